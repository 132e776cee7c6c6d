// Downcall tests
//
// Calls into extern "C" functions through their addresses, covering
// scalars, structs in registers and in memory, struct returns, pointers
// into arenas, variadic calls and argument validation.

mod common;

use common::*;
use ferry_runtime::{
    Arena, FfiError, FunctionDescriptor, LinkerOptions, MemoryLayout, Scope, ScopeMode,
    SymbolLookup, Value,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

// ===== Scalars =====

#[rstest]
#[case(2, 3, 5)]
#[case(-10, 4, -6)]
#[case(i32::MAX, 0, i32::MAX)]
fn test_add_ints(#[case] a: i32, #[case] b: i32, #[case] expected: i32) {
    let linker = linker();
    let add = handle(
        &linker,
        add as usize,
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![MemoryLayout::C_INT, MemoryLayout::C_INT]),
    );
    assert_eq!(
        add.invoke(&[Value::I32(a), Value::I32(b)]).unwrap(),
        Value::I32(expected)
    );
}

#[test]
fn test_narrow_integer_return_truncated() {
    let linker = linker();
    let negate = handle(
        &linker,
        negate_char as usize,
        FunctionDescriptor::of(MemoryLayout::C_CHAR, vec![MemoryLayout::C_CHAR]),
    );
    assert_eq!(negate.invoke(&[Value::I8(5)]).unwrap(), Value::I8(-5));
}

#[test]
fn test_float_and_double_arguments() {
    let linker = linker();
    let scale = handle(
        &linker,
        scale as usize,
        FunctionDescriptor::of(MemoryLayout::C_DOUBLE, vec![MemoryLayout::C_DOUBLE, MemoryLayout::C_FLOAT]),
    );
    assert_eq!(
        scale.invoke(&[Value::F64(1.5), Value::F32(4.0)]).unwrap(),
        Value::F64(6.0)
    );
}

// ===== Structs =====

#[test]
fn test_small_struct_by_value() {
    let linker = linker();
    let sum = handle(
        &linker,
        sum_point as usize,
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![point_layout()]),
    );

    Arena::with(ScopeMode::Confined, |arena| {
        let point = arena.allocate_layout(&point_layout())?;
        point.set_i32(0, 20)?;
        point.set_i32(4, 22)?;
        assert_eq!(sum.invoke(&[Value::Struct(point)])?, Value::I32(42));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_large_struct_by_value() {
    let linker = linker();
    let sum = handle(
        &linker,
        sum_triple as usize,
        FunctionDescriptor::of(MemoryLayout::C_LONG_LONG, vec![triple_layout()]),
    );

    let arena = Arena::open_confined();
    let triple = arena.allocate_layout(&triple_layout()).unwrap();
    for (i, v) in [100i64, 20, 3].into_iter().enumerate() {
        triple.set_i64(i * 8, v).unwrap();
    }
    assert_eq!(sum.invoke(&[Value::Struct(triple)]).unwrap(), Value::I64(123));
    arena.close().unwrap();
}

#[test]
fn test_mixed_class_struct() {
    let linker = linker();
    let total = handle(
        &linker,
        mixed_total as usize,
        FunctionDescriptor::of(MemoryLayout::C_DOUBLE, vec![mixed_layout()]),
    );
    let scope = Scope::auto();
    let mixed = scope.allocate_layout(&mixed_layout()).unwrap();
    mixed.set_f64(0, 0.5).unwrap();
    mixed.set_i64(8, 2).unwrap();
    assert_eq!(total.invoke(&[Value::Struct(mixed)]).unwrap(), Value::F64(2.5));
}

#[rstest]
#[case(MemoryLayout::struct_of(vec![MemoryLayout::C_FLOAT, MemoryLayout::C_DOUBLE]))]
#[case(float_double_padded_layout())]
fn test_float_double_struct_with_and_without_explicit_padding(#[case] layout: MemoryLayout) {
    let linker = linker();
    let sum = handle(
        &linker,
        float_double_sum as usize,
        FunctionDescriptor::of(MemoryLayout::C_DOUBLE, vec![layout.clone()]),
    );
    let scope = Scope::auto();
    let value = scope.allocate_layout(&layout).unwrap();
    value.set_f32(0, 1.5).unwrap();
    value.set_f64(8, 2.0).unwrap();
    assert_eq!(sum.invoke(&[Value::Struct(value)]).unwrap(), Value::F64(3.5));
}

#[test]
fn test_padding_off_natural_alignment_rejected_at_link_time() {
    let linker = linker();
    let shifted = MemoryLayout::struct_of(vec![
        MemoryLayout::C_FLOAT,
        MemoryLayout::Padding(8),
        MemoryLayout::C_DOUBLE,
    ]);
    let result = linker.downcall_handle(
        &symbol(float_double_sum as usize),
        FunctionDescriptor::of(MemoryLayout::C_DOUBLE, vec![shifted]),
        LinkerOptions::new(),
    );
    assert!(matches!(result, Err(FfiError::UnsupportedLayout { .. })));
}

#[test]
fn test_small_struct_return() {
    let linker = linker();
    let make = handle(
        &linker,
        make_point as usize,
        FunctionDescriptor::of(point_layout(), vec![MemoryLayout::C_INT, MemoryLayout::C_INT]),
    );

    let arena = Arena::open_shared();
    let result = make
        .invoke_in(&[Value::I32(7), Value::I32(-7)], arena.scope())
        .unwrap();
    let segment = result.as_segment().unwrap();
    assert!(segment.scope().same_as(arena.scope()));
    assert_eq!(segment.get_i32(0).unwrap(), 7);
    assert_eq!(segment.get_i32(4).unwrap(), -7);

    arena.close().unwrap();
    assert!(matches!(segment.get_i32(0), Err(FfiError::ScopeClosed { .. })));
}

#[test]
fn test_memory_struct_return_in_automatic_scope() {
    let linker = linker();
    let make = handle(
        &linker,
        make_triple as usize,
        FunctionDescriptor::of(triple_layout(), vec![MemoryLayout::C_LONG_LONG]),
    );
    assert!(make.calling_sequence().returns_in_memory());

    let result = make.invoke(&[Value::I64(10)]).unwrap();
    let segment = result.as_segment().unwrap();
    assert_eq!(segment.to_vec().unwrap().len(), 24);
    assert_eq!(segment.get_i64(16).unwrap(), 12);
}

// ===== Pointers =====

#[test]
fn test_pointer_into_arena() {
    let linker = linker();
    let sum = handle(
        &linker,
        sum_ints as usize,
        FunctionDescriptor::of(
            MemoryLayout::C_LONG_LONG,
            vec![MemoryLayout::C_POINTER, MemoryLayout::C_LONG_LONG],
        ),
    );

    let arena = Arena::open_confined();
    let values = arena.allocate(4 * 4, 4).unwrap();
    for i in 0..4 {
        values.set_i32(i * 4, (i as i32 + 1) * 10).unwrap();
    }
    assert_eq!(
        sum.invoke(&[Value::Address(values.clone()), Value::I64(4)]).unwrap(),
        Value::I64(100)
    );
    assert_eq!(arena.scope().acquire_count(), 0);
}

#[test]
fn test_va_list_passed_as_pointer() {
    let linker = linker();
    let sum = handle(
        &linker,
        sum_slots as usize,
        FunctionDescriptor::of(
            MemoryLayout::C_LONG_LONG,
            vec![MemoryLayout::C_INT, MemoryLayout::C_POINTER],
        ),
    );

    let arena = Arena::open_confined();
    let mut list = linker
        .new_va_list(arena.scope(), |b| {
            b.add_arg(MemoryLayout::C_INT, 1i32)?
                .add_arg(MemoryLayout::C_INT, -2i32)?
                .add_arg(MemoryLayout::C_LONG_LONG, 40i64)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(
        sum.invoke(&[Value::I32(3), Value::VaList(list.clone())]).unwrap(),
        Value::I64(39)
    );

    // the native side sees only the unread tail
    list.next_arg(MemoryLayout::C_INT).unwrap();
    assert_eq!(
        sum.invoke(&[Value::I32(2), Value::VaList(list)]).unwrap(),
        Value::I64(38)
    );
}

// ===== Variadic =====

#[cfg(unix)]
#[test]
fn test_variadic_snprintf() {
    let linker = linker();
    let snprintf = linker.default_lookup().unwrap().require("snprintf").unwrap();
    let descriptor = FunctionDescriptor::of(
        MemoryLayout::C_INT,
        vec![
            MemoryLayout::C_POINTER,
            MemoryLayout::C_LONG_LONG,
            MemoryLayout::C_POINTER,
            MemoryLayout::C_INT,
            MemoryLayout::C_DOUBLE,
        ],
    );
    let call = linker
        .downcall_handle(&snprintf, descriptor, LinkerOptions::new().first_variadic_arg(3))
        .unwrap();
    assert!(call.calling_sequence().is_variadic());

    let arena = Arena::open_confined();
    let buffer = arena.allocate(32, 1).unwrap();
    let format = arena.scope().allocate_from(b"%d %.1f\0", 1).unwrap();
    let written = call
        .invoke(&[
            Value::Address(buffer.clone()),
            Value::I64(32),
            Value::Address(format),
            Value::I32(7),
            Value::F64(2.5),
        ])
        .unwrap();
    assert_eq!(written, Value::I32(5));
    assert_eq!(&buffer.to_vec().unwrap()[..6], b"7 2.5\0");
}

#[cfg(unix)]
#[test]
fn test_variadic_float_rejected_at_link_time() {
    let linker = linker();
    let printf = linker.default_lookup().unwrap().require("printf").unwrap();
    let result = linker.downcall_handle(
        &printf,
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![MemoryLayout::C_POINTER, MemoryLayout::C_FLOAT]),
        LinkerOptions::new().first_variadic_arg(1),
    );
    assert!(matches!(result, Err(FfiError::UnsupportedLayout { .. })));
}

// ===== Validation =====

#[test]
fn test_arity_mismatch() {
    let linker = linker();
    let add = handle(
        &linker,
        add as usize,
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![MemoryLayout::C_INT, MemoryLayout::C_INT]),
    );
    assert!(matches!(
        add.invoke(&[Value::I32(1)]),
        Err(FfiError::ArityMismatch { expected: 2, got: 1 })
    ));
}

#[test]
fn test_argument_kind_mismatch() {
    let linker = linker();
    let add = handle(
        &linker,
        add as usize,
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![MemoryLayout::C_INT, MemoryLayout::C_INT]),
    );
    match add.invoke(&[Value::I32(1), Value::F64(2.0)]) {
        Err(FfiError::TypeMismatch { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected type mismatch, got {:?}", other),
    }
}

#[test]
fn test_struct_segment_too_small() {
    let linker = linker();
    let sum = handle(
        &linker,
        sum_point as usize,
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![point_layout()]),
    );
    let short = Scope::auto().allocate(4, 4).unwrap();
    assert!(matches!(
        sum.invoke(&[Value::Struct(short)]),
        Err(FfiError::TypeMismatch { .. })
    ));
}

#[test]
fn test_confined_argument_from_other_thread() {
    let linker = linker();
    let sum = handle(
        &linker,
        sum_ints as usize,
        FunctionDescriptor::of(
            MemoryLayout::C_LONG_LONG,
            vec![MemoryLayout::C_POINTER, MemoryLayout::C_LONG_LONG],
        ),
    );
    let scope = Scope::confined();
    let values = scope.allocate(8, 4).unwrap();

    let result = std::thread::scope(|s| {
        s.spawn(|| sum.invoke(&[Value::Address(values.clone()), Value::I64(2)]))
            .join()
            .unwrap()
    });
    assert!(matches!(result, Err(FfiError::WrongThread { .. })));
    scope.close().unwrap();
}

#[test]
fn test_handles_share_cached_sequence() {
    let linker = linker();
    let descriptor =
        FunctionDescriptor::of(MemoryLayout::C_INT, vec![MemoryLayout::C_INT, MemoryLayout::C_INT]);
    let before = linker.cached_sequences();
    handle(&linker, add as usize, descriptor.clone());
    handle(&linker, add as usize, descriptor);
    assert_eq!(linker.cached_sequences(), before + 1);
}
