//! Moving values between managed `Value`s and libffi argument storage
//!
//! libffi wants one pointer per argument, each pointing at the argument's
//! bytes in native representation. Every argument gets its own word-aligned
//! buffer so scalars and structs alike can be written in place. Integral
//! results narrower than a register come back widened to `ffi_arg` and are
//! truncated here.

use crate::arranger::{words, CallingSequence};
use crate::error::{FfiError, FfiResult};
use crate::layout::{FunctionDescriptor, MemoryLayout, ValueLayout};
use crate::scope::Scope;
use crate::segment::MemorySegment;
use crate::value::Value;
use libffi::middle::{Cif, Type};
use std::ffi::c_void;
use std::ptr;

/// libffi type for a layout
pub(crate) fn ffi_type(layout: &MemoryLayout) -> Type {
    match layout {
        MemoryLayout::Value(v) => match v {
            ValueLayout::I8 => Type::i8(),
            ValueLayout::I16 => Type::i16(),
            ValueLayout::I32 => Type::i32(),
            ValueLayout::I64 => Type::i64(),
            ValueLayout::F32 => Type::f32(),
            ValueLayout::F64 => Type::f64(),
            ValueLayout::Address => Type::pointer(),
        },
        // padding is left out: libffi would classify filler bytes as integer
        // data, and arrangement already rejected padding that natural
        // alignment does not reproduce
        MemoryLayout::Struct(s) => {
            let members: Vec<Type> = s
                .fields()
                .iter()
                .filter(|field| !matches!(field.layout, MemoryLayout::Padding(_)))
                .map(|field| ffi_type(&field.layout))
                .collect();
            Type::structure(members)
        }
        // only reachable inside structs, handled above
        MemoryLayout::Padding(n) => Type::structure(vec![Type::u8(); *n]),
    }
}

/// Call interface for a classified signature
pub(crate) fn build_cif(sequence: &CallingSequence) -> Cif {
    let descriptor = sequence.descriptor();
    let args = descriptor.args().iter().map(ffi_type);
    let ret = descriptor
        .return_layout()
        .map(ffi_type)
        .unwrap_or_else(Type::void);
    match sequence.first_variadic() {
        Some(fixed) => Cif::new_variadic(args, fixed, ret),
        None => Cif::new(args, ret),
    }
}

/// Per-argument storage handed to `ffi_call`
pub(crate) struct ArgBuffers {
    words: Vec<Vec<u64>>,
}

impl ArgBuffers {
    /// Argument pointer array; valid while `self` is neither moved nor dropped
    pub(crate) fn pointers(&mut self) -> Vec<*mut c_void> {
        self.words
            .iter_mut()
            .map(|buffer| buffer.as_mut_ptr() as *mut c_void)
            .collect()
    }
}

fn word_buffer(size: usize) -> Vec<u64> {
    vec![0u64; words(size).max(1)]
}

/// Encode downcall arguments; callers must already hold every scope
pub(crate) fn encode_args(descriptor: &FunctionDescriptor, args: &[Value]) -> FfiResult<ArgBuffers> {
    let mut words = Vec::with_capacity(args.len());
    for (index, (layout, value)) in descriptor.args().iter().zip(args).enumerate() {
        if !value.matches(layout) {
            return Err(FfiError::type_mismatch(index, layout, value.type_name()));
        }
        let mut buffer = word_buffer(layout.size());
        let dst = buffer.as_mut_ptr() as *mut u8;
        // SAFETY: the buffer holds at least `layout.size()` bytes
        unsafe { write_value(dst, layout, value)? };
        words.push(buffer);
    }
    Ok(ArgBuffers { words })
}

unsafe fn write_value(dst: *mut u8, layout: &MemoryLayout, value: &Value) -> FfiResult<()> {
    match value {
        Value::I8(v) => ptr::write_unaligned(dst as *mut i8, *v),
        Value::I16(v) => ptr::write_unaligned(dst as *mut i16, *v),
        Value::I32(v) => ptr::write_unaligned(dst as *mut i32, *v),
        Value::I64(v) => ptr::write_unaligned(dst as *mut i64, *v),
        Value::F32(v) => ptr::write_unaligned(dst as *mut f32, *v),
        Value::F64(v) => ptr::write_unaligned(dst as *mut f64, *v),
        Value::Address(segment) => ptr::write_unaligned(dst as *mut usize, segment.address()),
        Value::VaList(list) => ptr::write_unaligned(dst as *mut usize, list.current_address()),
        Value::Struct(segment) => {
            let bytes = std::slice::from_raw_parts_mut(dst, layout.size());
            segment.read_bytes(0, bytes)?;
        }
        Value::Void => return Err(FfiError::type_mismatch(0, layout, "void")),
    }
    Ok(())
}

/// Storage large enough for the return value, or a widened register
pub(crate) fn return_buffer(descriptor: &FunctionDescriptor) -> Vec<u64> {
    // libffi may store whole registers for small structs
    let mut buffer = word_buffer(descriptor.return_layout().map_or(0, MemoryLayout::size));
    buffer.resize(buffer.len().max(2), 0);
    buffer
}

/// Decode a downcall result; struct results are copied into `scope`
pub(crate) fn decode_return(
    layout: Option<&MemoryLayout>,
    buffer: &[u64],
    scope: &Scope,
) -> FfiResult<Value> {
    let Some(layout) = layout else {
        return Ok(Value::Void);
    };
    let raw = buffer.first().copied().unwrap_or(0);
    Ok(match layout {
        // integral results are widened to a full register
        MemoryLayout::Value(ValueLayout::I8) => Value::I8(raw as i8),
        MemoryLayout::Value(ValueLayout::I16) => Value::I16(raw as i16),
        MemoryLayout::Value(ValueLayout::I32) => Value::I32(raw as i32),
        MemoryLayout::Value(ValueLayout::I64) => Value::I64(raw as i64),
        MemoryLayout::Value(ValueLayout::F32) => {
            Value::F32(unsafe { ptr::read_unaligned(buffer.as_ptr() as *const f32) })
        }
        MemoryLayout::Value(ValueLayout::F64) => Value::F64(f64::from_bits(raw)),
        MemoryLayout::Value(ValueLayout::Address) => Value::address(raw as usize),
        MemoryLayout::Struct(s) => {
            let bytes =
                unsafe { std::slice::from_raw_parts(buffer.as_ptr() as *const u8, s.size()) };
            Value::Struct(scope.allocate_from(bytes, s.align())?)
        }
        MemoryLayout::Padding(_) => Value::Void,
    })
}

/// Read one upcall argument from the pointer libffi hands the closure
///
/// # Safety
///
/// `src` must point at a live value of `layout`.
pub(crate) unsafe fn read_arg(
    src: *const c_void,
    layout: &MemoryLayout,
    scope: &Scope,
) -> FfiResult<Value> {
    let src = src as *const u8;
    Ok(match layout {
        MemoryLayout::Value(ValueLayout::I8) => Value::I8(ptr::read_unaligned(src as *const i8)),
        MemoryLayout::Value(ValueLayout::I16) => Value::I16(ptr::read_unaligned(src as *const i16)),
        MemoryLayout::Value(ValueLayout::I32) => Value::I32(ptr::read_unaligned(src as *const i32)),
        MemoryLayout::Value(ValueLayout::I64) => Value::I64(ptr::read_unaligned(src as *const i64)),
        MemoryLayout::Value(ValueLayout::F32) => Value::F32(ptr::read_unaligned(src as *const f32)),
        MemoryLayout::Value(ValueLayout::F64) => Value::F64(ptr::read_unaligned(src as *const f64)),
        MemoryLayout::Value(ValueLayout::Address) => {
            Value::Address(MemorySegment::of_address(ptr::read_unaligned(src as *const usize)))
        }
        MemoryLayout::Struct(s) => {
            let bytes = std::slice::from_raw_parts(src, s.size());
            Value::Struct(scope.allocate_from(bytes, s.align())?)
        }
        MemoryLayout::Padding(_) => Value::Void,
    })
}

/// Write an upcall result where libffi expects it
///
/// # Safety
///
/// `dst` must be the closure result slot for a function returning `layout`.
pub(crate) unsafe fn write_return(
    dst: *mut c_void,
    layout: Option<&MemoryLayout>,
    value: &Value,
) -> FfiResult<()> {
    let Some(layout) = layout else {
        return Ok(());
    };
    if !value.matches(layout) {
        return Err(FfiError::Upcall(format!(
            "target returned {}, expected {}",
            value.type_name(),
            layout
        )));
    }
    let dst = dst as *mut u8;
    match value {
        // closures return narrow integers widened to ffi_arg
        Value::I8(v) => ptr::write_unaligned(dst as *mut i64, i64::from(*v)),
        Value::I16(v) => ptr::write_unaligned(dst as *mut i64, i64::from(*v)),
        Value::I32(v) => ptr::write_unaligned(dst as *mut i64, i64::from(*v)),
        other => write_value(dst, layout, other)?,
    }
    Ok(())
}

/// Zero the result slot after a failed upcall
///
/// # Safety
///
/// Same contract as [`write_return`].
pub(crate) unsafe fn zero_return(dst: *mut c_void, layout: Option<&MemoryLayout>) {
    match layout {
        Some(MemoryLayout::Struct(s)) => ptr::write_bytes(dst as *mut u8, 0, s.size()),
        Some(_) => ptr::write_unaligned(dst as *mut u64, 0),
        None => {}
    }
}
