//! Shared native functions and helpers for integration tests
//!
//! The "native" side of every call is an `extern "C"` function defined here,
//! reached through its address exactly like a symbol from a shared library.

#![allow(dead_code)]

use ferry_runtime::{
    FunctionDescriptor, Linker, LinkerOptions, MemoryLayout, MemorySegment, DowncallHandle,
};
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Calls that reached functions which must never run in the tests using them
pub static GUARDED_CALLS: AtomicUsize = AtomicUsize::new(0);

pub fn guarded_calls() -> usize {
    GUARDED_CALLS.load(Ordering::SeqCst)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triple {
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mixed {
    pub d: f64,
    pub l: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FloatDouble {
    pub a: f32,
    pub b: f64,
}

pub extern "C" fn add(a: i32, b: i32) -> i32 {
    a + b
}

pub extern "C" fn negate_char(c: i8) -> i8 {
    -c
}

pub extern "C" fn scale(x: f64, factor: f32) -> f64 {
    x * f64::from(factor)
}

pub extern "C" fn sum_point(p: Point) -> i32 {
    p.x + p.y
}

pub extern "C" fn make_point(x: i32, y: i32) -> Point {
    Point { x, y }
}

pub extern "C" fn sum_triple(t: Triple) -> i64 {
    t.a + t.b + t.c
}

pub extern "C" fn make_triple(base: i64) -> Triple {
    Triple {
        a: base,
        b: base + 1,
        c: base + 2,
    }
}

pub extern "C" fn mixed_total(m: Mixed) -> f64 {
    m.d + m.l as f64
}

pub extern "C" fn float_double_sum(v: FloatDouble) -> f64 {
    f64::from(v.a) + v.b
}

pub extern "C" fn sum_ints(values: *const i32, count: i64) -> i64 {
    let values = unsafe { std::slice::from_raw_parts(values, count as usize) };
    values.iter().map(|v| i64::from(*v)).sum()
}

/// Sums `count` 8-byte slots of a variadic list
pub extern "C" fn sum_slots(count: i32, list: *const i64) -> i64 {
    (0..count as usize).map(|i| unsafe { *list.add(i) }).sum()
}

pub extern "C" fn touch_six(
    _a: *mut c_void,
    _b: *mut c_void,
    _c: *mut c_void,
    _d: *mut c_void,
    _e: *mut c_void,
    _f: *mut c_void,
) {
    GUARDED_CALLS.fetch_add(1, Ordering::SeqCst);
}

pub extern "C" fn guarded_sum_point(p: Point) -> i32 {
    GUARDED_CALLS.fetch_add(1, Ordering::SeqCst);
    p.x + p.y
}

pub extern "C" fn guarded_read_slot(list: *const i64) -> i64 {
    GUARDED_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { *list }
}

pub extern "C" fn apply_int(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(x)
}

pub extern "C" fn apply_point(f: extern "C" fn(Point) -> i32, p: Point) -> i32 {
    f(p)
}

pub extern "C" fn call_with_pointer(f: extern "C" fn(*mut c_void), p: *mut c_void) {
    f(p)
}

pub extern "C" fn fold_doubles(f: extern "C" fn(f64, f64) -> f64, a: f64, b: f64, c: f64) -> f64 {
    f(f(a, b), c)
}

/// Address of a test function as a global segment
pub fn symbol(address: usize) -> MemorySegment {
    MemorySegment::of_address(address)
}

pub fn point_layout() -> MemoryLayout {
    MemoryLayout::struct_of(vec![MemoryLayout::C_INT, MemoryLayout::C_INT])
}

pub fn triple_layout() -> MemoryLayout {
    MemoryLayout::struct_of(vec![MemoryLayout::C_LONG_LONG; 3])
}

pub fn mixed_layout() -> MemoryLayout {
    MemoryLayout::struct_of(vec![MemoryLayout::C_DOUBLE, MemoryLayout::C_LONG_LONG])
}

/// `{float, double}` with the hole after the float spelled out
pub fn float_double_padded_layout() -> MemoryLayout {
    MemoryLayout::struct_of(vec![
        MemoryLayout::C_FLOAT,
        MemoryLayout::Padding(4),
        MemoryLayout::C_DOUBLE,
    ])
}

pub fn linker() -> Linker {
    Linker::native().expect("host ABI is supported")
}

pub fn handle(linker: &Linker, address: usize, descriptor: FunctionDescriptor) -> DowncallHandle {
    linker
        .downcall_handle(&symbol(address), descriptor, LinkerOptions::new())
        .expect("signature is supported")
}
