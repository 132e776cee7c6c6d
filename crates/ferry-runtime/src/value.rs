//! Managed-side values crossing the native boundary
//!
//! Scalars are carried by value. Anything that refers to native memory
//! (pointers, by-value structs, variadic lists) carries the segment that
//! roots it, so a call can acquire the owning scope before touching it.

use crate::layout::{MemoryLayout, ValueLayout};
use crate::scope::Scope;
use crate::segment::MemorySegment;
use crate::valist::VaList;

#[derive(Debug, Clone)]
pub enum Value {
    /// No value (void return)
    Void,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// A pointer; the segment's scope is acquired for the call
    Address(MemorySegment),
    /// A struct passed by value, copied out of the segment
    Struct(MemorySegment),
    /// A variadic list, passed as a pointer to its unread arguments
    VaList(VaList),
}

impl Value {
    /// Pointer to a raw native address (global scope)
    pub fn address(address: usize) -> Self {
        Value::Address(MemorySegment::of_address(address))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Address(_) => "ptr",
            Value::Struct(_) => "struct",
            Value::VaList(_) => "va_list",
        }
    }

    /// The scope this value depends on, if any
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            Value::Address(segment) | Value::Struct(segment) => Some(segment.scope()),
            Value::VaList(list) => Some(list.segment().scope()),
            _ => None,
        }
    }

    /// Whether this value can be passed where `layout` is expected
    pub fn matches(&self, layout: &MemoryLayout) -> bool {
        match (self, layout) {
            (Value::I8(_), MemoryLayout::Value(ValueLayout::I8))
            | (Value::I16(_), MemoryLayout::Value(ValueLayout::I16))
            | (Value::I32(_), MemoryLayout::Value(ValueLayout::I32))
            | (Value::I64(_), MemoryLayout::Value(ValueLayout::I64))
            | (Value::F32(_), MemoryLayout::Value(ValueLayout::F32))
            | (Value::F64(_), MemoryLayout::Value(ValueLayout::F64))
            | (Value::Address(_), MemoryLayout::Value(ValueLayout::Address))
            | (Value::VaList(_), MemoryLayout::Value(ValueLayout::Address)) => true,
            (Value::Struct(segment), MemoryLayout::Struct(s)) => segment.byte_size() >= s.size(),
            _ => false,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_segment(&self) -> Option<&MemorySegment> {
        match self {
            Value::Address(segment) | Value::Struct(segment) => Some(segment),
            _ => None,
        }
    }
}

// Manual PartialEq: segments compare by identity, lists by position
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) => true,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Address(a), Value::Address(b)) => a.address() == b.address(),
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::VaList(a), Value::VaList(b)) => a.current_address() == b.current_address(),
            _ => false,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from!(i8 => I8, i16 => I16, i32 => I32, i64 => I64, f32 => F32, f64 => F64);
