//! Memory segments: bounded, scope-checked views over native memory
//!
//! A segment never owns memory. It records an address range and the scope
//! that owns the bytes; every access acquires that scope for its duration,
//! so a concurrent close on a shared scope is rejected rather than raced.

use crate::error::{FfiError, FfiResult};
use crate::layout::ValueLayout;
use crate::scope::{AcquireGuard, Scope};
use crate::value::Value;
use std::fmt;
use std::ptr;

/// A contiguous byte range rooted at a scope
#[derive(Clone)]
pub struct MemorySegment {
    scope: Scope,
    address: usize,
    length: usize,
}

macro_rules! typed_accessors {
    ($($get:ident, $set:ident, $ty:ty;)*) => {
        $(
            pub fn $get(&self, offset: usize) -> FfiResult<$ty> {
                let _guard = self.checked(offset, std::mem::size_of::<$ty>(), std::mem::align_of::<$ty>(), "read")?;
                Ok(unsafe { ptr::read((self.address + offset) as *const $ty) })
            }

            pub fn $set(&self, offset: usize, value: $ty) -> FfiResult<()> {
                let _guard = self.checked(offset, std::mem::size_of::<$ty>(), std::mem::align_of::<$ty>(), "write")?;
                unsafe { ptr::write((self.address + offset) as *mut $ty, value) };
                Ok(())
            }
        )*
    };
}

impl MemorySegment {
    pub(crate) fn from_scope(scope: Scope, address: usize, length: usize) -> Self {
        Self {
            scope,
            address,
            length,
        }
    }

    /// Zero-length segment for an address received from native code
    pub fn of_address(address: usize) -> Self {
        Self::from_scope(Scope::global(), address, 0)
    }

    /// The null address
    pub fn null() -> Self {
        Self::of_address(0)
    }

    /// View `length` bytes at `address` as owned by `scope`
    ///
    /// # Safety
    ///
    /// The range must stay valid for as long as `scope` is alive.
    pub unsafe fn from_raw_parts(address: usize, length: usize, scope: &Scope) -> Self {
        Self::from_scope(scope.clone(), address, length)
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn byte_size(&self) -> usize {
        self.length
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_alive(&self) -> bool {
        self.scope.is_alive()
    }

    /// Same address and scope with a different length
    ///
    /// # Safety
    ///
    /// The caller vouches that `length` bytes are readable and writable.
    pub unsafe fn reinterpret(&self, length: usize) -> Self {
        Self::from_scope(self.scope.clone(), self.address, length)
    }

    /// Narrower view sharing the same scope
    pub fn as_slice(&self, offset: usize, length: usize) -> FfiResult<MemorySegment> {
        self.check_bounds(offset, length)?;
        Ok(Self::from_scope(
            self.scope.clone(),
            self.address + offset,
            length,
        ))
    }

    /// Everything from `offset` to the end
    pub fn slice_from(&self, offset: usize) -> FfiResult<MemorySegment> {
        let length = self.length.checked_sub(offset).ok_or(FfiError::OutOfBounds {
            offset,
            size: 0,
            length: self.length,
        })?;
        self.as_slice(offset, length)
    }

    fn check_bounds(&self, offset: usize, size: usize) -> FfiResult<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.length => Ok(()),
            _ => Err(FfiError::OutOfBounds {
                offset,
                size,
                length: self.length,
            }),
        }
    }

    fn checked(
        &self,
        offset: usize,
        size: usize,
        alignment: usize,
        operation: &'static str,
    ) -> FfiResult<AcquireGuard> {
        let guard = self.scope.acquire(operation)?;
        self.check_bounds(offset, size)?;
        let address = self.address + offset;
        if address % alignment != 0 {
            return Err(FfiError::Misaligned { address, alignment });
        }
        Ok(guard)
    }

    typed_accessors! {
        get_i8, set_i8, i8;
        get_i16, set_i16, i16;
        get_i32, set_i32, i32;
        get_i64, set_i64, i64;
        get_f32, set_f32, f32;
        get_f64, set_f64, f64;
    }

    /// Read a pointer-sized address
    pub fn get_address(&self, offset: usize) -> FfiResult<MemorySegment> {
        let _guard = self.checked(
            offset,
            std::mem::size_of::<usize>(),
            std::mem::align_of::<usize>(),
            "read",
        )?;
        let raw = unsafe { ptr::read((self.address + offset) as *const usize) };
        Ok(MemorySegment::of_address(raw))
    }

    pub fn set_address(&self, offset: usize, target: &MemorySegment) -> FfiResult<()> {
        let _guard = self.checked(
            offset,
            std::mem::size_of::<usize>(),
            std::mem::align_of::<usize>(),
            "write",
        )?;
        unsafe { ptr::write((self.address + offset) as *mut usize, target.address) };
        Ok(())
    }

    /// Read a scalar described by `layout`
    pub fn get(&self, layout: ValueLayout, offset: usize) -> FfiResult<Value> {
        Ok(match layout {
            ValueLayout::I8 => Value::I8(self.get_i8(offset)?),
            ValueLayout::I16 => Value::I16(self.get_i16(offset)?),
            ValueLayout::I32 => Value::I32(self.get_i32(offset)?),
            ValueLayout::I64 => Value::I64(self.get_i64(offset)?),
            ValueLayout::F32 => Value::F32(self.get_f32(offset)?),
            ValueLayout::F64 => Value::F64(self.get_f64(offset)?),
            ValueLayout::Address => Value::Address(self.get_address(offset)?),
        })
    }

    /// Write a scalar described by `layout`
    pub fn set(&self, layout: ValueLayout, offset: usize, value: &Value) -> FfiResult<()> {
        match (layout, value) {
            (ValueLayout::I8, Value::I8(v)) => self.set_i8(offset, *v),
            (ValueLayout::I16, Value::I16(v)) => self.set_i16(offset, *v),
            (ValueLayout::I32, Value::I32(v)) => self.set_i32(offset, *v),
            (ValueLayout::I64, Value::I64(v)) => self.set_i64(offset, *v),
            (ValueLayout::F32, Value::F32(v)) => self.set_f32(offset, *v),
            (ValueLayout::F64, Value::F64(v)) => self.set_f64(offset, *v),
            (ValueLayout::Address, Value::Address(target)) => self.set_address(offset, target),
            (layout, other) => Err(FfiError::type_mismatch(0, layout, other.type_name())),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset`
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> FfiResult<()> {
        let _guard = self.checked(offset, dst.len(), 1, "read")?;
        unsafe {
            ptr::copy_nonoverlapping(
                (self.address + offset) as *const u8,
                dst.as_mut_ptr(),
                dst.len(),
            )
        };
        Ok(())
    }

    /// Copy `src` into the segment at `offset`
    pub fn copy_from_slice(&self, offset: usize, src: &[u8]) -> FfiResult<()> {
        let _guard = self.checked(offset, src.len(), 1, "write")?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), (self.address + offset) as *mut u8, src.len())
        };
        Ok(())
    }

    /// Copy the whole of `src` to the start of this segment
    pub fn copy_from(&self, src: &MemorySegment) -> FfiResult<()> {
        let _src_guard = src.checked(0, src.length, 1, "read")?;
        let _guard = self.checked(0, src.length, 1, "write")?;
        unsafe {
            ptr::copy(
                src.address as *const u8,
                self.address as *mut u8,
                src.length,
            )
        };
        Ok(())
    }

    pub fn fill(&self, byte: u8) -> FfiResult<()> {
        let _guard = self.checked(0, self.length, 1, "write")?;
        unsafe { ptr::write_bytes(self.address as *mut u8, byte, self.length) };
        Ok(())
    }

    pub fn to_vec(&self) -> FfiResult<Vec<u8>> {
        let mut out = vec![0u8; self.length];
        self.read_bytes(0, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySegment")
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("scope", &self.scope.id())
            .finish()
    }
}

impl PartialEq for MemorySegment {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.length == other.length
            && self.scope.same_as(&other.scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;

    #[test]
    fn test_typed_roundtrip() {
        let scope = Scope::auto();
        let segment = scope.allocate(16, 8).unwrap();
        segment.set_i32(0, -7).unwrap();
        segment.set_f32(4, 1.5).unwrap();
        segment.set_f64(8, 2.25).unwrap();
        assert_eq!(segment.get_i32(0).unwrap(), -7);
        assert_eq!(segment.get_f32(4).unwrap(), 1.5);
        assert_eq!(segment.get_f64(8).unwrap(), 2.25);
    }

    #[test]
    fn test_out_of_bounds() {
        let segment = Scope::auto().allocate(4, 4).unwrap();
        assert!(matches!(
            segment.get_i64(0),
            Err(FfiError::OutOfBounds { .. })
        ));
        assert!(matches!(
            segment.as_slice(2, 4),
            Err(FfiError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_misaligned_access() {
        let segment = Scope::auto().allocate(16, 8).unwrap();
        assert!(matches!(
            segment.get_i32(2),
            Err(FfiError::Misaligned { .. })
        ));
    }

    #[test]
    fn test_slice_shares_memory_and_scope() {
        let scope = Scope::shared();
        let segment = scope.allocate(8, 4).unwrap();
        let tail = segment.as_slice(4, 4).unwrap();
        tail.set_i32(0, 99).unwrap();
        assert_eq!(segment.get_i32(4).unwrap(), 99);
        assert!(tail.scope().same_as(segment.scope()));

        scope.close().unwrap();
        assert!(!tail.is_alive());
        assert!(matches!(tail.get_i32(0), Err(FfiError::ScopeClosed { .. })));
    }

    #[test]
    fn test_of_address_is_zero_length_global() {
        let segment = MemorySegment::of_address(0x1000);
        assert_eq!(segment.byte_size(), 0);
        assert!(segment.is_alive());
        assert!(matches!(
            segment.get_i8(0),
            Err(FfiError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_copy_and_fill() {
        let scope = Scope::auto();
        let a = scope.allocate_from(&[1, 2, 3, 4], 1).unwrap();
        let b = scope.allocate(4, 1).unwrap();
        b.copy_from(&a).unwrap();
        assert_eq!(b.to_vec().unwrap(), vec![1, 2, 3, 4]);
        b.fill(0xAA).unwrap();
        assert_eq!(b.to_vec().unwrap(), vec![0xAA; 4]);
    }
}
