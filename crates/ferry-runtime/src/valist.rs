//! Variadic argument lists
//!
//! A list is a run of 8-byte slots in a segment, consumed front to back.
//! Integers are stored sign-extended to a full slot and doubles as-is.
//! Structs are copied inline, rounded up to whole slots, unless the ABI
//! passes composites above a size threshold indirectly, in which case the
//! slot holds a pointer to a copy owned by the same scope.
//!
//! C promotes `char`, `short` and `float` in variadic position, so those
//! layouts are rejected: callers pass the promoted type.

use crate::error::{FfiError, FfiResult};
use crate::layout::{align_up, MemoryLayout, ValueLayout};
use crate::scope::Scope;
use crate::segment::MemorySegment;
use crate::value::Value;
use ferry_config::AbiName;
use std::fmt;
use tracing::trace;

const SLOT: usize = 8;

/// How an ABI packs arguments into a variadic list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaListLayout {
    abi: AbiName,
    indirect_above: Option<usize>,
}

impl VaListLayout {
    pub fn new(abi: AbiName, indirect_above: Option<usize>) -> Self {
        Self {
            abi,
            indirect_above,
        }
    }

    pub fn abi(&self) -> AbiName {
        self.abi
    }

    pub fn slot_size(&self) -> usize {
        SLOT
    }

    fn is_indirect(&self, layout: &MemoryLayout) -> bool {
        layout.is_struct() && self.indirect_above.map_or(false, |limit| layout.size() > limit)
    }

    /// Bytes one argument occupies in the list
    fn footprint(&self, layout: &MemoryLayout) -> usize {
        if layout.is_struct() && !self.is_indirect(layout) {
            align_up(layout.size(), SLOT)
        } else {
            SLOT
        }
    }

    fn check(&self, layout: &MemoryLayout) -> FfiResult<()> {
        let reason = match layout {
            MemoryLayout::Value(ValueLayout::I8 | ValueLayout::I16 | ValueLayout::F32) => format!(
                "{} is promoted in variadic position; use the promoted layout",
                layout
            ),
            MemoryLayout::Padding(_) => "padding cannot be a variadic argument".to_string(),
            MemoryLayout::Struct(_) if layout.scalars().is_empty() => {
                format!("struct {} has no data members", layout)
            }
            _ => return Ok(()),
        };
        Err(FfiError::unsupported_layout(self.abi.as_str(), reason))
    }
}

/// Append-only builder bound to the scope that will own the list
pub struct VaListBuilder {
    layout: VaListLayout,
    scope: Scope,
    entries: Vec<(MemoryLayout, Value)>,
}

impl VaListBuilder {
    pub fn new(layout: VaListLayout, scope: &Scope) -> FfiResult<Self> {
        scope.check_valid("va_list builder")?;
        Ok(Self {
            layout,
            scope: scope.clone(),
            entries: Vec::new(),
        })
    }

    /// Append one argument
    pub fn add_arg(
        &mut self,
        layout: impl Into<MemoryLayout>,
        value: impl Into<Value>,
    ) -> FfiResult<&mut Self> {
        let layout = layout.into();
        let value = value.into();
        self.layout.check(&layout)?;
        if !value.matches(&layout) {
            return Err(FfiError::type_mismatch(
                self.entries.len(),
                &layout,
                value.type_name(),
            ));
        }
        self.entries.push((layout, value));
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every argument into storage owned by the builder's scope
    pub fn build(self) -> FfiResult<VaList> {
        let total: usize = self
            .entries
            .iter()
            .map(|(layout, _)| self.layout.footprint(layout))
            .sum();
        let segment = self.scope.allocate(total, SLOT)?;

        let mut offset = 0;
        for (layout, value) in &self.entries {
            write_slot(&self.layout, &self.scope, &segment, offset, layout, value)?;
            offset += self.layout.footprint(layout);
        }

        trace!(scope = %self.scope.id(), args = self.entries.len(), bytes = total, "va_list built");
        Ok(VaList {
            segment,
            layout: self.layout,
            offset: 0,
            consumed: 0,
            count: Some(self.entries.len()),
        })
    }
}

fn write_slot(
    va: &VaListLayout,
    scope: &Scope,
    segment: &MemorySegment,
    offset: usize,
    layout: &MemoryLayout,
    value: &Value,
) -> FfiResult<()> {
    match value {
        Value::I32(v) => segment.set_i64(offset, i64::from(*v)),
        Value::I64(v) => segment.set_i64(offset, *v),
        Value::F64(v) => segment.set_f64(offset, *v),
        Value::Address(target) => segment.set_address(offset, target),
        Value::VaList(list) => {
            segment.set_address(offset, &MemorySegment::of_address(list.current_address()))
        }
        Value::Struct(source) => {
            let bytes = source.as_slice(0, layout.size())?.to_vec()?;
            if va.is_indirect(layout) {
                let copy = scope.allocate_from(&bytes, layout.align())?;
                segment.set_address(offset, &copy)
            } else {
                segment.copy_from_slice(offset, &bytes)
            }
        }
        other => Err(FfiError::type_mismatch(0, layout, other.type_name())),
    }
}

/// Consume-only cursor over a variadic list
#[derive(Clone)]
pub struct VaList {
    segment: MemorySegment,
    layout: VaListLayout,
    offset: usize,
    consumed: usize,
    count: Option<usize>,
}

impl VaList {
    /// The list with no arguments
    pub fn empty(layout: VaListLayout) -> VaList {
        VaList {
            segment: MemorySegment::null(),
            layout,
            offset: 0,
            consumed: 0,
            count: Some(0),
        }
    }

    /// Wrap a list already materialized in native memory
    ///
    /// # Safety
    ///
    /// `address` must point at a list in this layout that stays valid while
    /// `scope` is alive. The list has no known end, so reading past the
    /// last real argument is undefined.
    pub unsafe fn of_address(address: usize, layout: VaListLayout, scope: &Scope) -> VaList {
        VaList {
            segment: MemorySegment::from_raw_parts(address, usize::MAX - address, scope),
            layout,
            offset: 0,
            consumed: 0,
            count: None,
        }
    }

    /// Read the next argument and advance
    pub fn next_arg(&mut self, layout: impl Into<MemoryLayout>) -> FfiResult<Value> {
        let layout = layout.into();
        self.check_next(&layout)?;
        let offset = self.offset;
        let value = self.read(&layout, offset);
        if value.is_ok() {
            self.offset += self.layout.footprint(&layout);
            self.consumed += 1;
        }
        value
    }

    /// Step over arguments without reading them
    pub fn skip(&mut self, layouts: &[MemoryLayout]) -> FfiResult<()> {
        for layout in layouts {
            self.check_next(layout)?;
            self.offset += self.layout.footprint(layout);
            self.consumed += 1;
        }
        Ok(())
    }

    fn check_next(&self, layout: &MemoryLayout) -> FfiResult<()> {
        self.segment.scope().check_valid("va_list read")?;
        self.layout.check(layout)?;
        match self.count {
            Some(count) if self.consumed >= count => Err(FfiError::OutOfArguments {
                consumed: self.consumed,
            }),
            _ => Ok(()),
        }
    }

    fn read(&self, layout: &MemoryLayout, offset: usize) -> FfiResult<Value> {
        let segment = &self.segment;
        match layout {
            MemoryLayout::Value(ValueLayout::I32) => Ok(Value::I32(segment.get_i64(offset)? as i32)),
            MemoryLayout::Value(ValueLayout::I64) => Ok(Value::I64(segment.get_i64(offset)?)),
            MemoryLayout::Value(ValueLayout::F64) => Ok(Value::F64(segment.get_f64(offset)?)),
            MemoryLayout::Value(ValueLayout::Address) => {
                Ok(Value::Address(segment.get_address(offset)?))
            }
            MemoryLayout::Struct(s) if self.layout.is_indirect(layout) => {
                let pointer = segment.get_address(offset)?;
                // the copy lives in the same scope as the list
                let view = unsafe {
                    MemorySegment::from_raw_parts(pointer.address(), s.size(), segment.scope())
                };
                Ok(Value::Struct(view))
            }
            MemoryLayout::Struct(s) => Ok(Value::Struct(segment.as_slice(offset, s.size())?)),
            other => Err(FfiError::unsupported_layout(
                self.layout.abi.as_str(),
                format!("{} cannot be read from a variadic list", other),
            )),
        }
    }

    /// Independent cursor at the same position
    pub fn copy(&self) -> FfiResult<VaList> {
        self.segment.scope().check_valid("va_list copy")?;
        Ok(self.clone())
    }

    /// Backing storage of the whole list
    pub fn segment(&self) -> &MemorySegment {
        &self.segment
    }

    /// Address of the next unread slot
    pub fn current_address(&self) -> usize {
        self.segment.address() + self.offset
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Arguments left, if the list has a known end
    pub fn remaining(&self) -> Option<usize> {
        self.count.map(|count| count - self.consumed)
    }

    pub fn layout(&self) -> VaListLayout {
        self.layout
    }
}

impl fmt::Debug for VaList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaList")
            .field("abi", &self.layout.abi)
            .field("address", &format_args!("{:#x}", self.current_address()))
            .field("consumed", &self.consumed)
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;

    fn sysv() -> VaListLayout {
        VaListLayout::new(AbiName::SysVX86_64, None)
    }

    #[test]
    fn test_scalars_in_order() {
        let scope = Scope::confined();
        let mut builder = VaListBuilder::new(sysv(), &scope).unwrap();
        builder
            .add_arg(MemoryLayout::C_INT, -3i32)
            .unwrap()
            .add_arg(MemoryLayout::C_DOUBLE, 0.5)
            .unwrap()
            .add_arg(MemoryLayout::C_LONG_LONG, 1i64 << 40)
            .unwrap();
        let mut list = builder.build().unwrap();

        assert_eq!(list.next_arg(MemoryLayout::C_INT).unwrap(), Value::I32(-3));
        assert_eq!(list.next_arg(MemoryLayout::C_DOUBLE).unwrap(), Value::F64(0.5));
        assert_eq!(
            list.next_arg(MemoryLayout::C_LONG_LONG).unwrap(),
            Value::I64(1 << 40)
        );
        assert!(matches!(
            list.next_arg(MemoryLayout::C_INT),
            Err(FfiError::OutOfArguments { consumed: 3 })
        ));
        scope.close().unwrap();
    }

    #[test]
    fn test_int_is_sign_extended_in_slot() {
        let scope = Scope::auto();
        let mut builder = VaListBuilder::new(sysv(), &scope).unwrap();
        builder.add_arg(MemoryLayout::C_INT, -1i32).unwrap();
        let list = builder.build().unwrap();
        assert_eq!(list.segment().get_i64(0).unwrap(), -1);
    }

    #[test]
    fn test_promoted_layouts_rejected() {
        let scope = Scope::auto();
        let mut builder = VaListBuilder::new(sysv(), &scope).unwrap();
        assert!(matches!(
            builder.add_arg(MemoryLayout::C_FLOAT, 1.0f32),
            Err(FfiError::UnsupportedLayout { .. })
        ));
        assert!(builder.add_arg(MemoryLayout::C_INT, 1.0f64).is_err());
        assert!(builder.is_empty());
    }

    #[test]
    fn test_indirect_struct_copy() {
        let layout = VaListLayout::new(AbiName::Aapcs64, Some(16));
        let big = MemoryLayout::struct_of(vec![MemoryLayout::C_LONG_LONG; 3]);
        let scope = Scope::auto();
        let source = scope.allocate_layout(&big).unwrap();
        source.set_i64(16, 77).unwrap();

        let mut builder = VaListBuilder::new(layout, &scope).unwrap();
        builder.add_arg(big.clone(), Value::Struct(source.clone())).unwrap();
        let mut list = builder.build().unwrap();
        assert_eq!(list.segment().byte_size(), 8);

        source.set_i64(16, 0).unwrap();
        let read = list.next_arg(big).unwrap();
        assert_eq!(read.as_segment().unwrap().get_i64(16).unwrap(), 77);
    }

    #[test]
    fn test_copy_and_skip() {
        let scope = Scope::auto();
        let mut builder = VaListBuilder::new(sysv(), &scope).unwrap();
        builder
            .add_arg(MemoryLayout::C_INT, 1i32)
            .unwrap()
            .add_arg(MemoryLayout::C_INT, 2i32)
            .unwrap();
        let mut list = builder.build().unwrap();
        let mut copy = list.copy().unwrap();

        list.skip(&[MemoryLayout::C_INT]).unwrap();
        assert_eq!(list.next_arg(MemoryLayout::C_INT).unwrap(), Value::I32(2));
        assert_eq!(copy.next_arg(MemoryLayout::C_INT).unwrap(), Value::I32(1));
        assert_eq!(copy.remaining(), Some(1));
    }

    #[test]
    fn test_closed_scope_blocks_reads() {
        let scope = Scope::confined();
        let mut builder = VaListBuilder::new(sysv(), &scope).unwrap();
        builder.add_arg(MemoryLayout::C_INT, 5i32).unwrap();
        let mut list = builder.build().unwrap();
        scope.close().unwrap();
        assert!(matches!(
            list.next_arg(MemoryLayout::C_INT),
            Err(FfiError::ScopeClosed { .. })
        ));
        assert!(list.copy().is_err());
    }

    #[test]
    fn test_empty_list() {
        let mut list = VaList::empty(sysv());
        assert_eq!(list.remaining(), Some(0));
        assert!(matches!(
            list.next_arg(MemoryLayout::C_INT),
            Err(FfiError::OutOfArguments { consumed: 0 })
        ));
    }

    #[test]
    fn test_of_address_reads_native_slots() {
        let scope = Scope::auto();
        let storage = scope.allocate(16, 8).unwrap();
        storage.set_i64(0, 11).unwrap();
        storage.set_f64(8, 2.5).unwrap();
        let mut list = unsafe { VaList::of_address(storage.address(), sysv(), &scope) };
        assert_eq!(list.next_arg(MemoryLayout::C_LONG_LONG).unwrap(), Value::I64(11));
        assert_eq!(list.next_arg(MemoryLayout::C_DOUBLE).unwrap(), Value::F64(2.5));
        assert_eq!(list.remaining(), None);
    }

    mod proptests {
        use super::*;
        use crate::scope::Scope;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Arg {
            Int(i32),
            Long(i64),
            Double(f64),
        }

        fn arg() -> impl Strategy<Value = Arg> {
            prop_oneof![
                any::<i32>().prop_map(Arg::Int),
                any::<i64>().prop_map(Arg::Long),
                (-1.0e9..1.0e9f64).prop_map(Arg::Double),
            ]
        }

        fn layout_of(arg: &Arg) -> MemoryLayout {
            match arg {
                Arg::Int(_) => MemoryLayout::C_INT,
                Arg::Long(_) => MemoryLayout::C_LONG_LONG,
                Arg::Double(_) => MemoryLayout::C_DOUBLE,
            }
        }

        fn value_of(arg: &Arg) -> Value {
            match arg {
                Arg::Int(v) => Value::I32(*v),
                Arg::Long(v) => Value::I64(*v),
                Arg::Double(v) => Value::F64(*v),
            }
        }

        proptest! {
            #[test]
            fn reads_back_exactly_what_was_added(args in prop::collection::vec(arg(), 0..16)) {
                let scope = Scope::confined();
                let mut builder = VaListBuilder::new(VaListLayout::new(AbiName::Aapcs64, Some(16)), &scope).unwrap();
                for a in &args {
                    builder.add_arg(layout_of(a), value_of(a)).unwrap();
                }
                let mut list = builder.build().unwrap();

                for a in &args {
                    prop_assert_eq!(list.next_arg(layout_of(a)).unwrap(), value_of(a));
                }
                let over_read = matches!(
                    list.next_arg(MemoryLayout::C_INT),
                    Err(FfiError::OutOfArguments { .. })
                );
                prop_assert!(over_read);
                scope.close().unwrap();
            }
        }
    }
}
