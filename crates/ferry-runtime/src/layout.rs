//! Memory layouts and call descriptors
//!
//! Layouts describe the shape of native data without owning any of it:
//! - `ValueLayout`: one C scalar (integers, floating point, addresses)
//! - `StructLayout`: a C struct with natural member alignment
//! - `FunctionDescriptor`: argument layouts plus an optional return layout
//!
//! Struct offsets follow the C rules: each member starts at the next
//! multiple of its alignment and the total size is rounded up to the
//! strictest member alignment.

use std::fmt;

/// A single C scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueLayout {
    /// C char
    I8,
    /// C short
    I16,
    /// C int
    I32,
    /// C long long (and long on LP64)
    I64,
    /// C float
    F32,
    /// C double
    F64,
    /// Any data or function pointer
    Address,
}

impl ValueLayout {
    pub fn size(&self) -> usize {
        match self {
            ValueLayout::I8 => 1,
            ValueLayout::I16 => 2,
            ValueLayout::I32 | ValueLayout::F32 => 4,
            ValueLayout::I64 | ValueLayout::F64 => 8,
            ValueLayout::Address => std::mem::size_of::<usize>(),
        }
    }

    pub fn align(&self) -> usize {
        self.size()
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ValueLayout::F32 | ValueLayout::F64)
    }

    /// Display name used in signatures and error messages
    pub fn name(&self) -> &'static str {
        match self {
            ValueLayout::I8 => "i8",
            ValueLayout::I16 => "i16",
            ValueLayout::I32 => "i32",
            ValueLayout::I64 => "i64",
            ValueLayout::F32 => "f32",
            ValueLayout::F64 => "f64",
            ValueLayout::Address => "ptr",
        }
    }
}

impl fmt::Display for ValueLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Member of a struct layout with its computed offset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructField {
    pub layout: MemoryLayout,
    pub offset: usize,
}

/// A C struct
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    fields: Vec<StructField>,
    size: usize,
    align: usize,
}

impl StructLayout {
    /// Lay out members in declaration order
    pub fn new(members: Vec<MemoryLayout>) -> Self {
        let mut offset = 0usize;
        let mut align = 1usize;
        let mut fields = Vec::with_capacity(members.len());

        for layout in members {
            let member_align = layout.align();
            offset = align_up(offset, member_align);
            align = align.max(member_align);
            let size = layout.size();
            fields.push(StructField { layout, offset });
            offset += size;
        }

        Self {
            fields,
            size: align_up(offset, align),
            align,
        }
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Whether dropping the explicit padding leaves every data member, and
    /// the total size, where natural alignment would put them
    pub fn padding_is_natural(&self) -> bool {
        let data: Vec<&StructField> = self
            .fields
            .iter()
            .filter(|field| !matches!(field.layout, MemoryLayout::Padding(_)))
            .collect();
        let natural = StructLayout::new(data.iter().map(|field| field.layout.clone()).collect());

        natural.size == self.size
            && natural
                .fields
                .iter()
                .zip(&data)
                .all(|(packed, declared)| packed.offset == declared.offset)
            && data.iter().all(|field| match &field.layout {
                MemoryLayout::Struct(inner) => inner.padding_is_natural(),
                _ => true,
            })
    }
}

/// Shape of a region of native memory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLayout {
    Value(ValueLayout),
    Struct(StructLayout),
    /// Explicit filler bytes inside a struct
    Padding(usize),
}

impl MemoryLayout {
    pub const C_CHAR: MemoryLayout = MemoryLayout::Value(ValueLayout::I8);
    pub const C_SHORT: MemoryLayout = MemoryLayout::Value(ValueLayout::I16);
    pub const C_INT: MemoryLayout = MemoryLayout::Value(ValueLayout::I32);
    pub const C_LONG_LONG: MemoryLayout = MemoryLayout::Value(ValueLayout::I64);
    pub const C_FLOAT: MemoryLayout = MemoryLayout::Value(ValueLayout::F32);
    pub const C_DOUBLE: MemoryLayout = MemoryLayout::Value(ValueLayout::F64);
    pub const C_POINTER: MemoryLayout = MemoryLayout::Value(ValueLayout::Address);

    /// Build a struct layout from its members
    ///
    /// ```
    /// # use ferry_runtime::layout::MemoryLayout;
    /// let point = MemoryLayout::struct_of(vec![MemoryLayout::C_INT, MemoryLayout::C_INT]);
    /// assert_eq!(point.size(), 8);
    /// assert_eq!(point.align(), 4);
    /// ```
    pub fn struct_of(members: Vec<MemoryLayout>) -> Self {
        MemoryLayout::Struct(StructLayout::new(members))
    }

    pub fn size(&self) -> usize {
        match self {
            MemoryLayout::Value(v) => v.size(),
            MemoryLayout::Struct(s) => s.size(),
            MemoryLayout::Padding(n) => *n,
        }
    }

    pub fn align(&self) -> usize {
        match self {
            MemoryLayout::Value(v) => v.align(),
            MemoryLayout::Struct(s) => s.align(),
            MemoryLayout::Padding(_) => 1,
        }
    }

    pub fn as_value(&self) -> Option<ValueLayout> {
        match self {
            MemoryLayout::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, MemoryLayout::Struct(_))
    }

    /// Every scalar inside this layout with its byte offset, depth first
    pub fn scalars(&self) -> Vec<(usize, ValueLayout)> {
        let mut out = Vec::new();
        self.collect_scalars(0, &mut out);
        out
    }

    fn collect_scalars(&self, base: usize, out: &mut Vec<(usize, ValueLayout)>) {
        match self {
            MemoryLayout::Value(v) => out.push((base, *v)),
            MemoryLayout::Struct(s) => {
                for field in s.fields() {
                    field.layout.collect_scalars(base + field.offset, out);
                }
            }
            MemoryLayout::Padding(_) => {}
        }
    }
}

impl From<ValueLayout> for MemoryLayout {
    fn from(v: ValueLayout) -> Self {
        MemoryLayout::Value(v)
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLayout::Value(v) => write!(f, "{}", v),
            MemoryLayout::Padding(n) => write!(f, "x{}", n),
            MemoryLayout::Struct(s) => {
                f.write_str("[")?;
                for (i, field) in s.fields().iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", field.layout)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Argument and return layouts of a native function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionDescriptor {
    args: Vec<MemoryLayout>,
    ret: Option<MemoryLayout>,
}

impl FunctionDescriptor {
    pub fn of(ret: MemoryLayout, args: Vec<MemoryLayout>) -> Self {
        Self {
            args,
            ret: Some(ret),
        }
    }

    pub fn of_void(args: Vec<MemoryLayout>) -> Self {
        Self { args, ret: None }
    }

    /// Copy of this descriptor with extra trailing arguments
    pub fn append_args(&self, extra: impl IntoIterator<Item = MemoryLayout>) -> Self {
        let mut args = self.args.clone();
        args.extend(extra);
        Self {
            args,
            ret: self.ret.clone(),
        }
    }

    pub fn args(&self) -> &[MemoryLayout] {
        &self.args
    }

    pub fn return_layout(&self) -> Option<&MemoryLayout> {
        self.ret.as_ref()
    }
}

impl fmt::Display for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")?;
        match &self.ret {
            Some(ret) => write!(f, "{}", ret),
            None => f.write_str("v"),
        }
    }
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
