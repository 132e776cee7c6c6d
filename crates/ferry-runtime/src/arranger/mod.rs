//! Call arranging: ABI classification of native signatures
//!
//! A `CallArranger` turns a `FunctionDescriptor` into a `CallingSequence`,
//! the per-argument placement plan for one ABI: scalars in general purpose
//! or floating point registers, stack slots once those run out, small
//! aggregates split across registers, large aggregates on the stack or
//! behind an implicit pointer, and hidden return buffers.
//!
//! Classification happens once per signature shape. Anything the ABI
//! cannot express fails here with `UnsupportedLayout`, before a handle
//! exists and long before native code runs. The generic rules shared by
//! every ABI live in this module; each submodule only supplies its
//! register file and placement rules.

pub mod aapcs64;
pub mod ppc64;
pub mod sysv;

pub use aapcs64::Aapcs64Arranger;
pub use ppc64::Ppc64AixArranger;
pub use sysv::SysVArranger;

use crate::error::{FfiError, FfiResult};
use crate::layout::{align_up, FunctionDescriptor, MemoryLayout, ValueLayout};
use crate::valist::VaListLayout;
use ferry_config::AbiName;
use std::fmt;
use std::sync::Arc;

/// Per-ABI classification capability
pub trait CallArranger: Send + Sync + fmt::Debug {
    fn abi(&self) -> AbiName;

    /// Placement plan for calling native code from managed code
    fn arrange_downcall(
        &self,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> FfiResult<CallingSequence>;

    /// Placement plan for native code calling into a managed target
    fn arrange_upcall(&self, descriptor: &FunctionDescriptor) -> FfiResult<CallingSequence>;

    /// How this ABI lays out variadic arguments in memory
    fn va_list_layout(&self) -> VaListLayout;
}

/// Pick the arranger for an ABI
pub fn arranger_for(abi: AbiName, max_by_value_aggregate: usize) -> Arc<dyn CallArranger> {
    match abi {
        AbiName::SysVX86_64 => Arc::new(SysVArranger::new(max_by_value_aggregate)),
        AbiName::Aapcs64 => Arc::new(Aapcs64Arranger::new(max_by_value_aggregate)),
        AbiName::Ppc64Aix => Arc::new(Ppc64AixArranger::new(max_by_value_aggregate)),
    }
}

/// ABI of the running process, if one is supported
pub fn host_abi() -> Option<AbiName> {
    if cfg!(all(target_arch = "x86_64", not(target_os = "windows"))) {
        Some(AbiName::SysVX86_64)
    } else if cfg!(all(target_arch = "aarch64", target_os = "linux")) {
        Some(AbiName::Aapcs64)
    } else if cfg!(all(target_arch = "powerpc64", target_os = "aix")) {
        Some(AbiName::Ppc64Aix)
    } else {
        None
    }
}

/// Per-call linking options
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LinkerOptions {
    first_variadic_arg: Option<usize>,
    allow_upcalls: Option<bool>,
    trailing_va_list: bool,
}

impl LinkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments from `index` on are variadic
    pub fn first_variadic_arg(mut self, index: usize) -> Self {
        self.first_variadic_arg = Some(index);
        self
    }

    /// Whether the native side may call back into managed code
    pub fn may_call_back(mut self, allowed: bool) -> Self {
        self.allow_upcalls = Some(allowed);
        self
    }

    /// The last argument is a `va_list`
    pub fn trailing_va_list(mut self) -> Self {
        self.trailing_va_list = true;
        self
    }

    pub fn variadic_index(&self) -> Option<usize> {
        self.first_variadic_arg
    }

    pub fn allows_upcalls(&self) -> bool {
        self.allow_upcalls.unwrap_or(true)
    }

    pub fn has_trailing_va_list(&self) -> bool {
        self.trailing_va_list
    }

    /// Fill unset choices from linker defaults
    pub(crate) fn resolved(&self, allow_upcalls_by_default: bool) -> Self {
        let mut resolved = self.clone();
        resolved.allow_upcalls = Some(self.allow_upcalls.unwrap_or(allow_upcalls_by_default));
        resolved
    }
}

/// A single register or stack location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// General purpose argument register, numbered from the first one
    Gp(u8),
    /// Floating point / vector argument register
    Fp(u8),
    /// Outgoing stack area
    Stack { offset: usize, size: usize },
}

impl fmt::Display for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Storage::Gp(n) => write!(f, "gp{}", n),
            Storage::Fp(n) => write!(f, "fp{}", n),
            Storage::Stack { offset, size } => write!(f, "stack+{}[{}]", offset, size),
        }
    }
}

/// Placement of one argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgClass {
    /// A scalar in one location
    Direct(Storage),
    /// A struct split into word-sized parts
    Aggregate(Vec<Storage>),
    /// A struct copied wholesale onto the stack
    OnStack { offset: usize, size: usize },
    /// A pointer to a caller-owned copy of the struct
    Indirect(Storage),
}

/// Placement of the return value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnClass {
    Void,
    Direct(Storage),
    Aggregate(Vec<Storage>),
    /// Caller passes a buffer address in the given register
    InMemory(Storage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgBinding {
    pub index: usize,
    pub layout: MemoryLayout,
    pub class: ArgClass,
    pub variadic: bool,
}

/// Compiled placement plan for one signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingSequence {
    abi: AbiName,
    descriptor: FunctionDescriptor,
    args: Vec<ArgBinding>,
    ret: ReturnClass,
    stack_bytes: usize,
    fp_registers_used: usize,
    first_variadic: Option<usize>,
    allows_upcalls: bool,
    trailing_va_list: bool,
    for_upcall: bool,
}

impl CallingSequence {
    pub fn abi(&self) -> AbiName {
        self.abi
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        &self.descriptor
    }

    pub fn args(&self) -> &[ArgBinding] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&ArgBinding> {
        self.args.get(index)
    }

    pub fn return_class(&self) -> &ReturnClass {
        &self.ret
    }

    /// Bytes of outgoing stack the call needs
    pub fn stack_bytes(&self) -> usize {
        self.stack_bytes
    }

    /// Vector registers used; variadic System V calls pass this in %al
    pub fn fp_registers_used(&self) -> usize {
        self.fp_registers_used
    }

    pub fn first_variadic(&self) -> Option<usize> {
        self.first_variadic
    }

    pub fn is_variadic(&self) -> bool {
        self.first_variadic.is_some()
    }

    pub fn allows_upcalls(&self) -> bool {
        self.allows_upcalls
    }

    pub fn has_trailing_va_list(&self) -> bool {
        self.trailing_va_list
    }

    pub fn is_upcall(&self) -> bool {
        self.for_upcall
    }

    pub fn returns_in_memory(&self) -> bool {
        matches!(self.ret, ReturnClass::InMemory(_))
    }
}

/// Register and stack cursor used while classifying one signature
#[derive(Debug)]
pub(crate) struct Registers {
    gp_next: u8,
    gp_max: u8,
    fp_next: u8,
    fp_max: u8,
    stack: usize,
    stack_base: usize,
}

impl Registers {
    pub(crate) fn new(gp_max: u8, fp_max: u8) -> Self {
        Self::with_stack_base(gp_max, fp_max, 0)
    }

    pub(crate) fn with_stack_base(gp_max: u8, fp_max: u8, stack_base: usize) -> Self {
        Self {
            gp_next: 0,
            gp_max,
            fp_next: 0,
            fp_max,
            stack: 0,
            stack_base,
        }
    }

    pub(crate) fn gp(&mut self) -> Option<Storage> {
        if self.gp_next < self.gp_max {
            self.gp_next += 1;
            Some(Storage::Gp(self.gp_next - 1))
        } else {
            None
        }
    }

    pub(crate) fn fp(&mut self) -> Option<Storage> {
        if self.fp_next < self.fp_max {
            self.fp_next += 1;
            Some(Storage::Fp(self.fp_next - 1))
        } else {
            None
        }
    }

    pub(crate) fn gp_left(&self) -> usize {
        (self.gp_max - self.gp_next) as usize
    }

    pub(crate) fn fp_left(&self) -> usize {
        (self.fp_max - self.fp_next) as usize
    }

    pub(crate) fn fp_used(&self) -> usize {
        self.fp_next as usize
    }

    /// Mark all general purpose registers as used
    pub(crate) fn exhaust_gp(&mut self) {
        self.gp_next = self.gp_max;
    }

    pub(crate) fn exhaust_fp(&mut self) {
        self.fp_next = self.fp_max;
    }

    /// Reserve stack space in 8-byte slots
    pub(crate) fn stack(&mut self, size: usize, align: usize) -> (usize, usize) {
        let offset = align_up(self.stack, align.max(8));
        self.stack = offset + align_up(size.max(1), 8);
        (self.stack_base + offset, size)
    }

    pub(crate) fn stack_slot(&mut self, size: usize) -> Storage {
        let (offset, size) = self.stack(size, 8);
        Storage::Stack { offset, size }
    }

    pub(crate) fn stack_bytes(&self) -> usize {
        self.stack
    }
}

/// Classification result from an ABI specific pass
pub(crate) struct Classified {
    pub(crate) args: Vec<ArgClass>,
    pub(crate) ret: ReturnClass,
    pub(crate) stack_bytes: usize,
    pub(crate) fp_registers_used: usize,
}

/// Shared validation and assembly around an ABI specific classifier
pub(crate) fn arrange<F>(
    abi: AbiName,
    max_by_value_aggregate: usize,
    descriptor: &FunctionDescriptor,
    options: &LinkerOptions,
    for_upcall: bool,
    classify: F,
) -> FfiResult<CallingSequence>
where
    F: FnOnce(&FunctionDescriptor, Option<usize>) -> Classified,
{
    validate(abi, max_by_value_aggregate, descriptor, options, for_upcall)?;

    let first_variadic = options.variadic_index();
    let classified = classify(descriptor, first_variadic);
    let args = descriptor
        .args()
        .iter()
        .zip(classified.args)
        .enumerate()
        .map(|(index, (layout, class))| ArgBinding {
            index,
            layout: layout.clone(),
            class,
            variadic: first_variadic.map_or(false, |first| index >= first),
        })
        .collect();

    Ok(CallingSequence {
        abi,
        descriptor: descriptor.clone(),
        args,
        ret: classified.ret,
        stack_bytes: classified.stack_bytes,
        fp_registers_used: classified.fp_registers_used,
        first_variadic,
        allows_upcalls: options.allows_upcalls(),
        trailing_va_list: options.has_trailing_va_list(),
        for_upcall,
    })
}

fn validate(
    abi: AbiName,
    limit: usize,
    descriptor: &FunctionDescriptor,
    options: &LinkerOptions,
    for_upcall: bool,
) -> FfiResult<()> {
    let name = abi.as_str();

    for (index, layout) in descriptor.args().iter().enumerate() {
        validate_layout(limit, layout)
            .map_err(|reason| FfiError::unsupported_layout(name, format!("argument {}: {}", index, reason)))?;
    }
    if let Some(ret) = descriptor.return_layout() {
        validate_layout(limit, ret)
            .map_err(|reason| FfiError::unsupported_layout(name, format!("return: {}", reason)))?;
    }

    if let Some(first) = options.variadic_index() {
        if for_upcall {
            return Err(FfiError::unsupported_layout(
                name,
                "variadic upcalls are not supported",
            ));
        }
        if first > descriptor.args().len() {
            return Err(FfiError::unsupported_layout(
                name,
                format!(
                    "first variadic index {} is past the {} declared arguments",
                    first,
                    descriptor.args().len()
                ),
            ));
        }
        for (index, layout) in descriptor.args().iter().enumerate().skip(first) {
            if let Some(ValueLayout::I8 | ValueLayout::I16 | ValueLayout::F32) = layout.as_value() {
                return Err(FfiError::unsupported_layout(
                    name,
                    format!(
                        "variadic argument {} has layout {}, which C promotes; pass the promoted type",
                        index, layout
                    ),
                ));
            }
        }
    }

    if options.has_trailing_va_list()
        && descriptor.args().last() != Some(&MemoryLayout::C_POINTER)
    {
        return Err(FfiError::unsupported_layout(
            name,
            "trailing va_list requires a final pointer argument",
        ));
    }

    Ok(())
}

fn validate_layout(limit: usize, layout: &MemoryLayout) -> Result<(), String> {
    match layout {
        MemoryLayout::Value(_) => Ok(()),
        MemoryLayout::Padding(_) => Err("padding cannot be passed".to_string()),
        MemoryLayout::Struct(s) => {
            if s.size() == 0 || layout.scalars().is_empty() {
                return Err(format!("struct {} has no data members", layout));
            }
            if s.size() > limit {
                return Err(format!(
                    "struct of {} bytes exceeds the by-value limit of {} bytes",
                    s.size(),
                    limit
                ));
            }
            // native calls are built from the data members alone
            if !s.padding_is_natural() {
                return Err(format!(
                    "struct {} declares padding that moves members off their natural alignment",
                    layout
                ));
            }
            Ok(())
        }
    }
}

/// Number of 8-byte words needed for `size` bytes
pub(crate) fn words(size: usize) -> usize {
    (size + 7) / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> MemoryLayout {
        MemoryLayout::struct_of(vec![MemoryLayout::C_INT, MemoryLayout::C_INT])
    }

    #[test]
    fn test_padding_argument_rejected() {
        let arranger = SysVArranger::new(1024);
        let desc = FunctionDescriptor::of_void(vec![MemoryLayout::Padding(4)]);
        assert!(matches!(
            arranger.arrange_downcall(&desc, &LinkerOptions::new()),
            Err(FfiError::UnsupportedLayout { .. })
        ));
    }

    #[test]
    fn test_padding_off_natural_alignment_rejected() {
        let shifted = MemoryLayout::struct_of(vec![
            MemoryLayout::C_INT,
            MemoryLayout::Padding(4),
            MemoryLayout::C_INT,
        ]);
        let natural = MemoryLayout::struct_of(vec![
            MemoryLayout::C_FLOAT,
            MemoryLayout::Padding(4),
            MemoryLayout::C_DOUBLE,
        ]);
        let arranger = SysVArranger::new(1024);

        match arranger.arrange_downcall(&FunctionDescriptor::of_void(vec![shifted]), &LinkerOptions::new()) {
            Err(FfiError::UnsupportedLayout { reason, .. }) => assert!(reason.contains("natural alignment")),
            other => panic!("expected unsupported layout, got {:?}", other),
        }
        let seq = arranger
            .arrange_downcall(&FunctionDescriptor::of_void(vec![natural]), &LinkerOptions::new())
            .unwrap();
        assert_eq!(seq.args()[0].class, ArgClass::Aggregate(vec![Storage::Fp(0), Storage::Fp(1)]));
    }

    #[test]
    fn test_aggregate_limit_enforced() {
        let arranger = Aapcs64Arranger::new(4);
        let desc = FunctionDescriptor::of_void(vec![point()]);
        match arranger.arrange_downcall(&desc, &LinkerOptions::new()) {
            Err(FfiError::UnsupportedLayout { abi, reason }) => {
                assert_eq!(abi, "aapcs64");
                assert!(reason.contains("by-value limit"));
            }
            other => panic!("expected unsupported layout, got {:?}", other),
        }
    }

    #[test]
    fn test_variadic_float_rejected() {
        let arranger = SysVArranger::new(1024);
        let desc =
            FunctionDescriptor::of(MemoryLayout::C_INT, vec![MemoryLayout::C_POINTER, MemoryLayout::C_FLOAT]);
        let options = LinkerOptions::new().first_variadic_arg(1);
        assert!(arranger.arrange_downcall(&desc, &options).is_err());
    }

    #[test]
    fn test_variadic_index_out_of_range() {
        let arranger = SysVArranger::new(1024);
        let desc = FunctionDescriptor::of_void(vec![MemoryLayout::C_INT]);
        let options = LinkerOptions::new().first_variadic_arg(2);
        assert!(arranger.arrange_downcall(&desc, &options).is_err());
    }

    #[test]
    fn test_trailing_va_list_needs_pointer() {
        let arranger = SysVArranger::new(1024);
        let desc = FunctionDescriptor::of_void(vec![MemoryLayout::C_INT]);
        let options = LinkerOptions::new().trailing_va_list();
        assert!(arranger.arrange_downcall(&desc, &options).is_err());

        let desc = FunctionDescriptor::of_void(vec![MemoryLayout::C_INT, MemoryLayout::C_POINTER]);
        let seq = arranger.arrange_downcall(&desc, &options).unwrap();
        assert!(seq.has_trailing_va_list());
    }

    #[test]
    fn test_options_resolution() {
        let options = LinkerOptions::new();
        assert!(!options.resolved(false).allows_upcalls());
        assert!(options.resolved(true).allows_upcalls());
        let explicit = LinkerOptions::new().may_call_back(false);
        assert!(!explicit.resolved(true).allows_upcalls());
    }

    #[test]
    fn test_variadic_flags_on_bindings() {
        let arranger = SysVArranger::new(1024);
        let desc = FunctionDescriptor::of(
            MemoryLayout::C_INT,
            vec![MemoryLayout::C_POINTER, MemoryLayout::C_INT, MemoryLayout::C_DOUBLE],
        );
        let seq = arranger
            .arrange_downcall(&desc, &LinkerOptions::new().first_variadic_arg(1))
            .unwrap();
        let flags: Vec<bool> = seq.args().iter().map(|a| a.variadic).collect();
        assert_eq!(flags, vec![false, true, true]);
        assert_eq!(seq.fp_registers_used(), 1);
    }

    #[test]
    fn test_upcall_rejects_variadic_via_validation() {
        let desc = FunctionDescriptor::of_void(vec![MemoryLayout::C_INT]);
        let result = arrange(
            AbiName::SysVX86_64,
            1024,
            &desc,
            &LinkerOptions::new().first_variadic_arg(0),
            true,
            |_, _| unreachable!(),
        );
        assert!(result.is_err());
    }
}
