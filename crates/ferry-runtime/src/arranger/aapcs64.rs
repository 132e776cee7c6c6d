//! AArch64 procedure call standard (Linux flavour)
//!
//! x0-x7 and v0-v7 carry arguments. Homogeneous floating-point aggregates
//! of up to four members travel in consecutive vector registers; other
//! composites over 16 bytes are replaced by a pointer to a caller copy.
//! Once a class of registers cannot hold a composite it is marked
//! exhausted, so later arguments of that class go to the stack too.

use super::{
    arrange, words, ArgClass, CallArranger, CallingSequence, Classified, LinkerOptions,
    Registers, ReturnClass, Storage,
};
use crate::error::FfiResult;
use crate::layout::{FunctionDescriptor, MemoryLayout, ValueLayout};
use crate::valist::VaListLayout;
use ferry_config::AbiName;

const GP_REGISTERS: u8 = 8;
const FP_REGISTERS: u8 = 8;
const MAX_REGISTER_AGGREGATE: usize = 16;
const MAX_HFA_MEMBERS: usize = 4;
/// Indirect result location register
const XR: u8 = 8;

#[derive(Debug, Clone)]
pub struct Aapcs64Arranger {
    max_by_value_aggregate: usize,
}

impl Aapcs64Arranger {
    pub fn new(max_by_value_aggregate: usize) -> Self {
        Self {
            max_by_value_aggregate,
        }
    }

    fn classify(descriptor: &FunctionDescriptor) -> Classified {
        let ret = match descriptor.return_layout() {
            None => ReturnClass::Void,
            Some(MemoryLayout::Value(v)) if v.is_float() => ReturnClass::Direct(Storage::Fp(0)),
            Some(MemoryLayout::Value(_)) => ReturnClass::Direct(Storage::Gp(0)),
            Some(layout) => match homogeneous_float(layout) {
                Some((count, _)) => {
                    ReturnClass::Aggregate((0..count as u8).map(Storage::Fp).collect())
                }
                None if layout.size() <= MAX_REGISTER_AGGREGATE => {
                    ReturnClass::Aggregate((0..words(layout.size()) as u8).map(Storage::Gp).collect())
                }
                None => ReturnClass::InMemory(Storage::Gp(XR)),
            },
        };

        let mut regs = Registers::new(GP_REGISTERS, FP_REGISTERS);
        let args = descriptor
            .args()
            .iter()
            .map(|layout| classify_arg(&mut regs, layout))
            .collect();

        Classified {
            args,
            ret,
            stack_bytes: regs.stack_bytes(),
            fp_registers_used: regs.fp_used(),
        }
    }
}

fn classify_arg(regs: &mut Registers, layout: &MemoryLayout) -> ArgClass {
    match layout {
        MemoryLayout::Value(v) if v.is_float() => {
            ArgClass::Direct(regs.fp().unwrap_or_else(|| regs.stack_slot(v.size())))
        }
        MemoryLayout::Value(v) => {
            ArgClass::Direct(regs.gp().unwrap_or_else(|| regs.stack_slot(v.size())))
        }
        _ => {
            if let Some((count, _)) = homogeneous_float(layout) {
                if regs.fp_left() >= count {
                    return ArgClass::Aggregate((0..count).filter_map(|_| regs.fp()).collect());
                }
                regs.exhaust_fp();
                return on_stack(regs, layout);
            }

            if layout.size() > MAX_REGISTER_AGGREGATE {
                let pointer = regs.gp().unwrap_or_else(|| regs.stack_slot(8));
                return ArgClass::Indirect(pointer);
            }

            let needed = words(layout.size());
            if regs.gp_left() >= needed {
                return ArgClass::Aggregate((0..needed).filter_map(|_| regs.gp()).collect());
            }
            regs.exhaust_gp();
            on_stack(regs, layout)
        }
    }
}

fn on_stack(regs: &mut Registers, layout: &MemoryLayout) -> ArgClass {
    let (offset, size) = regs.stack(layout.size(), layout.align());
    ArgClass::OnStack { offset, size }
}

/// Member count and element type of a homogeneous floating-point aggregate
fn homogeneous_float(layout: &MemoryLayout) -> Option<(usize, ValueLayout)> {
    if !layout.is_struct() {
        return None;
    }
    let scalars = layout.scalars();
    let (_, first) = *scalars.first()?;
    if !first.is_float() || scalars.len() > MAX_HFA_MEMBERS {
        return None;
    }
    let uniform = scalars.iter().all(|(_, s)| *s == first);
    // explicit padding disqualifies the aggregate
    let dense = scalars.len() * first.size() == layout.size();
    (uniform && dense).then_some((scalars.len(), first))
}

impl CallArranger for Aapcs64Arranger {
    fn abi(&self) -> AbiName {
        AbiName::Aapcs64
    }

    fn arrange_downcall(
        &self,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> FfiResult<CallingSequence> {
        arrange(
            self.abi(),
            self.max_by_value_aggregate,
            descriptor,
            options,
            false,
            |desc, _| Self::classify(desc),
        )
    }

    fn arrange_upcall(&self, descriptor: &FunctionDescriptor) -> FfiResult<CallingSequence> {
        arrange(
            self.abi(),
            self.max_by_value_aggregate,
            descriptor,
            &LinkerOptions::default(),
            true,
            |desc, _| Self::classify(desc),
        )
    }

    fn va_list_layout(&self) -> VaListLayout {
        VaListLayout::new(self.abi(), Some(MAX_REGISTER_AGGREGATE))
    }
}
