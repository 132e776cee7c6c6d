//! System V AMD64 classification
//!
//! Six integer registers (rdi, rsi, rdx, rcx, r8, r9) and eight vector
//! registers (xmm0-xmm7). Structs up to 16 bytes are split into eightbytes
//! classified INTEGER or SSE; anything larger is MEMORY and is copied onto
//! the stack. Large returns go through a hidden buffer pointer in rdi.

use super::{
    arrange, words, ArgClass, CallArranger, CallingSequence, Classified, LinkerOptions,
    Registers, ReturnClass, Storage,
};
use crate::error::FfiResult;
use crate::layout::{FunctionDescriptor, MemoryLayout};
use crate::valist::VaListLayout;
use ferry_config::AbiName;

const GP_REGISTERS: u8 = 6;
const FP_REGISTERS: u8 = 8;
const MAX_REGISTER_AGGREGATE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EightbyteClass {
    Integer,
    Sse,
}

#[derive(Debug, Clone)]
pub struct SysVArranger {
    max_by_value_aggregate: usize,
}

impl SysVArranger {
    pub fn new(max_by_value_aggregate: usize) -> Self {
        Self {
            max_by_value_aggregate,
        }
    }

    fn classify(descriptor: &FunctionDescriptor) -> Classified {
        let mut regs = Registers::new(GP_REGISTERS, FP_REGISTERS);

        let ret = match descriptor.return_layout() {
            None => ReturnClass::Void,
            Some(MemoryLayout::Value(v)) if v.is_float() => ReturnClass::Direct(Storage::Fp(0)),
            Some(MemoryLayout::Value(_)) => ReturnClass::Direct(Storage::Gp(0)),
            Some(layout) if layout.size() > MAX_REGISTER_AGGREGATE => {
                // hidden pointer takes rdi
                let pointer = regs.gp().unwrap_or(Storage::Gp(0));
                ReturnClass::InMemory(pointer)
            }
            Some(layout) => {
                let (mut gp, mut fp) = (0u8, 0u8);
                let parts = eightbytes(layout)
                    .into_iter()
                    .map(|class| match class {
                        EightbyteClass::Integer => {
                            gp += 1;
                            Storage::Gp(gp - 1)
                        }
                        EightbyteClass::Sse => {
                            fp += 1;
                            Storage::Fp(fp - 1)
                        }
                    })
                    .collect();
                ReturnClass::Aggregate(parts)
            }
        };

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
            let size = layout.size();
            if size > MAX_REGISTER_AGGREGATE {
                return on_stack(regs, layout);
            }
            let classes = eightbytes(layout);
            let need_gp = classes.iter().filter(|c| **c == EightbyteClass::Integer).count();
            let need_fp = classes.len() - need_gp;
            // all or nothing: a struct is never split between registers and stack
            if regs.gp_left() < need_gp || regs.fp_left() < need_fp {
                return on_stack(regs, layout);
            }
            let parts = classes
                .into_iter()
                .filter_map(|class| match class {
                    EightbyteClass::Integer => regs.gp(),
                    EightbyteClass::Sse => regs.fp(),
                })
                .collect();
            ArgClass::Aggregate(parts)
        }
    }
}

fn on_stack(regs: &mut Registers, layout: &MemoryLayout) -> ArgClass {
    let (offset, size) = regs.stack(layout.size(), layout.align());
    ArgClass::OnStack { offset, size }
}

/// Class of each eightbyte of a struct no larger than 16 bytes
fn eightbytes(layout: &MemoryLayout) -> Vec<EightbyteClass> {
    let count = words(layout.size());
    let mut classes: Vec<Option<EightbyteClass>> = vec![None; count];
    for (offset, scalar) in layout.scalars() {
        let slot = &mut classes[offset / 8];
        *slot = match (*slot, scalar.is_float()) {
            (Some(EightbyteClass::Integer), _) | (_, false) => Some(EightbyteClass::Integer),
            _ => Some(EightbyteClass::Sse),
        };
    }
    // an eightbyte of pure padding travels as an integer
    classes
        .into_iter()
        .map(|class| class.unwrap_or(EightbyteClass::Integer))
        .collect()
}

impl CallArranger for SysVArranger {
    fn abi(&self) -> AbiName {
        AbiName::SysVX86_64
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
        VaListLayout::new(self.abi(), None)
    }
}
