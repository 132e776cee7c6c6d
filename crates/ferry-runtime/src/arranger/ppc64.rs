//! 64-bit PowerPC AIX linkage
//!
//! Every argument is mapped onto the parameter save area as a sequence of
//! doubleword slots. The first eight slots are shadowed by r3-r10, the rest
//! live on the caller's stack after the 48-byte linkage area. Floating
//! point arguments additionally take one of f1-f13 while still consuming
//! their slot. Aggregates fill consecutive slots and may straddle the
//! register/stack boundary; they are always returned through memory.

use super::{
    arrange, words, ArgClass, CallArranger, CallingSequence, Classified, LinkerOptions,
    ReturnClass, Storage,
};
use crate::error::FfiResult;
use crate::layout::{FunctionDescriptor, MemoryLayout};
use crate::valist::VaListLayout;
use ferry_config::AbiName;

const GP_SLOTS: usize = 8;
const FP_REGISTERS: u8 = 13;
const LINKAGE_AREA: usize = 48;
const SLOT: usize = 8;

#[derive(Debug, Clone)]
pub struct Ppc64AixArranger {
    max_by_value_aggregate: usize,
}

/// Doubleword slot cursor over the parameter save area
struct Slots {
    next: usize,
    fp_next: u8,
}

impl Slots {
    fn take(&mut self) -> Storage {
        let slot = self.next;
        self.next += 1;
        if slot < GP_SLOTS {
            Storage::Gp(slot as u8)
        } else {
            Storage::Stack {
                offset: LINKAGE_AREA + slot * SLOT,
                size: SLOT,
            }
        }
    }

    fn fp(&mut self) -> Option<Storage> {
        if self.fp_next < FP_REGISTERS {
            self.fp_next += 1;
            Some(Storage::Fp(self.fp_next - 1))
        } else {
            None
        }
    }
}

impl Ppc64AixArranger {
    pub fn new(max_by_value_aggregate: usize) -> Self {
        Self {
            max_by_value_aggregate,
        }
    }

    fn classify(descriptor: &FunctionDescriptor, first_variadic: Option<usize>) -> Classified {
        let mut slots = Slots {
            next: 0,
            fp_next: 0,
        };

        let ret = match descriptor.return_layout() {
            None => ReturnClass::Void,
            Some(MemoryLayout::Value(v)) if v.is_float() => ReturnClass::Direct(Storage::Fp(0)),
            Some(MemoryLayout::Value(_)) => ReturnClass::Direct(Storage::Gp(0)),
            // buffer address occupies the first slot
            Some(_) => ReturnClass::InMemory(slots.take()),
        };

        let args = descriptor
            .args()
            .iter()
            .enumerate()
            .map(|(index, layout)| {
                let variadic = first_variadic.map_or(false, |first| index >= first);
                match layout {
                    MemoryLayout::Value(v) if v.is_float() && !variadic => {
                        let shadow = slots.take();
                        ArgClass::Direct(slots.fp().unwrap_or(shadow))
                    }
                    MemoryLayout::Value(_) => ArgClass::Direct(slots.take()),
                    _ => ArgClass::Aggregate((0..words(layout.size())).map(|_| slots.take()).collect()),
                }
            })
            .collect();

        Classified {
            args,
            ret,
            // the callee may spill r3-r10, so the save area always covers them
            stack_bytes: LINKAGE_AREA + slots.next.max(GP_SLOTS) * SLOT,
            fp_registers_used: slots.fp_next as usize,
        }
    }
}

impl CallArranger for Ppc64AixArranger {
    fn abi(&self) -> AbiName {
        AbiName::Ppc64Aix
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
            Self::classify,
        )
    }

    fn arrange_upcall(&self, descriptor: &FunctionDescriptor) -> FfiResult<CallingSequence> {
        arrange(
            self.abi(),
            self.max_by_value_aggregate,
            descriptor,
            &LinkerOptions::default(),
            true,
            Self::classify,
        )
    }

    fn va_list_layout(&self) -> VaListLayout {
        VaListLayout::new(self.abi(), None)
    }
}
