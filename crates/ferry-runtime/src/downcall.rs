//! Downcall handles: invoking native functions through a calling sequence
//!
//! Every invocation follows the same discipline:
//! 1. check arity and argument kinds against the descriptor
//! 2. acquire the target's scope and every scope an argument depends on
//! 3. marshal, call through libffi, and surface any upcall failure
//! 4. decode the result and release every acquire, on every path
//!
//! A failed acquire aborts the call before any argument is encoded, so a
//! closed scope never reaches native code.

use crate::arranger::CallingSequence;
use crate::error::{FfiError, FfiResult};
use crate::layout::FunctionDescriptor;
use crate::marshal;
use crate::scope::{AcquireGuard, Scope};
use crate::segment::MemorySegment;
use crate::upcall;
use crate::value::Value;
use libffi::middle::{Cif, CodePtr};
use libffi::raw;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// A callable native function
pub struct DowncallHandle {
    target: MemorySegment,
    sequence: Arc<CallingSequence>,
    cif: Cif,
}

// The cif is immutable after construction and libffi only reads it.
unsafe impl Send for DowncallHandle {}
unsafe impl Sync for DowncallHandle {}

impl DowncallHandle {
    pub(crate) fn new(target: MemorySegment, sequence: Arc<CallingSequence>) -> Self {
        let cif = marshal::build_cif(&sequence);
        Self {
            target,
            sequence,
            cif,
        }
    }

    pub fn calling_sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    pub fn descriptor(&self) -> &FunctionDescriptor {
        self.sequence.descriptor()
    }

    pub fn address(&self) -> usize {
        self.target.address()
    }

    /// Call the function; struct results live in a fresh automatic scope
    pub fn invoke(&self, args: &[Value]) -> FfiResult<Value> {
        let needs_scope = self
            .descriptor()
            .return_layout()
            .map_or(false, |layout| layout.is_struct());
        if needs_scope {
            self.invoke_in(args, &Scope::auto())
        } else {
            self.invoke_in(args, &Scope::global())
        }
    }

    /// Call the function, allocating a struct result in `result_scope`
    pub fn invoke_in(&self, args: &[Value], result_scope: &Scope) -> FfiResult<Value> {
        let descriptor = self.descriptor();
        if args.len() != descriptor.args().len() {
            return Err(FfiError::ArityMismatch {
                expected: descriptor.args().len(),
                got: args.len(),
            });
        }
        for (index, (layout, value)) in descriptor.args().iter().zip(args).enumerate() {
            if !value.matches(layout) {
                return Err(FfiError::type_mismatch(index, layout, value.type_name()));
            }
        }

        let guards = self.acquire_all(args, result_scope)?;

        let mut buffers = marshal::encode_args(descriptor, args)?;
        let mut pointers = buffers.pointers();
        let mut ret = marshal::return_buffer(descriptor);

        trace!(address = self.address(), signature = %descriptor, "downcall");
        let frame = upcall::enter_downcall(self.sequence.allows_upcalls());
        let code = CodePtr(self.target.address() as *mut c_void);
        // SAFETY: the cif matches the descriptor, every argument pointer refers
        // to a buffer of the right size, and all scopes involved are held.
        unsafe {
            raw::ffi_call(
                self.cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                ret.as_mut_ptr() as *mut c_void,
                pointers.as_mut_ptr(),
            );
        }
        frame.finish()?;

        let value = marshal::decode_return(descriptor.return_layout(), &ret, result_scope);
        drop(guards);
        value
    }

    /// Acquire every scope this call depends on, deduplicated by identity
    fn acquire_all(&self, args: &[Value], result_scope: &Scope) -> FfiResult<Vec<AcquireGuard>> {
        let mut scopes: Vec<&Scope> = Vec::with_capacity(args.len() + 2);
        scopes.push(self.target.scope());
        scopes.extend(args.iter().filter_map(Value::scope));
        if self
            .descriptor()
            .return_layout()
            .map_or(false, |layout| layout.is_struct())
        {
            scopes.push(result_scope);
        }

        let mut guards: Vec<AcquireGuard> = Vec::with_capacity(scopes.len());
        for (position, scope) in scopes.iter().enumerate() {
            if scopes[..position].iter().any(|seen| seen.same_as(scope)) {
                continue;
            }
            // an error here drops the guards taken so far
            guards.push(scope.acquire("downcall")?);
        }
        Ok(guards)
    }
}

impl fmt::Debug for DowncallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DowncallHandle")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("signature", &self.descriptor().to_string())
            .field("abi", &self.sequence.abi())
            .finish()
    }
}
