//! Upcall stubs: native-callable entry points into managed closures
//!
//! A stub is a libffi closure whose code address is exposed as a
//! zero-length segment owned by the caller's scope. The closure and its
//! dispatch data are attached to that scope, so closing the scope frees
//! the stub; passing the stub to a downcall acquires the scope and keeps
//! it from being freed mid-call.
//!
//! Errors cannot unwind through native frames. A failing or panicking
//! target is caught at the entry point, the native caller sees a zeroed
//! result, and the error is parked on the innermost downcall frame of
//! this thread, which re-raises it once native code has returned.

use crate::arranger::CallingSequence;
use crate::error::{FfiError, FfiResult};
use crate::marshal;
use crate::scope::{Arena, Scope, WeakScope};
use crate::segment::MemorySegment;
use crate::value::Value;
use libffi::low::ffi_cif;
use libffi::middle::Closure;
use std::any::Any;
use std::cell::RefCell;
use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Managed code reachable from native code
pub type UpcallTarget = dyn Fn(&[Value]) -> FfiResult<Value> + Send + Sync;

struct CallFrame {
    allows_upcalls: bool,
    pending: Option<FfiError>,
}

thread_local! {
    static FRAMES: RefCell<Vec<CallFrame>> = const { RefCell::new(Vec::new()) };
}

/// Marks this thread as inside a downcall until finished or dropped
pub(crate) struct FrameGuard {
    active: bool,
}

pub(crate) fn enter_downcall(allows_upcalls: bool) -> FrameGuard {
    FRAMES.with(|frames| {
        frames.borrow_mut().push(CallFrame {
            allows_upcalls,
            pending: None,
        })
    });
    FrameGuard { active: true }
}

impl FrameGuard {
    /// Leave the frame, surfacing the first error raised by an upcall
    pub(crate) fn finish(mut self) -> FfiResult<()> {
        self.active = false;
        let frame = FRAMES.with(|frames| frames.borrow_mut().pop());
        match frame.and_then(|frame| frame.pending) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if self.active {
            FRAMES.with(|frames| frames.borrow_mut().pop());
        }
    }
}

fn upcalls_allowed() -> bool {
    FRAMES.with(|frames| frames.borrow().last().map_or(true, |f| f.allows_upcalls))
}

fn park(err: FfiError) {
    FRAMES.with(|frames| match frames.borrow_mut().last_mut() {
        Some(frame) => {
            if frame.pending.is_none() {
                frame.pending = Some(err);
            }
        }
        None => error!(error = %err, "upcall failed outside of any downcall; error dropped"),
    });
}

struct UpcallData {
    target: Box<UpcallTarget>,
    sequence: Arc<CallingSequence>,
    scope: WeakScope,
}

impl UpcallData {
    fn dispatch(&self, args: *const *const c_void, result: *mut c_void) -> FfiResult<()> {
        if !upcalls_allowed() {
            return Err(FfiError::Upcall(
                "native code called back during a call linked without upcall support".to_string(),
            ));
        }
        let owner = self.scope.upgrade().ok_or_else(|| {
            FfiError::Upcall(format!("stub owner {} no longer exists", self.scope.id()))
        })?;
        let _guard = owner.acquire("upcall")?;

        // struct arguments are copied into an arena that closes on every exit
        let call_arena = Arena::open_confined();
        let descriptor = self.sequence.descriptor();
        let mut values = Vec::with_capacity(descriptor.args().len());
        for (index, layout) in descriptor.args().iter().enumerate() {
            // SAFETY: libffi passes one pointer per declared argument
            values.push(unsafe { marshal::read_arg(*args.add(index), layout, call_arena.scope())? });
        }

        let returned = (self.target)(&values)?;
        unsafe { marshal::write_return(result, descriptor.return_layout(), &returned) }
    }
}

unsafe extern "C" fn upcall_entry(
    _cif: &ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    data: &UpcallData,
) {
    let result = result as *mut u64 as *mut c_void;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| data.dispatch(args, result)));
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(payload) => FfiError::Upcall(format!("target panicked: {}", panic_message(&*payload))),
    };
    marshal::zero_return(result, data.sequence.descriptor().return_layout());
    warn!(error = %err, "upcall failed, returning zero to native caller");
    park(err);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Closure and dispatch data, owned by the stub's scope
struct StubStorage {
    closure: ManuallyDrop<Closure<'static>>,
    data: *mut UpcallData,
}

// The closure is only executed by native code; the data it points to is
// Send + Sync.
unsafe impl Send for StubStorage {}

impl Drop for StubStorage {
    fn drop(&mut self) {
        // the closure borrows `data`, so it goes first
        unsafe {
            ManuallyDrop::drop(&mut self.closure);
            drop(Box::from_raw(self.data));
        }
    }
}

/// Produces stubs for one classified signature
#[derive(Debug, Clone)]
pub struct UpcallStubFactory {
    sequence: Arc<CallingSequence>,
}

impl UpcallStubFactory {
    pub(crate) fn new(sequence: Arc<CallingSequence>) -> Self {
        Self { sequence }
    }

    pub fn calling_sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    /// Create a stub calling `target`, owned by `scope`
    pub fn make_stub<F>(&self, target: F, scope: &Scope) -> FfiResult<UpcallStub>
    where
        F: Fn(&[Value]) -> FfiResult<Value> + Send + Sync + 'static,
    {
        scope.check_valid("upcall stub")?;

        let data = Box::into_raw(Box::new(UpcallData {
            target: Box::new(target),
            sequence: Arc::clone(&self.sequence),
            scope: scope.downgrade(),
        }));
        let cif = marshal::build_cif(&self.sequence);
        // SAFETY: `data` outlives the closure, see StubStorage::drop
        let closure = Closure::new(cif, upcall_entry, unsafe { &*data });
        let address = *closure.code_ptr() as usize;

        scope.attach(Box::new(StubStorage {
            closure: ManuallyDrop::new(closure),
            data,
        }))?;

        debug!(scope = %scope.id(), signature = %self.sequence.descriptor(), address, "upcall stub created");
        Ok(UpcallStub {
            segment: MemorySegment::from_scope(scope.clone(), address, 0),
            sequence: Arc::clone(&self.sequence),
        })
    }
}

/// A native function pointer into managed code
#[derive(Clone)]
pub struct UpcallStub {
    segment: MemorySegment,
    sequence: Arc<CallingSequence>,
}

impl UpcallStub {
    /// Zero-length segment at the stub's code address
    pub fn segment(&self) -> &MemorySegment {
        &self.segment
    }

    pub fn address(&self) -> usize {
        self.segment.address()
    }

    pub fn calling_sequence(&self) -> &CallingSequence {
        &self.sequence
    }

    /// The stub as a pointer argument
    pub fn as_value(&self) -> Value {
        Value::Address(self.segment.clone())
    }
}

impl fmt::Debug for UpcallStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpcallStub")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("signature", &self.sequence.descriptor().to_string())
            .field("scope", &self.segment.scope().id())
            .finish()
    }
}
