//! Scopes and arenas: the lifetime authority for native memory
//!
//! A `Scope` owns native storage (heap blocks, file mappings, upcall code,
//! loaded libraries) and decides when it becomes invalid. Three policies:
//!
//! - **Confined**: one owning thread may allocate, acquire and close.
//! - **Shared**: any thread may use it; close still fails while acquired.
//! - **Automatic**: never closed explicitly; storage is released once the
//!   last handle (scope, segment or list) referencing it is dropped.
//!
//! Liveness is a single atomic word. A non-negative value counts in-flight
//! acquires; `CLOSED` is absorbing. Closing is a compare-exchange from
//! zero, so a close can never slip in between an acquire and the release
//! that pairs with it.

use crate::error::{FfiError, FfiResult};
use crate::segment::MemorySegment;
use ferry_config::{ArenaConfig, ScopeModeName, DEFAULT_MAX_ALIGNMENT};
use std::alloc::{self, Layout};
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

const CLOSED: isize = -1;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_SCOPE: OnceLock<Scope> = OnceLock::new();

/// Stable identity of a scope, used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Lifetime policy of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeMode {
    Confined,
    Shared,
    Automatic,
    /// Process lifetime; roots addresses that came from native code
    Global,
}

impl ScopeMode {
    /// Whether `close` is a legal request for this mode
    pub fn is_closeable(&self) -> bool {
        matches!(self, ScopeMode::Confined | ScopeMode::Shared)
    }
}

impl From<ScopeModeName> for ScopeMode {
    fn from(name: ScopeModeName) -> Self {
        match name {
            ScopeModeName::Confined => ScopeMode::Confined,
            ScopeModeName::Shared => ScopeMode::Shared,
            ScopeModeName::Auto => ScopeMode::Automatic,
        }
    }
}

struct HeapBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The block is exclusively owned by its scope.
unsafe impl Send for HeapBlock {}

impl Drop for HeapBlock {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

enum Resource {
    Heap(HeapBlock),
    Mapped(memmap2::MmapMut),
    Owned(Box<dyn Any + Send>),
}

struct ScopeInner {
    id: ScopeId,
    mode: ScopeMode,
    owner: Option<ThreadId>,
    state: AtomicIsize,
    max_alignment: usize,
    resources: Mutex<Vec<Resource>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let resources = self
            .resources
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if !resources.is_empty() {
            trace!(scope = %self.id, count = resources.len(), "reclaiming unreachable scope");
        }
        resources.clear();
    }
}

/// Shared handle to a scope
///
/// Cloning is cheap and never extends liveness past `close`: clones only
/// keep the bookkeeping (and, for automatic scopes, the storage) around.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// Open a new alive scope
    pub fn open(mode: ScopeMode) -> Scope {
        Self::open_with(mode, DEFAULT_MAX_ALIGNMENT)
    }

    /// Open a scope using the configured alignment limit
    pub fn open_configured(mode: ScopeMode, config: &ArenaConfig) -> Scope {
        Self::open_with(mode, config.max_alignment)
    }

    fn open_with(mode: ScopeMode, max_alignment: usize) -> Scope {
        let id = ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed));
        let owner = match mode {
            ScopeMode::Confined => Some(thread::current().id()),
            _ => None,
        };
        trace!(scope = %id, ?mode, "scope opened");
        Scope {
            inner: Arc::new(ScopeInner {
                id,
                mode,
                owner,
                state: AtomicIsize::new(0),
                max_alignment,
                resources: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn confined() -> Scope {
        Self::open(ScopeMode::Confined)
    }

    pub fn shared() -> Scope {
        Self::open(ScopeMode::Shared)
    }

    pub fn auto() -> Scope {
        Self::open(ScopeMode::Automatic)
    }

    /// The process-wide scope that is always alive
    pub fn global() -> Scope {
        GLOBAL_SCOPE
            .get_or_init(|| Self::open(ScopeMode::Global))
            .clone()
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    pub fn mode(&self) -> ScopeMode {
        self.inner.mode
    }

    /// Current liveness; never cached
    pub fn is_alive(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != CLOSED
    }

    /// Number of in-flight acquires
    pub fn acquire_count(&self) -> usize {
        self.inner.state.load(Ordering::Acquire).max(0) as usize
    }

    /// Whether two handles refer to the same scope
    pub fn same_as(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_thread(&self, operation: &'static str) -> FfiResult<()> {
        match self.inner.owner {
            Some(owner) if owner != thread::current().id() => {
                Err(FfiError::wrong_thread(self.inner.id, operation))
            }
            _ => Ok(()),
        }
    }

    /// Ensure the scope is alive and usable from this thread
    pub fn check_valid(&self, operation: &'static str) -> FfiResult<()> {
        self.check_thread(operation)?;
        if self.is_alive() {
            Ok(())
        } else {
            Err(FfiError::closed(self.inner.id, operation))
        }
    }

    /// Mark the scope busy until the returned guard is dropped
    ///
    /// Fails if the scope is already closed, so a liveness check and the
    /// use it guards cannot be separated by a close.
    pub fn acquire(&self, operation: &'static str) -> FfiResult<AcquireGuard> {
        self.check_thread(operation)?;
        if self.inner.mode == ScopeMode::Global {
            return Ok(AcquireGuard { scope: None });
        }

        let state = &self.inner.state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if current == CLOSED {
                return Err(FfiError::closed(self.inner.id, operation));
            }
            match state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(AcquireGuard {
            scope: Some(self.clone()),
        })
    }

    fn release(&self) {
        let previous = self.inner.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "release without acquire on {}", self.inner.id);
    }

    /// Close the scope and free everything it owns
    ///
    /// - automatic and global scopes: `Unsupported`
    /// - confined scope from another thread: `WrongThread`
    /// - acquired by an in-flight operation: `ScopeBusy` (scope stays alive)
    /// - second close: `AlreadyClosed`
    pub fn close(&self) -> FfiResult<()> {
        if !self.inner.mode.is_closeable() {
            return Err(FfiError::Unsupported {
                operation: "close of an automatic or global scope",
            });
        }
        self.check_thread("close")?;

        match self
            .inner
            .state
            .compare_exchange(0, CLOSED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let released = {
                    let mut guard = self
                        .inner
                        .resources
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    std::mem::take(&mut *guard)
                };
                debug!(scope = %self.inner.id, resources = released.len(), "scope closed");
                drop(released);
                Ok(())
            }
            Err(CLOSED) => Err(FfiError::AlreadyClosed {
                scope: self.inner.id,
            }),
            Err(acquires) => {
                debug!(scope = %self.inner.id, acquires, "close rejected, scope is acquired");
                Err(FfiError::ScopeBusy {
                    scope: self.inner.id,
                    acquires: acquires as usize,
                })
            }
        }
    }

    /// Allocate zeroed native memory owned by this scope
    pub fn allocate(&self, size: usize, alignment: usize) -> FfiResult<MemorySegment> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(FfiError::InvalidAllocation(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        if alignment > self.inner.max_alignment {
            return Err(FfiError::InvalidAllocation(format!(
                "alignment {} exceeds limit {}",
                alignment, self.inner.max_alignment
            )));
        }
        let layout = Layout::from_size_align(size.max(1), alignment)
            .map_err(|e| FfiError::InvalidAllocation(e.to_string()))?;

        let _guard = self.acquire("allocate")?;
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) }).ok_or_else(|| {
            FfiError::InvalidAllocation(format!("out of memory allocating {} bytes", size))
        })?;
        let address = ptr.as_ptr() as usize;
        self.push_resource(Resource::Heap(HeapBlock { ptr, layout }));

        trace!(scope = %self.inner.id, size, alignment, "allocated");
        Ok(MemorySegment::from_scope(self.clone(), address, size))
    }

    /// Allocate storage sized and aligned for `layout`
    pub fn allocate_layout(&self, layout: &crate::layout::MemoryLayout) -> FfiResult<MemorySegment> {
        self.allocate(layout.size(), layout.align())
    }

    /// Allocate a copy of `bytes`
    pub fn allocate_from(&self, bytes: &[u8], alignment: usize) -> FfiResult<MemorySegment> {
        let segment = self.allocate(bytes.len(), alignment)?;
        segment.copy_from_slice(0, bytes)?;
        Ok(segment)
    }

    /// Map a whole file read-write; the mapping is dropped on close
    pub fn map_file(&self, path: &Path) -> FfiResult<MemorySegment> {
        let _guard = self.acquire("map_file")?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;
        let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
        let address = mmap.as_mut_ptr() as usize;
        let length = mmap.len();
        self.push_resource(Resource::Mapped(mmap));

        debug!(scope = %self.inner.id, path = %path.display(), length, "file mapped");
        Ok(MemorySegment::from_scope(self.clone(), address, length))
    }

    /// Hand ownership of an arbitrary value to this scope
    pub(crate) fn attach(&self, value: Box<dyn Any + Send>) -> FfiResult<()> {
        let _guard = self.acquire("attach")?;
        self.push_resource(Resource::Owned(value));
        Ok(())
    }

    fn push_resource(&self, resource: Resource) {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resource);
    }

    pub(crate) fn downgrade(&self) -> WeakScope {
        WeakScope {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("alive", &self.is_alive())
            .field("acquires", &self.acquire_count())
            .finish()
    }
}

/// Non-owning reference held by storage the scope itself owns
#[derive(Clone)]
pub(crate) struct WeakScope {
    id: ScopeId,
    inner: Weak<ScopeInner>,
}

impl WeakScope {
    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<Scope> {
        self.inner.upgrade().map(|inner| Scope { inner })
    }
}

/// Busy marker; releases its acquire on drop
#[must_use = "the scope is released as soon as the guard is dropped"]
pub struct AcquireGuard {
    scope: Option<Scope>,
}

impl AcquireGuard {
    pub fn scope_id(&self) -> Option<ScopeId> {
        self.scope.as_ref().map(Scope::id)
    }
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if let Some(scope) = self.scope.take() {
            scope.release();
        }
    }
}

/// Scoped handle that opens a scope and closes it when done
///
/// Prefer [`Arena::with`] or an explicit [`Arena::close`], both of which
/// report `ScopeBusy`/`AlreadyClosed` to the caller. Dropping an arena
/// that is still alive attempts the close as well; a failure there can
/// only be logged, and the storage then lives until the last handle to
/// it is gone.
pub struct Arena {
    scope: Scope,
}

impl Arena {
    pub fn open(mode: ScopeMode) -> Arena {
        Arena {
            scope: Scope::open(mode),
        }
    }

    pub fn open_confined() -> Arena {
        Self::open(ScopeMode::Confined)
    }

    pub fn open_shared() -> Arena {
        Self::open(ScopeMode::Shared)
    }

    pub fn open_configured(config: &ArenaConfig) -> Arena {
        Arena {
            scope: Scope::open_configured(config.default_mode.into(), config),
        }
    }

    /// Run `body` with a fresh arena and close it afterwards
    ///
    /// An error from `body` wins over an error from the close.
    pub fn with<T, F>(mode: ScopeMode, body: F) -> FfiResult<T>
    where
        F: FnOnce(&Arena) -> FfiResult<T>,
    {
        let arena = Arena::open(mode);
        let result = body(&arena);
        let closed = arena.close_if_closeable();
        let value = result?;
        closed?;
        Ok(value)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> FfiResult<MemorySegment> {
        self.scope.allocate(size, alignment)
    }

    pub fn allocate_layout(&self, layout: &crate::layout::MemoryLayout) -> FfiResult<MemorySegment> {
        self.scope.allocate_layout(layout)
    }

    pub fn close(&self) -> FfiResult<()> {
        self.scope.close()
    }

    fn close_if_closeable(&self) -> FfiResult<()> {
        if self.scope.mode().is_closeable() && self.scope.is_alive() {
            self.scope.close()
        } else {
            Ok(())
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Err(e) = self.close_if_closeable() {
            warn!(scope = %self.scope.id(), error = %e, "arena dropped without a successful close");
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Arena").field(&self.scope).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_scope_is_alive() {
        let scope = Scope::confined();
        assert!(scope.is_alive());
        assert_eq!(scope.acquire_count(), 0);
    }

    #[test]
    fn test_close_is_absorbing() {
        let scope = Scope::shared();
        scope.close().unwrap();
        assert!(!scope.is_alive());
        assert!(matches!(
            scope.close(),
            Err(FfiError::AlreadyClosed { .. })
        ));
        assert!(matches!(
            scope.acquire("test"),
            Err(FfiError::ScopeClosed { .. })
        ));
        assert!(matches!(
            scope.allocate(8, 8),
            Err(FfiError::ScopeClosed { .. })
        ));
    }

    #[test]
    fn test_close_while_acquired_is_busy() {
        let scope = Scope::shared();
        let guard = scope.acquire("test").unwrap();
        match scope.close() {
            Err(FfiError::ScopeBusy { acquires, .. }) => assert_eq!(acquires, 1),
            other => panic!("expected busy, got {:?}", other),
        }
        assert!(scope.is_alive());
        drop(guard);
        assert_eq!(scope.acquire_count(), 0);
        scope.close().unwrap();
    }

    #[test]
    fn test_nested_acquires_count() {
        let scope = Scope::confined();
        let a = scope.acquire("a").unwrap();
        let b = scope.acquire("b").unwrap();
        assert_eq!(scope.acquire_count(), 2);
        drop(a);
        assert!(scope.close().is_err());
        drop(b);
        assert!(scope.close().is_ok());
    }

    #[test]
    fn test_automatic_and_global_not_closeable() {
        assert!(matches!(
            Scope::auto().close(),
            Err(FfiError::Unsupported { .. })
        ));
        assert!(matches!(
            Scope::global().close(),
            Err(FfiError::Unsupported { .. })
        ));
        assert!(Scope::global().same_as(&Scope::global()));
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let scope = Scope::auto();
        assert!(matches!(
            scope.allocate(16, 3),
            Err(FfiError::InvalidAllocation(_))
        ));
        assert!(matches!(
            scope.allocate(16, 1 << 20),
            Err(FfiError::InvalidAllocation(_))
        ));
    }

    #[test]
    fn test_allocation_is_zeroed_and_aligned() {
        let scope = Scope::auto();
        let segment = scope.allocate(64, 32).unwrap();
        assert_eq!(segment.address() % 32, 0);
        assert!(segment.to_vec().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_arena_with_closes() {
        let mut kept = None;
        Arena::with(ScopeMode::Confined, |arena| {
            kept = Some(arena.scope().clone());
            arena.allocate(8, 8).map(|_| ())
        })
        .unwrap();
        assert!(!kept.unwrap().is_alive());
    }

    #[test]
    fn test_arena_with_reports_busy_close() {
        let mut guard = None;
        let result = Arena::with(ScopeMode::Shared, |arena| {
            guard = Some(arena.scope().acquire("leak")?);
            Ok(())
        });
        assert!(matches!(result, Err(FfiError::ScopeBusy { .. })));
        drop(guard);
    }

    #[test]
    fn test_scope_ids_are_unique() {
        assert_ne!(Scope::auto().id(), Scope::auto().id());
    }
}
