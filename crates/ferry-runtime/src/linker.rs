//! Linker: the entry point for calls across the native boundary
//!
//! A linker is bound to one call arranger, chosen once (host detection or
//! configuration) and passed to whoever needs it. It caches calling
//! sequences per signature, so repeated handles for the same shape skip
//! classification.

use crate::arranger::{arranger_for, host_abi, CallArranger, CallingSequence, LinkerOptions};
use crate::downcall::DowncallHandle;
use crate::error::{FfiError, FfiResult};
use crate::layout::FunctionDescriptor;
use crate::lookup::{default_lookup, ProcessLookup};
use crate::scope::Scope;
use crate::segment::MemorySegment;
use crate::upcall::{UpcallStub, UpcallStubFactory};
use crate::valist::{VaList, VaListBuilder};
use crate::value::Value;
use ferry_config::{AbiName, ConfigLoader, FerryConfig, LinkerConfig};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type SequenceKey = (FunctionDescriptor, LinkerOptions);

pub struct Linker {
    arranger: Arc<dyn CallArranger>,
    config: LinkerConfig,
    sequences: Mutex<HashMap<SequenceKey, Arc<CallingSequence>>>,
}

impl Linker {
    /// Linker for the host ABI with default settings
    pub fn native() -> FfiResult<Linker> {
        Self::from_linker_config(LinkerConfig::default())
    }

    /// Linker configured from `[linker]`
    pub fn from_config(config: &FerryConfig) -> FfiResult<Linker> {
        Self::from_linker_config(config.linker.clone())
    }

    /// Linker configured from the `ferry.toml` nearest to `start_dir`
    pub fn from_directory(start_dir: &Path) -> FfiResult<Linker> {
        let config = ConfigLoader::new().load_from_directory(start_dir)?;
        Self::from_config(&config)
    }

    fn from_linker_config(config: LinkerConfig) -> FfiResult<Linker> {
        let host = host_abi();
        let abi = match (config.abi, host) {
            (Some(chosen), Some(host)) if chosen != host => {
                warn!(%chosen, %host, "configured ABI differs from host; native calls are disabled");
                chosen
            }
            (Some(chosen), _) => chosen,
            (None, Some(host)) => host,
            (None, None) => {
                return Err(FfiError::Unsupported {
                    operation: "native linker on an unsupported platform",
                })
            }
        };
        let arranger = arranger_for(abi, config.max_by_value_aggregate);
        info!(%abi, max_by_value_aggregate = config.max_by_value_aggregate, "linker ready");
        Ok(Self::new(arranger, config))
    }

    pub fn new(arranger: Arc<dyn CallArranger>, config: LinkerConfig) -> Linker {
        Linker {
            arranger,
            config,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    pub fn abi(&self) -> AbiName {
        self.arranger.abi()
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Whether calls planned by this linker can actually run here
    pub fn is_native(&self) -> bool {
        host_abi() == Some(self.abi())
    }

    fn ensure_native(&self, operation: &'static str) -> FfiResult<()> {
        if self.is_native() {
            Ok(())
        } else {
            Err(FfiError::Unsupported { operation })
        }
    }

    /// Classify a downcall signature, reusing a cached plan when possible
    pub fn arrange_downcall(
        &self,
        descriptor: &FunctionDescriptor,
        options: &LinkerOptions,
    ) -> FfiResult<Arc<CallingSequence>> {
        let options = options.resolved(self.config.allow_upcalls_by_default);
        let key = (descriptor.clone(), options);
        if let Some(sequence) = self.lock_sequences().get(&key) {
            return Ok(Arc::clone(sequence));
        }

        // classify outside the lock; a racing thread computes the same plan
        let sequence = Arc::new(self.arranger.arrange_downcall(&key.0, &key.1)?);
        debug!(abi = %self.abi(), signature = %descriptor, "downcall arranged");
        Ok(Arc::clone(
            self.lock_sequences().entry(key).or_insert(sequence),
        ))
    }

    fn lock_sequences(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SequenceKey, Arc<CallingSequence>>> {
        self.sequences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of distinct downcall signatures classified so far
    pub fn cached_sequences(&self) -> usize {
        self.lock_sequences().len()
    }

    /// Callable handle for the function at `symbol`
    pub fn downcall_handle(
        &self,
        symbol: &MemorySegment,
        descriptor: FunctionDescriptor,
        options: LinkerOptions,
    ) -> FfiResult<DowncallHandle> {
        if symbol.is_null() {
            return Err(FfiError::NullAddress);
        }
        let sequence = self.arrange_downcall(&descriptor, &options)?;
        self.ensure_native("downcall through a foreign ABI")?;
        symbol.scope().check_valid("downcall handle")?;
        Ok(DowncallHandle::new(symbol.clone(), sequence))
    }

    /// Classify an upcall signature into a stub factory
    pub fn arrange_upcall(&self, descriptor: &FunctionDescriptor) -> FfiResult<UpcallStubFactory> {
        let sequence = self.arranger.arrange_upcall(descriptor)?;
        Ok(UpcallStubFactory::new(Arc::new(sequence)))
    }

    /// Native function pointer that calls `target`, owned by `scope`
    pub fn upcall_stub<F>(
        &self,
        target: F,
        descriptor: FunctionDescriptor,
        scope: &Scope,
    ) -> FfiResult<UpcallStub>
    where
        F: Fn(&[Value]) -> FfiResult<Value> + Send + Sync + 'static,
    {
        let factory = self.arrange_upcall(&descriptor)?;
        self.ensure_native("upcall through a foreign ABI")?;
        factory.make_stub(target, scope)
    }

    /// Build a variadic list owned by `scope`
    pub fn new_va_list<F>(&self, scope: &Scope, actions: F) -> FfiResult<VaList>
    where
        F: FnOnce(&mut VaListBuilder) -> FfiResult<()>,
    {
        let mut builder = VaListBuilder::new(self.arranger.va_list_layout(), scope)?;
        actions(&mut builder)?;
        builder.build()
    }

    /// Wrap a list at a native address
    ///
    /// # Safety
    ///
    /// See [`VaList::of_address`].
    pub unsafe fn va_list_of_address(&self, address: usize, scope: &Scope) -> VaList {
        VaList::of_address(address, self.arranger.va_list_layout(), scope)
    }

    pub fn empty_va_list(&self) -> VaList {
        VaList::empty(self.arranger.va_list_layout())
    }

    /// Symbols of the running process
    pub fn default_lookup(&self) -> FfiResult<ProcessLookup> {
        default_lookup()
    }
}

impl fmt::Debug for Linker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Linker")
            .field("abi", &self.abi())
            .field("config", &self.config)
            .field("cached_sequences", &self.cached_sequences())
            .finish()
    }
}
