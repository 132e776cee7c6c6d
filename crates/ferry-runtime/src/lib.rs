//! Ferry Runtime - scope-checked native interop
//!
//! This library lets managed code call native functions and be called back
//! from them without ever touching freed memory:
//! - Scopes and arenas that own native memory and refuse to close while busy
//! - Memory segments with bounds, alignment and liveness checks on every access
//! - Variadic argument lists built in native memory
//! - Call arrangers that classify signatures per ABI (System V x86-64,
//!   AArch64, PowerPC64 AIX)
//! - A linker producing downcall handles and upcall stubs
//!
//! # Example
//!
//! ```no_run
//! use ferry_runtime::{FunctionDescriptor, Linker, LinkerOptions, MemoryLayout, SymbolLookup, Value};
//!
//! let linker = Linker::native()?;
//! let strlen = linker.default_lookup()?.require("strlen")?;
//! let handle = linker.downcall_handle(
//!     &strlen,
//!     FunctionDescriptor::of(MemoryLayout::C_LONG_LONG, vec![MemoryLayout::C_POINTER]),
//!     LinkerOptions::new(),
//! )?;
//!
//! let arena = ferry_runtime::Arena::open_confined();
//! let text = arena.scope().allocate_from(b"hello\0", 1)?;
//! assert_eq!(handle.invoke(&[Value::Address(text)])?, Value::I64(5));
//! arena.close()?;
//! # Ok::<(), ferry_runtime::FfiError>(())
//! ```

/// Ferry runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod arranger;
pub mod downcall;
pub mod error;
pub mod layout;
pub mod linker;
pub mod logging;
pub mod lookup;
mod marshal;
pub mod scope;
pub mod segment;
pub mod upcall;
pub mod valist;
pub mod value;

pub use arranger::{
    ArgBinding, ArgClass, CallArranger, CallingSequence, LinkerOptions, ReturnClass, Storage,
};
pub use downcall::DowncallHandle;
pub use error::{FfiError, FfiResult};
pub use layout::{FunctionDescriptor, MemoryLayout, StructLayout, ValueLayout};
pub use linker::Linker;
pub use lookup::{default_lookup, LibraryLookup, LookupError, ProcessLookup, SymbolLookup};
pub use scope::{AcquireGuard, Arena, Scope, ScopeId, ScopeMode};
pub use segment::MemorySegment;
pub use upcall::{UpcallStub, UpcallStubFactory};
pub use valist::{VaList, VaListBuilder, VaListLayout};
pub use value::Value;

pub use ferry_config::{AbiName, FerryConfig};
