//! Error taxonomy for scope, memory and call-arranging failures
//!
//! All of these are local, recoverable conditions. Each one is a gate:
//! once detected, no marshaling or native call proceeds.

use crate::lookup::LookupError;
use crate::scope::ScopeId;
use ferry_config::ConfigError;
use thiserror::Error;

pub type FfiResult<T> = Result<T, FfiError>;

#[derive(Debug, Error)]
pub enum FfiError {
    #[error("Already closed: {scope} is not alive ({operation})")]
    ScopeClosed {
        scope: ScopeId,
        operation: &'static str,
    },

    #[error("Session is acquired: {scope} has {acquires} in-flight use(s) and cannot be closed")]
    ScopeBusy { scope: ScopeId, acquires: usize },

    #[error("Attempted access outside owning thread: {scope} is confined ({operation})")]
    WrongThread {
        scope: ScopeId,
        operation: &'static str,
    },

    #[error("Already closed: {scope} was closed before")]
    AlreadyClosed { scope: ScopeId },

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: &'static str },

    #[error("No more arguments in variadic list (consumed {consumed})")]
    OutOfArguments { consumed: usize },

    #[error("Unsupported layout for {abi}: {reason}")]
    UnsupportedLayout { abi: &'static str, reason: String },

    #[error("Out of bounds access: offset {offset} + {size} exceeds segment length {length}")]
    OutOfBounds {
        offset: usize,
        size: usize,
        length: usize,
    },

    #[error("Misaligned access: address {address:#x} is not aligned to {alignment}")]
    Misaligned { address: usize, alignment: usize },

    #[error("Invalid allocation request: {0}")]
    InvalidAllocation(String),

    #[error("Expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Argument {index}: expected {expected}, got {got}")]
    TypeMismatch {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("Null address")]
    NullAddress,

    #[error("Upcall failed: {0}")]
    Upcall(String),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl FfiError {
    /// Use of a scope that is no longer alive
    pub fn closed(scope: ScopeId, operation: &'static str) -> Self {
        Self::ScopeClosed { scope, operation }
    }

    /// Confined scope touched from a foreign thread
    pub fn wrong_thread(scope: ScopeId, operation: &'static str) -> Self {
        Self::WrongThread { scope, operation }
    }

    /// Layout the ABI cannot classify
    pub fn unsupported_layout(abi: &'static str, reason: impl Into<String>) -> Self {
        Self::UnsupportedLayout {
            abi,
            reason: reason.into(),
        }
    }

    /// Argument of the wrong kind for its layout
    pub fn type_mismatch(index: usize, expected: impl ToString, got: impl ToString) -> Self {
        Self::TypeMismatch {
            index,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    /// True for the liveness errors a caller might recover from by
    /// choosing another scope.
    pub fn is_lifetime_error(&self) -> bool {
        matches!(
            self,
            FfiError::ScopeClosed { .. }
                | FfiError::ScopeBusy { .. }
                | FfiError::WrongThread { .. }
                | FfiError::AlreadyClosed { .. }
        )
    }
}
