use thiserror::Error;

use crate::exception::NativeFault;
use crate::object::Handle;

/// Top-level error type for every bridge operation.
///
/// The four variants are deliberately distinct kinds: `InvalidCall` is a
/// programming error at the call site, `NativeFault` means the called native
/// method itself raised, `Registry` signals a handle-lifecycle bug, and
/// `Resource` is a fatal allocation failure. None of them are retried
/// internally; the only fallback behavior in the crate is the fast-path miss,
/// which is not an error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    InvalidCall(#[from] InvalidCallError),

    #[error(transparent)]
    NativeFault(#[from] NativeFault),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("resource allocation failed: {0}")]
    Resource(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidCallError {
    #[error("couldn't find a method for {class}.{selector}")]
    MethodNotFound { class: String, selector: String },

    #[error("{selector} takes {takes} arguments but was called with {got} arguments")]
    WrongArity {
        selector: String,
        takes: usize,
        got: usize,
    },

    #[error("unsupported type encoding '{0}'")]
    UnsupportedType(String),

    #[error("malformed type encoding '{0}'")]
    MalformedEncoding(String),

    #[error("can't convert {actual} to {expected}")]
    TypeMismatch {
        expected: &'static str,
        actual: String,
    },

    #[error("couldn't find a registered instance for {0:?}; is the type registered or exported?")]
    NotExported(Handle),

    #[error("invocation was used after being disposed")]
    Disposed,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("{0:?} is being registered twice; exported handles allow exactly one instance")]
    AlreadyRegistered(Handle),

    #[error("{0:?} has no registered instance")]
    NotRegistered(Handle),
}

impl BridgeError {
    /// True for the caller-programming-error kind.
    pub fn is_invalid_call(&self) -> bool {
        matches!(self, BridgeError::InvalidCall(_))
    }

    /// True when the called native method raised an exception.
    pub fn is_native_fault(&self) -> bool {
        matches!(self, BridgeError::NativeFault(_))
    }
}
