//! Bidirectional exception carriers.
//!
//! A native exception crossing into managed code becomes a [`NativeFault`]
//! with its name and reason preserved and the original handle exposed. When
//! the exception was created by the reverse-call adapter forwarding a
//! managed error, its side-channel data carries the serialized original;
//! conversion reconstitutes it and reports a `Forwarded` fault so the
//! original type and message survive the round trip as the inner cause.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::BridgeError;
use crate::object::Handle;
use crate::runtime::{self, MANAGED_PAYLOAD_KEY};

/// A managed-side error crossing the native boundary.
///
/// Serialized into the native exception's side channel by the reverse-call
/// adapter and reconstituted by [`from_handle`]. The cause chain survives
/// serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedException {
    pub exception_type: String,
    pub message: String,
    pub cause: Option<Box<ManagedException>>,
}

impl ManagedException {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        ManagedException {
            exception_type: exception_type.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: ManagedException) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ManagedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type, self.message)
    }
}

impl std::error::Error for ManagedException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// The called native method raised.
#[derive(Debug, Error)]
pub enum NativeFault {
    /// A genuine native exception; message mirrors "name. reason".
    #[error("{name}. {reason}")]
    Raised {
        name: String,
        reason: String,
        handle: Handle,
    },

    /// The native exception carried a forwarded managed error; the
    /// reconstituted original is the inner cause.
    #[error("an exception was thrown by the target of a native method call")]
    Forwarded {
        handle: Handle,
        #[source]
        cause: ManagedException,
    },
}

impl NativeFault {
    /// The original native exception handle, for inspection.
    pub fn handle(&self) -> Handle {
        match self {
            NativeFault::Raised { handle, .. } | NativeFault::Forwarded { handle, .. } => *handle,
        }
    }
}

/// Converts a raised native exception handle into a [`BridgeError`].
///
/// If the exception's side channel holds a serialized managed exception the
/// original is reconstituted as the fault's inner cause. A payload that
/// fails to deserialize never masks the primary exception: the failure is
/// logged and the plain wrapper is returned instead.
pub fn from_handle(exc: Handle) -> BridgeError {
    let rt = runtime::global();

    if rt.is_exception(exc) {
        if let Some(bytes) = rt.exception_payload(exc, MANAGED_PAYLOAD_KEY) {
            match serde_json::from_slice::<ManagedException>(&bytes) {
                Ok(original) => {
                    return BridgeError::NativeFault(NativeFault::Forwarded {
                        handle: exc,
                        cause: original,
                    })
                }
                Err(e) => {
                    warn!(error = %e, "ignoring undeserializable managed exception payload");
                }
            }
        }
    }

    BridgeError::NativeFault(NativeFault::Raised {
        name: rt.exception_name(exc),
        reason: rt.exception_reason(exc),
        handle: exc,
    })
}

type ExceptionLogger = Box<dyn Fn(&ManagedException) + Send + Sync>;

static LOGGER: RwLock<Option<ExceptionLogger>> = RwLock::new(None);

/// Replaces the hook invoked for every managed exception the reverse-call
/// adapter converts. The default logs the full cause chain.
pub fn set_exception_logger(logger: impl Fn(&ManagedException) + Send + Sync + 'static) {
    *LOGGER.write() = Some(Box::new(logger));
}

/// Restores the default logging behavior.
pub fn clear_exception_logger() {
    *LOGGER.write() = None;
}

/// Logs a managed exception about to be forwarded into native code.
pub(crate) fn log_managed_exception(e: &ManagedException) {
    let guard = LOGGER.read();
    if let Some(hook) = guard.as_ref() {
        hook(e);
        return;
    }

    // Native callers have a tendency to eat exceptions, so record the whole
    // causal chain before handing it over.
    tracing::error!(exception = %e, "exception thrown from managed code");
    let mut next = e.cause.as_deref();
    while let Some(inner) = next {
        tracing::error!(cause = %inner, "caused by");
        next = inner.cause.as_deref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_round_trips_cause_chain() {
        let original = ManagedException::new("ArgumentError", "index out of range")
            .with_cause(ManagedException::new("IoError", "backing store gone"));
        let bytes = serde_json::to_vec(&original).unwrap();
        let back: ManagedException = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, original);
        assert_eq!(back.cause.as_deref().unwrap().exception_type, "IoError");
    }

    #[test]
    fn display_matches_native_message_shape() {
        let fault = NativeFault::Raised {
            name: "RangeException".into(),
            reason: "index 1 beyond bounds".into(),
            handle: Handle(0x10),
        };
        assert_eq!(fault.to_string(), "RangeException. index 1 beyond bounds");
        assert_eq!(fault.handle(), Handle(0x10));
    }

    #[test]
    fn forwarded_fault_exposes_original_as_source() {
        use std::error::Error;
        let fault = NativeFault::Forwarded {
            handle: Handle(0x20),
            cause: ManagedException::new("CustomError", "boom"),
        };
        let source = fault.source().expect("forwarded fault has a source");
        assert_eq!(source.to_string(), "CustomError: boom");
    }
}
