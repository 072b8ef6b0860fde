//! A bidirectional bridge between loosely-typed managed call sites and an
//! Objective-C-style dynamic object runtime.
//!
//! The core is the dynamic invocation engine: given an opaque object
//! [`Handle`], a method name, and a slice of [`Value`]s, it discovers the
//! method's type encoding at runtime, marshals the arguments into raw native
//! buffers, dispatches through libffi (or a direct typed call for common
//! signatures), and converts native exceptions into [`BridgeError`]s. The
//! symmetric path lets native code call back into managed instances through
//! [`reverse::ReverseBinding`].
//!
//! Initialization order matters: install an [`runtime::ObjcRuntime`] with
//! [`runtime::install`] before interning selectors, registering instances,
//! or issuing any call. The test suite installs the in-process
//! [`runtime::fixture`] backend; production users install
//! [`runtime::host::HostRuntime`] over their glue library.

pub mod encoding;
pub mod error;
pub mod exception;
pub mod ffi;
pub mod invoke;
pub mod object;
pub mod registry;
pub mod resolve;
pub mod reverse;
pub mod runtime;
pub mod selector;
pub mod value;

pub use error::{BridgeError, InvalidCallError, RegistryError};
pub use exception::{ManagedException, NativeFault};
pub use invoke::{call, Invocation};
pub use object::{Class, Handle};
pub use registry::{ManagedInstance, ParamKind};
pub use reverse::ReverseBinding;
pub use selector::Selector;
pub use value::Value;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BridgeError>;
