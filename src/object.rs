//! Opaque native object references.

use std::fmt;

use crate::error::InvalidCallError;
use crate::invoke;
use crate::runtime;
use crate::value::Value;
use crate::Result;

/// An opaque, pointer-sized native object reference.
///
/// The bridge does not own the referent; reference counts belong to the
/// native object system and are only ever adjusted through [`Handle::retain`]
/// and [`Handle::release`]. The null handle is a valid message target: any
/// call on it is a no-op returning a null-equivalent result.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub usize);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Sends `selector` to this object with the given arguments.
    ///
    /// Dynamic dispatch: the method is resolved on the receiver's runtime
    /// class at call time. On a null handle this returns `Value::Null`
    /// without touching the runtime, so results can be chained safely.
    pub fn call(self, selector: &str, args: &[Value]) -> Result<Value> {
        invoke::call(self, selector, args)
    }

    /// Increments the native reference count.
    pub fn retain(self) -> Handle {
        if !self.is_null() {
            runtime::global().retain(self);
        }
        self
    }

    /// Decrements the native reference count.
    pub fn release(self) {
        if !self.is_null() {
            runtime::global().release(self);
        }
    }

    /// The receiver's dynamic class (proxies report their runtime class,
    /// not their declared one).
    pub fn class(self) -> Class {
        Class::from_handle(runtime::global().class_of(self))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Handle(null)")
        } else {
            write!(f, "Handle({:#x})", self.0)
        }
    }
}

/// A native class handle plus its name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Class {
    handle: Handle,
    name: String,
}

impl Class {
    /// Looks the class up by name in the installed runtime.
    pub fn named(name: &str) -> Result<Class> {
        let handle = runtime::global().class_named(name).ok_or_else(|| {
            InvalidCallError::MethodNotFound {
                class: name.to_string(),
                selector: "(class lookup)".to_string(),
            }
        })?;
        Ok(Class {
            handle,
            name: name.to_string(),
        })
    }

    /// Wraps a class handle, asking the runtime for its name.
    pub fn from_handle(handle: Handle) -> Class {
        let name = if handle.is_null() {
            "(null)".to_string()
        } else {
            runtime::global().class_name(handle)
        };
        Class { handle, name }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent class; null-handle class for the root.
    pub fn superclass(&self) -> Class {
        Class::from_handle(runtime::global().superclass(self.handle))
    }

    /// Allocates an uninitialized instance (reference count one).
    pub fn alloc(&self) -> Result<Value> {
        self.handle.call("alloc", &[])
    }

    /// Sends a class method.
    pub fn call(&self, selector: &str, args: &[Value]) -> Result<Value> {
        self.handle.call(selector, args)
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.name)
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
