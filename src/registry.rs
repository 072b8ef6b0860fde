//! Registry of managed instances exported to the native runtime.
//!
//! Every handle the reverse-call adapter can receive must map to at most one
//! live managed instance. A single coarse lock guards the table; hold times
//! are bounded by a hash lookup, and the lock is released before any managed
//! method runs.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::RegistryError;
use crate::exception::ManagedException;
use crate::object::Handle;
use crate::value::Value;

/// How the reverse-call adapter should rehydrate one parameter.
///
/// The wire format underdetermines a couple of managed types; the declared
/// parameter kind disambiguates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Decode as the encoding dictates.
    Default,
    /// The 16-bit slot is a character, not an unsigned short.
    Char,
    /// The pointer slot must resolve to a registered managed instance.
    Instance,
}

/// A managed object reachable from native code.
///
/// Implementations dispatch `invoke` to the method the selector names and
/// return the managed error, if any, for forwarding across the boundary.
pub trait ManagedInstance: Send + Sync {
    fn invoke(&self, selector: &str, args: &[Value]) -> Result<Value, ManagedException>;

    /// Declared parameter kinds for a selector, where the encoding alone is
    /// ambiguous. `None` means every parameter decodes by its encoding.
    fn parameter_kinds(&self, _selector: &str) -> Option<Vec<ParamKind>> {
        None
    }
}

fn table() -> &'static Mutex<HashMap<Handle, Arc<dyn ManagedInstance>>> {
    static TABLE: OnceLock<Mutex<HashMap<Handle, Arc<dyn ManagedInstance>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Associates a native handle with its managed instance.
///
/// Registering a handle that is already bound is a lifecycle bug and is
/// rejected rather than silently replacing the existing instance.
pub fn register(handle: Handle, instance: Arc<dyn ManagedInstance>) -> Result<(), RegistryError> {
    use std::collections::hash_map::Entry;
    match table().lock().entry(handle) {
        Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(handle)),
        Entry::Vacant(slot) => {
            slot.insert(instance);
            Ok(())
        }
    }
}

/// Looks up the managed instance bound to `handle`.
pub fn lookup(handle: Handle) -> Option<Arc<dyn ManagedInstance>> {
    table().lock().get(&handle).cloned()
}

/// Removes a binding, typically when the native side releases its last
/// reference.
pub fn unregister(handle: Handle) -> Result<(), RegistryError> {
    table()
        .lock()
        .remove(&handle)
        .map(|_| ())
        .ok_or(RegistryError::NotRegistered(handle))
}

/// Drops every binding. Test support.
pub fn clear() {
    table().lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl ManagedInstance for Probe {
        fn invoke(&self, _selector: &str, _args: &[Value]) -> Result<Value, ManagedException> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn at_most_one_instance_per_handle() {
        clear();
        let h = Handle(0x1000);
        register(h, Arc::new(Probe)).unwrap();
        assert!(matches!(
            register(h, Arc::new(Probe)),
            Err(RegistryError::AlreadyRegistered(got)) if got == h
        ));
        unregister(h).unwrap();
        assert!(lookup(h).is_none());
        assert!(matches!(
            unregister(h),
            Err(RegistryError::NotRegistered(_))
        ));
    }
}
