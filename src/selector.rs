//! Interned method identifiers.
//!
//! Native APIs expect a stable identifier pointer for every method name, so
//! selectors are interned exactly once per process through the installed
//! runtime and cached here. Equality and hashing are by the interned value.

use std::fmt;

use dashmap::DashMap;
use std::sync::OnceLock;

use crate::runtime;

/// Raw interned selector, pointer-sized and FFI-safe.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sel(pub usize);

impl Sel {
    pub const NULL: Sel = Sel(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Sel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sel({:#x})", self.0)
    }
}

/// A method name bound to its interned [`Sel`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Selector {
    raw: Sel,
    name: String,
}

fn intern_cache() -> &'static DashMap<String, Sel> {
    static CACHE: OnceLock<DashMap<String, Sel>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

impl Selector {
    /// Interns `name` through the installed runtime, reusing the cached
    /// identifier on repeat lookups.
    pub fn intern(name: &str) -> Selector {
        if let Some(sel) = intern_cache().get(name) {
            return Selector {
                raw: *sel,
                name: name.to_string(),
            };
        }
        let raw = runtime::global().register_selector(name);
        intern_cache().insert(name.to_string(), raw);
        Selector {
            raw,
            name: name.to_string(),
        }
    }

    /// Wraps an already-interned identifier, asking the runtime for its name.
    pub fn from_raw(raw: Sel) -> Selector {
        let name = runtime::global().selector_name(raw);
        Selector { raw, name }
    }

    pub fn raw(&self) -> Sel {
        self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.name)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Drops the process-wide name cache. Intended for test teardown; safe to
/// call at any time because interning falls back to the runtime.
pub fn clear_intern_cache() {
    intern_cache().clear();
}
