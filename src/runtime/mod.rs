//! The native runtime collaborator.
//!
//! Everything the invocation engine needs from the underlying object system
//! goes through the [`ObjcRuntime`] trait: class/method introspection,
//! selector interning, reference counting, the direct-call primitive table,
//! and exception accessors. The bridge drives these; it never reimplements
//! them.
//!
//! Exactly one runtime is installed per process, before any other bridge
//! call. [`host::HostRuntime`] binds to a real glue library with
//! `libloading`; [`fixture`] is the in-process stand-in the test suite runs
//! against.

use std::sync::OnceLock;

use crate::object::Handle;
use crate::selector::Sel;

pub mod fixture;
pub mod host;

/// A method implementation entry point, shape known only to its encoding.
pub type Imp = unsafe extern "C" fn();

/// A resolved method: implementation pointer plus raw type encoding.
#[derive(Debug, Clone)]
pub struct MethodImpl {
    pub imp: Imp,
    pub encoding: String,
}

/// Specialized native entry points for the fast path.
///
/// Each primitive takes the receiver, the selector, at most one scalar or
/// pointer argument, and an exception out-parameter the callee populates
/// with a raised exception handle (null when the call returned normally).
#[derive(Clone, Copy)]
pub struct DirectCallTable {
    /// Nullary, pointer-sized return.
    pub call_p: unsafe extern "C" fn(Handle, Sel, *mut Handle) -> Handle,
    /// Nullary, 32-bit integer return.
    pub call_i: unsafe extern "C" fn(Handle, Sel, *mut Handle) -> i32,
    /// One 32-bit integer argument, pointer-sized return.
    pub call_pi: unsafe extern "C" fn(Handle, Sel, i32, *mut Handle) -> Handle,
    /// One 32-bit integer argument, 32-bit integer return.
    pub call_ii: unsafe extern "C" fn(Handle, Sel, i32, *mut Handle) -> i32,
    /// One pointer argument, pointer-sized return.
    pub call_pp: unsafe extern "C" fn(Handle, Sel, Handle, *mut Handle) -> Handle,
    /// One pointer argument, 32-bit integer return.
    pub call_ip: unsafe extern "C" fn(Handle, Sel, Handle, *mut Handle) -> i32,
}

/// Key under which a serialized managed exception travels in a native
/// exception's side-channel data.
pub const MANAGED_PAYLOAD_KEY: &str = "managed exception";

pub trait ObjcRuntime: Send + Sync {
    // Introspection (read-only).

    /// Dynamic class of an object; must work for proxies.
    fn class_of(&self, obj: Handle) -> Handle;
    fn class_named(&self, name: &str) -> Option<Handle>;
    fn class_name(&self, class: Handle) -> String;
    fn superclass(&self, class: Handle) -> Handle;

    /// Finds the implementation for `sel` on `class`, searching instance
    /// methods, then class methods, then up the superclass chain.
    fn lookup_method(&self, class: Handle, sel: Sel) -> Option<MethodImpl>;

    // Selectors.

    fn register_selector(&self, name: &str) -> Sel;
    fn selector_name(&self, sel: Sel) -> String;

    // Reference counting (the bridge forwards, never tracks).

    fn retain(&self, obj: Handle);
    fn release(&self, obj: Handle);

    // Calls.

    fn direct_calls(&self) -> &DirectCallTable;

    /// Drains the exception raised by the most recent generic (libffi)
    /// call on this thread, if any. The invocation engine checks this
    /// immediately after every native call.
    fn take_pending_exception(&self) -> Option<Handle>;

    /// Records `exc` as raised; used by reverse-call shims returning into
    /// native code.
    fn raise(&self, exc: Handle);

    // Exception accessors.

    /// Class-membership test: is `obj` a native exception object?
    fn is_exception(&self, obj: Handle) -> bool;
    fn exception_name(&self, exc: Handle) -> String;
    fn exception_reason(&self, exc: Handle) -> String;
    /// Side-channel lookup by fixed key; `None` when absent.
    fn exception_payload(&self, exc: Handle, key: &str) -> Option<Vec<u8>>;
    /// Builds a native exception, optionally attaching side-channel data.
    fn new_exception(&self, name: &str, reason: &str, payload: Option<Vec<u8>>) -> Handle;
}

static RUNTIME: OnceLock<&'static dyn ObjcRuntime> = OnceLock::new();

/// Installs the process-wide runtime. The first installation wins; later
/// calls against the same runtime are no-ops and a conflicting installation
/// is a startup-order bug.
pub fn install(rt: &'static dyn ObjcRuntime) {
    let installed = *RUNTIME.get_or_init(|| rt);
    assert!(
        std::ptr::addr_eq(installed as *const dyn ObjcRuntime, rt as *const dyn ObjcRuntime),
        "a different runtime is already installed"
    );
}

/// The installed runtime. Panics when called before [`install`]; runtime
/// installation is the documented first step of bridge initialization.
pub fn global() -> &'static dyn ObjcRuntime {
    *RUNTIME
        .get()
        .expect("no ObjcRuntime installed; call runtime::install first")
}

pub fn is_installed() -> bool {
    RUNTIME.get().is_some()
}
