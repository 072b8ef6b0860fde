//! Runtime backend bound to a native glue library.
//!
//! The glue library exports a flat C ABI over the underlying object system:
//! introspection, selector interning, reference counting, the direct-call
//! primitives, and exception plumbing. Symbols are resolved once at load
//! time; the library handle is held for the life of the process so the
//! resolved function pointers stay valid.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;

use libloading::Library;
use tracing::info;

use crate::error::BridgeError;
use crate::object::Handle;
use crate::runtime::{self, DirectCallTable, MethodImpl, ObjcRuntime};
use crate::selector::Sel;

type GetClassFn = unsafe extern "C" fn(Handle) -> Handle;
type ClassNamedFn = unsafe extern "C" fn(*const c_char) -> Handle;
type ClassNameFn = unsafe extern "C" fn(Handle) -> *const c_char;
type LookupMethodFn = unsafe extern "C" fn(Handle, Sel) -> Handle;
type MethodImpFn = unsafe extern "C" fn(Handle) -> unsafe extern "C" fn();
type MethodEncodingFn = unsafe extern "C" fn(Handle) -> *const c_char;
type RegisterSelFn = unsafe extern "C" fn(*const c_char) -> Sel;
type SelNameFn = unsafe extern "C" fn(Sel) -> *const c_char;
type RefCountFn = unsafe extern "C" fn(Handle);
type TakeExceptionFn = unsafe extern "C" fn() -> Handle;
type RaiseFn = unsafe extern "C" fn(Handle);
type IsExceptionFn = unsafe extern "C" fn(Handle) -> u8;
type ExcTextFn = unsafe extern "C" fn(Handle) -> *const c_char;
type ExcPayloadFn = unsafe extern "C" fn(Handle, *const c_char, *mut usize) -> *const u8;
type NewExceptionFn =
    unsafe extern "C" fn(*const c_char, *const c_char, *const u8, usize) -> Handle;

struct Symbols {
    object_get_class: GetClassFn,
    class_named: ClassNamedFn,
    class_name: ClassNameFn,
    class_superclass: GetClassFn,
    lookup_method: LookupMethodFn,
    method_imp: MethodImpFn,
    method_encoding: MethodEncodingFn,
    register_selector: RegisterSelFn,
    selector_name: SelNameFn,
    retain: RefCountFn,
    release: RefCountFn,
    take_exception: TakeExceptionFn,
    raise: RaiseFn,
    is_exception: IsExceptionFn,
    exception_name: ExcTextFn,
    exception_reason: ExcTextFn,
    exception_payload: ExcPayloadFn,
    new_exception: NewExceptionFn,
}

/// The production runtime backend.
pub struct HostRuntime {
    // Keeps every resolved symbol valid.
    _lib: Library,
    syms: Symbols,
    direct: DirectCallTable,
}

fn cstr_to_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn resource(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Resource(e.to_string())
}

macro_rules! sym {
    ($lib:expr, $name:literal, $ty:ty) => {
        *unsafe { $lib.get::<$ty>($name) }.map_err(resource)?
    };
}

impl HostRuntime {
    /// Loads the glue library and resolves every required symbol, then
    /// installs the result as the process-wide runtime.
    pub fn install(path: impl AsRef<Path>) -> Result<&'static HostRuntime, BridgeError> {
        let rt: &'static HostRuntime = Box::leak(Box::new(HostRuntime::load(path.as_ref())?));
        runtime::install(rt);
        Ok(rt)
    }

    fn load(path: &Path) -> Result<HostRuntime, BridgeError> {
        info!(path = %path.display(), "loading native glue library");
        let lib = unsafe { Library::new(path) }.map_err(resource)?;

        let syms = Symbols {
            object_get_class: sym!(lib, b"BridgeObjectGetClass", GetClassFn),
            class_named: sym!(lib, b"BridgeClassNamed", ClassNamedFn),
            class_name: sym!(lib, b"BridgeClassName", ClassNameFn),
            class_superclass: sym!(lib, b"BridgeClassSuperclass", GetClassFn),
            lookup_method: sym!(lib, b"BridgeLookupMethod", LookupMethodFn),
            method_imp: sym!(lib, b"BridgeMethodImp", MethodImpFn),
            method_encoding: sym!(lib, b"BridgeMethodEncoding", MethodEncodingFn),
            register_selector: sym!(lib, b"BridgeRegisterSelector", RegisterSelFn),
            selector_name: sym!(lib, b"BridgeSelectorName", SelNameFn),
            retain: sym!(lib, b"BridgeRetain", RefCountFn),
            release: sym!(lib, b"BridgeRelease", RefCountFn),
            take_exception: sym!(lib, b"BridgeTakeException", TakeExceptionFn),
            raise: sym!(lib, b"BridgeRaise", RaiseFn),
            is_exception: sym!(lib, b"BridgeIsException", IsExceptionFn),
            exception_name: sym!(lib, b"BridgeExceptionName", ExcTextFn),
            exception_reason: sym!(lib, b"BridgeExceptionReason", ExcTextFn),
            exception_payload: sym!(lib, b"BridgeExceptionPayload", ExcPayloadFn),
            new_exception: sym!(lib, b"BridgeNewException", NewExceptionFn),
        };

        let direct = DirectCallTable {
            call_p: sym!(
                lib,
                b"BridgeCallp",
                unsafe extern "C" fn(Handle, Sel, *mut Handle) -> Handle
            ),
            call_i: sym!(
                lib,
                b"BridgeCalli",
                unsafe extern "C" fn(Handle, Sel, *mut Handle) -> i32
            ),
            call_pi: sym!(
                lib,
                b"BridgeCallpi",
                unsafe extern "C" fn(Handle, Sel, i32, *mut Handle) -> Handle
            ),
            call_ii: sym!(
                lib,
                b"BridgeCallii",
                unsafe extern "C" fn(Handle, Sel, i32, *mut Handle) -> i32
            ),
            call_pp: sym!(
                lib,
                b"BridgeCallpp",
                unsafe extern "C" fn(Handle, Sel, Handle, *mut Handle) -> Handle
            ),
            call_ip: sym!(
                lib,
                b"BridgeCallip",
                unsafe extern "C" fn(Handle, Sel, Handle, *mut Handle) -> i32
            ),
        };

        Ok(HostRuntime {
            _lib: lib,
            syms,
            direct,
        })
    }
}

impl ObjcRuntime for HostRuntime {
    fn class_of(&self, obj: Handle) -> Handle {
        unsafe { (self.syms.object_get_class)(obj) }
    }

    fn class_named(&self, name: &str) -> Option<Handle> {
        let Ok(name) = CString::new(name) else {
            return None;
        };
        let class = unsafe { (self.syms.class_named)(name.as_ptr()) };
        (!class.is_null()).then_some(class)
    }

    fn class_name(&self, class: Handle) -> String {
        cstr_to_string(unsafe { (self.syms.class_name)(class) })
    }

    fn superclass(&self, class: Handle) -> Handle {
        unsafe { (self.syms.class_superclass)(class) }
    }

    fn lookup_method(&self, class: Handle, sel: Sel) -> Option<MethodImpl> {
        let method = unsafe { (self.syms.lookup_method)(class, sel) };
        if method.is_null() {
            return None;
        }
        let imp = unsafe { (self.syms.method_imp)(method) };
        let encoding = cstr_to_string(unsafe { (self.syms.method_encoding)(method) });
        Some(MethodImpl { imp, encoding })
    }

    fn register_selector(&self, name: &str) -> Sel {
        match CString::new(name) {
            Ok(name) => unsafe { (self.syms.register_selector)(name.as_ptr()) },
            Err(_) => Sel::NULL,
        }
    }

    fn selector_name(&self, sel: Sel) -> String {
        cstr_to_string(unsafe { (self.syms.selector_name)(sel) })
    }

    fn retain(&self, obj: Handle) {
        unsafe { (self.syms.retain)(obj) }
    }

    fn release(&self, obj: Handle) {
        unsafe { (self.syms.release)(obj) }
    }

    fn direct_calls(&self) -> &DirectCallTable {
        &self.direct
    }

    fn take_pending_exception(&self) -> Option<Handle> {
        let exc = unsafe { (self.syms.take_exception)() };
        (!exc.is_null()).then_some(exc)
    }

    fn raise(&self, exc: Handle) {
        unsafe { (self.syms.raise)(exc) }
    }

    fn is_exception(&self, obj: Handle) -> bool {
        unsafe { (self.syms.is_exception)(obj) != 0 }
    }

    fn exception_name(&self, exc: Handle) -> String {
        cstr_to_string(unsafe { (self.syms.exception_name)(exc) })
    }

    fn exception_reason(&self, exc: Handle) -> String {
        cstr_to_string(unsafe { (self.syms.exception_reason)(exc) })
    }

    fn exception_payload(&self, exc: Handle, key: &str) -> Option<Vec<u8>> {
        let key = CString::new(key).ok()?;
        let mut len = 0usize;
        let ptr = unsafe { (self.syms.exception_payload)(exc, key.as_ptr(), &mut len) };
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
    }

    fn new_exception(&self, name: &str, reason: &str, payload: Option<Vec<u8>>) -> Handle {
        let name = CString::new(name).unwrap_or_default();
        let reason = CString::new(reason).unwrap_or_default();
        let (ptr, len) = match &payload {
            Some(bytes) => (bytes.as_ptr(), bytes.len()),
            None => (std::ptr::null(), 0),
        };
        unsafe { (self.syms.new_exception)(name.as_ptr(), reason.as_ptr(), ptr, len) }
    }
}

const _: () = {
    // The lookup handle is a raw method pointer, not an object reference.
    assert!(std::mem::size_of::<Handle>() == std::mem::size_of::<*const c_void>());
};
