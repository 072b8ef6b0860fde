//! The reverse-call adapter: native code invoking managed methods.
//!
//! A [`ReverseBinding`] wraps one managed method as a native entry point
//! using a libffi closure. When native code calls it, the shim decodes the
//! argument buffers with the same type-encoding grammar the forward path
//! uses, dispatches to the registered managed instance, and encodes the
//! result back into the caller's return slot. A managed error is logged,
//! serialized into a native exception's side channel, and raised, so the
//! forward path's exception conversion can reconstitute the original.

use std::cell::RefCell;
use std::ffi::{c_void, CString};

use libffi::low;
use libffi::middle::{Cif, CodePtr, Type};
use tracing::warn;

use crate::encoding::{self, TypeEncoding, TypeToken};
use crate::error::BridgeError;
use crate::exception::{self, ManagedException};
use crate::ffi::{self, buffer};
use crate::object::Handle;
use crate::registry::{self, ParamKind};
use crate::runtime::{self, Imp};
use crate::value::Value;

use std::sync::Arc;

/// Everything the shim needs to service one bound method.
pub struct ReverseThunk {
    selector: String,
    signature: Arc<TypeEncoding>,
    /// Declared parameter kinds; `None` decodes every slot by its encoding.
    params: Option<Vec<ParamKind>>,
}

thread_local! {
    /// Keeps the most recently returned C-string alive until the native
    /// caller has consumed it; overwritten by the next string-returning
    /// reverse call on this thread.
    static LAST_CSTR: RefCell<Vec<CString>> = const { RefCell::new(Vec::new()) };
}

/// Decodes one argument slot, applying the declared parameter kind where the
/// wire format alone cannot determine the managed representation.
unsafe fn decode_param(
    ptr: *const u8,
    token: &TypeToken,
    kind: ParamKind,
) -> Result<Value, ManagedException> {
    let decoded = buffer::decode_arg(ptr, token)
        .map_err(|e| ManagedException::new("InvalidCallError", e.to_string()))?;

    match kind {
        ParamKind::Default => Ok(decoded),
        // A 16-bit slot is indistinguishable from a single code unit; the
        // declared parameter type decides.
        ParamKind::Char => match decoded {
            Value::UInt16(v) => char::from_u32(v as u32)
                .map(Value::Char)
                .ok_or_else(|| {
                    ManagedException::new("InvalidCallError", format!("unpaired surrogate {v:#x}"))
                }),
            other => Ok(other),
        },
        ParamKind::Instance => match decoded {
            Value::Object(h) => {
                if registry::lookup(h).is_none() {
                    return Err(ManagedException::new(
                        "InvalidCallError",
                        crate::error::InvalidCallError::NotExported(h).to_string(),
                    ));
                }
                Ok(Value::Object(h))
            }
            other => Ok(other),
        },
    }
}

/// Services one native-to-managed call.
///
/// Returns the raised native exception handle, or null on success. A
/// non-null target with no registered instance is a registry-consistency
/// bug and panics rather than limping on.
///
/// # Safety
/// `ret` must be a writable return slot for the thunk's return token and
/// `args` must hold one valid slot pointer per signature argument.
pub unsafe fn dispatch(thunk: &ReverseThunk, ret: *mut u8, args: &[*const u8]) -> Handle {
    let sig = &thunk.signature;

    let target = match buffer::decode_arg(args[0], &sig.args[0]) {
        Ok(v) => v.as_handle().unwrap_or(Handle::NULL),
        Err(_) => Handle::NULL,
    };

    let Some(instance) = registry::lookup(target) else {
        panic!(
            "reverse call to {} on handle {:#x} with no registered managed instance",
            thunk.selector, target.0
        );
    };

    let outcome = (|| {
        let mut call_args = Vec::with_capacity(sig.arity());
        for (i, token) in sig.args[2..].iter().enumerate() {
            let kind = thunk
                .params
                .as_ref()
                .and_then(|kinds| kinds.get(i).copied())
                .unwrap_or(ParamKind::Default);
            call_args.push(decode_param(args[i + 2], token, kind)?);
        }

        let result = instance.invoke(&thunk.selector, &call_args)?;

        let mut scratch = Vec::new();
        buffer::encode_return(ret, &result, &sig.ret, &mut scratch)
            .map_err(|e| ManagedException::new("InvalidCallError", e.to_string()))?;
        // Returned C-strings outlive the call through the thread-local slot.
        if !scratch.is_empty() {
            LAST_CSTR.with(|s| *s.borrow_mut() = scratch);
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => Handle::NULL,
        Err(e) => to_native_exception(&e),
    }
}

/// Converts a managed exception into a native exception carrying the
/// serialized original in its side channel.
fn to_native_exception(e: &ManagedException) -> Handle {
    exception::log_managed_exception(e);

    let payload = match serde_json::to_vec(e) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(error = %err, "could not serialize managed exception for forwarding");
            None
        }
    };

    runtime::global().new_exception(&e.exception_type, &e.message, payload)
}

unsafe extern "C" fn shim(
    cif: &low::ffi_cif,
    result: &mut low::ffi_arg,
    args: *const *const c_void,
    thunk: &ReverseThunk,
) {
    debug_assert_eq!(cif.nargs as usize, thunk.signature.args.len());
    let slots: Vec<*const u8> = std::slice::from_raw_parts(args, thunk.signature.args.len())
        .iter()
        .map(|p| p.cast::<u8>())
        .collect();

    let exc = dispatch(thunk, (result as *mut low::ffi_arg).cast::<u8>(), &slots);
    if !exc.is_null() {
        runtime::global().raise(exc);
    }
}

/// A managed method exported as a callable native entry point.
///
/// Owns the libffi closure and the call interface backing it; the entry
/// point stays valid until the binding drops. Install the [`imp`]
/// (`ReverseBinding::imp`) into the runtime's method tables.
pub struct ReverseBinding {
    thunk: Box<ReverseThunk>,
    /// The prepared closure holds a pointer into this call interface, so it
    /// is boxed for a stable address and kept for the binding's lifetime.
    _cif: Box<Cif>,
    closure: *mut low::ffi_closure,
    code: CodePtr,
}

// The closure's writable state is fixed at prep time; after construction
// the binding is only ever read.
unsafe impl Send for ReverseBinding {}
unsafe impl Sync for ReverseBinding {}

impl ReverseBinding {
    /// Binds `selector` with the given encoding. Calls through the returned
    /// entry point dispatch to the managed instance registered for the
    /// receiver handle.
    pub fn bind(
        selector: &str,
        encoding_source: &str,
        params: Option<Vec<ParamKind>>,
    ) -> Result<ReverseBinding, BridgeError> {
        let signature = encoding::cached(encoding_source)?;

        let arg_types: Vec<Type> = signature.args.iter().map(ffi::ffi_type).collect();
        let cif = Box::new(Cif::new(arg_types, ffi::ffi_type(&signature.ret)));

        let thunk = Box::new(ReverseThunk {
            selector: selector.to_string(),
            signature,
            params,
        });

        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(BridgeError::Resource(
                "libffi closure allocation failed".to_string(),
            ));
        }
        if let Err(e) = unsafe { low::prep_closure(closure, cif.as_raw_ptr(), shim, &*thunk, code) }
        {
            unsafe { low::closure_free(closure) };
            return Err(BridgeError::Resource(format!(
                "libffi closure prep failed: {e:?}"
            )));
        }

        Ok(ReverseBinding {
            thunk,
            _cif: cif,
            closure,
            code,
        })
    }

    /// The native entry point for this binding.
    pub fn imp(&self) -> Imp {
        unsafe { *self.code.as_fun() }
    }

    pub fn selector(&self) -> &str {
        &self.thunk.selector
    }

    pub fn encoding(&self) -> &TypeEncoding {
        &self.thunk.signature
    }
}

impl Drop for ReverseBinding {
    fn drop(&mut self) {
        unsafe { low::closure_free(self.closure) };
    }
}
