//! Direct dispatch for the signature shapes that dominate real workloads.
//!
//! A closed table of (argument shape, return token) pairs maps straight onto
//! the runtime's specialized call primitives, skipping descriptor and buffer
//! machinery entirely. Anything outside the table reports a miss and the
//! caller falls back to the generic path; a miss is never an error.

use crate::encoding::{TypeEncoding, TypeToken};
use crate::error::BridgeError;
use crate::exception;
use crate::object::{Class, Handle};
use crate::selector::Sel;
use crate::value::Value;
use crate::runtime;

/// The one-argument shapes the direct-call table covers.
enum FastArg {
    None,
    Int(i32),
    Ptr(Handle),
}

/// Classifies the call's arguments against the direct-call table.
///
/// Arguments are matched by their declared slot tokens, not by the supplied
/// values, so a shape miss here and a type error in the generic path stay
/// distinct.
fn classify_args(sig: &TypeEncoding, args: &[Value]) -> Option<FastArg> {
    let slots = &sig.args[2..];
    match slots {
        [] => Some(FastArg::None),
        [TypeToken::Int32] => args[0].as_i32().ok().map(FastArg::Int),
        // An unsigned 32-bit slot travels through the signed primitive
        // bit-for-bit.
        [TypeToken::UInt32] => args[0].as_u32().ok().map(|v| FastArg::Int(v as i32)),
        [TypeToken::Object | TypeToken::Class | TypeToken::Pointer] => {
            args[0].as_handle().ok().map(FastArg::Ptr)
        }
        [TypeToken::Sel] => args[0].as_selector().ok().map(|s| FastArg::Ptr(Handle(s.0))),
        _ => None,
    }
}

fn supported_return(token: &TypeToken) -> bool {
    matches!(
        token,
        TypeToken::Void
            | TypeToken::Int32
            | TypeToken::UInt32
            | TypeToken::Int64
            | TypeToken::UInt64
            | TypeToken::Object
            | TypeToken::Class
            | TypeToken::Sel
    )
}

/// Attempts a direct call. `Ok(None)` means the signature or argument shape
/// is outside the table and the generic path must run instead.
///
/// Exceptions raised by the callee convert exactly as on the generic path.
pub fn attempt(
    target: Handle,
    sel: Sel,
    sig: &TypeEncoding,
    args: &[Value],
) -> Result<Option<Value>, BridgeError> {
    if !supported_return(&sig.ret) {
        return Ok(None);
    }
    let Some(arg) = classify_args(sig, args) else {
        return Ok(None);
    };

    let table = runtime::global().direct_calls();
    let mut exc = Handle::NULL;

    // Pointer-sized returns (including 64-bit integers, which occupy a full
    // register on the supported targets) go through the pointer primitives;
    // 32-bit integer returns through the int primitives.
    let raw: RawResult = unsafe {
        match (&sig.ret, &arg) {
            (TypeToken::Int32 | TypeToken::UInt32 | TypeToken::Void, FastArg::None) => {
                RawResult::Int((table.call_i)(target, sel, &mut exc))
            }
            (TypeToken::Int32 | TypeToken::UInt32 | TypeToken::Void, FastArg::Int(v)) => {
                RawResult::Int((table.call_ii)(target, sel, *v, &mut exc))
            }
            (TypeToken::Int32 | TypeToken::UInt32 | TypeToken::Void, FastArg::Ptr(p)) => {
                RawResult::Int((table.call_ip)(target, sel, *p, &mut exc))
            }
            (_, FastArg::None) => RawResult::Ptr((table.call_p)(target, sel, &mut exc)),
            (_, FastArg::Int(v)) => RawResult::Ptr((table.call_pi)(target, sel, *v, &mut exc)),
            (_, FastArg::Ptr(p)) => RawResult::Ptr((table.call_pp)(target, sel, *p, &mut exc)),
        }
    };

    if !exc.is_null() {
        return Err(exception::from_handle(exc));
    }

    Ok(Some(decode(&sig.ret, raw)))
}

enum RawResult {
    Int(i32),
    Ptr(Handle),
}

fn decode(ret: &TypeToken, raw: RawResult) -> Value {
    match (ret, raw) {
        (TypeToken::Void, _) => Value::Null,
        (TypeToken::Int32, RawResult::Int(v)) => Value::Int32(v),
        (TypeToken::UInt32, RawResult::Int(v)) => Value::UInt32(v as u32),
        (TypeToken::Int64, RawResult::Ptr(h)) => Value::Int64(h.0 as i64),
        (TypeToken::UInt64, RawResult::Ptr(h)) => Value::UInt64(h.0 as u64),
        (TypeToken::Object, RawResult::Ptr(h)) if h.is_null() => Value::Null,
        (TypeToken::Object, RawResult::Ptr(h)) => Value::Object(h),
        (TypeToken::Class, RawResult::Ptr(h)) if h.is_null() => Value::Null,
        (TypeToken::Class, RawResult::Ptr(h)) => Value::Class(Class::from_handle(h)),
        (TypeToken::Sel, RawResult::Ptr(h)) => Value::Selector(Sel(h.0)),
        // classify/dispatch keep the int and pointer channels aligned with
        // the return token; any other pairing is unreachable.
        _ => Value::Null,
    }
}
