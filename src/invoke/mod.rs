//! The invocation engine.
//!
//! [`call`] is the one-shot entry point: resolve, try the fast path, fall
//! back to a generic descriptor-driven call. [`Invocation`] is the reusable
//! form, bound to one target and selector so repeated calls amortize
//! descriptor and buffer setup. Both check the pending-exception slot after
//! every native call and convert a raised exception before returning.

pub mod fast_path;

use std::cell::RefCell;
use std::ffi::CString;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::encoding::TypeEncoding;
use crate::error::{BridgeError, InvalidCallError};
use crate::exception;
use crate::ffi::{self, buffer, Frame};
use crate::object::Handle;
use crate::resolve;
use crate::runtime::{self, Imp};
use crate::selector::Selector;
use crate::value::Value;

/// Sends `selector` to `target` with `args`, trying the fast path first.
///
/// A null target is a no-op returning `Value::Null`, so results can be
/// chained without null checks. Arity is validated against the resolved
/// signature before anything native runs.
pub fn call(target: Handle, selector: &str, args: &[Value]) -> Result<Value, BridgeError> {
    if target.is_null() {
        return Ok(Value::Null);
    }

    let selector = Selector::intern(selector);
    let resolved = resolve::method(target, &selector)?;
    check_arity(&selector, &resolved.encoding, args.len())?;

    if let Some(result) = fast_path::attempt(target, selector.raw(), &resolved.encoding, args)? {
        trace!(selector = selector.name(), "dispatched via fast path");
        return Ok(result);
    }

    let mut inv = Invocation::from_resolved(target, selector, resolved.imp, resolved.encoding);
    inv.set_args(args)?;
    inv.invoke()
}

fn check_arity(
    selector: &Selector,
    sig: &TypeEncoding,
    got: usize,
) -> Result<(), InvalidCallError> {
    let takes = sig.arity();
    if takes != got {
        return Err(InvalidCallError::WrongArity {
            selector: selector.name().to_string(),
            takes,
            got,
        });
    }
    Ok(())
}

/// A reusable call bound to one target and selector.
///
/// Holds the calling thread's cached frame for the signature, so an
/// `Invocation` never moves between threads (enforced by the `Rc` inside).
/// Safe for repeated sequential use; [`dispose`](Invocation::dispose) ends
/// its life, after which every operation fails with
/// [`InvalidCallError::Disposed`].
///
/// Binding to a null target always succeeds: the resulting invocation
/// accepts any arguments and every [`invoke`](Invocation::invoke) is a
/// no-op returning `Value::Null`, matching the one-shot [`call`] semantics.
pub struct Invocation {
    target: Handle,
    selector: Selector,
    /// `None` for a null receiver, which swallows every call.
    bound: Option<BoundCall>,
    /// Temporary C-string allocations for the pending call; freed on drain.
    scratch: Vec<CString>,
    args_set: bool,
    disposed: bool,
}

struct BoundCall {
    imp: Imp,
    sig: Arc<TypeEncoding>,
    frame: Rc<RefCell<Frame>>,
}

impl Invocation {
    /// Resolves `selector` on `target` and prepares a reusable call. A null
    /// target binds trivially, without consulting the runtime.
    pub fn bind(target: Handle, selector: &str) -> Result<Invocation, BridgeError> {
        let selector = Selector::intern(selector);
        if target.is_null() {
            return Ok(Invocation {
                target,
                selector,
                bound: None,
                scratch: Vec::new(),
                args_set: false,
                disposed: false,
            });
        }
        let resolved = resolve::method(target, &selector)?;
        Ok(Invocation::from_resolved(
            target,
            selector,
            resolved.imp,
            resolved.encoding,
        ))
    }

    fn from_resolved(
        target: Handle,
        selector: Selector,
        imp: Imp,
        sig: Arc<TypeEncoding>,
    ) -> Invocation {
        let frame = ffi::frame_for(&sig);
        Invocation {
            target,
            selector,
            bound: Some(BoundCall { imp, sig, frame }),
            scratch: Vec::new(),
            args_set: false,
            disposed: false,
        }
    }

    /// The resolved type encoding, or `None` for a null-target binding.
    pub fn signature(&self) -> Option<&TypeEncoding> {
        self.bound.as_ref().map(|b| &*b.sig)
    }

    /// Marshals `args` into the frame's buffers for the next [`invoke`]
    /// (`Invocation::invoke`). Validates arity and every narrowing.
    pub fn set_args(&mut self, args: &[Value]) -> Result<(), BridgeError> {
        self.check_live()?;
        let Some(b) = &self.bound else {
            // Nothing to marshal against; a null receiver takes anything.
            self.args_set = true;
            return Ok(());
        };
        check_arity(&self.selector, &b.sig, args.len())?;

        self.scratch.clear();
        let mut frame = b.frame.borrow_mut();

        buffer::encode(
            &mut frame.args[0],
            &Value::Object(self.target),
            &b.sig.args[0],
            &mut self.scratch,
        )?;
        buffer::encode(
            &mut frame.args[1],
            &Value::Selector(self.selector.raw()),
            &b.sig.args[1],
            &mut self.scratch,
        )?;
        for (i, value) in args.iter().enumerate() {
            buffer::encode(
                &mut frame.args[i + 2],
                value,
                &b.sig.args[i + 2],
                &mut self.scratch,
            )?;
        }

        self.args_set = true;
        Ok(())
    }

    /// Performs the native call with the currently marshaled arguments and
    /// drains the result. Temporary marshaling allocations are released on
    /// both the success and the fault exit.
    pub fn invoke(&mut self) -> Result<Value, BridgeError> {
        self.check_live()?;
        let Some(arity) = self.bound.as_ref().map(|b| b.sig.arity()) else {
            self.args_set = false;
            return Ok(Value::Null);
        };
        if arity > 0 && !self.args_set {
            return Err(InvalidCallError::WrongArity {
                selector: self.selector.name().to_string(),
                takes: arity,
                got: 0,
            }
            .into());
        }
        if !self.args_set {
            // Nullary calls still need the receiver and selector slots.
            self.set_args(&[])?;
        }

        let result = match &self.bound {
            Some(b) => {
                let mut frame = b.frame.borrow_mut();
                frame.ret.zero();
                unsafe { frame.call(b.imp) };

                match runtime::global().take_pending_exception() {
                    Some(exc) => Err(exception::from_handle(exc)),
                    None => unsafe { buffer::decode_return(frame.ret.as_ptr(), &b.sig.ret) }
                        .map_err(BridgeError::from),
                }
            }
            None => Ok(Value::Null),
        };

        // Drain marshaling state whichever way the call went.
        self.scratch.clear();
        self.args_set = false;
        result
    }

    /// Convenience for `set_args` followed by `invoke`.
    pub fn invoke_with(&mut self, args: &[Value]) -> Result<Value, BridgeError> {
        self.set_args(args)?;
        self.invoke()
    }

    /// Releases per-call state and retires the instance. Further use fails
    /// with a clear error instead of touching freed resources.
    pub fn dispose(&mut self) {
        self.scratch.clear();
        self.args_set = false;
        self.disposed = true;
    }

    fn check_live(&self) -> Result<(), InvalidCallError> {
        if self.disposed {
            return Err(InvalidCallError::Disposed);
        }
        Ok(())
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.disposed {
            self.dispose();
        }
    }
}
