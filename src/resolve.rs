//! Runtime signature resolution.

use std::sync::Arc;

use tracing::debug;

use crate::encoding::{self, TypeEncoding};
use crate::error::InvalidCallError;
use crate::object::Handle;
use crate::runtime::{self, Imp};
use crate::selector::Selector;

/// A method resolved against a live receiver.
pub struct ResolvedMethod {
    pub imp: Imp,
    pub encoding: Arc<TypeEncoding>,
}

/// Resolves `selector` on the dynamic class of `target`.
///
/// Introspection only; no native method runs. The caller is responsible for
/// short-circuiting null targets (messages to nil never resolve). Missing
/// implementations fail with `MethodNotFound`; the encoding string is parsed
/// through the process-wide cache.
pub fn method(target: Handle, selector: &Selector) -> Result<ResolvedMethod, InvalidCallError> {
    debug_assert!(!target.is_null(), "null targets are handled before resolution");

    let rt = runtime::global();
    let class = rt.class_of(target);
    let found = rt.lookup_method(class, selector.raw());

    let Some(m) = found else {
        debug!(class = %rt.class_name(class), selector = %selector, "method not found");
        return Err(InvalidCallError::MethodNotFound {
            class: rt.class_name(class),
            selector: selector.name().to_string(),
        });
    };

    Ok(ResolvedMethod {
        imp: m.imp,
        encoding: encoding::cached(&m.encoding)?,
    })
}
