//! The generic calling-convention layer.
//!
//! A parsed signature becomes a [`Frame`]: a prepared libffi call interface
//! plus one buffer per argument slot and a promoted return buffer. Building
//! a frame is expensive, so frames are cached per signature *per thread*;
//! the descriptor is logically immutable but its buffers are not, and
//! thread-local caching makes concurrent calls safe without any locking.
//! Structural signature equality guarantees that two encodings with the same
//! token sequence share a cache entry.

pub mod buffer;

#[cfg(test)]
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use libffi::middle::{Cif, CodePtr, Type};

use crate::encoding::{TypeEncoding, TypeToken};
use crate::runtime::Imp;
use buffer::ArgBuffer;

/// Maps one encoding token to its ABI-level libffi type.
pub fn ffi_type(token: &TypeToken) -> Type {
    match token {
        TypeToken::Void => Type::void(),
        TypeToken::Bool | TypeToken::UInt8 => Type::u8(),
        TypeToken::Int8 => Type::i8(),
        TypeToken::Int16 => Type::i16(),
        TypeToken::UInt16 => Type::u16(),
        TypeToken::Int32 => Type::i32(),
        TypeToken::UInt32 => Type::u32(),
        TypeToken::Int64 => Type::i64(),
        TypeToken::UInt64 => Type::u64(),
        TypeToken::Float32 => Type::f32(),
        TypeToken::Float64 => Type::f64(),
        TypeToken::CString
        | TypeToken::Object
        | TypeToken::Class
        | TypeToken::Sel
        | TypeToken::Pointer => Type::pointer(),
        TypeToken::Struct(s) => Type::structure(s.fields.iter().map(ffi_type)),
    }
}

/// A prepared call: descriptor plus per-slot buffers for one signature.
pub struct Frame {
    cif: Cif,
    pub ret: ArgBuffer,
    pub args: Vec<ArgBuffer>,
}

impl Frame {
    fn build(sig: &TypeEncoding) -> Frame {
        #[cfg(test)]
        BUILDS_ON_THREAD.with(|c| c.set(c.get() + 1));

        let arg_types: Vec<Type> = sig.args.iter().map(ffi_type).collect();
        let cif = Cif::new(arg_types, ffi_type(&sig.ret));
        Frame {
            cif,
            ret: ArgBuffer::for_return(&sig.ret),
            args: sig.args.iter().map(ArgBuffer::for_token).collect(),
        }
    }

    /// Invokes `imp` through the generic call primitive with the currently
    /// filled argument buffers, leaving the result in the return buffer.
    ///
    /// # Safety
    /// `imp`'s true signature must match the frame's descriptor, and every
    /// argument buffer must have been filled for the pending call.
    pub unsafe fn call(&mut self, imp: Imp) {
        let mut arg_ptrs: Vec<*mut c_void> = self
            .args
            .iter_mut()
            .map(|b| b.as_mut_ptr().cast::<c_void>())
            .collect();
        let code = CodePtr::from_fun(imp);
        libffi::raw::ffi_call(
            self.cif.as_raw_ptr(),
            Some(*code.as_fun()),
            self.ret.as_mut_ptr().cast::<c_void>(),
            arg_ptrs.as_mut_ptr(),
        );
    }
}

thread_local! {
    static FRAMES: RefCell<HashMap<Arc<TypeEncoding>, Rc<RefCell<Frame>>>> =
        RefCell::new(HashMap::new());

    #[cfg(test)]
    static BUILDS_ON_THREAD: Cell<usize> = const { Cell::new(0) };
}

/// The calling thread's frame for `sig`, built on first use.
///
/// The returned handle is deliberately not `Send`; a frame never leaves the
/// thread that built it. If the cached frame is already borrowed by a call
/// further down this thread's stack (a native callee re-entered managed
/// code and issued another call with the same signature), a fresh uncached
/// frame is handed out instead of clobbering the in-flight one.
pub fn frame_for(sig: &Arc<TypeEncoding>) -> Rc<RefCell<Frame>> {
    FRAMES.with(|frames| {
        let mut map = frames.borrow_mut();
        if let Some(frame) = map.get(sig) {
            if frame.try_borrow_mut().is_ok() {
                return Rc::clone(frame);
            }
            return Rc::new(RefCell::new(Frame::build(sig)));
        }
        let frame = Rc::new(RefCell::new(Frame::build(sig)));
        map.insert(Arc::clone(sig), Rc::clone(&frame));
        frame
    })
}

/// Drops the calling thread's cached frames. Intended for test teardown and
/// thread shutdown; in-flight invocations keep their frame alive through
/// their own reference.
pub fn clear_thread_frames() {
    FRAMES.with(|frames| frames.borrow_mut().clear());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding;

    #[test]
    fn frames_are_built_once_per_signature_per_thread() {
        clear_thread_frames();
        BUILDS_ON_THREAD.with(|c| c.set(0));

        let a = encoding::cached("i@:i").unwrap();
        // Equivalent encoding with frame offsets: structurally equal, so it
        // must hit the same cache entry.
        let b = encoding::cached("i12@0:4i8").unwrap();

        let f1 = frame_for(&a);
        let f2 = frame_for(&b);
        let f3 = frame_for(&a);

        assert!(Rc::ptr_eq(&f1, &f2));
        assert!(Rc::ptr_eq(&f1, &f3));
        assert_eq!(BUILDS_ON_THREAD.with(|c| c.get()), 1);
    }

    #[test]
    fn frame_buffers_match_slot_layout() {
        let sig = encoding::cached("d@:{Point=dd}").unwrap();
        let frame = frame_for(&sig);
        let frame = frame.borrow();
        assert_eq!(frame.args.len(), 3);
        assert_eq!(frame.args[2].len(), 16);
        assert!(frame.ret.len() >= 8);
    }

    #[test]
    fn distinct_threads_build_their_own_frames() {
        let sig = encoding::cached("v@:@").unwrap();
        let _local = frame_for(&sig);
        let sig2 = Arc::clone(&sig);
        std::thread::spawn(move || {
            // A fresh thread starts with an empty cache and must be able to
            // build and use its own frame independently.
            let frame = frame_for(&sig2);
            assert_eq!(frame.borrow().args.len(), 3);
        })
        .join()
        .unwrap();
    }
}
