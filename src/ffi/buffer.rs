//! Raw argument and return buffers.
//!
//! Each call slot gets one aligned buffer, filled from a [`Value`] before
//! the call and drained back to a [`Value`] after. Return buffers follow the
//! generic-call primitive's promotion rule: integral results narrower than a
//! machine word come back widened, so draining them truncates instead of
//! failing. C-string arguments allocate a temporary native string which the
//! caller must keep alive until the call completes (the invocation engine
//! tracks these in its scratch list).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;

use crate::encoding::TypeToken;
use crate::error::InvalidCallError;
use crate::object::Handle;
use crate::selector::Sel;
use crate::value::Value;

/// An owned, aligned raw buffer for one call slot.
///
/// Not `Send`: buffers live in per-thread frames and are never shared across
/// threads.
pub struct ArgBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    _not_send: std::marker::PhantomData<*mut u8>,
}

impl ArgBuffer {
    /// Allocates a zeroed buffer sized and aligned for `token`.
    pub fn for_token(token: &TypeToken) -> ArgBuffer {
        Self::with_size(token.size().max(1), token.alignment().max(1))
    }

    /// Allocates a zeroed return buffer for `token`, padded up to the
    /// generic call primitive's promoted return width.
    pub fn for_return(token: &TypeToken) -> ArgBuffer {
        let size = token.size().max(std::mem::size_of::<usize>());
        let align = token.alignment().max(std::mem::align_of::<usize>());
        Self::with_size(size, align)
    }

    fn with_size(size: usize, align: usize) -> ArgBuffer {
        let layout = Layout::from_size_align(size, align)
            .expect("slot layout is always valid for encodable types");
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            // Allocation failure for a call buffer is a fatal resource fault.
            std::alloc::handle_alloc_error(layout);
        };
        ArgBuffer {
            ptr,
            layout,
            _not_send: std::marker::PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn zero(&mut self) {
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size()) }
    }
}

impl Drop for ArgBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

unsafe fn write<T>(ptr: *mut u8, v: T) {
    std::ptr::write_unaligned(ptr.cast::<T>(), v)
}

unsafe fn read<T>(ptr: *const u8) -> T {
    std::ptr::read_unaligned(ptr.cast::<T>())
}

/// Encodes `value` into `buf` as `token`.
///
/// Narrowing is checked: a value that does not fit the declared slot fails
/// with `TypeMismatch`. C-string temporaries are appended to `scratch` and
/// must outlive the native call. An undersized buffer is a programming
/// error, not a recoverable condition.
pub fn encode(
    buf: &mut ArgBuffer,
    value: &Value,
    token: &TypeToken,
    scratch: &mut Vec<CString>,
) -> Result<(), InvalidCallError> {
    assert!(
        buf.len() >= token.size(),
        "slot buffer of {} bytes cannot hold a {} byte value",
        buf.len(),
        token.size()
    );
    unsafe { encode_at(buf.as_mut_ptr(), value, token, scratch) }
}

unsafe fn encode_at(
    ptr: *mut u8,
    value: &Value,
    token: &TypeToken,
    scratch: &mut Vec<CString>,
) -> Result<(), InvalidCallError> {
    match token {
        TypeToken::Void => {}
        TypeToken::Bool => write(ptr, value.as_bool()? as u8),
        TypeToken::Int8 => {
            // BOOL is encoded as a signed byte; accept booleans here.
            let v = match value {
                Value::Bool(b) => *b as i8,
                other => other.as_i8()?,
            };
            write(ptr, v);
        }
        TypeToken::UInt8 => write(ptr, value.as_u8()?),
        TypeToken::Int16 => write(ptr, value.as_i16()?),
        TypeToken::UInt16 => write(ptr, value.as_u16()?),
        TypeToken::Int32 => write(ptr, value.as_i32()?),
        TypeToken::UInt32 => write(ptr, value.as_u32()?),
        TypeToken::Int64 => write(ptr, value.as_i64()?),
        TypeToken::UInt64 => write(ptr, value.as_u64()?),
        TypeToken::Float32 => write(ptr, value.as_f32()?),
        TypeToken::Float64 => write(ptr, value.as_f64()?),
        TypeToken::CString => match value {
            Value::String(s) => {
                let c = CString::new(s.as_str()).map_err(|_| InvalidCallError::TypeMismatch {
                    expected: "CString",
                    actual: format!("string with interior NUL: {s:?}"),
                })?;
                write(ptr, c.as_ptr() as usize);
                scratch.push(c);
            }
            Value::Null => write(ptr, 0usize),
            Value::Pointer(p) => write(ptr, *p),
            other => {
                return Err(InvalidCallError::TypeMismatch {
                    expected: "CString",
                    actual: format!("{other:?}"),
                })
            }
        },
        TypeToken::Object | TypeToken::Class | TypeToken::Pointer => {
            write(ptr, value.as_handle()?.0)
        }
        TypeToken::Sel => write(ptr, value.as_selector()?.0),
        TypeToken::Struct(layout) => {
            let fields = value.as_struct()?;
            if fields.len() != layout.fields.len() {
                return Err(InvalidCallError::TypeMismatch {
                    expected: "Struct",
                    actual: format!(
                        "struct {} with {} fields, value has {}",
                        layout.name,
                        layout.fields.len(),
                        fields.len()
                    ),
                });
            }
            let mut offset = 0usize;
            for (field, ft) in fields.iter().zip(&layout.fields) {
                let align = ft.alignment();
                offset = offset.div_ceil(align) * align;
                encode_at(ptr.add(offset), field, ft, scratch)?;
                offset += ft.size();
            }
        }
    }
    Ok(())
}

/// Decodes an exact-width argument slot (no return promotion).
///
/// # Safety
/// `ptr` must point to at least `token.size()` readable bytes laid out as
/// the token describes.
pub unsafe fn decode_arg(ptr: *const u8, token: &TypeToken) -> Result<Value, InvalidCallError> {
    Ok(match token {
        TypeToken::Void => Value::Null,
        TypeToken::Bool => Value::Bool(read::<u8>(ptr) != 0),
        TypeToken::Int8 => Value::Int8(read(ptr)),
        TypeToken::UInt8 => Value::UInt8(read(ptr)),
        TypeToken::Int16 => Value::Int16(read(ptr)),
        TypeToken::UInt16 => Value::UInt16(read(ptr)),
        TypeToken::Int32 => Value::Int32(read(ptr)),
        TypeToken::UInt32 => Value::UInt32(read(ptr)),
        TypeToken::Int64 => Value::Int64(read(ptr)),
        TypeToken::UInt64 => Value::UInt64(read(ptr)),
        TypeToken::Float32 => Value::Float32(read(ptr)),
        TypeToken::Float64 => Value::Float64(read(ptr)),
        TypeToken::CString => decode_cstring(read::<usize>(ptr)),
        TypeToken::Object => decode_object(read::<usize>(ptr)),
        TypeToken::Class => decode_class(read::<usize>(ptr)),
        TypeToken::Sel => Value::Selector(Sel(read::<usize>(ptr))),
        TypeToken::Pointer => Value::Pointer(read::<usize>(ptr)),
        TypeToken::Struct(layout) => {
            let mut fields = Vec::with_capacity(layout.fields.len());
            let mut offset = 0usize;
            for ft in &layout.fields {
                let align = ft.alignment();
                offset = offset.div_ceil(align) * align;
                fields.push(decode_arg(ptr.add(offset), ft)?);
                offset += ft.size();
            }
            Value::Struct(fields)
        }
    })
}

/// Drains a return buffer produced by the generic call primitive.
///
/// Integral results narrower than a machine word are widened by the ABI, so
/// the full promoted word is read and truncated to the declared width. This
/// is required behavior, not leniency: an unsigned-short return physically
/// arrives as a 32-bit register value.
///
/// # Safety
/// `ptr` must point to a return buffer of at least promoted-word size.
pub unsafe fn decode_return(ptr: *const u8, token: &TypeToken) -> Result<Value, InvalidCallError> {
    Ok(match token {
        TypeToken::Bool => Value::Bool(read::<usize>(ptr) as u8 != 0),
        TypeToken::Int8 => Value::Int8(read::<isize>(ptr) as i8),
        TypeToken::UInt8 => Value::UInt8(read::<usize>(ptr) as u8),
        TypeToken::Int16 => Value::Int16(read::<isize>(ptr) as i16),
        TypeToken::UInt16 => Value::UInt16(read::<usize>(ptr) as u16),
        TypeToken::Int32 => Value::Int32(read::<isize>(ptr) as i32),
        TypeToken::UInt32 => Value::UInt32(read::<usize>(ptr) as u32),
        other => decode_arg(ptr, other)?,
    })
}

/// Fills a caller-supplied return slot, widening integral results narrower
/// than a machine word the way the ABI expects them.
///
/// The inverse of [`decode_return`]; used by reverse-call shims writing into
/// the closure's result pointer.
///
/// # Safety
/// `ptr` must point to a writable return slot of at least promoted-word size
/// (or the struct's full size for struct returns).
pub unsafe fn encode_return(
    ptr: *mut u8,
    value: &Value,
    token: &TypeToken,
    scratch: &mut Vec<CString>,
) -> Result<(), InvalidCallError> {
    match token {
        TypeToken::Void => {}
        TypeToken::Bool => write(ptr, value.as_bool()? as usize),
        TypeToken::Int8 => write(ptr, value.as_i8()? as isize),
        TypeToken::UInt8 => write(ptr, value.as_u8()? as usize),
        TypeToken::Int16 => write(ptr, value.as_i16()? as isize),
        TypeToken::UInt16 => write(ptr, value.as_u16()? as usize),
        TypeToken::Int32 => write(ptr, value.as_i32()? as isize),
        TypeToken::UInt32 => write(ptr, value.as_u32()? as usize),
        other => encode_at(ptr, value, other, scratch)?,
    }
    Ok(())
}

fn decode_cstring(raw: usize) -> Value {
    if raw == 0 {
        return Value::Null;
    }
    let s = unsafe { CStr::from_ptr(raw as *const c_char) };
    Value::String(s.to_string_lossy().into_owned())
}

fn decode_object(raw: usize) -> Value {
    // Never a bare pointer: object slots decode to handles, which resolve to
    // managed instances through the registry at the adapter boundary.
    if raw == 0 {
        Value::Null
    } else {
        Value::Object(Handle(raw))
    }
}

fn decode_class(raw: usize) -> Value {
    if raw == 0 {
        Value::Null
    } else {
        Value::Class(crate::object::Class::from_handle(Handle(raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::TypeEncoding;

    fn roundtrip(value: Value, token: &TypeToken) -> Value {
        let mut scratch = Vec::new();
        let mut buf = ArgBuffer::for_token(token);
        encode(&mut buf, &value, token, &mut scratch).unwrap();
        unsafe { decode_arg(buf.as_ptr(), token).unwrap() }
    }

    #[test]
    fn scalar_roundtrips() {
        assert_eq!(roundtrip(Value::Int8(-5), &TypeToken::Int8), Value::Int8(-5));
        assert_eq!(
            roundtrip(Value::UInt16(5000), &TypeToken::UInt16),
            Value::UInt16(5000)
        );
        assert_eq!(
            roundtrip(Value::Int64(i64::MIN), &TypeToken::Int64),
            Value::Int64(i64::MIN)
        );
        assert_eq!(
            roundtrip(Value::Float32(1.5), &TypeToken::Float32),
            Value::Float32(1.5)
        );
    }

    #[test]
    fn nested_struct_roundtrips_bit_for_bit() {
        let token = TypeEncoding::parse("{Rect={Point=dd}{Size=dd}}@:")
            .unwrap()
            .ret;
        let rect = Value::Struct(vec![
            Value::Struct(vec![Value::Float64(1.25), Value::Float64(-2.5)]),
            Value::Struct(vec![Value::Float64(640.0), Value::Float64(480.0)]),
        ]);
        assert_eq!(roundtrip(rect.clone(), &token), rect);
    }

    #[test]
    fn mixed_struct_respects_alignment() {
        let token = TypeEncoding::parse("{Mixed=icq}@:").unwrap().ret;
        let v = Value::Struct(vec![
            Value::Int32(7),
            Value::Int8(-1),
            Value::Int64(1 << 40),
        ]);
        assert_eq!(roundtrip(v.clone(), &token), v);
    }

    #[test]
    fn cstring_encode_allocates_tracked_temporary() {
        let mut scratch = Vec::new();
        let mut buf = ArgBuffer::for_token(&TypeToken::CString);
        encode(
            &mut buf,
            &Value::String("hello".into()),
            &TypeToken::CString,
            &mut scratch,
        )
        .unwrap();
        assert_eq!(scratch.len(), 1);
        let decoded = unsafe { decode_arg(buf.as_ptr(), &TypeToken::CString).unwrap() };
        assert_eq!(decoded, Value::String("hello".into()));
    }

    #[test]
    fn null_cstring_is_null() {
        let v = roundtrip(Value::Null, &TypeToken::CString);
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn promoted_unsigned_short_return_truncates() {
        let mut buf = ArgBuffer::for_return(&TypeToken::UInt16);
        unsafe { write::<usize>(buf.as_mut_ptr(), 5000) };
        let v = unsafe { decode_return(buf.as_ptr(), &TypeToken::UInt16).unwrap() };
        assert_eq!(v, Value::UInt16(5000));

        // High bits set by the callee's register must not leak through.
        unsafe { write::<usize>(buf.as_mut_ptr(), 0xdead_0005) };
        let v = unsafe { decode_return(buf.as_ptr(), &TypeToken::UInt16).unwrap() };
        assert_eq!(v, Value::UInt16(5));
    }

    #[test]
    fn encode_rejects_lossy_values() {
        let mut scratch = Vec::new();
        let mut buf = ArgBuffer::for_token(&TypeToken::Int16);
        let err = encode(
            &mut buf,
            &Value::Int32(70000),
            &TypeToken::Int16,
            &mut scratch,
        )
        .unwrap_err();
        assert!(matches!(err, InvalidCallError::TypeMismatch { .. }));
    }
}
