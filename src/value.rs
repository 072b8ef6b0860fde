//! Loosely-typed call arguments and results.
//!
//! [`Value`] carries enough type information to perform checked narrowing at
//! the bridge boundary. Conversions follow the widening matrix of the
//! original bridge: a narrower integer always converts to a wider one, but a
//! lossy conversion fails with [`InvalidCallError::TypeMismatch`] instead of
//! silently truncating. The single deliberate truncation is u32 -> u16,
//! which exists because the ABI produces unsigned-short return values as a
//! promoted 32-bit register.

use crate::error::InvalidCallError;
use crate::object::{Class, Handle};
use crate::selector::Sel;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// A single UTF-16 code unit promoted to `char`; produced by the reverse
    /// adapter when the declared managed parameter is a character (the ABI
    /// cannot distinguish it from `UInt16`).
    Char(char),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    /// A raw untyped pointer.
    Pointer(usize),
    Object(Handle),
    Class(Class),
    Selector(Sel),
    String(String),
    /// Fixed-layout struct fields in declaration order.
    Struct(Vec<Value>),
}

fn mismatch(expected: &'static str, v: &Value) -> InvalidCallError {
    InvalidCallError::TypeMismatch {
        expected,
        actual: format!("{v:?}"),
    }
}

impl Value {
    /// True for `Null` and for null object/pointer payloads.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Object(h) => h.is_null(),
            Value::Class(c) => c.handle().is_null(),
            Value::Pointer(p) => *p == 0,
            _ => false,
        }
    }

    pub fn as_bool(&self) -> Result<bool, InvalidCallError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("Bool", other)),
        }
    }

    pub fn as_i8(&self) -> Result<i8, InvalidCallError> {
        match self {
            Value::Int8(v) => Ok(*v),
            other => Err(mismatch("Int8", other)),
        }
    }

    pub fn as_u8(&self) -> Result<u8, InvalidCallError> {
        match self {
            Value::UInt8(v) => Ok(*v),
            other => Err(mismatch("UInt8", other)),
        }
    }

    pub fn as_i16(&self) -> Result<i16, InvalidCallError> {
        match self {
            Value::UInt8(v) => Ok(*v as i16),
            Value::Int8(v) => Ok(*v as i16),
            Value::Int16(v) => Ok(*v),
            other => Err(mismatch("Int16", other)),
        }
    }

    pub fn as_u16(&self) -> Result<u16, InvalidCallError> {
        match self {
            Value::UInt8(v) => Ok(*v as u16),
            Value::UInt16(v) => Ok(*v),
            Value::Char(c) => Ok(*c as u16),
            // Unsigned-short returns come back ABI-promoted; truncation here
            // is the defined behavior, preserved bit-for-bit.
            Value::UInt32(v) => Ok(*v as u16),
            other => Err(mismatch("UInt16", other)),
        }
    }

    pub fn as_char(&self) -> Result<char, InvalidCallError> {
        match self {
            Value::Char(c) => Ok(*c),
            Value::UInt16(v) => char::from_u32(*v as u32)
                .ok_or_else(|| mismatch("Char", self)),
            other => Err(mismatch("Char", other)),
        }
    }

    pub fn as_i32(&self) -> Result<i32, InvalidCallError> {
        match self {
            Value::Int8(v) => Ok(*v as i32),
            Value::UInt8(v) => Ok(*v as i32),
            Value::Int16(v) => Ok(*v as i32),
            Value::UInt16(v) => Ok(*v as i32),
            Value::Int32(v) => Ok(*v),
            other => Err(mismatch("Int32", other)),
        }
    }

    pub fn as_u32(&self) -> Result<u32, InvalidCallError> {
        match self {
            Value::UInt8(v) => Ok(*v as u32),
            Value::UInt16(v) => Ok(*v as u32),
            Value::UInt32(v) => Ok(*v),
            other => Err(mismatch("UInt32", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64, InvalidCallError> {
        match self {
            Value::Int8(v) => Ok(*v as i64),
            Value::UInt8(v) => Ok(*v as i64),
            Value::Int16(v) => Ok(*v as i64),
            Value::UInt16(v) => Ok(*v as i64),
            Value::Int32(v) => Ok(*v as i64),
            Value::UInt32(v) => Ok(*v as i64),
            Value::Int64(v) => Ok(*v),
            other => Err(mismatch("Int64", other)),
        }
    }

    pub fn as_u64(&self) -> Result<u64, InvalidCallError> {
        match self {
            Value::UInt8(v) => Ok(*v as u64),
            Value::UInt16(v) => Ok(*v as u64),
            Value::UInt32(v) => Ok(*v as u64),
            Value::UInt64(v) => Ok(*v),
            other => Err(mismatch("UInt64", other)),
        }
    }

    pub fn as_f32(&self) -> Result<f32, InvalidCallError> {
        match self {
            Value::Int8(v) => Ok(*v as f32),
            Value::UInt8(v) => Ok(*v as f32),
            Value::Int16(v) => Ok(*v as f32),
            Value::UInt16(v) => Ok(*v as f32),
            Value::Float32(v) => Ok(*v),
            other => Err(mismatch("Float32", other)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, InvalidCallError> {
        match self {
            Value::Int8(v) => Ok(*v as f64),
            Value::UInt8(v) => Ok(*v as f64),
            Value::Int16(v) => Ok(*v as f64),
            Value::UInt16(v) => Ok(*v as f64),
            Value::Int32(v) => Ok(*v as f64),
            Value::UInt32(v) => Ok(*v as f64),
            Value::Float32(v) => Ok(*v as f64),
            Value::Float64(v) => Ok(*v),
            other => Err(mismatch("Float64", other)),
        }
    }

    /// Converts any pointer-like value to a handle; `Null` maps to the null
    /// handle so call results can be chained.
    pub fn as_handle(&self) -> Result<Handle, InvalidCallError> {
        match self {
            Value::Null => Ok(Handle::NULL),
            Value::Object(h) => Ok(*h),
            Value::Class(c) => Ok(c.handle()),
            Value::Pointer(p) => Ok(Handle(*p)),
            other => Err(mismatch("Handle", other)),
        }
    }

    pub fn as_object(&self) -> Result<Handle, InvalidCallError> {
        match self {
            Value::Null => Ok(Handle::NULL),
            Value::Object(h) => Ok(*h),
            Value::Class(c) => Ok(c.handle()),
            other => Err(mismatch("Object", other)),
        }
    }

    pub fn as_class(&self) -> Result<Class, InvalidCallError> {
        match self {
            Value::Class(c) => Ok(c.clone()),
            Value::Object(h) if !h.is_null() => Ok(Class::from_handle(*h)),
            other => Err(mismatch("Class", other)),
        }
    }

    pub fn as_selector(&self) -> Result<Sel, InvalidCallError> {
        match self {
            Value::Selector(s) => Ok(*s),
            other => Err(mismatch("Selector", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, InvalidCallError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(mismatch("String", other)),
        }
    }

    pub fn as_struct(&self) -> Result<&[Value], InvalidCallError> {
        match self {
            Value::Struct(fields) => Ok(fields),
            other => Err(mismatch("Struct", other)),
        }
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Value {
        Value::Object(h)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Value {
        Value::UInt32(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_is_allowed() {
        assert_eq!(Value::UInt8(7).as_i64().unwrap(), 7);
        assert_eq!(Value::Int16(-3).as_f64().unwrap(), -3.0);
        assert_eq!(Value::UInt16(65535).as_i32().unwrap(), 65535);
    }

    #[test]
    fn lossy_narrowing_is_rejected() {
        assert!(Value::Int32(1).as_i16().is_err());
        assert!(Value::Int64(1).as_i32().is_err());
        assert!(Value::Float64(1.0).as_f32().is_err());
        assert!(Value::Int32(-1).as_u32().is_err());
    }

    #[test]
    fn promoted_unsigned_short_truncates() {
        // The one sanctioned truncation: a u32 produced by the ABI for an
        // unsigned-short return reads back as its low 16 bits.
        assert_eq!(Value::UInt32(5000).as_u16().unwrap(), 5000);
        assert_eq!(Value::UInt32(0x0001_0005).as_u16().unwrap(), 5);
    }

    #[test]
    fn char_and_u16_interconvert() {
        assert_eq!(Value::Char('x').as_u16().unwrap(), 'x' as u16);
        assert_eq!(Value::UInt16('x' as u16).as_char().unwrap(), 'x');
    }

    #[test]
    fn null_chains_to_null_handle() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Null.as_handle().unwrap(), Handle::NULL);
        assert!(Value::Object(Handle::NULL).is_null());
    }
}
