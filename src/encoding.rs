//! The method type-encoding grammar.
//!
//! A method signature is encoded as a string: return type first, then one
//! token per argument slot (the receiver `@` and selector `:` slots
//! included). Scalars are single characters, structs nest as
//! `{Name=fields}`, and the runtime may interleave qualifiers and frame
//! offsets which carry no type information and are skipped. Parsing is done
//! once per distinct signature; the parsed [`TypeEncoding`] is the value the
//! descriptor and frame caches key on, so its equality and hashing are
//! structural over the token sequence rather than over the raw text.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use std::sync::OnceLock;

use crate::error::InvalidCallError;

/// One slot of a parsed signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeToken {
    Void,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
    /// `*`: a NUL-terminated C string.
    CString,
    /// `@`: an object handle.
    Object,
    /// `#`: a class handle.
    Class,
    /// `:`: an interned selector.
    Sel,
    /// `^T` or `?`: an untyped pointer; the pointee type is not preserved.
    Pointer,
    /// `{Name=...}`: a fixed-layout struct, fields in declaration order.
    Struct(StructLayout),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    pub name: Box<str>,
    pub fields: Vec<TypeToken>,
}

impl TypeToken {
    /// Size in bytes under the platform's natural layout rules.
    pub fn size(&self) -> usize {
        match self {
            TypeToken::Void => 0,
            TypeToken::Bool | TypeToken::Int8 | TypeToken::UInt8 => 1,
            TypeToken::Int16 | TypeToken::UInt16 => 2,
            TypeToken::Int32 | TypeToken::UInt32 | TypeToken::Float32 => 4,
            TypeToken::Int64 | TypeToken::UInt64 | TypeToken::Float64 => 8,
            TypeToken::CString
            | TypeToken::Object
            | TypeToken::Class
            | TypeToken::Sel
            | TypeToken::Pointer => std::mem::size_of::<usize>(),
            TypeToken::Struct(s) => {
                let mut size = 0usize;
                for f in &s.fields {
                    let align = f.alignment();
                    size = size.div_ceil(align) * align;
                    size += f.size();
                }
                let align = self.alignment();
                size.div_ceil(align) * align
            }
        }
    }

    /// Natural alignment; structs align to their widest field.
    pub fn alignment(&self) -> usize {
        match self {
            TypeToken::Void => 1,
            TypeToken::Struct(s) => s.fields.iter().map(|f| f.alignment()).max().unwrap_or(1),
            other => other.size(),
        }
    }

    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self,
            TypeToken::CString
                | TypeToken::Object
                | TypeToken::Class
                | TypeToken::Sel
                | TypeToken::Pointer
        )
    }
}

/// A parsed method signature: return token plus every argument slot.
///
/// `args[0]` is the receiver and `args[1]` the selector; user-visible arity
/// is `args.len() - 2`. Two encodings with identical token sequences compare
/// equal and hash identically even if their raw text differed in offsets or
/// qualifiers.
#[derive(Debug, Clone)]
pub struct TypeEncoding {
    source: Box<str>,
    pub ret: TypeToken,
    pub args: Vec<TypeToken>,
}

impl PartialEq for TypeEncoding {
    fn eq(&self, other: &Self) -> bool {
        self.ret == other.ret && self.args == other.args
    }
}

impl Eq for TypeEncoding {}

impl Hash for TypeEncoding {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ret.hash(state);
        self.args.hash(state);
    }
}

impl fmt::Display for TypeEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TypeEncoding {
    /// Parses a full method encoding. The first type is the return value;
    /// at least the receiver and selector slots must follow.
    pub fn parse(source: &str) -> Result<TypeEncoding, InvalidCallError> {
        let mut p = Parser {
            source,
            rest: source.as_bytes(),
        };
        let ret = p.parse_type()?;
        let mut args = Vec::new();
        while !p.at_end() {
            args.push(p.parse_type()?);
        }
        if args.len() < 2 || args[0] != TypeToken::Object || args[1] != TypeToken::Sel {
            return Err(InvalidCallError::MalformedEncoding(source.to_string()));
        }
        Ok(TypeEncoding {
            source: source.into(),
            ret,
            args,
        })
    }

    /// Raw encoding text as produced by the runtime.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of caller-supplied arguments (receiver and selector excluded).
    pub fn arity(&self) -> usize {
        self.args.len() - 2
    }
}

struct Parser<'a> {
    source: &'a str,
    rest: &'a [u8],
}

impl<'a> Parser<'a> {
    fn at_end(&mut self) -> bool {
        self.skip_noise();
        self.rest.is_empty()
    }

    fn skip_noise(&mut self) {
        // Qualifiers and stack-frame offsets carry no type information.
        while let Some(&c) = self.rest.first() {
            if c.is_ascii_digit() || b"rnNoORV".contains(&c) {
                self.rest = &self.rest[1..];
            } else {
                break;
            }
        }
    }

    fn bump(&mut self) -> Option<u8> {
        let (&c, rest) = self.rest.split_first()?;
        self.rest = rest;
        Some(c)
    }

    fn parse_type(&mut self) -> Result<TypeToken, InvalidCallError> {
        self.skip_noise();
        let c = self
            .bump()
            .ok_or_else(|| InvalidCallError::MalformedEncoding(self.source.to_string()))?;
        let token = match c {
            b'v' => TypeToken::Void,
            b'B' => TypeToken::Bool,
            b'c' => TypeToken::Int8,
            b'C' => TypeToken::UInt8,
            b's' => TypeToken::Int16,
            b'S' => TypeToken::UInt16,
            // The runtime defines 'l' as a 32-bit quantity even on 64-bit.
            b'i' | b'l' => TypeToken::Int32,
            b'I' | b'L' => TypeToken::UInt32,
            b'q' => TypeToken::Int64,
            b'Q' => TypeToken::UInt64,
            b'f' => TypeToken::Float32,
            b'd' => TypeToken::Float64,
            b'*' => TypeToken::CString,
            b'@' => {
                // An optional quoted class name may follow; it does not
                // change the ABI slot.
                if self.rest.first() == Some(&b'"') {
                    self.rest = &self.rest[1..];
                    while let Some(c) = self.bump() {
                        if c == b'"' {
                            break;
                        }
                    }
                }
                TypeToken::Object
            }
            b'#' => TypeToken::Class,
            b':' => TypeToken::Sel,
            b'?' => TypeToken::Pointer,
            b'^' => {
                // Consume the pointee type; only the pointer crosses the ABI.
                let _ = self.parse_type()?;
                TypeToken::Pointer
            }
            b'{' => self.parse_struct()?,
            other => {
                return Err(InvalidCallError::UnsupportedType(
                    (other as char).to_string(),
                ))
            }
        };
        Ok(token)
    }

    fn parse_struct(&mut self) -> Result<TypeToken, InvalidCallError> {
        let mut name = String::new();
        loop {
            match self.bump() {
                Some(b'=') => break,
                Some(b'}') => {
                    // Opaque struct with no field list; cannot be marshaled.
                    return Err(InvalidCallError::UnsupportedType(format!("{{{name}}}")));
                }
                Some(c) => name.push(c as char),
                None => {
                    return Err(InvalidCallError::MalformedEncoding(self.source.to_string()))
                }
            }
        }
        let mut fields = Vec::new();
        loop {
            self.skip_noise();
            match self.rest.first() {
                Some(b'}') => {
                    self.rest = &self.rest[1..];
                    break;
                }
                Some(_) => fields.push(self.parse_type()?),
                None => {
                    return Err(InvalidCallError::MalformedEncoding(self.source.to_string()))
                }
            }
        }
        if fields.is_empty() {
            return Err(InvalidCallError::UnsupportedType(format!("{{{name}=}}")));
        }
        Ok(TypeToken::Struct(StructLayout {
            name: name.into(),
            fields,
        }))
    }
}

fn parse_cache() -> &'static DashMap<Box<str>, Arc<TypeEncoding>> {
    static CACHE: OnceLock<DashMap<Box<str>, Arc<TypeEncoding>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// Parse-once lookup for a raw encoding string.
///
/// The cache is process-wide and insert-if-absent; concurrent misses may both
/// parse, which is harmless since the parsed value is immutable.
pub fn cached(source: &str) -> Result<Arc<TypeEncoding>, InvalidCallError> {
    if let Some(e) = parse_cache().get(source) {
        return Ok(Arc::clone(&e));
    }
    let parsed = Arc::new(TypeEncoding::parse(source)?);
    let entry = parse_cache()
        .entry(source.into())
        .or_insert_with(|| Arc::clone(&parsed));
    Ok(Arc::clone(&entry))
}

/// Drops every cached parse. Intended for test teardown.
pub fn clear_cache() {
    parse_cache().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_signature() {
        let e = TypeEncoding::parse("i@:i").unwrap();
        assert_eq!(e.ret, TypeToken::Int32);
        assert_eq!(e.args, vec![TypeToken::Object, TypeToken::Sel, TypeToken::Int32]);
        assert_eq!(e.arity(), 1);
    }

    #[test]
    fn skips_offsets_and_qualifiers() {
        let plain = TypeEncoding::parse("v@:@").unwrap();
        let noisy = TypeEncoding::parse("v12@0:4r@8").unwrap();
        assert_eq!(plain, noisy);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut a = DefaultHasher::new();
        let mut b = DefaultHasher::new();
        plain.hash(&mut a);
        noisy.hash(&mut b);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn parses_nested_struct() {
        let e = TypeEncoding::parse("{Rect={Point=dd}{Size=dd}}@:").unwrap();
        let TypeToken::Struct(rect) = &e.ret else {
            panic!("expected struct return, got {:?}", e.ret);
        };
        assert_eq!(&*rect.name, "Rect");
        assert_eq!(rect.fields.len(), 2);
        assert_eq!(e.ret.size(), 32);
        assert_eq!(e.ret.alignment(), 8);
    }

    #[test]
    fn struct_layout_respects_field_alignment() {
        // {Mixed=icq}: i32 at 0, i8 at 4, i64 aligned up to 8 -> size 16.
        let t = TypeEncoding::parse("{Mixed=icq}@:").unwrap().ret;
        assert_eq!(t.size(), 16);
        assert_eq!(t.alignment(), 8);
    }

    #[test]
    fn long_tokens_are_32_bit() {
        let e = TypeEncoding::parse("l@:L").unwrap();
        assert_eq!(e.ret, TypeToken::Int32);
        assert_eq!(e.args[2], TypeToken::UInt32);
    }

    #[test]
    fn pointer_encodings_collapse() {
        let e = TypeEncoding::parse("^{Opaque=i}@:^i").unwrap();
        assert_eq!(e.ret, TypeToken::Pointer);
        assert_eq!(e.args[2], TypeToken::Pointer);
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(matches!(
            TypeEncoding::parse("%@:"),
            Err(InvalidCallError::UnsupportedType(_))
        ));
        assert!(matches!(
            TypeEncoding::parse("i@"),
            Err(InvalidCallError::MalformedEncoding(_))
        ));
        assert!(matches!(
            TypeEncoding::parse("{Broken=i"),
            Err(InvalidCallError::MalformedEncoding(_))
        ));
    }

    #[test]
    fn cache_returns_same_parse() {
        clear_cache();
        let a = cached("q@:@").unwrap();
        let b = cached("q@:@").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn cache_converges_under_concurrency() {
        clear_cache();
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| cached("d@:{Point=dd}").unwrap()))
            .collect();
        let parses: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let canonical = cached("d@:{Point=dd}").unwrap();
        for p in parses {
            // Racing builds may produce distinct Arcs, but the cache must
            // converge and every result must be structurally identical.
            assert_eq!(*p, *canonical);
        }
        assert!(Arc::ptr_eq(
            &cached("d@:{Point=dd}").unwrap(),
            &canonical
        ));
    }
}
