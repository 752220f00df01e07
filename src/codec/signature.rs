//! Type signature parsing.
//!
//! A signature is a sequence of complete types written with the usual
//! one-letter codes (`s`, `i`, `a{sv}`, `(ii)` ...). The codec only needs
//! to split a signature into complete types and render them back; the
//! grammar is zvariant's.

use std::fmt;
use zbus::zvariant::Signature;

use super::CodecError;

/// Longest signature accepted on the wire.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// One complete type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Str,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<Type>),
    Dict(Box<Type>, Box<Type>),
    Struct(Vec<Type>),
}

impl Type {
    /// Basic types may be used as dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Dict(..) | Type::Struct(_)
        )
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Byte => f.write_str("y"),
            Type::Bool => f.write_str("b"),
            Type::Int16 => f.write_str("n"),
            Type::UInt16 => f.write_str("q"),
            Type::Int32 => f.write_str("i"),
            Type::UInt32 => f.write_str("u"),
            Type::Int64 => f.write_str("x"),
            Type::UInt64 => f.write_str("t"),
            Type::Double => f.write_str("d"),
            Type::Str => f.write_str("s"),
            Type::ObjectPath => f.write_str("o"),
            Type::Signature => f.write_str("g"),
            Type::Variant => f.write_str("v"),
            Type::Array(elem) => write!(f, "a{}", elem),
            Type::Dict(key, value) => write!(f, "a{{{}{}}}", key, value),
            Type::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Split a signature into its complete types.
///
/// The grammar itself is checked by [`Signature`]; this only maps
/// the parsed tree onto [`Type`].
pub fn parse(signature: &str) -> Result<Vec<Type>, CodecError> {
    let invalid = |reason: String| CodecError::InvalidSignature {
        signature: signature.to_string(),
        reason,
    };

    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(invalid(format!(
            "longer than {} bytes",
            MAX_SIGNATURE_LEN
        )));
    }

    let parsed = Signature::try_from(signature).map_err(|e| invalid(e.to_string()))?;
    match parsed {
        Signature::Unit => Ok(Vec::new()),
        // Several top-level types come back as one struct without the parens.
        Signature::Structure(ref fields) if parsed.to_string() != signature => fields
            .iter()
            .map(convert)
            .collect::<Result<_, _>>()
            .map_err(invalid),
        ref single => Ok(vec![convert(single).map_err(invalid)?]),
    }
}

/// Render a type list back into signature text.
pub fn render(types: &[Type]) -> String {
    types.iter().map(|t| t.to_string()).collect()
}

fn convert(sig: &Signature) -> Result<Type, String> {
    let ty = match sig {
        Signature::U8 => Type::Byte,
        Signature::Bool => Type::Bool,
        Signature::I16 => Type::Int16,
        Signature::U16 => Type::UInt16,
        Signature::I32 => Type::Int32,
        Signature::U32 => Type::UInt32,
        Signature::I64 => Type::Int64,
        Signature::U64 => Type::UInt64,
        Signature::F64 => Type::Double,
        Signature::Str => Type::Str,
        Signature::ObjectPath => Type::ObjectPath,
        Signature::Signature => Type::Signature,
        Signature::Variant => Type::Variant,
        Signature::Array(elem) => Type::Array(Box::new(convert(elem.signature())?)),
        Signature::Dict { key, value } => {
            let key = convert(key.signature())?;
            if !key.is_basic() {
                return Err(format!("dict key must be a basic type, got '{}'", key));
            }
            Type::Dict(Box::new(key), Box::new(convert(value.signature())?))
        }
        Signature::Structure(fields) => {
            let fields = fields.iter().map(convert).collect::<Result<Vec<_>, _>>()?;
            if fields.is_empty() {
                return Err("empty struct".into());
            }
            Type::Struct(fields)
        }
        other => return Err(format!("unsupported type '{}'", other)),
    };
    Ok(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_sequence() {
        let types = parse("sib").unwrap();
        assert_eq!(types, vec![Type::Str, Type::Int32, Type::Bool]);
    }

    #[test]
    fn test_parse_empty_signature() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_containers() {
        let types = parse("a{sv}(iu)as").unwrap();
        assert_eq!(types.len(), 3);
        assert_eq!(
            types[0],
            Type::Dict(Box::new(Type::Str), Box::new(Type::Variant))
        );
        assert_eq!(types[1], Type::Struct(vec![Type::Int32, Type::UInt32]));
        assert_eq!(types[2], Type::Array(Box::new(Type::Str)));
    }

    #[test]
    fn test_struct_is_one_type_sequence_is_many() {
        assert_eq!(
            parse("(ii)").unwrap(),
            vec![Type::Struct(vec![Type::Int32, Type::Int32])]
        );
        assert_eq!(parse("ii").unwrap(), vec![Type::Int32, Type::Int32]);
        assert_eq!(parse("(ii)(s)").unwrap().len(), 2);
    }

    #[test]
    fn test_render_matches_input() {
        for sig in ["s", "a{sv}", "(ia(ss))", "aay", "a{oa{sv}}"] {
            assert_eq!(render(&parse(sig).unwrap()), sig);
        }
    }

    #[test]
    fn test_rejects_malformed() {
        for sig in ["z", "a", "(", "h", "a{vs}", "a{sss}", "(ii"] {
            assert!(parse(sig).is_err(), "{} should be rejected", sig);
        }
    }

    #[test]
    fn test_rejects_overlong() {
        let sig = "s".repeat(MAX_SIGNATURE_LEN + 1);
        assert!(matches!(
            parse(&sig),
            Err(CodecError::InvalidSignature { .. })
        ));
    }
}
