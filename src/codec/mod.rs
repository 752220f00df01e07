//! Typed values and the body codec.
//!
//! The engine treats marshalling as a black box with a small contract:
//! [`Codec::encode`] turns an argument list plus an optional signature into a
//! message [`Body`], and [`Codec::decode`] turns a received body back into
//! values, optionally checking it against an expected signature.
//!
//! [`SignatureCodec`] is the default implementation. It checks values against
//! the signature, converting between integer widths when the value fits and
//! wrapping plain values into variants where the signature asks for one.

pub mod signature;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use signature::Type;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Invalid signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    #[error("Signature declares {expected} values but {got} were given")]
    ArityMismatch { expected: usize, got: usize },

    #[error("Expected a value of type '{expected}', got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Value {value} does not fit type '{target}'")]
    OutOfRange { value: String, target: String },

    #[error("Cannot infer a type for {0}")]
    CannotInfer(String),

    #[error("Body has signature '{got}' but '{expected}' was expected")]
    SignatureMismatch { expected: String, got: String },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// A single marshalled value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Value>),
    Array(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Struct(Vec<Value>),
}

impl Value {
    /// Short name of the value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Bool(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::Variant(_) => "variant",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::Struct(_) => "struct",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            Value::Variant(inner) => inner.as_str(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Variant(inner) => inner.as_bool(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_integer().and_then(|n| i64::try_from(n).ok())
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_integer().and_then(|n| u64::try_from(n).ok())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Variant(inner) => inner.as_f64(),
            other => other.as_integer().map(|n| n as f64),
        }
    }

    fn as_integer(&self) -> Option<i128> {
        match *self {
            Value::Byte(n) => Some(n.into()),
            Value::Int16(n) => Some(n.into()),
            Value::UInt16(n) => Some(n.into()),
            Value::Int32(n) => Some(n.into()),
            Value::UInt32(n) => Some(n.into()),
            Value::Int64(n) => Some(n.into()),
            Value::UInt64(n) => Some(n.into()),
            Value::Variant(ref inner) => inner.as_integer(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int16(n) => write!(f, "{}", n),
            Value::UInt16(n) => write!(f, "{}", n),
            Value::Int32(n) => write!(f, "{}", n),
            Value::UInt32(n) => write!(f, "{}", n),
            Value::Int64(n) => write!(f, "{}", n),
            Value::UInt64(n) => write!(f, "{}", n),
            Value::Double(d) => write!(f, "{}", d),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::ObjectPath(p) => write!(f, "{}", p),
            Value::Signature(s) => write!(f, "<{}>", s),
            Value::Variant(inner) => write!(f, "<{}>", inner),
            Value::Array(items) | Value::Struct(items) => {
                let (open, close) = if matches!(self, Value::Array(_)) {
                    ("[", "]")
                } else {
                    ("(", ")")
                };
                f.write_str(open)?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(close)
            }
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

value_from! {
    u8 => Byte,
    bool => Bool,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => Str,
    &str => Str,
}

/// A message body: the signature plus the values it describes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl Body {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Marshalling contract consumed by the RPC engine and the dispatcher.
pub trait Codec {
    /// Build a body from `values`. Without a signature the types are inferred.
    fn encode(&self, signature: Option<&str>, values: Vec<Value>) -> Result<Body, CodecError>;

    /// Read the values out of `body`, checking its signature against
    /// `expected` when one is given.
    fn decode(&self, body: &Body, expected: Option<&str>) -> Result<Vec<Value>, CodecError>;
}

/// Default codec: signature-checked values.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureCodec;

impl Codec for SignatureCodec {
    fn encode(&self, signature: Option<&str>, values: Vec<Value>) -> Result<Body, CodecError> {
        let types = match signature {
            Some(sig) => signature::parse(sig)?,
            None => values.iter().map(infer).collect::<Result<Vec<_>, _>>()?,
        };

        if types.len() != values.len() {
            return Err(CodecError::ArityMismatch {
                expected: types.len(),
                got: values.len(),
            });
        }

        let values = types
            .iter()
            .zip(values)
            .map(|(ty, value)| coerce(ty, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Body {
            signature: signature::render(&types),
            values,
        })
    }

    fn decode(&self, body: &Body, expected: Option<&str>) -> Result<Vec<Value>, CodecError> {
        if let Some(expected) = expected {
            if expected != body.signature {
                return Err(CodecError::SignatureMismatch {
                    expected: expected.to_string(),
                    got: body.signature.clone(),
                });
            }
        }

        let types = signature::parse(&body.signature)?;
        if types.len() != body.values.len() {
            return Err(CodecError::ArityMismatch {
                expected: types.len(),
                got: body.values.len(),
            });
        }

        for (ty, value) in types.iter().zip(&body.values) {
            if !conforms(ty, value) {
                return Err(CodecError::TypeMismatch {
                    expected: ty.to_string(),
                    got: value.kind().to_string(),
                });
            }
        }

        Ok(body.values.clone())
    }
}

/// Work out the type of a value that came without a signature.
pub fn infer(value: &Value) -> Result<Type, CodecError> {
    Ok(match value {
        Value::Byte(_) => Type::Byte,
        Value::Bool(_) => Type::Bool,
        Value::Int16(_) => Type::Int16,
        Value::UInt16(_) => Type::UInt16,
        Value::Int32(_) => Type::Int32,
        Value::UInt32(_) => Type::UInt32,
        Value::Int64(_) => Type::Int64,
        Value::UInt64(_) => Type::UInt64,
        Value::Double(_) => Type::Double,
        Value::Str(_) => Type::Str,
        Value::ObjectPath(_) => Type::ObjectPath,
        Value::Signature(_) => Type::Signature,
        Value::Variant(_) => Type::Variant,
        Value::Array(items) => {
            let first = items
                .first()
                .ok_or_else(|| CodecError::CannotInfer("an empty array".into()))?;
            let elem = infer(first)?;
            if let Some(odd) = items.iter().find(|v| !conforms(&elem, v)) {
                return Err(CodecError::TypeMismatch {
                    expected: elem.to_string(),
                    got: odd.kind().to_string(),
                });
            }
            Type::Array(Box::new(elem))
        }
        Value::Dict(entries) => {
            let (k, v) = entries
                .first()
                .ok_or_else(|| CodecError::CannotInfer("an empty dict".into()))?;
            let key = infer(k)?;
            let val = infer(v)?;
            if !key.is_basic() {
                return Err(CodecError::CannotInfer(format!(
                    "a dict keyed by {}",
                    k.kind()
                )));
            }
            for (k, v) in entries {
                if !conforms(&key, k) || !conforms(&val, v) {
                    return Err(CodecError::CannotInfer("a dict with mixed entry types".into()));
                }
            }
            Type::Dict(Box::new(key), Box::new(val))
        }
        Value::Struct(fields) => {
            if fields.is_empty() {
                return Err(CodecError::CannotInfer("an empty struct".into()));
            }
            Type::Struct(fields.iter().map(infer).collect::<Result<Vec<_>, _>>()?)
        }
    })
}

/// Strict check: does `value` already have exactly type `ty`?
fn conforms(ty: &Type, value: &Value) -> bool {
    match (ty, value) {
        (Type::Byte, Value::Byte(_))
        | (Type::Bool, Value::Bool(_))
        | (Type::Int16, Value::Int16(_))
        | (Type::UInt16, Value::UInt16(_))
        | (Type::Int32, Value::Int32(_))
        | (Type::UInt32, Value::UInt32(_))
        | (Type::Int64, Value::Int64(_))
        | (Type::UInt64, Value::UInt64(_))
        | (Type::Double, Value::Double(_))
        | (Type::Str, Value::Str(_))
        | (Type::ObjectPath, Value::ObjectPath(_))
        | (Type::Signature, Value::Signature(_)) => true,
        (Type::Variant, Value::Variant(inner)) => infer(inner).is_ok(),
        (Type::Array(elem), Value::Array(items)) => items.iter().all(|v| conforms(elem, v)),
        (Type::Dict(key, val), Value::Dict(entries)) => entries
            .iter()
            .all(|(k, v)| conforms(key, k) && conforms(val, v)),
        (Type::Struct(fields), Value::Struct(items)) => {
            fields.len() == items.len() && fields.iter().zip(items).all(|(t, v)| conforms(t, v))
        }
        _ => false,
    }
}

/// Convert `value` to type `ty` where the conversion is lossless.
fn coerce(ty: &Type, value: Value) -> Result<Value, CodecError> {
    let mismatch = |value: &Value| CodecError::TypeMismatch {
        expected: ty.to_string(),
        got: value.kind().to_string(),
    };

    match ty {
        Type::Byte
        | Type::Int16
        | Type::UInt16
        | Type::Int32
        | Type::UInt32
        | Type::Int64
        | Type::UInt64 => {
            let n = value.as_integer().ok_or_else(|| mismatch(&value))?;
            integer(ty, n).ok_or_else(|| CodecError::OutOfRange {
                value: n.to_string(),
                target: ty.to_string(),
            })
        }
        Type::Double => value
            .as_f64()
            .map(Value::Double)
            .ok_or_else(|| mismatch(&value)),
        Type::Bool => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        Type::Str => match value {
            Value::Str(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        Type::ObjectPath => match value {
            Value::ObjectPath(path) | Value::Str(path) => {
                zbus::zvariant::ObjectPath::try_from(path.as_str())
                    .map_err(|e| CodecError::InvalidValue(format!("'{}': {}", path, e)))?;
                Ok(Value::ObjectPath(path))
            }
            other => Err(mismatch(&other)),
        },
        Type::Signature => match value {
            Value::Signature(sig) | Value::Str(sig) => {
                signature::parse(&sig)?;
                Ok(Value::Signature(sig))
            }
            other => Err(mismatch(&other)),
        },
        Type::Variant => match value {
            Value::Variant(_) => Ok(value),
            other => {
                infer(&other)?;
                Ok(Value::Variant(Box::new(other)))
            }
        },
        Type::Array(elem) => match value {
            Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|v| coerce(elem, v))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            other => Err(mismatch(&other)),
        },
        Type::Dict(key, val) => match value {
            Value::Dict(entries) => Ok(Value::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((coerce(key, k)?, coerce(val, v)?)))
                    .collect::<Result<Vec<_>, CodecError>>()?,
            )),
            other => Err(mismatch(&other)),
        },
        Type::Struct(fields) => match value {
            Value::Struct(items) if items.len() == fields.len() => Ok(Value::Struct(
                fields
                    .iter()
                    .zip(items)
                    .map(|(t, v)| coerce(t, v))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            other => Err(mismatch(&other)),
        },
    }
}

fn integer(ty: &Type, n: i128) -> Option<Value> {
    Some(match ty {
        Type::Byte => Value::Byte(u8::try_from(n).ok()?),
        Type::Int16 => Value::Int16(i16::try_from(n).ok()?),
        Type::UInt16 => Value::UInt16(u16::try_from(n).ok()?),
        Type::Int32 => Value::Int32(i32::try_from(n).ok()?),
        Type::UInt32 => Value::UInt32(u32::try_from(n).ok()?),
        Type::Int64 => Value::Int64(i64::try_from(n).ok()?),
        Type::UInt64 => Value::UInt64(u64::try_from(n).ok()?),
        _ => return None,
    })
}

/// Parse command-line text into values following `signature`.
///
/// Only basic types (and variants, which carry the text as a string) can be
/// written this way.
pub fn parse_args(signature: &str, args: &[String]) -> Result<Vec<Value>, CodecError> {
    let types = signature::parse(signature)?;
    if types.len() != args.len() {
        return Err(CodecError::ArityMismatch {
            expected: types.len(),
            got: args.len(),
        });
    }
    types
        .iter()
        .zip(args)
        .map(|(ty, text)| parse_arg(ty, text))
        .collect()
}

fn parse_arg(ty: &Type, text: &str) -> Result<Value, CodecError> {
    let bad = || CodecError::InvalidValue(format!("'{}' is not a valid '{}'", text, ty));

    match ty {
        Type::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        Type::Double => text.parse().map(Value::Double).map_err(|_| bad()),
        Type::Str => Ok(Value::Str(text.to_string())),
        Type::ObjectPath | Type::Signature => coerce(ty, Value::Str(text.to_string())),
        Type::Variant => Ok(Value::Variant(Box::new(Value::Str(text.to_string())))),
        Type::Array(_) | Type::Dict(..) | Type::Struct(_) => Err(CodecError::InvalidValue(
            format!("container type '{}' cannot be given on the command line", ty),
        )),
        integral => {
            let n: i128 = text.parse().map_err(|_| bad())?;
            integer(integral, n).ok_or_else(|| CodecError::OutOfRange {
                value: text.to_string(),
                target: ty.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_with_signature_converts_integers() {
        let body = SignatureCodec
            .encode(Some("yu"), vec![Value::Int32(7), Value::Int64(42)])
            .unwrap();
        assert_eq!(body.signature, "yu");
        assert_eq!(body.values, vec![Value::Byte(7), Value::UInt32(42)]);
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        let err = SignatureCodec
            .encode(Some("y"), vec![Value::Int32(300)])
            .unwrap_err();
        assert!(matches!(err, CodecError::OutOfRange { .. }));
    }

    #[test]
    fn test_encode_infers_without_signature() {
        let body = SignatureCodec
            .encode(
                None,
                vec![
                    Value::from("hi"),
                    Value::Array(vec![Value::Int32(1), Value::Int32(2)]),
                ],
            )
            .unwrap();
        assert_eq!(body.signature, "sai");
    }

    #[test]
    fn test_encode_wraps_variants() {
        let body = SignatureCodec
            .encode(Some("v"), vec![Value::from(true)])
            .unwrap();
        assert_eq!(body.values, vec![Value::Variant(Box::new(Value::Bool(true)))]);
    }

    #[test]
    fn test_encode_arity_mismatch() {
        let err = SignatureCodec
            .encode(Some("ss"), vec![Value::from("only one")])
            .unwrap_err();
        assert_eq!(err, CodecError::ArityMismatch { expected: 2, got: 1 });
    }

    #[test]
    fn test_encode_validates_object_paths() {
        assert!(SignatureCodec
            .encode(Some("o"), vec![Value::from("/org/example")])
            .is_ok());
        assert!(SignatureCodec
            .encode(Some("o"), vec![Value::from("not/a/path")])
            .is_err());
    }

    #[test]
    fn test_decode_checks_expected_signature() {
        let body = SignatureCodec.encode(Some("s"), vec!["x".into()]).unwrap();
        assert_eq!(
            SignatureCodec.decode(&body, Some("s")).unwrap(),
            vec![Value::from("x")]
        );
        assert!(matches!(
            SignatureCodec.decode(&body, Some("i")),
            Err(CodecError::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_lying_body() {
        let body = Body {
            signature: "i".into(),
            values: vec![Value::from("not an int")],
        };
        assert!(matches!(
            SignatureCodec.decode(&body, None),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_parse_args_from_text() {
        let args = vec!["hello".to_string(), "-5".to_string(), "yes".to_string()];
        let values = parse_args("sib", &args).unwrap();
        assert_eq!(
            values,
            vec![Value::from("hello"), Value::Int32(-5), Value::Bool(true)]
        );
        assert!(parse_args("u", &["-1".to_string()]).is_err());
        assert!(parse_args("as", &["x".to_string()]).is_err());
    }

    #[test]
    fn test_display() {
        let v = Value::Struct(vec![
            Value::from("a"),
            Value::Array(vec![Value::UInt32(1), Value::UInt32(2)]),
        ]);
        assert_eq!(v.to_string(), "(\"a\", [1, 2])");
    }
}
