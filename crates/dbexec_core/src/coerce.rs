use crate::error::ExecError;
use crate::value::Value;

/// Converts a raw driver scalar into `Self`, per the rules in §4.6.
///
/// Implemented for primitives, `String`, `uuid::Uuid`, `Vec<u8>`, and for
/// `Option<T>` generically over any `T: FromScalar`. Enum types are
/// expected to go through [`coerce_enum`] rather than this trait, since
/// Rust has no reflection over an arbitrary enum's variants.
pub trait FromScalar: Sized {
    /// The value returned for rule 1 (`v` absent or NULL) when `Self` is
    /// not itself an `Option` — i.e. the "zero" value of the type.
    fn zero() -> Self;

    fn from_value(value: &Value) -> Result<Self, ExecError>;
}

/// Entry point for C7: applies rules 1-7 in order for non-nullable `T`.
pub fn coerce_scalar<T: FromScalar>(raw: Option<Value>) -> Result<T, ExecError> {
    match raw {
        None => Ok(T::zero()),
        Some(Value::Null) => Ok(T::zero()),
        Some(v) => T::from_value(&v),
    }
}

/// Entry point for C7 when the caller wants a nullable result (rule 3):
/// absent/NULL yields `None` rather than `T`'s zero value.
pub fn coerce_nullable_scalar<T: FromScalar>(raw: Option<Value>) -> Result<Option<T>, ExecError> {
    match raw {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => T::from_value(&v).map(Some),
    }
}

fn invalid(expected: &str, got: &Value) -> ExecError {
    ExecError::InvalidConversion(format!("cannot convert {got:?} to {expected}"))
}

macro_rules! impl_from_scalar_int {
    ($($ty:ty),+) => {
        $(
            impl FromScalar for $ty {
                fn zero() -> Self { 0 as $ty }

                fn from_value(value: &Value) -> Result<Self, ExecError> {
                    match value {
                        Value::Int(i) => <$ty>::try_from(*i)
                            .map_err(|_| invalid(stringify!($ty), value)),
                        Value::Text(s) => s.trim().parse::<$ty>()
                            .map_err(|_| invalid(stringify!($ty), value)),
                        Value::Bool(b) => Ok(if *b { 1 } else { 0 }),
                        _ => Err(invalid(stringify!($ty), value)),
                    }
                }
            }
        )+
    };
}

impl_from_scalar_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl FromScalar for f64 {
    fn zero() -> Self {
        0.0
    }

    fn from_value(value: &Value) -> Result<Self, ExecError> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::Decimal(s) | Value::Text(s) => {
                s.trim().parse::<f64>().map_err(|_| invalid("f64", value))
            }
            _ => Err(invalid("f64", value)),
        }
    }
}

impl FromScalar for bool {
    fn zero() -> Self {
        false
    }

    fn from_value(value: &Value) -> Result<Self, ExecError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(invalid("bool", value)),
            },
            _ => Err(invalid("bool", value)),
        }
    }
}

impl FromScalar for String {
    fn zero() -> Self {
        String::new()
    }

    fn from_value(value: &Value) -> Result<Self, ExecError> {
        // Rule 2: T compatible with v's concrete type -> unchanged (as text).
        Ok(value.to_string())
    }
}

impl FromScalar for Vec<u8> {
    fn zero() -> Self {
        Vec::new()
    }

    fn from_value(value: &Value) -> Result<Self, ExecError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Err(invalid("byte array", value)),
        }
    }
}

impl FromScalar for uuid::Uuid {
    fn zero() -> Self {
        uuid::Uuid::nil()
    }

    fn from_value(value: &Value) -> Result<Self, ExecError> {
        match value {
            Value::Uuid(u) => Ok(*u),
            Value::Bytes(bytes) if bytes.len() == 16 => {
                let mut buf = [0u8; 16];
                buf.copy_from_slice(bytes);
                Ok(uuid::Uuid::from_bytes(buf))
            }
            Value::Text(s) => uuid::Uuid::parse_str(s.trim()).map_err(|_| invalid("UUID", value)),
            _ => Err(invalid("UUID", value)),
        }
    }
}

impl<T: FromScalar> FromScalar for Option<T> {
    fn zero() -> Self {
        None
    }

    fn from_value(value: &Value) -> Result<Self, ExecError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Coerces an enum value (rule 6): string values are parsed
/// case-insensitively via `parse_name`; numeric values are converted to
/// the enum's underlying primitive and passed to `parse_ordinal`.
pub fn coerce_enum<E>(
    raw: Option<Value>,
    parse_name: impl Fn(&str) -> Option<E>,
    parse_ordinal: impl Fn(i64) -> Option<E>,
) -> Result<Option<E>, ExecError> {
    let value = match raw {
        None => return Ok(None),
        Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };

    match &value {
        Value::Text(s) => parse_name(s.trim())
            .map(Some)
            .ok_or_else(|| invalid("enum", &value)),
        Value::Int(i) => parse_ordinal(*i)
            .map(Some)
            .ok_or_else(|| invalid("enum", &value)),
        _ => Err(invalid("enum", &value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_preserved_for_nullable_and_zeroed_for_non_nullable() {
        assert_eq!(coerce_scalar::<i32>(None).unwrap(), 0);
        assert_eq!(coerce_scalar::<i32>(Some(Value::Null)).unwrap(), 0);
        assert_eq!(coerce_nullable_scalar::<i32>(None).unwrap(), None);
        assert_eq!(coerce_nullable_scalar::<i32>(Some(Value::Null)).unwrap(), None);
    }

    #[test]
    fn int_value_round_trips() {
        assert_eq!(coerce_scalar::<i64>(Some(Value::Int(42))).unwrap(), 42);
    }

    #[test]
    fn uuid_accepts_text_and_bytes() {
        let id = uuid::Uuid::new_v4();
        let from_bytes = coerce_scalar::<uuid::Uuid>(Some(Value::Bytes(id.as_bytes().to_vec()))).unwrap();
        assert_eq!(from_bytes, id);

        let from_text = coerce_scalar::<uuid::Uuid>(Some(Value::Text(id.to_string()))).unwrap();
        assert_eq!(from_text, id);
    }

    #[test]
    fn byte_array_rejects_non_bytes() {
        let result = coerce_scalar::<Vec<u8>>(Some(Value::Int(1)));
        assert!(matches!(result, Err(ExecError::InvalidConversion(_))));
    }

    #[derive(Debug, PartialEq, Eq)]
    enum Color {
        Red,
        Green,
    }

    #[test]
    fn enum_parses_case_insensitively_or_by_ordinal() {
        let parsed = coerce_enum(
            Some(Value::Text("red".to_string())),
            |s| match s.to_ascii_lowercase().as_str() {
                "red" => Some(Color::Red),
                "green" => Some(Color::Green),
                _ => None,
            },
            |i| match i {
                0 => Some(Color::Red),
                1 => Some(Color::Green),
                _ => None,
            },
        )
        .unwrap();
        assert_eq!(parsed, Some(Color::Red));
    }
}
