//! Value token coercion.
//!
//! Blank and zero values coerce to `None`: the row is kept for duplicate
//! detection but nothing is persisted for it.

use crate::model::count::CountInput;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Reasons a value token is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueError {
    Negative(String),
    NotInteger(String),
    /// Exceeds the signed 64-bit range SQLite stores.
    TooLarge(String),
}

impl Display for ValueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Negative(token) => write!(f, "value `{token}` is negative"),
            Self::NotInteger(token) => write!(f, "value `{token}` is not a whole number"),
            Self::TooLarge(token) => write!(f, "value `{token}` is too large"),
        }
    }
}

impl Error for ValueError {}

/// Coerces a raw token into a count.
///
/// Returns `Ok(None)` for blank and zero values.
pub fn coerce_count(input: &CountInput) -> Result<Option<u64>, ValueError> {
    match input {
        CountInput::Integer(value) if *value < 0 => Err(ValueError::Negative(value.to_string())),
        CountInput::Integer(0) => Ok(None),
        CountInput::Integer(value) => Ok(Some(value.unsigned_abs())),
        CountInput::Unsigned(0) => Ok(None),
        CountInput::Unsigned(value) if i64::try_from(*value).is_err() => {
            Err(ValueError::TooLarge(value.to_string()))
        }
        CountInput::Unsigned(value) => Ok(Some(*value)),
        CountInput::Decimal(value) => Err(ValueError::NotInteger(value.to_string())),
        CountInput::Text(text) => coerce_text(text),
    }
}

fn coerce_text(text: &str) -> Result<Option<u64>, ValueError> {
    let token = text.trim();
    if token.is_empty() {
        return Ok(None);
    }

    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(ValueError::NotInteger(token.to_string()));
    }

    let parsed = digits
        .parse::<i64>()
        .map_err(|_| ValueError::TooLarge(token.to_string()))?;
    if parsed == 0 {
        return Ok(None);
    }
    if negative {
        return Err(ValueError::Negative(token.to_string()));
    }
    Ok(Some(parsed.unsigned_abs()))
}
