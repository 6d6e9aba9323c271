//! Value marshaling between protocol tokens and Postgres binary values.
//!
//! Arguments arrive as text tokens and are decoded according to the
//! parameter type the server declared for their position. Result cells are
//! read in Postgres binary format and rendered back into tokens.

use std::error::Error;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use chrono::{DateTime, SecondsFormat, Utc};
use postgres_protocol::types as pg;
use serde_json::value::RawValue;
use tokio_postgres::types::{FromSql, IsNull, Json, ToSql, Type};

use crate::error::{GatewayError, Result};

type BoxError = Box<dyn Error + Sync + Send>;

/// Column and parameter types the gateway knows how to marshal.
pub const SUPPORTED_TYPES: [&str; 11] = [
    "text",
    "jsonb",
    "varchar",
    "timestamptz",
    "int4",
    "int8",
    "numeric",
    "bigserial",
    "float8",
    "bool",
    "void",
];

/// Stand-in for the empty string inside base64 text tokens.
pub const EMPTY_SENTINEL: &str = "\"\"";

pub fn is_supported_type(name: &str) -> bool {
    SUPPORTED_TYPES.contains(&name)
}

/// A decoded argument ready to be sent for one parameter slot.
#[derive(Clone, Debug, PartialEq)]
pub enum BindValue {
    Null,
    Text(String),
    Json(String),
    Timestamp(DateTime<Utc>),
    Bool(bool),
    Int4(i32),
    Int8(i64),
    Float8(f64),
}

/// Decodes the raw token for the 1-based parameter `idx` declared as `type_name`.
pub fn decode_arg(type_name: &str, idx: usize, raw: &str) -> Result<BindValue> {
    if !is_supported_type(type_name) {
        return Err(GatewayError::bind(format!(
            "bind arg - unsupported sql type {type_name}"
        )));
    }
    if raw.is_empty() || type_name == "void" {
        return Ok(BindValue::Null);
    }
    let number_error = || GatewayError::bind(format!("bind arg - failed to parse idx {idx} to number"));
    let value = match type_name {
        "text" | "jsonb" | "varchar" | "timestamptz" => {
            if let Some(encoded) = raw.strip_prefix('s') {
                let text = decode_base64(encoded, idx)?;
                if text == EMPTY_SENTINEL {
                    BindValue::Text(String::new())
                } else {
                    BindValue::Text(text)
                }
            } else if let Some(encoded) = raw.strip_prefix('j') {
                BindValue::Json(decode_base64(encoded, idx)?)
            } else if let Some(instant) = raw.strip_prefix('t') {
                let parsed = DateTime::parse_from_rfc3339(instant).map_err(|_| {
                    GatewayError::bind(format!("bind arg - failed to parse idx {idx} to timestamp"))
                })?;
                BindValue::Timestamp(parsed.with_timezone(&Utc))
            } else {
                BindValue::Text(raw.to_string())
            }
        }
        "bool" => BindValue::Bool(raw == "true"),
        "int4" => BindValue::Int4(raw.parse().map_err(|_| number_error())?),
        "int8" | "numeric" | "bigserial" => {
            BindValue::Int8(raw.parse().map_err(|_| number_error())?)
        }
        "float8" => BindValue::Float8(raw.parse().map_err(|_| number_error())?),
        _ => BindValue::Null,
    };
    Ok(value)
}

fn decode_base64(encoded: &str, idx: usize) -> Result<String> {
    BASE64
        .decode(encoded)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|_| GatewayError::bind(format!("bind arg - failed to base64 decode idx {idx}")))
}

impl ToSql for BindValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            BindValue::Null => return Ok(IsNull::Yes),
            BindValue::Text(text) => match *ty {
                Type::TIMESTAMPTZ | Type::TIMESTAMP => {
                    let parsed = DateTime::parse_from_rfc3339(text)?;
                    return timestamp_to_sql(&parsed.with_timezone(&Utc), ty, out);
                }
                Type::JSON | Type::JSONB => return json_to_sql(text, ty, out),
                _ => pg::text_to_sql(text, out),
            },
            BindValue::Json(json) => match *ty {
                Type::TIMESTAMPTZ | Type::TIMESTAMP => {
                    return Err(format!("cannot bind json to {ty}").into());
                }
                Type::JSON | Type::JSONB => return json_to_sql(json, ty, out),
                _ => pg::text_to_sql(json, out),
            },
            BindValue::Timestamp(instant) => match *ty {
                Type::TIMESTAMPTZ | Type::TIMESTAMP => return timestamp_to_sql(instant, ty, out),
                Type::JSON | Type::JSONB => return Json(format_instant(instant)).to_sql(ty, out),
                _ => pg::text_to_sql(&format_instant(instant), out),
            },
            BindValue::Bool(value) => pg::bool_to_sql(*value, out),
            BindValue::Int4(value) => pg::int4_to_sql(*value, out),
            BindValue::Int8(value) => match *ty {
                Type::NUMERIC => numeric::encode(*value, out),
                _ => pg::int8_to_sql(*value, out),
            },
            BindValue::Float8(value) => pg::float8_to_sql(*value, out),
        }
        Ok(IsNull::No)
    }

    // Every value is produced for a type the server declared, so conversion
    // is decided per value in `to_sql`.
    fn accepts(_: &Type) -> bool {
        true
    }

    fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        self.to_sql(ty, out)
    }
}

/// Undecoded binary cell; NULL is `None`.
pub struct RawCell<'a>(pub Option<&'a [u8]>);

impl<'a> FromSql<'a> for RawCell<'a> {
    fn from_sql(_: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(RawCell(Some(raw)))
    }

    fn from_sql_null(_: &Type) -> std::result::Result<Self, BoxError> {
        Ok(RawCell(None))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// Encodes text as an `s`-prefixed base64 token, substituting the sentinel for "".
pub fn encode_text(text: &str) -> String {
    let text = if text.is_empty() { EMPTY_SENTINEL } else { text };
    format!("s{}", BASE64.encode(text.as_bytes()))
}

/// Renders one binary result cell of the given column type as a row token.
pub fn encode_cell(type_name: &str, raw: Option<&[u8]>) -> std::result::Result<String, BoxError> {
    let Some(raw) = raw else {
        return Ok(String::new());
    };
    let token = match type_name {
        "text" | "varchar" => encode_text(pg::text_from_sql(raw)?),
        "jsonb" => encode_text(Json::<&RawValue>::from_sql(&Type::JSONB, raw)?.0.get()),
        "timestamptz" => match pg::timestamp_from_sql(raw)? {
            i64::MAX => "infinity".to_string(),
            i64::MIN => "-infinity".to_string(),
            _ => format_instant(&DateTime::<Utc>::from_sql(&Type::TIMESTAMPTZ, raw)?),
        },
        "bool" => pg::bool_from_sql(raw)?.to_string(),
        "int4" => pg::int4_from_sql(raw)?.to_string(),
        "int8" | "bigserial" => pg::int8_from_sql(raw)?.to_string(),
        "numeric" => numeric::decode(raw)?.to_string(),
        "float8" => format_float(pg::float8_from_sql(raw)?),
        _ => String::new(),
    };
    Ok(token)
}

/// `TIMESTAMP` parameters take the UTC wall-clock time.
fn timestamp_to_sql(
    instant: &DateTime<Utc>,
    ty: &Type,
    out: &mut BytesMut,
) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::TIMESTAMP => instant.naive_utc().to_sql(ty, out),
        _ => instant.to_sql(ty, out),
    }
}

/// Sends already-serialized JSON text without re-encoding it.
fn json_to_sql(text: &str, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    let raw = RawValue::from_string(text.to_string())?;
    Json(raw).to_sql(ty, out)
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "Infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        value.to_string()
    }
}

fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Postgres `numeric` binary format restricted to integers.
///
/// Layout: ndigits, weight, sign, dscale (all 16-bit) followed by ndigits
/// base-10000 digits, most significant first.
mod numeric {
    use super::BoxError;
    use bytes::{BufMut, BytesMut};

    const NBASE: u64 = 10_000;
    const POSITIVE: u16 = 0x0000;
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const POSITIVE_INFINITY: u16 = 0xD000;
    const NEGATIVE_INFINITY: u16 = 0xF000;

    pub fn encode(value: i64, out: &mut BytesMut) {
        let mut magnitude = value.unsigned_abs();
        let mut digits = Vec::new();
        while magnitude > 0 {
            digits.push((magnitude % NBASE) as i16);
            magnitude /= NBASE;
        }
        digits.reverse();
        let weight = digits.len().saturating_sub(1) as i16;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        out.put_i16(digits.len() as i16);
        out.put_i16(weight);
        out.put_u16(if value < 0 { NEGATIVE } else { POSITIVE });
        out.put_u16(0);
        for digit in digits {
            out.put_i16(digit);
        }
    }

    /// Decodes to an integer, truncating any fractional digits toward zero.
    pub fn decode(raw: &[u8]) -> Result<i64, BoxError> {
        let field = |at: usize| -> Result<u16, BoxError> {
            raw.get(at..at + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| "truncated numeric value".into())
        };
        let ndigits = field(0)? as usize;
        let weight = field(2)? as i16;
        let sign = field(4)?;
        match sign {
            POSITIVE | NEGATIVE => {}
            NAN => return Err("numeric NaN cannot be read as an integer".into()),
            POSITIVE_INFINITY | NEGATIVE_INFINITY => {
                return Err("numeric infinity cannot be read as an integer".into());
            }
            other => return Err(format!("invalid numeric sign {other:#06x}").into()),
        }
        let mut magnitude: i128 = 0;
        if weight >= 0 {
            for position in 0..=weight as usize {
                let digit = if position < ndigits {
                    field(8 + position * 2)? as i128
                } else {
                    0
                };
                magnitude = magnitude
                    .checked_mul(NBASE as i128)
                    .and_then(|m| m.checked_add(digit))
                    .ok_or("numeric value out of range")?;
            }
        }
        let value = if sign == NEGATIVE { -magnitude } else { magnitude };
        i64::try_from(value).map_err(|_| "numeric value out of range".into())
    }
}
