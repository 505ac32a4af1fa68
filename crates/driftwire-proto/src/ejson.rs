//! EJSON helpers.
//!
//! EJSON is the JSON superset DDP speaks: plain JSON plus typed values
//! encoded under reserved keys (`{"$date": ms}`, `{"$binary": b64}`).
//! We keep documents as [`serde_json::Value`] and layer the extended
//! semantics on top, so the store and the wire share one representation.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// An EJSON value. Alias kept for signature readability.
pub type Ejson = Value;

/// Reserved key for millisecond-epoch dates.
pub const DATE_KEY: &str = "$date";

/// Reserved key for base64 binary payloads.
pub const BINARY_KEY: &str = "$binary";

/// Deep EJSON equality.
///
/// Differs from `Value == Value` in one way that matters on the wire:
/// numbers compare by numeric value, so `1`, `1.0`, and a float that
/// arrived through a different serializer are equal. Objects compare by
/// key set (insertion order is irrelevant), arrays element-wise.
#[must_use]
pub fn equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| equals(x, y))
        },
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs.iter().all(|(k, x)| ys.get(k).is_some_and(|y| equals(x, y)))
        },
        _ => a == b,
    }
}

/// Build a `{"$date": ms}` value.
#[must_use]
pub fn date(epoch_ms: i64) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(DATE_KEY.to_string(), Value::from(epoch_ms));
    Value::Object(map)
}

/// Millisecond epoch of a `$date` value, if `value` is one.
#[must_use]
pub fn as_date(value: &Value) -> Option<i64> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(DATE_KEY)?.as_i64()
}

/// Build a `{"$binary": base64}` value.
#[must_use]
pub fn binary(bytes: &[u8]) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(BINARY_KEY.to_string(), Value::from(BASE64.encode(bytes)));
    Value::Object(map)
}

/// Decoded bytes of a `$binary` value, if `value` is one.
#[must_use]
pub fn as_binary(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    BASE64.decode(map.get(BINARY_KEY)?.as_str()?).ok()
}

/// Normalize a token-expiry value to an ISO-8601 string.
///
/// Servers hand expiry back in several shapes: millisecond epoch
/// numbers, RFC 3339 strings, or `{"$date": ms}` EJSON dates. Anything
/// unparseable collapses to `None` so stale garbage in key storage
/// never breaks a resume.
#[must_use]
pub fn normalize_expiry(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => iso_from_epoch_ms(n.as_f64()? as i64),
        Value::String(s) => OffsetDateTime::parse(s, &Rfc3339).ok().map(|_| s.clone()),
        Value::Object(_) => iso_from_epoch_ms(as_date(value)?),
        _ => None,
    }
}

fn iso_from_epoch_ms(epoch_ms: i64) -> Option<String> {
    let ts = OffsetDateTime::from_unix_timestamp_nanos(i128::from(epoch_ms) * 1_000_000).ok()?;
    ts.format(&Rfc3339).ok()
}
