//! Wire codec and value coercion shared by the producer and the listeners.
//!
//! A message body is the channel's subset of a source row joined with a single `,`.
//! There is no escaping: a field that itself contains a comma splits into two fields
//! on decode.

use crate::channel::ChannelId;

pub const FIELD_DELIMITER: char = ',';

const TIMESTAMP_FIELD: usize = 0;
const VALUE_FIELD: usize = 1;

/// A channel value after coercion: numeric when it parses as a float, otherwise kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Numeric(f64),
    Raw(String),
}

/// Never fails: anything that does not parse as `f64` (including a missing field) is `Raw`.
pub fn coerce_value(field: Option<&str>) -> Value {
    let Some(raw) = field else {
        return Value::Raw(String::new());
    };
    match raw.trim().parse::<f64>() {
        Ok(value) => Value::Numeric(value),
        Err(_) => Value::Raw(raw.to_string()),
    }
}

pub fn encode_fields<S: AsRef<str>>(fields: &[S]) -> String {
    let mut out = String::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            out.push(FIELD_DELIMITER);
        }
        out.push_str(field.as_ref());
    }
    out
}

pub fn decode_fields(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(body);
    let text = strip_brackets(&text);
    text.split(FIELD_DELIMITER).map(str::to_string).collect()
}

// Older producers wrapped the field list as `[ts, value]`.
fn strip_brackets(text: &str) -> &str {
    text.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(text)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub channel: ChannelId,
    pub timestamp: String,
    pub raw_fields: Vec<String>,
    pub value: Value,
}

impl Reading {
    pub fn decode(channel: ChannelId, body: &[u8]) -> Self {
        let raw_fields = decode_fields(body);
        let timestamp = raw_fields
            .get(TIMESTAMP_FIELD)
            .map(|ts| ts.trim().to_string())
            .unwrap_or_default();
        let value = coerce_value(raw_fields.get(VALUE_FIELD).map(String::as_str));
        Self {
            channel,
            timestamp,
            raw_fields,
            value,
        }
    }
}
