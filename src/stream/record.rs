//! Decoding of individual stream payloads.

use serde_json::{Map, Value};
use std::fmt;

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// Why a message was not turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    EmptyPayload,
    InvalidUtf8,
    InvalidJson(String),
    NotAnObject,
    MissingField(String),
}

impl SkipReason {
    /// Stable label for metrics and the reject log.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::EmptyPayload => "empty_payload",
            SkipReason::InvalidUtf8 => "invalid_utf8",
            SkipReason::InvalidJson(_) => "invalid_json",
            SkipReason::NotAnObject => "not_an_object",
            SkipReason::MissingField(_) => "missing_field",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EmptyPayload => write!(f, "payload is empty"),
            SkipReason::InvalidUtf8 => write!(f, "payload is not valid UTF-8"),
            SkipReason::InvalidJson(e) => write!(f, "payload is not valid JSON: {e}"),
            SkipReason::NotAnObject => write!(f, "payload is not a JSON object"),
            SkipReason::MissingField(field) => write!(f, "required field '{field}' is missing"),
        }
    }
}

/// Outcome of decoding one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Record(Map<String, Value>),
    Skipped(SkipReason),
}

/// Decode a payload into a JSON object.
///
/// A field listed in `required_fields` that is absent or `null` skips the
/// message.
pub fn decode(message: &RawMessage, required_fields: &[String]) -> Decoded {
    let payload = match message.payload.as_deref() {
        Some(p) if !p.is_empty() => p,
        _ => return Decoded::Skipped(SkipReason::EmptyPayload),
    };

    let Ok(text) = std::str::from_utf8(payload) else {
        return Decoded::Skipped(SkipReason::InvalidUtf8);
    };

    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Decoded::Skipped(SkipReason::InvalidJson(e.to_string())),
    };

    let Value::Object(record) = value else {
        return Decoded::Skipped(SkipReason::NotAnObject);
    };

    if let Some(missing) = required_fields
        .iter()
        .find(|f| record.get(f.as_str()).is_none_or(Value::is_null))
    {
        return Decoded::Skipped(SkipReason::MissingField(missing.clone()));
    }

    Decoded::Record(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &[u8]) -> RawMessage {
        RawMessage {
            topic: "trip_search".to_string(),
            partition: 0,
            offset: 7,
            payload: Some(payload.to_vec()),
        }
    }

    #[test]
    fn test_decode_object() {
        let decoded = decode(&message(br#"{"fromProvinceId": 1, "userId": "u1"}"#), &[]);
        let Decoded::Record(record) = decoded else {
            panic!("expected a record");
        };
        assert_eq!(record["fromProvinceId"], 1);
    }

    #[test]
    fn test_decode_failures() {
        assert_eq!(
            decode(&message(b""), &[]),
            Decoded::Skipped(SkipReason::EmptyPayload)
        );
        assert_eq!(
            decode(&message(&[0xff, 0xfe]), &[]),
            Decoded::Skipped(SkipReason::InvalidUtf8)
        );
        assert!(matches!(
            decode(&message(b"{not json"), &[]),
            Decoded::Skipped(SkipReason::InvalidJson(_))
        ));
        assert_eq!(
            decode(&message(b"[1, 2]"), &[]),
            Decoded::Skipped(SkipReason::NotAnObject)
        );

        let mut no_payload = message(b"");
        no_payload.payload = None;
        assert_eq!(
            decode(&no_payload, &[]),
            Decoded::Skipped(SkipReason::EmptyPayload)
        );
    }

    #[test]
    fn test_required_fields() {
        let required = vec!["userId".to_string()];
        assert_eq!(
            decode(&message(br#"{"userId": null}"#), &required),
            Decoded::Skipped(SkipReason::MissingField("userId".to_string()))
        );
        assert!(matches!(
            decode(&message(br#"{"userId": "u1"}"#), &required),
            Decoded::Record(_)
        ));
    }
}
