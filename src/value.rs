//! Wire codec for SQL values.
//!
//! Every value crossing the wire is a JSON object tagged by `type`. The codec is the only place
//! that knows about this representation; the rest of the crate works with [`Value`].
//!
//! # Wire Format
//!
//! | Value            | Wire representation                              |
//! |------------------|--------------------------------------------------|
//! | `Null`           | `{"type":"null"}`                                |
//! | `Integer(i64)`   | `{"type":"integer","value":"<decimal string>"}`  |
//! | `Float(f64)`     | `{"type":"float","value":<JSON number>}`         |
//! | `Text(String)`   | `{"type":"text","value":<string>}`               |
//! | `Blob(Vec<u8>)`  | `{"type":"blob","base64":<base64>}`              |
//!
//! Integers travel as strings so that JSON decoders backed by doubles keep the full signed 64-bit
//! range. Blobs are encoded without padding; decoding accepts both padded and unpadded input.
use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use serde_json::{Map, Value as Json, json};
use thiserror::Error;

const BLOB_CODEC: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A single SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// Failure to decode a wire value or statement arguments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("value must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("value has no 'type' tag")]
    MissingTag,

    #[error("unrecognized value type '{0}'")]
    UnknownTag(String),

    #[error("'{tag}' value is missing the '{field}' field")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },

    #[error("integer value must be a decimal string, got {0}")]
    InvalidInteger(String),

    #[error("float value must be a JSON number")]
    InvalidFloat,

    #[error("text value must be a JSON string")]
    InvalidText,

    #[error("invalid base64 blob: {0}")]
    InvalidBlob(String),

    #[error("statement arguments must be an array or an object, got {0}")]
    InvalidArguments(&'static str),

    #[error("parameter name '{0}' must start with ':', '@' or '$'")]
    UnprefixedName(String),
}

impl Value {
    /// Encode into the tagged wire representation.
    pub fn encode(&self) -> Json {
        match self {
            Value::Null => json!({ "type": "null" }),
            Value::Integer(i) => json!({ "type": "integer", "value": i.to_string() }),
            Value::Float(f) => json!({ "type": "float", "value": f }),
            Value::Text(s) => json!({ "type": "text", "value": s }),
            Value::Blob(b) => json!({ "type": "blob", "base64": BLOB_CODEC.encode(b) }),
        }
    }

    /// Decode from the tagged wire representation.
    pub fn decode(json: &Json) -> Result<Self, ValueError> {
        let obj = json
            .as_object()
            .ok_or_else(|| ValueError::NotAnObject(json_kind(json)))?;
        let tag = obj
            .get("type")
            .and_then(Json::as_str)
            .ok_or(ValueError::MissingTag)?;

        match tag {
            "null" => Ok(Value::Null),
            "integer" => {
                let raw = field(obj, "integer", "value")?;
                raw.as_str()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(Value::Integer)
                    .ok_or_else(|| ValueError::InvalidInteger(raw.to_string()))
            }
            "float" => field(obj, "float", "value")?
                .as_f64()
                .map(Value::Float)
                .ok_or(ValueError::InvalidFloat),
            "text" => field(obj, "text", "value")?
                .as_str()
                .map(|s| Value::Text(s.to_string()))
                .ok_or(ValueError::InvalidText),
            "blob" => {
                let encoded = field(obj, "blob", "base64")?
                    .as_str()
                    .ok_or_else(|| ValueError::InvalidBlob("expected a string".into()))?;
                BLOB_CODEC
                    .decode(encoded)
                    .map(Value::Blob)
                    .map_err(|e| ValueError::InvalidBlob(e.to_string()))
            }
            other => Err(ValueError::UnknownTag(other.to_string())),
        }
    }
}

fn field<'a>(
    obj: &'a Map<String, Json>,
    tag: &'static str,
    field: &'static str,
) -> Result<&'a Json, ValueError> {
    obj.get(field)
        .ok_or(ValueError::MissingField { tag, field })
}

pub(crate) fn json_kind(json: &Json) -> &'static str {
    match json {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.encode().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = Json::deserialize(deserializer)?;
        Value::decode(&json).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let encoded = value.encode();
        assert_eq!(Value::decode(&encoded).unwrap(), value, "wire form: {encoded}");
    }

    #[test]
    fn encodes_integers_as_strings() {
        assert_eq!(
            Value::Integer(i64::MAX).encode(),
            json!({"type": "integer", "value": "9223372036854775807"})
        );
        round_trip(Value::Integer(i64::MAX));
        round_trip(Value::Integer(i64::MIN));
        round_trip(Value::Integer(0));
    }

    #[test]
    fn rejects_integer_numbers() {
        let err = Value::decode(&json!({"type": "integer", "value": 1})).unwrap_err();
        assert_eq!(err, ValueError::InvalidInteger("1".into()));

        let err = Value::decode(&json!({"type": "integer", "value": "9223372036854775808"}))
            .unwrap_err();
        assert!(matches!(err, ValueError::InvalidInteger(_)));
    }

    #[test]
    fn floats_text_and_null() {
        assert_eq!(
            Value::Float(2.5).encode(),
            json!({"type": "float", "value": 2.5})
        );
        round_trip(Value::Float(-0.125));
        round_trip(Value::Float(1e300));
        round_trip(Value::Text(String::new()));
        round_trip(Value::Text("žluťoučký kůň".into()));
        round_trip(Value::Null);

        let err = Value::decode(&json!({"type": "float", "value": "1.0"})).unwrap_err();
        assert_eq!(err, ValueError::InvalidFloat);
    }

    #[test]
    fn blobs_encode_without_padding() {
        assert_eq!(
            Value::Blob(vec![1]).encode(),
            json!({"type": "blob", "base64": "AQ"})
        );
        for len in 0..=7u8 {
            round_trip(Value::Blob((0..len).collect()));
        }
        round_trip(Value::Blob(vec![0xff; 1024]));
    }

    #[test]
    fn blobs_decode_padded_and_unpadded() {
        let padded = Value::decode(&json!({"type": "blob", "base64": "AQI="})).unwrap();
        let unpadded = Value::decode(&json!({"type": "blob", "base64": "AQI"})).unwrap();
        assert_eq!(padded, Value::Blob(vec![1, 2]));
        assert_eq!(padded, unpadded);

        let err = Value::decode(&json!({"type": "blob", "base64": "!!"})).unwrap_err();
        assert!(matches!(err, ValueError::InvalidBlob(_)));
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            Value::decode(&json!({"type": "decimal", "value": "1"})).unwrap_err(),
            ValueError::UnknownTag("decimal".into())
        );
        assert_eq!(
            Value::decode(&json!({"value": "1"})).unwrap_err(),
            ValueError::MissingTag
        );
        assert_eq!(
            Value::decode(&json!([1])).unwrap_err(),
            ValueError::NotAnObject("an array")
        );
        assert_eq!(
            Value::decode(&json!({"type": "text"})).unwrap_err(),
            ValueError::MissingField {
                tag: "text",
                field: "value"
            }
        );
    }

    #[test]
    fn serde_uses_wire_form() {
        let values: Vec<Value> = serde_json::from_str(
            r#"[{"type":"null"},{"type":"integer","value":"-7"},{"type":"blob","base64":""}]"#,
        )
        .unwrap();
        assert_eq!(
            values,
            vec![Value::Null, Value::Integer(-7), Value::Blob(vec![])]
        );
        assert_eq!(
            serde_json::to_string(&Value::Text("a".into())).unwrap(),
            r#"{"type":"text","value":"a"}"#
        );
    }
}
