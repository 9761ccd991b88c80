//! Pluggable message encoding.
//!
//! The framing layer is encoding-agnostic. Parent and worker agree on a serializer by name via
//! the startup parameters; the worker looks the name up in its registry and refuses to start
//! when it is unknown.

use tokio_util::bytes::Bytes;

use crate::bridge::protocol::Message;

#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode/decode contract for [`Message`]s.
///
/// Implementations must round-trip every message kind and every [`Value`](crate::Value)
/// variant: `decode(encode(m)) == m`.
pub trait MessageSerializer: Send + Sync {
    /// Name passed to the worker to select the matching implementation.
    fn name(&self) -> &str;

    fn encode(&self, message: &Message) -> Result<Bytes, SerializerError>;

    fn decode(&self, bytes: &[u8]) -> Result<Message, SerializerError>;
}

/// JSON encoding via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub const NAME: &'static str = "json";
}

impl MessageSerializer for JsonSerializer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn encode(&self, message: &Message) -> Result<Bytes, SerializerError> {
        let json = serde_json::to_vec(message).map_err(|source| SerializerError::Encode {
            kind: message.kind(),
            source,
        })?;
        Ok(Bytes::from(json))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, SerializerError> {
        serde_json::from_slice(bytes).map_err(SerializerError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        CallMessage, FaultKind, MessageId, MessageResult, Outcome, RemoteFailure, ShutdownMessage,
    };
    use crate::value::Value;
    use chrono::{TimeZone, Utc};

    fn roundtrip(msg: Message) {
        let serializer = JsonSerializer;
        let bytes = serializer.encode(&msg).unwrap();
        let decoded = serializer.decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_call_with_every_value_type() {
        let ts = Utc.with_ymd_and_hms(2021, 7, 4, 18, 0, 59).unwrap();
        roundtrip(Message::Call(CallMessage::new(
            "EchoMethod",
            vec![
                Value::from("a string"),
                Value::Int(-42),
                Value::Float(2.5),
                Value::Bool(true),
                Value::from(ts),
                Value::from(None::<i64>),
                Value::from(Some(7i64)),
                Value::from(vec!["x", "y"]),
            ],
        )));
    }

    #[test]
    fn roundtrip_void_call() {
        roundtrip(Message::Call(CallMessage::new("Sleep", vec![]).without_return()));
    }

    #[test]
    fn roundtrip_shutdown() {
        roundtrip(Message::Shutdown(ShutdownMessage::new()));
    }

    #[test]
    fn roundtrip_results() {
        let id = MessageId::new();
        roundtrip(Message::Result(MessageResult::value(id, Value::from("awesome"))));
        roundtrip(Message::Result(MessageResult::value(id, Value::Null)));
        roundtrip(Message::Result(MessageResult::fault(
            id,
            RemoteFailure::new(FaultKind::Operation, "boom"),
        )));
        roundtrip(Message::Result(MessageResult::fault(
            MessageId::nil(),
            RemoteFailure::new(FaultKind::StartupResolution, "no hosted type 'Nope'"),
        )));
    }

    fn float_through_wire(v: f64) -> f64 {
        let msg = Message::Result(MessageResult::value(MessageId::new(), Value::Float(v)));
        let bytes = JsonSerializer.encode(&msg).unwrap();
        match JsonSerializer.decode(&bytes).unwrap() {
            Message::Result(MessageResult {
                outcome: Outcome::Return(Value::Float(f)),
                ..
            }) => f,
            other => panic!("expected float result, got {other:?}"),
        }
    }

    #[test]
    fn non_finite_floats_survive_the_wire() {
        assert!(float_through_wire(f64::NAN).is_nan());
        assert_eq!(float_through_wire(f64::INFINITY), f64::INFINITY);
        assert_eq!(float_through_wire(f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert_eq!(float_through_wire(-0.5), -0.5);
        assert_eq!(float_through_wire(f64::MAX), f64::MAX);
    }

    #[test]
    fn non_finite_floats_encode_as_strings() {
        let args = vec![
            Value::Float(f64::NAN),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(1.5),
        ];
        insta::assert_json_snapshot!(args, @r#"
        [
          {
            "type": "float",
            "value": "NaN"
          },
          {
            "type": "float",
            "value": "inf"
          },
          {
            "type": "float",
            "value": "-inf"
          },
          {
            "type": "float",
            "value": 1.5
          }
        ]
        "#);
    }

    #[test]
    fn float_accepts_integral_json_number() {
        let value: Value = serde_json::from_str(r#"{"type":"float","value":3}"#).unwrap();
        assert_eq!(value, Value::Float(3.0));
        assert!(serde_json::from_str::<Value>(r#"{"type":"float","value":"many"}"#).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = JsonSerializer.decode(b"{\"type\":\"bogus\"}").unwrap_err();
        assert!(matches!(err, SerializerError::Decode(_)));
    }

    #[test]
    fn name_is_json() {
        assert_eq!(JsonSerializer.name(), "json");
    }
}
