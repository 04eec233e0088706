//! Envelopes exchanged between a caller and a task context.

use crate::runtime::codec::{encode, EncodedProgram, GraphDecoder};
use crate::runtime::error::{Error, Result};
use crate::runtime::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serialized envelope bytes.
pub type Frame = Vec<u8>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Pipe traffic, any number per task
    Message,
    /// Final value, exactly one per task
    Result,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeKind::Message => f.write_str("message"),
            EnvelopeKind::Result => f.write_str("result"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: EncodedProgram,
}

impl Envelope {
    pub fn message(value: &Value) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            payload: encode(value),
        }
    }

    pub fn result(value: &Value) -> Self {
        Self {
            kind: EnvelopeKind::Result,
            payload: encode(value),
        }
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Decode the payload, labelling failures with the envelope kind.
    pub fn open(&self, decoder: &GraphDecoder) -> Result<Value> {
        decoder.decode(&self.payload).map_err(|e| {
            Error::Decode(format!("Failed to decode {} envelope: {}", self.kind, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let value = Value::object([("answer", Value::Int(42))]);
        let frame = Envelope::result(&value).to_frame().unwrap();

        let envelope = Envelope::from_frame(&frame).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Result);
        let opened = envelope.open(&GraphDecoder::default()).unwrap();
        assert!(opened.deep_eq(&value));
    }

    #[test]
    fn test_garbage_frame_is_wire_error() {
        let err = Envelope::from_frame(b"not json").unwrap_err();
        assert!(matches!(err, Error::Wire(_)));
        assert!(err.is_decode_failure());
    }

    #[test]
    fn test_open_names_envelope_kind() {
        let mut envelope = Envelope::message(&Value::Null);
        envelope.payload.root = crate::runtime::codec::Slot::Node(3);
        let err = envelope.open(&GraphDecoder::default()).unwrap_err();
        assert!(err.to_string().contains("Failed to decode message envelope"));
    }
}
