//! Envelope codec: pairs a [`Topic`] with a JSON field payload and converts
//! to/from the raw `(subject, bytes)` shape a [`crate::bus::MessageBus`]
//! actually moves (spec §4.1, §4.2).
//!
//! The Rust analogue of `original_source/internal/message_bus/message.go`'s
//! `Message` plus the `Struct2Map`/`Map2Struct` helpers in
//! `original_source/helper/str_conv.go`, now backed by [`crate::value`].

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::DriverError;
use crate::topic::{error_topic_of, response_topic_of, Topic};
use crate::value::{decode_fields, encode_fields, Fields};

/// The wire-level unit a bus implementation actually sends/receives: a
/// subject string and an opaque JSON payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
}

/// A typed request/response/event unit: a topic plus its field payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Topic,
    pub fields: Fields,
}

/// The shape an error envelope's fields take on the wire, so a caller on
/// the other end of [`crate::bus::MessageBus::call`] can reconstruct a
/// [`DriverError`] (spec §7).
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl Envelope {
    pub fn new(topic: Topic, fields: Fields) -> Self {
        Self { topic, fields }
    }

    /// Build an envelope by serializing `value` into fields via
    /// [`encode_fields`] (the `Struct2Map` analogue).
    pub fn encode<T: Serialize>(topic: Topic, value: &T) -> Result<Envelope, DriverError> {
        Ok(Envelope::new(topic, encode_fields(value)?))
    }

    /// Deserialize this envelope's fields into `T` via [`decode_fields`]
    /// (the `Map2Struct` analogue).
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DriverError> {
        decode_fields(&self.fields)
    }

    /// Convert to the raw `(subject, payload)` a bus implementation sends.
    /// Refuses to publish a wildcard subscription-pattern topic.
    pub fn to_message(&self) -> Result<Message, DriverError> {
        self.topic.require_publishable()?;
        let payload = serde_json::to_vec(&self.fields)?;
        Ok(Message {
            subject: self.topic.to_string(),
            payload: Bytes::from(payload),
        })
    }

    /// Parse a raw `(subject, payload)` pair back into an envelope.
    pub fn parse(subject: &str, payload: &[u8]) -> Result<Envelope, DriverError> {
        let topic = Topic::parse(subject)?;
        let fields: Fields = serde_json::from_slice(payload)?;
        Ok(Envelope::new(topic, fields))
    }

    /// Build the paired response envelope carrying `fields`, computing the
    /// response topic from this (request) envelope's topic.
    pub fn response(&self, fields: Fields) -> Result<Envelope, DriverError> {
        let topic = response_topic_of(&self.topic)?;
        Ok(Envelope::new(topic, fields))
    }

    /// Build the paired error envelope for this (request) envelope, per
    /// spec §9: a write/read failure always publishes a response envelope
    /// (here, on the error topic) rather than returning inline.
    pub fn error_response(&self, err: &DriverError) -> Result<Envelope, DriverError> {
        let topic = error_topic_of(&self.topic)?;
        let fields = encode_fields(&ErrorPayload {
            kind: err.kind().to_string(),
            message: err.to_string(),
        })?;
        Ok(Envelope::new(topic, fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::device_data::DataOperation;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        temperature: f64,
        label: String,
    }

    #[test]
    fn encode_decode_round_trips() {
        let topic = Topic::data("v1", "p1", "d1", DataOperation::HardReadRsp, "temp");
        let sample = Sample {
            temperature: 21.5,
            label: "ok".to_string(),
        };
        let envelope = Envelope::encode(topic, &sample).unwrap();
        let decoded: Sample = envelope.decode().unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn message_round_trips() {
        let topic = Topic::data("v1", "p1", "d1", DataOperation::Event, "motion");
        let envelope = Envelope::encode(
            topic,
            &Sample {
                temperature: 1.0,
                label: "x".to_string(),
            },
        )
        .unwrap();
        let message = envelope.to_message().unwrap();
        let parsed = Envelope::parse(&message.subject, &message.payload).unwrap();
        assert_eq!(parsed.topic, envelope.topic);
    }

    #[test]
    fn wildcard_topic_cannot_be_published() {
        let topic = Topic::parse("v1/DATA/#/d1/event/motion").unwrap();
        let envelope = Envelope::new(topic, Fields::new());
        assert!(envelope.to_message().is_err());
    }

    #[test]
    fn response_flips_to_response_topic() {
        let req_topic = Topic::data("v1", "p1", "d1", DataOperation::SoftReadReq, "temp");
        let req = Envelope::new(req_topic, Fields::new());
        let rsp = req.response(Fields::new()).unwrap();
        assert_eq!(rsp.topic.data_operation(), Some(DataOperation::SoftReadRsp));
    }

    #[test]
    fn error_response_carries_kind_and_message() {
        let req_topic = Topic::data("v1", "p1", "d1", DataOperation::WriteReq, "temp");
        let req = Envelope::new(req_topic, Fields::new());
        let err = DriverError::NotFound("temp".to_string());
        let error_envelope = req.error_response(&err).unwrap();
        let payload: ErrorPayload = error_envelope.decode().unwrap();
        assert_eq!(payload.kind, "not_found");
    }
}
