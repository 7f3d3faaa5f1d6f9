//! Topic & envelope codec (spec §4.1).
//!
//! A topic is a slash-separated string beginning with the protocol's
//! version tag, followed by a type tag (`META` or `DATA`), followed by the
//! type-specific tag tuple. `Topic::parse` validates the first two
//! segments, selects the schema, and parses exactly the right number of
//! remaining segments; a malformed topic fails with [`DriverError::BadTopic`].
//!
//! Mirrors `original_source/internal/message_bus/topic.go`'s `commonTopic`/
//! `NewTopic`, generalized into a typed Rust enum instead of a map keyed by
//! `TopicTagKey`.

use std::fmt;
use std::str::FromStr;

use strum_macros::{Display, EnumString};

use crate::domain::device_data::DataOperation;
use crate::error::DriverError;

pub const TOPIC_SEP: char = '/';
pub const WILDCARD: &str = "#";

/// The metadata kind addressed by a `META` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetaType {
    Protocol,
    Product,
    Device,
}

/// The operation performed on a piece of metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetaOp {
    Create,
    Update,
    Delete,
    Get,
    List,
}

/// Whether a `META` envelope is the request or the response half of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum MetaMode {
    Request,
    Response,
}

/// A parsed, well-formed topic of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Meta {
        version: String,
        meta_type: String,
        op: String,
        mode: String,
        data_id: String,
    },
    Data {
        version: String,
        product_id: String,
        device_id: String,
        op: String,
        func_id: String,
    },
}

impl Topic {
    /// Build a `META/.../<op>/<mode>/<data_id>` topic.
    pub fn meta(
        version: impl Into<String>,
        meta_type: MetaType,
        op: MetaOp,
        mode: MetaMode,
        data_id: impl Into<String>,
    ) -> Topic {
        Topic::Meta {
            version: version.into(),
            meta_type: meta_type.to_string(),
            op: op.to_string(),
            mode: mode.to_string(),
            data_id: data_id.into(),
        }
    }

    /// Build a `DATA/.../<product_id>/<device_id>/<op>/<func_id>` topic.
    pub fn data(
        version: impl Into<String>,
        product_id: impl Into<String>,
        device_id: impl Into<String>,
        op: DataOperation,
        func_id: impl Into<String>,
    ) -> Topic {
        Topic::Data {
            version: version.into(),
            product_id: product_id.into(),
            device_id: device_id.into(),
            op: op.to_string(),
            func_id: func_id.into(),
        }
    }

    /// Parse a topic string, validating segment counts against the schema
    /// selected by the type tag.
    pub fn parse(topic: &str) -> Result<Topic, DriverError> {
        let parts: Vec<&str> = topic.split(TOPIC_SEP).collect();
        if parts.len() < 2 {
            return Err(DriverError::BadTopic(topic.to_string()));
        }
        let version = parts[0].to_string();
        let type_tag = parts[1];
        let rest = &parts[2..];

        match type_tag {
            "META" => {
                if rest.len() != 4 {
                    return Err(DriverError::BadTopic(topic.to_string()));
                }
                Ok(Topic::Meta {
                    version,
                    meta_type: rest[0].to_string(),
                    op: rest[1].to_string(),
                    mode: rest[2].to_string(),
                    data_id: rest[3].to_string(),
                })
            }
            "DATA" => {
                if rest.len() != 4 {
                    return Err(DriverError::BadTopic(topic.to_string()));
                }
                Ok(Topic::Data {
                    version,
                    product_id: rest[0].to_string(),
                    device_id: rest[1].to_string(),
                    op: rest[2].to_string(),
                    func_id: rest[3].to_string(),
                })
            }
            _ => Err(DriverError::BadTopic(topic.to_string())),
        }
    }

    /// `true` if any segment is the wildcard `#`: valid as a subscription
    /// pattern, but not as a publishable topic (spec §4.1).
    pub fn is_wildcard(&self) -> bool {
        match self {
            Topic::Meta {
                meta_type,
                op,
                mode,
                data_id,
                ..
            } => [meta_type, op, mode, data_id]
                .iter()
                .any(|s| s.as_str() == WILDCARD),
            Topic::Data {
                product_id,
                device_id,
                op,
                func_id,
                ..
            } => [product_id, device_id, op, func_id]
                .iter()
                .any(|s| s.as_str() == WILDCARD),
        }
    }

    /// Validate that this topic is publishable (no wildcard segment).
    pub fn require_publishable(&self) -> Result<(), DriverError> {
        if self.is_wildcard() {
            Err(DriverError::BadTopic(format!(
                "topic is a subscription pattern, not publishable: {self}"
            )))
        } else {
            Ok(())
        }
    }

    pub fn meta_type(&self) -> Option<&str> {
        match self {
            Topic::Meta { meta_type, .. } => Some(meta_type),
            Topic::Data { .. } => None,
        }
    }

    pub fn data_operation(&self) -> Option<DataOperation> {
        match self {
            Topic::Data { op, .. } => DataOperation::from_str(op).ok(),
            Topic::Meta { .. } => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Meta {
                version,
                meta_type,
                op,
                mode,
                data_id,
            } => write!(
                f,
                "{version}{TOPIC_SEP}META{TOPIC_SEP}{meta_type}{TOPIC_SEP}{op}{TOPIC_SEP}{mode}{TOPIC_SEP}{data_id}"
            ),
            Topic::Data {
                version,
                product_id,
                device_id,
                op,
                func_id,
            } => write!(
                f,
                "{version}{TOPIC_SEP}DATA{TOPIC_SEP}{product_id}{TOPIC_SEP}{device_id}{TOPIC_SEP}{op}{TOPIC_SEP}{func_id}"
            ),
        }
    }
}

/// Compute the paired response topic for a request topic (spec §4.1,
/// property 3). For `META`, `request -> response` in the `mode` segment;
/// for `DATA`, the op segment maps via [`DataOperation::response`].
pub fn response_topic_of(request: &Topic) -> Result<Topic, DriverError> {
    match request {
        Topic::Meta {
            version,
            meta_type,
            op,
            mode,
            data_id,
        } => {
            if mode != "request" {
                return Err(DriverError::BadRequest(format!(
                    "topic is not a request: {request}"
                )));
            }
            Ok(Topic::Meta {
                version: version.clone(),
                meta_type: meta_type.clone(),
                op: op.clone(),
                mode: "response".to_string(),
                data_id: data_id.clone(),
            })
        }
        Topic::Data {
            version,
            product_id,
            device_id,
            op,
            func_id,
        } => {
            let current = DataOperation::from_str(op)
                .map_err(|_| DriverError::BadTopic(format!("unknown data op: {op}")))?;
            let response = current
                .response()
                .ok_or_else(|| DriverError::BadRequest(format!("topic is not a request: {request}")))?;
            Ok(Topic::Data {
                version: version.clone(),
                product_id: product_id.clone(),
                device_id: device_id.clone(),
                op: response.to_string(),
                func_id: func_id.clone(),
            })
        }
    }
}

/// Compute the paired error topic for a request topic (the `error`
/// channel of [`crate::bus::MessageBus::call`]).
pub fn error_topic_of(request: &Topic) -> Result<Topic, DriverError> {
    match request {
        Topic::Meta { .. } => Err(DriverError::BadRequest(
            "meta topics have no dedicated error channel".to_string(),
        )),
        Topic::Data {
            version,
            product_id,
            device_id,
            op,
            func_id,
        } => {
            let current = DataOperation::from_str(op)
                .map_err(|_| DriverError::BadTopic(format!("unknown data op: {op}")))?;
            current
                .error()
                .ok_or_else(|| DriverError::BadRequest(format!("topic is not a request: {request}")))?;
            Ok(Topic::Data {
                version: version.clone(),
                product_id: product_id.clone(),
                device_id: device_id.clone(),
                op: DataOperation::Error.to_string(),
                func_id: func_id.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn meta_topic_round_trips() {
        let topic = Topic::meta("v1", MetaType::Product, MetaOp::Update, MetaMode::Request, "p1");
        let parsed = Topic::parse(&topic.to_string()).unwrap();
        assert_eq!(topic, parsed);
    }

    #[test]
    fn data_topic_round_trips() {
        let topic = Topic::data("v1", "p1", "d1", DataOperation::HardReadReq, "temp");
        let parsed = Topic::parse(&topic.to_string()).unwrap();
        assert_eq!(topic, parsed);
    }

    #[test]
    fn bad_topic_is_rejected() {
        assert!(Topic::parse("garbage").is_err());
        assert!(Topic::parse("v1/META/only/three/segments").is_err());
        assert!(Topic::parse("v1/WOOT/a/b/c/d").is_err());
    }

    #[test]
    fn wildcard_is_not_publishable() {
        let topic = Topic::meta("v1", MetaType::Product, MetaOp::List, MetaMode::Request, WILDCARD);
        assert!(topic.is_wildcard());
        assert!(topic.require_publishable().is_err());
    }

    #[test]
    fn response_topic_flips_mode() {
        let req = Topic::meta("v1", MetaType::Device, MetaOp::Update, MetaMode::Request, "d1");
        let rsp = response_topic_of(&req).unwrap();
        match rsp {
            Topic::Meta { mode, .. } => assert_eq!(mode, "response"),
            _ => panic!("expected meta topic"),
        }
    }

    #[test]
    fn data_response_topic_maps_op() {
        let req = Topic::data("v1", "p1", "d1", DataOperation::WriteReq, "temp");
        let rsp = response_topic_of(&req).unwrap();
        assert_eq!(rsp.data_operation(), Some(DataOperation::WriteRsp));

        let err = error_topic_of(&req).unwrap();
        assert_eq!(err.data_operation(), Some(DataOperation::Error));
    }

    #[test]
    fn non_request_topic_has_no_response() {
        let watch = Topic::data("v1", "p1", "d1", DataOperation::Watch, "temp");
        assert!(response_topic_of(&watch).is_err());
    }

    proptest! {
        #[test]
        fn data_topic_round_trip_prop(
            product_id in "[a-zA-Z0-9_-]{1,12}",
            device_id in "[a-zA-Z0-9_-]{1,12}",
            func_id in "[a-zA-Z0-9_*-]{1,12}",
        ) {
            let topic = Topic::data("v1", &product_id, &device_id, DataOperation::HardReadReq, &func_id);
            let parsed = Topic::parse(&topic.to_string()).unwrap();
            prop_assert_eq!(topic, parsed);
        }
    }
}
