//! Device data: the unit of transport payload that moves between a twin
//! and the bus (spec §3, §4.1).

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::{DeviceId, ProductId};
use crate::value::Fields;

/// The operation carried by a `DATA` topic (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataOperation {
    SoftReadReq,
    SoftReadRsp,
    HardReadReq,
    HardReadRsp,
    WriteReq,
    WriteRsp,
    Event,
    Request,
    Response,
    Error,
    HealthCheckPing,
    HealthCheckPong,
    Watch,
}

impl DataOperation {
    /// Whether this operation is a request that expects a paired response
    /// (spec §4.1 request/response pairing).
    pub fn is_request(self) -> bool {
        matches!(
            self,
            DataOperation::SoftReadReq
                | DataOperation::HardReadReq
                | DataOperation::WriteReq
                | DataOperation::Request
                | DataOperation::HealthCheckPing
        )
    }

    /// The paired response operation for a request operation (spec §4.1).
    pub fn response(self) -> Option<DataOperation> {
        match self {
            DataOperation::SoftReadReq => Some(DataOperation::SoftReadRsp),
            DataOperation::HardReadReq => Some(DataOperation::HardReadRsp),
            DataOperation::WriteReq => Some(DataOperation::WriteRsp),
            DataOperation::Request => Some(DataOperation::Response),
            DataOperation::HealthCheckPing => Some(DataOperation::HealthCheckPong),
            _ => None,
        }
    }

    /// The paired error operation for a request operation.
    pub fn error(self) -> Option<DataOperation> {
        if self.is_request() {
            Some(DataOperation::Error)
        } else {
            None
        }
    }
}

/// Device data: a single envelope's worth of product/device runtime data
/// (spec §3). Round-trippable to a topic + JSON payload via
/// [`crate::envelope::Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceData {
    pub product_id: ProductId,
    pub device_id: DeviceId,
    pub op: DataOperation,
    pub func_id: String,
    pub fields: Fields,
}

/// A batch of property values read in one poll tick, queued onto the
/// coordinator's props channel by a runner's watcher (spec §4.4). `func_id`
/// is `"*"` when the bucket groups more than one property, else the single
/// property id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDataWrapper {
    pub product_id: ProductId,
    pub device_id: DeviceId,
    pub func_id: String,
    pub properties: Fields,
}
