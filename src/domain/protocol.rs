//! Protocol: the immutable descriptor a driver registers with the manager.

use serde::{Deserialize, Serialize};

use super::{ProtocolId, ScalarType};

/// A protocol descriptor, created once at process start and never mutated
/// (spec §3). Registration with the manager is retried on an interval by
/// the coordinator, not by the protocol itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    pub id: ProtocolId,
    pub name: String,
    pub category: String,
    /// Capability tags this protocol's drivers support, e.g. `"read"`,
    /// `"write"`, `"event"`, `"method"`.
    pub capabilities: Vec<String>,
    /// Properties every device of this protocol must carry regardless of
    /// product (e.g. connection parameters).
    pub device_props: Vec<GeneralProperty>,
    /// Auxiliary properties describing the protocol itself (not per-device).
    pub aux_props: Vec<GeneralProperty>,
}

/// A named, typed property descriptor shared by protocol and product
/// schemas that don't need the full periodic-report machinery of
/// [`super::PropertyDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralProperty {
    pub id: String,
    pub name: String,
    pub field_type: ScalarType,
    pub required: bool,
}

/// Lifecycle state of the driver itself, published in [`DriverStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Running,
    Stopping,
}

/// Health payload published on a ticker by the coordinator (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverStatus {
    /// `true` exactly once: the first status emitted after startup.
    pub hello: bool,
    pub protocol_id: ProtocolId,
    pub state: DriverState,
    /// So the manager can infer a liveness deadline from the interval.
    pub health_check_interval_second: u64,
}
