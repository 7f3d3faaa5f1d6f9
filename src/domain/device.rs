//! Device: a single physical or virtual unit of a product, cached and
//! lifecycle-managed by the coordinator (spec §3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

use super::{DeviceId, ProductId};

/// Connection state of a device, as observed by its twin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Disconnected,
    Connected,
    Reconnecting,
    Exception,
}

/// A device: identifier, product membership, free-form per-device
/// properties and its current connection state.
///
/// Invariant (spec §3): a device in cache has a runner in cache for the
/// same id, unless the device is `Disconnected`, in which case no runner
/// exists until the next mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub product_id: ProductId,
    pub props: HashMap<String, String>,
    pub state: DeviceState,
}

impl Device {
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

/// Health payload published whenever a device's twin is health-checked
/// (spec §4.4, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub state: DeviceState,
    /// Populated from a twin error's message when the state is `Exception`
    /// (spec §7 `DeviceTwin` error kind, §9 open question resolution).
    pub state_detail: Option<String>,
}
