//! Core data model (spec §3): protocols, products, devices and the device
//! data envelopes that move between them.

mod device;
pub mod device_data;
mod product;
mod protocol;

pub use device::{Device, DeviceState, DeviceStatus};
pub use device_data::{DataOperation, DeviceData, DeviceDataWrapper};
pub use product::{
    EventDescriptor, FieldDescriptor, MethodDescriptor, Product, PropertyDescriptor, ReportMode,
};
pub use protocol::{DriverState, DriverStatus, GeneralProperty, Protocol};

use serde::{Deserialize, Serialize};

pub type ProtocolId = String;
pub type ProductId = String;
pub type DeviceId = String;
pub type PropertyId = String;
pub type EventId = String;
pub type MethodId = String;

/// Scalar type alphabet for property/method field descriptors (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Int,
    Uint,
    Float,
    Bool,
    String,
}

/// The wildcard id meaning "every property" when reading/watching
/// properties in bulk (spec §4.4, original `DeviceDataMultiPropsID`).
pub const ALL_PROPERTIES: &str = "*";
