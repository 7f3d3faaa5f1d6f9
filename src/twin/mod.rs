//! The user-supplied device twin contract (spec §3, §6 "Twin plug-in
//! contract").
//!
//! Grounded in `original_source/internal/driver/twin_runner.go`'s calls
//! into `r.twin`: the runner is a thin orchestrator around whatever a
//! protocol implementer provides here. One twin instance per active
//! device, owned by its [`crate::runner::TwinRunner`].

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::{Device, DeviceStatus, EventId, MethodId, Product, PropertyId};
use crate::error::DriverError;
use crate::scope::Scope;
use crate::value::Fields;

/// A sink a twin pushes subscribed event samples into (spec §3 `Subscribe(eventId, sink)`).
pub type EventSink = tokio::sync::mpsc::Sender<Fields>;

/// The contract a protocol implementer fulfills once per product/device
/// pair. Every method may be called concurrently with every other except
/// where noted; the runner serializes calls to the same twin that would
/// otherwise race its internal state (spec §4.4).
#[async_trait]
pub trait Twin: Send + Sync {
    /// One-time setup before [`Twin::start`]: parse connection parameters
    /// out of the device's properties, open a handle, and the like.
    async fn initialize(&mut self) -> Result<(), DriverError>;

    /// Establish the live connection and perform whatever bookkeeping
    /// keeps it alive until `scope` is cancelled. Must honor the scope:
    /// any background work the twin spawns should stop when it resolves
    /// (spec §6).
    async fn start(&mut self, scope: Scope) -> Result<(), DriverError>;

    /// Tear down the connection. `force` skips graceful shutdown when the
    /// caller cannot wait (process shutdown under a deadline).
    async fn stop(&mut self, force: bool) -> Result<(), DriverError>;

    /// Report this device's current connection health.
    async fn health_check(&self) -> Result<DeviceStatus, DriverError>;

    /// Perform a real round trip to the device for the named property, or
    /// every property when `property_id` is [`crate::domain::ALL_PROPERTIES`].
    /// Backs both the runner's periodic poll and its on-demand hard read
    /// (spec §3 Property Cache: "writes occur on every hard read").
    async fn read(&self, property_id: &PropertyId) -> Result<Fields, DriverError>;

    /// Write `values` for the named property to the real device. The
    /// runner has already checked the property exists and is writeable.
    async fn write(&self, property_id: &PropertyId, values: Fields) -> Result<(), DriverError>;

    /// Subscribe to a product event, pushing every sample into `sink`
    /// until the twin's scope is cancelled.
    async fn subscribe(&mut self, event_id: &EventId, sink: EventSink) -> Result<(), DriverError>;

    /// Invoke a product method. The runner has already checked that every
    /// declared input is present; it will reject the result if a declared
    /// output is missing.
    async fn call(&self, method_id: &MethodId, ins: Fields) -> Result<Fields, DriverError>;
}

/// A twin is built once per activated device from its product descriptor
/// and device record (spec §6: "a function `(Product, Device) -> Twin`
/// supplied at startup").
pub type TwinBuilder =
    std::sync::Arc<dyn Fn(&Product, &Device) -> Result<Box<dyn Twin>, DriverError> + Send + Sync>;

/// Helper used by tests and by protocol drivers assembling a static twin
/// registry: index a product's descriptors the way [`crate::runner`] does.
pub fn index_properties(product: &Product) -> HashMap<PropertyId, &crate::domain::PropertyDescriptor> {
    product.properties_by_id()
}
