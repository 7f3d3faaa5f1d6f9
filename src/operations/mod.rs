//! Operations client (spec §5): the driver process's only channel to the
//! device manager, split into a meta half (protocol/product/device
//! lifecycle) and a data half (property/event/method traffic).
//!
//! Grounded in `original_source/internal/operations/client_service.go` (the
//! driver-side, `Call`-based half: register/list) and
//! `original_source/internal/driver/handle_operations_meta.go` /
//! `handle_operations_data.go` (the driver-side subscribe-and-respond half:
//! `d.ds.*Handler`). The retrieved package predates the final
//! `DriverClient`/`DriverService` split named in `device_driver.go`; this
//! module reconstructs that split from the call sites, not from a type
//! definition the pack doesn't contain.

pub mod data;
pub mod meta;

pub use data::DriverDataClient;
pub use meta::DriverMetaClient;

use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageBus;
use crate::value::Fields;

/// Outbound half: publish status/props/events and place `Call`s to the
/// device manager. One instance, built once at startup, shared by the
/// coordinator and every twin runner's reporting task.
pub struct DriverClient {
    pub meta: DriverMetaClient,
    pub data: DriverDataClient,
}

impl DriverClient {
    pub fn new(bus: Arc<dyn MessageBus>, version: impl Into<String>, call_timeout: Duration) -> Self {
        let version = version.into();
        Self {
            meta: DriverMetaClient::new(bus.clone(), version.clone(), call_timeout),
            data: DriverDataClient::new(bus, version, call_timeout),
        }
    }
}

/// Inbound half: register the driver's standing handlers for meta
/// mutations and data requests forwarded by the device manager. Registered
/// once at startup (spec §5 "subscribe-and-respond").
pub struct DriverService {
    pub meta: meta::DriverMetaService,
    pub data: data::DriverDataService,
}

impl DriverService {
    pub fn new(bus: Arc<dyn MessageBus>, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            meta: meta::DriverMetaService::new(bus.clone(), version.clone()),
            data: data::DriverDataService::new(bus, version),
        }
    }
}

/// Embed a failure into a response's fields rather than using the dedicated
/// error topic (spec §7: "write and read handlers emit the paired `*-rsp`
/// topic with an error field populated", as opposed to
/// [`crate::envelope::Envelope::error_response`], which is reserved for the
/// method `Call` operation's native error channel).
pub(crate) fn with_error_field(mut fields: Fields, error: Option<&crate::error::DriverError>) -> Fields {
    if let Some(err) = error {
        fields.insert(
            "error".to_string(),
            crate::value::FieldValue::String(err.to_string()),
        );
    }
    fields
}
