//! # edge-driver-sdk
//!
//! SDK runtime for edge device protocol drivers: long-running processes
//! that mediate between a central device manager and physical devices
//! speaking a specific wire protocol (Modbus, OPC-UA, RTSP, ...).
//!
//! A driver built on this crate registers a [`domain::Protocol`], activates
//! the [`domain::Device`]s it owns, then exposes their properties, events
//! and methods over a message bus so the manager can read/write/invoke
//! them uniformly. The pieces are: a topic/envelope codec ([`topic`],
//! [`envelope`]), a message bus client ([`bus`]), a meta/data operations
//! facade ([`operations`]), a per-device twin runner ([`runner`]) and the
//! process-wide [`coordinator::DriverCoordinator`]. Concrete protocol
//! implementations plug in via the [`twin::Twin`] trait; this crate never
//! talks to a real device itself.

#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod operations;
pub mod runner;
pub mod scope;
pub mod topic;
pub mod twin;
pub mod value;

pub use config::DriverConfig;
pub use coordinator::DriverCoordinator;
pub use domain::{Device, DeviceState, Product, Protocol};
pub use error::{DriverError, Result};
pub use scope::Scope;
pub use twin::{Twin, TwinBuilder};

use std::sync::Arc;
use std::time::Duration;

use bus::MessageBus;

/// The wire version tag embedded in every topic this SDK speaks (spec §6:
/// "Version tag is the project's major version string and is part of
/// every topic").
pub const PROTOCOL_VERSION: &str = "v1";

/// Thin startup glue (spec §2 item 6, "User-Facing Entrypoint"): wires a
/// user-supplied twin builder and protocol descriptor into a
/// [`DriverCoordinator`], connects the bus, and runs until the coordinator's
/// root scope is cancelled.
///
/// This is the only code a protocol implementer's `main` needs beyond
/// constructing its [`MessageBus`] and [`Twin`] impls; everything else
/// (registration retry, cache maintenance, health reporting, data fan-in)
/// lives in the coordinator.
pub async fn run_driver(
    protocol: Protocol,
    twin_builder: TwinBuilder,
    config: DriverConfig,
    bus: Arc<dyn MessageBus>,
) -> Result<()> {
    bus.connect().await?;
    let call_timeout = Duration::from_millis(config.message_bus.timeout_ms);
    let coordinator = DriverCoordinator::new(
        protocol,
        twin_builder,
        config.driver_options,
        bus,
        PROTOCOL_VERSION,
        call_timeout,
    );
    coordinator.serve().await
}

#[cfg(test)]
mod tests {
    #[test]
    fn protocol_version_is_v1() {
        assert_eq!(super::PROTOCOL_VERSION, "v1");
    }
}
