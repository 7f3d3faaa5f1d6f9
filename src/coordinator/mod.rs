//! Driver coordinator (spec §4.5): the top-level object a protocol
//! implementer constructs once. Owns the product/device/runner caches,
//! wires the operations client/service, activates and deactivates devices
//! in response to meta mutations, and fans reported props/events out to the
//! operations client.
//!
//! Grounded in `original_source/internal/driver/device_driver.go` (cache
//! layout, `Initialize`/`Serve`) and `handle_operations_meta.go` /
//! `handle_operations_data.go` (activation, health reporting, data fan-in).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};

use crate::bus::MessageBus;
use crate::config::DriverOptions;
use crate::domain::{
    Device, DeviceId, DeviceState, DeviceStatus, DriverState, DriverStatus, Product, ProductId,
    Protocol,
};
use crate::error::DriverError;
use crate::operations::{DriverClient, DriverService};
use crate::runner::TwinRunner;
use crate::scope::Scope;
use crate::twin::TwinBuilder;

const PROPS_BUS_CAPACITY: usize = 1000;
const EVENT_BUS_CAPACITY: usize = 1000;

/// The coordinator a driver binary constructs once at startup (spec §2
/// item 6, §4.5).
pub struct DriverCoordinator {
    protocol: Protocol,
    twin_builder: TwinBuilder,
    options: DriverOptions,

    products: DashMap<ProductId, Product>,
    devices: DashMap<DeviceId, Device>,
    runners: DashMap<DeviceId, Arc<TwinRunner>>,

    client: DriverClient,
    service: Arc<DriverService>,

    props_tx: mpsc::Sender<crate::domain::device_data::DeviceDataWrapper>,
    props_rx: RwLock<Option<mpsc::Receiver<crate::domain::device_data::DeviceDataWrapper>>>,
    event_tx: mpsc::Sender<crate::domain::device_data::DeviceDataWrapper>,
    event_rx: RwLock<Option<mpsc::Receiver<crate::domain::device_data::DeviceDataWrapper>>>,
    status_tx: mpsc::Sender<DeviceStatus>,
    status_rx: RwLock<Option<mpsc::Receiver<DeviceStatus>>>,

    root_scope: Scope,
}

impl DriverCoordinator {
    /// Build a coordinator. `version` is the protocol's wire version tag
    /// used to address every topic this driver speaks (spec §4.1).
    pub fn new(
        protocol: Protocol,
        twin_builder: TwinBuilder,
        options: DriverOptions,
        bus: Arc<dyn MessageBus>,
        version: impl Into<String>,
        call_timeout: Duration,
    ) -> Arc<Self> {
        let version = version.into();
        let (props_tx, props_rx) = mpsc::channel(PROPS_BUS_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUS_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(EVENT_BUS_CAPACITY);

        Arc::new(Self {
            protocol,
            twin_builder,
            options,
            products: DashMap::new(),
            devices: DashMap::new(),
            runners: DashMap::new(),
            client: DriverClient::new(bus.clone(), version.clone(), call_timeout),
            service: Arc::new(DriverService::new(bus, version)),
            props_tx,
            props_rx: RwLock::new(Some(props_rx)),
            event_tx,
            event_rx: RwLock::new(Some(event_rx)),
            status_tx,
            status_rx: RwLock::new(Some(status_rx)),
            root_scope: Scope::root(),
        })
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Register this protocol with the manager, subscribe to meta
    /// mutations and data requests, and start reporting tasks. Blocks until
    /// the root scope is cancelled (spec §4.5 `Serve`).
    pub async fn serve(self: &Arc<Self>) -> Result<(), DriverError> {
        self.register_protocol_with_retry().await;
        self.subscribe_meta_mutation().await?;
        self.activate_all_devices().await;
        self.subscribe_data_operations().await?;

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.report_driver_health().await });
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.report_devices_health().await });
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.fan_in_device_data().await });
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.fan_in_device_status().await });

        self.root_scope.cancelled().await;
        self.publish_stopping_status().await;
        self.deactivate_all_devices().await;
        Ok(())
    }

    /// Announce the driver's shutdown before tearing down any runner, so the
    /// manager sees `DriverState::Stopping` rather than just losing the
    /// health-check heartbeat (spec §4.5, process shutdown).
    async fn publish_stopping_status(&self) {
        let status = DriverStatus {
            hello: false,
            protocol_id: self.protocol.id.clone(),
            state: DriverState::Stopping,
            health_check_interval_second: self.options.driver_health_check_interval_second,
        };
        if let Err(err) = self.client.meta.publish_driver_status(&status).await {
            tracing::error!(error = %err, "failed to publish stopping status");
        }
    }

    /// Register the protocol with the manager, retrying on
    /// `ProtocolRegisterIntervalSecond` until it succeeds (spec §3 "retried
    /// at a configured interval", §7 "protocol register retries on a
    /// ticker"). Only a `Timeout`/`Unreachable` is worth retrying; any
    /// other error is a programmer mistake the retry loop can't fix, so it
    /// is logged and the loop keeps going regardless rather than risk a
    /// never-registered driver.
    async fn register_protocol_with_retry(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.options.protocol_register_interval_second);
        loop {
            match self.client.meta.register_protocol(&self.protocol).await {
                Ok(()) => {
                    tracing::info!(protocol_id = %self.protocol.id, "registered protocol");
                    return;
                }
                Err(err) => {
                    tracing::warn!(protocol_id = %self.protocol.id, error = %err,
                        "failed to register protocol, retrying");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.root_scope.cancelled() => return,
            }
        }
    }

    /// Cancel the coordinator's root scope, stopping every runner and
    /// reporting task (spec §4.5, process shutdown).
    pub fn shutdown(&self) {
        self.root_scope.cancel();
    }

    async fn subscribe_meta_mutation(self: &Arc<Self>) -> Result<(), DriverError> {
        let protocol_id = self.protocol.id.clone();

        let coordinator = Arc::clone(self);
        self.service
            .meta
            .initialize_driver_handler(&protocol_id, move |products, devices| {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.initialize_driver(products, devices).await }
            })
            .await?;

        let coordinator_update = Arc::clone(self);
        let coordinator_remove = Arc::clone(self);
        self.service
            .meta
            .mutate_product_handler(
                &protocol_id,
                move |product| {
                    let coordinator = Arc::clone(&coordinator_update);
                    async move { coordinator.update_product(product).await }
                },
                move |product_id| {
                    let coordinator = Arc::clone(&coordinator_remove);
                    async move { coordinator.remove_product(&product_id).await }
                },
            )
            .await?;

        let coordinator_update = Arc::clone(self);
        let coordinator_remove = Arc::clone(self);
        self.service
            .meta
            .mutate_device_handler(
                &protocol_id,
                move |device| {
                    let coordinator = Arc::clone(&coordinator_update);
                    async move { coordinator.update_device(device).await }
                },
                move |device_id| {
                    let coordinator = Arc::clone(&coordinator_remove);
                    async move { coordinator.remove_device(&device_id).await }
                },
            )
            .await?;

        Ok(())
    }

    async fn subscribe_data_operations(self: &Arc<Self>) -> Result<(), DriverError> {
        let coordinator = Arc::clone(self);
        self.service
            .data
            .read_handler(move |_product_id, device_id, property_id| {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.read(&device_id, &property_id).await }
            })
            .await?;

        let coordinator = Arc::clone(self);
        self.service
            .data
            .hard_read_handler(move |_product_id, device_id, property_id| {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.hard_read(&device_id, &property_id).await }
            })
            .await?;

        let coordinator = Arc::clone(self);
        self.service
            .data
            .write_handler(move |_product_id, device_id, property_id, values| {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.write(&device_id, &property_id, values).await }
            })
            .await?;

        let coordinator = Arc::clone(self);
        self.service
            .data
            .call_handler(move |_product_id, device_id, method_id, ins| {
                let coordinator = Arc::clone(&coordinator);
                async move { coordinator.call(&device_id, &method_id, ins).await }
            })
            .await?;

        Ok(())
    }

    async fn initialize_driver(
        &self,
        products: Vec<Product>,
        devices: Vec<Device>,
    ) -> Result<(), DriverError> {
        for product in products {
            self.products.insert(product.id.clone(), product);
        }
        for device in devices {
            self.update_device(device).await?;
        }
        Ok(())
    }

    async fn update_product(self: &Arc<Self>, product: Product) -> Result<(), DriverError> {
        let product_id = product.id.clone();
        self.products.insert(product_id.clone(), product);

        let affected: Vec<Device> = self
            .devices
            .iter()
            .filter(|entry| entry.value().product_id == product_id)
            .map(|entry| entry.value().clone())
            .collect();
        for device in affected {
            if let Err(err) = self.activate_device(&device).await {
                tracing::error!(
                    device_id = %device.id, product_id = %product_id, error = %err,
                    "failed to reactivate device after product update"
                );
            }
        }
        Ok(())
    }

    async fn remove_product(self: &Arc<Self>, product_id: &str) -> Result<(), DriverError> {
        let affected: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|entry| entry.value().product_id == product_id)
            .map(|entry| entry.key().clone())
            .collect();
        for device_id in affected {
            if let Err(err) = self.deactivate_device(&device_id).await {
                tracing::error!(device_id = %device_id, product_id = %product_id, error = %err,
                    "failed to deactivate device after product removal");
            }
        }
        self.products.remove(product_id);
        Ok(())
    }

    async fn update_device(self: &Arc<Self>, device: Device) -> Result<(), DriverError> {
        self.activate_device(&device).await
    }

    async fn remove_device(self: &Arc<Self>, device_id: &str) -> Result<(), DriverError> {
        self.deactivate_device(device_id).await
    }

    async fn activate_all_devices(self: &Arc<Self>) {
        let devices: Vec<Device> = self.devices.iter().map(|entry| entry.value().clone()).collect();
        for device in devices {
            if let Err(err) = self.activate_device(&device).await {
                tracing::error!(device_id = %device.id, error = %err, "failed to activate device");
            }
        }
    }

    async fn deactivate_all_devices(self: &Arc<Self>) {
        let device_ids: Vec<DeviceId> = self.runners.iter().map(|entry| entry.key().clone()).collect();
        for device_id in device_ids {
            if let Err(err) = self.deactivate_device(&device_id).await {
                tracing::error!(device_id = %device_id, error = %err, "failed to deactivate device");
            }
        }
    }

    /// Idempotent: reactivating an already-active device stops it first.
    /// Skips activation entirely when the device record itself says
    /// `Disconnected` (spec §4.5 `activateDevice`).
    ///
    /// Builds and initializes the runner inline, then hands the rest to a
    /// background task: the pair is registered in the caches *before*
    /// `Start` runs, so an inbound operation arriving immediately after
    /// finds the runner, and a slow twin does not block other devices'
    /// activation (spec §4.5: "asynchronous per device").
    async fn activate_device(self: &Arc<Self>, device: &Device) -> Result<(), DriverError> {
        if self.runners.contains_key(&device.id) {
            self.deactivate_device(&device.id).await?;
        }
        if device.state == DeviceState::Disconnected {
            tracing::info!(device_id = %device.id, "skip activating disconnected device");
            self.devices.insert(device.id.clone(), device.clone());
            return Ok(());
        }

        let product = self
            .products
            .get(&device.product_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DriverError::NotFound(format!("product[{}] not in cache", device.product_id)))?;

        let twin = (self.twin_builder)(&product, device)?;
        let runner = TwinRunner::initialize(
            device.id.clone(),
            product,
            twin,
            self.options.clone(),
            self.props_tx.clone(),
            self.event_tx.clone(),
            self.status_tx.clone(),
        )
        .await?;

        let coordinator = Arc::clone(self);
        let device = device.clone();
        let scope = self.root_scope.child();
        tokio::spawn(async move {
            coordinator.devices.insert(device.id.clone(), device.clone());
            coordinator.runners.insert(device.id.clone(), runner.clone());
            if let Err(err) = runner.start(scope).await {
                tracing::error!(device_id = %device.id, error = %err, "failed to start twin runner");
                if !coordinator.options.device_auto_reconnect {
                    coordinator.runners.remove(&device.id);
                    coordinator.devices.remove(&device.id);
                }
            } else {
                tracing::info!(device_id = %device.id, "activated device");
            }
        });
        Ok(())
    }

    async fn deactivate_device(&self, device_id: &str) -> Result<(), DriverError> {
        if let Some((_, runner)) = self.runners.remove(device_id) {
            runner.stop(false).await?;
        }
        self.devices.remove(device_id);
        tracing::info!(device_id = %device_id, "deactivated device");
        Ok(())
    }

    fn runner(&self, device_id: &str) -> Result<Arc<TwinRunner>, DriverError> {
        self.runners
            .get(device_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DriverError::NotFound(format!("device[{device_id}] is not activated")))
    }

    async fn read(&self, device_id: &str, property_id: &str) -> Result<crate::value::Fields, DriverError> {
        self.runner(device_id)?.read(property_id).await
    }

    async fn hard_read(
        &self,
        device_id: &str,
        property_id: &str,
    ) -> Result<crate::value::Fields, DriverError> {
        self.runner(device_id)?.hard_read(property_id).await
    }

    async fn write(
        &self,
        device_id: &str,
        property_id: &str,
        values: crate::value::Fields,
    ) -> Result<(), DriverError> {
        self.runner(device_id)?.write(property_id, values).await
    }

    async fn call(
        &self,
        device_id: &str,
        method_id: &str,
        ins: crate::value::Fields,
    ) -> Result<crate::value::Fields, DriverError> {
        self.runner(device_id)?.call(method_id, ins).await
    }

    /// Publish `hello=true` once, then `hello=false` forever after, on the
    /// driver health-check interval (spec §4.5 `reportingDriverHealth`).
    async fn report_driver_health(self: Arc<Self>) {
        let interval = Duration::from_secs(self.options.driver_health_check_interval_second);
        let mut ticker = tokio::time::interval(interval);
        let mut hello = true;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = DriverStatus {
                        hello,
                        protocol_id: self.protocol.id.clone(),
                        state: DriverState::Running,
                        health_check_interval_second: self.options.driver_health_check_interval_second,
                    };
                    if let Err(err) = self.client.meta.publish_driver_status(&status).await {
                        tracing::error!(error = %err, "failed to publish driver status");
                    }
                    hello = false;
                }
                _ = self.root_scope.cancelled() => return,
            }
        }
    }

    /// Health-check every active device on a ticker and publish its status
    /// (spec §4.5 `reportingDevicesHealth`).
    async fn report_devices_health(self: Arc<Self>) {
        let interval = Duration::from_secs(self.options.device_health_check_interval_second);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let device_ids: Vec<DeviceId> =
                        self.runners.iter().map(|entry| entry.key().clone()).collect();
                    for device_id in device_ids {
                        let Ok(runner) = self.runner(&device_id) else { continue };
                        match runner.health_check().await {
                            Ok(status) => {
                                if let Err(err) = self.client.meta.publish_device_status(&status).await {
                                    tracing::error!(device_id = %device_id, error = %err,
                                        "failed to publish device status");
                                }
                            }
                            Err(err) => tracing::error!(device_id = %device_id, error = %err,
                                "failed to health-check device"),
                        }
                    }
                }
                _ = self.root_scope.cancelled() => return,
            }
        }
    }

    /// Drain the props/event channels fed by every runner's watchers and
    /// forward each batch to the operations client (spec §4.5
    /// `reportingDevicesData`).
    async fn fan_in_device_data(self: Arc<Self>) {
        let mut props_rx = self.props_rx.write().await.take().expect("fan-in started once");
        let mut event_rx = self.event_rx.write().await.take().expect("fan-in started once");
        loop {
            tokio::select! {
                Some(wrapper) = props_rx.recv() => {
                    if let Err(err) = self.client.data.publish_device_props(
                        &wrapper.product_id, &wrapper.device_id, &wrapper.func_id, wrapper.properties,
                    ).await {
                        tracing::error!(device_id = %wrapper.device_id, error = %err,
                            "failed to publish device props");
                    }
                }
                Some(wrapper) = event_rx.recv() => {
                    if let Err(err) = self.client.data.publish_device_event(
                        &wrapper.product_id, &wrapper.device_id, &wrapper.func_id, wrapper.properties,
                    ).await {
                        tracing::error!(device_id = %wrapper.device_id, error = %err,
                            "failed to publish device event");
                    }
                }
                _ = self.root_scope.cancelled() => return,
                else => return,
            }
        }
    }

    /// Drain status updates runners push on Start/Exception transitions and
    /// forward them as device status publishes (spec §4.4 `start`).
    async fn fan_in_device_status(self: Arc<Self>) {
        let mut status_rx = self.status_rx.write().await.take().expect("fan-in started once");
        loop {
            tokio::select! {
                Some(status) = status_rx.recv() => {
                    if let Err(err) = self.client.meta.publish_device_status(&status).await {
                        tracing::error!(device_id = %status.device_id, error = %err,
                            "failed to publish device status");
                    }
                }
                _ = self.root_scope.cancelled() => return,
                else => return,
            }
        }
    }
}
