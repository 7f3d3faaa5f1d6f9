//! Twin Runner (spec §4.4): the per-device orchestrator that builds and
//! initializes a user twin, starts it under a cancellable scope, schedules
//! periodic property polls, subscribes to product events, and serves
//! soft/hard reads, writes and method calls.
//!
//! Grounded in `original_source/internal/driver/twin_runner.go`'s
//! `twinRunner`, generalized from goroutines over a shared mutex to tasks
//! spawned against an `Arc<TwinRunner>` and a [`Scope`].

mod cache;

pub use cache::PropertyCache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::config::DriverOptions;
use crate::domain::device_data::DeviceDataWrapper;
use crate::domain::{
    DeviceId, DeviceState, DeviceStatus, EventId, MethodDescriptor, MethodId, Product,
    PropertyDescriptor, PropertyId, ReportMode, ALL_PROPERTIES,
};
use crate::error::DriverError;
use crate::scope::Scope;
use crate::twin::{EventSink, Twin};
use crate::value::{FieldValue, Fields};

/// A twin runner's lifecycle state (spec §4.4: New -> Initialized ->
/// Running -> Stopped, with Exception -> Running via auto-reconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    New,
    Initialized,
    Running,
    Stopped,
    Exception,
}

/// Parse a duration string like `"5s"`, `"500ms"` or `"1m"` the way the
/// original's `time.ParseDuration` does, for a property's periodic report
/// interval (spec §3 report mode `periodical`).
pub fn parse_interval(raw: &str) -> Result<Duration, DriverError> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| DriverError::DeviceTwin(format!("fail to parse the reporting interval: {raw}")))?;
    let (value, unit) = raw.split_at(split_at);
    let value: f64 = value
        .parse()
        .map_err(|_| DriverError::DeviceTwin(format!("fail to parse the reporting interval: {raw}")))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => {
            return Err(DriverError::DeviceTwin(format!(
                "unsupported interval unit: {other}"
            )))
        }
    };
    Ok(Duration::from_secs_f64(seconds.max(0.0)))
}

/// Per-device controller (spec §3 "Runner"). Owns the twin, the short-TTL
/// property cache and the group-by-interval poll scheduler.
pub struct TwinRunner {
    device_id: DeviceId,
    product: Product,
    twin: Mutex<Box<dyn Twin>>,

    properties: HashMap<PropertyId, PropertyDescriptor>,
    methods: HashMap<MethodId, MethodDescriptor>,
    watch_buckets: HashMap<Duration, Vec<PropertyId>>,
    property_cache: PropertyCache,

    props_tx: mpsc::Sender<DeviceDataWrapper>,
    event_tx: mpsc::Sender<DeviceDataWrapper>,
    status_tx: mpsc::Sender<DeviceStatus>,

    options: DriverOptions,
    state: RwLock<RunnerState>,
    scope: RwLock<Option<Scope>>,
}

impl TwinRunner {
    /// Build and initialize a twin for `device` against `product` (spec
    /// §4.4 "builds and initializes a user twin"). Leaves the runner in
    /// [`RunnerState::Initialized`]; call [`TwinRunner::start`] next.
    pub async fn initialize(
        device_id: DeviceId,
        product: Product,
        mut twin: Box<dyn Twin>,
        options: DriverOptions,
        props_tx: mpsc::Sender<DeviceDataWrapper>,
        event_tx: mpsc::Sender<DeviceDataWrapper>,
        status_tx: mpsc::Sender<DeviceStatus>,
    ) -> Result<Arc<Self>, DriverError> {
        twin.initialize().await?;

        let properties: HashMap<PropertyId, PropertyDescriptor> = product
            .properties
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        let methods: HashMap<MethodId, MethodDescriptor> = product
            .methods
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();

        let mut watch_buckets: HashMap<Duration, Vec<PropertyId>> = HashMap::new();
        for property in properties.values() {
            if let ReportMode::Periodical(interval) = &property.report_mode {
                let duration = parse_interval(interval)?;
                if duration.is_zero() {
                    continue;
                }
                watch_buckets.entry(duration).or_default().push(property.id.clone());
            }
        }

        let runner = Arc::new(Self {
            device_id,
            product,
            twin: Mutex::new(twin),
            properties,
            methods,
            watch_buckets,
            property_cache: PropertyCache::new(Duration::from_secs(
                options.property_cache_expiration_second,
            )),
            props_tx,
            event_tx,
            status_tx,
            options,
            state: RwLock::new(RunnerState::Initialized),
            scope: RwLock::new(None),
        });

        Ok(runner)
    }

    pub async fn state(&self) -> RunnerState {
        *self.state.read().await
    }

    /// Start the twin under a child of `parent_scope`, then schedule its
    /// watchers, event subscriptions and (if enabled) auto-reconnect.
    /// Mirrors `twinRunner.Start`/`start`.
    pub async fn start(self: &Arc<Self>, parent_scope: Scope) -> Result<(), DriverError> {
        if self.options.device_auto_reconnect {
            let runner = Arc::clone(self);
            let parent_scope = parent_scope.clone();
            tokio::spawn(async move { runner.auto_reconnect(parent_scope).await });
        }
        self.spawn_cache_janitor(parent_scope.clone());
        self.start_once(parent_scope).await
    }

    /// Sweep the property cache on `property_cache_cleanup_interval_second`
    /// for the lifetime of the runner (spec §3 "janitor interval"). Tied to
    /// `parent_scope` rather than the per-connection child scope so a
    /// reconnect doesn't spawn a second one.
    fn spawn_cache_janitor(self: &Arc<Self>, scope: Scope) {
        let runner = Arc::clone(self);
        let interval = Duration::from_secs(self.options.property_cache_cleanup_interval_second);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => runner.property_cache.sweep().await,
                    _ = scope.cancelled() => return,
                }
            }
        });
    }

    async fn start_once(self: &Arc<Self>, parent_scope: Scope) -> Result<(), DriverError> {
        let scope = parent_scope.child();
        *self.scope.write().await = Some(scope.clone());

        let start_result = self.twin.lock().await.start(scope.clone()).await;
        match start_result {
            Err(err) => {
                *self.state.write().await = RunnerState::Exception;
                let _ = self
                    .status_tx
                    .send(DeviceStatus {
                        device_id: self.device_id.clone(),
                        state: DeviceState::Exception,
                        state_detail: Some(err.to_string()),
                    })
                    .await;
                return Err(err);
            }
            Ok(()) => {
                *self.state.write().await = RunnerState::Running;
                let _ = self
                    .status_tx
                    .send(DeviceStatus {
                        device_id: self.device_id.clone(),
                        state: DeviceState::Connected,
                        state_detail: None,
                    })
                    .await;
            }
        }

        self.watch(scope.clone());
        self.subscribe_events(scope).await?;
        Ok(())
    }

    /// Stop the twin and cancel its scope. Idempotent: stopping an
    /// already-stopped runner is a no-op, mirroring the original's
    /// `defer cancel()` always running even on twin.Stop error.
    pub async fn stop(&self, force: bool) -> Result<(), DriverError> {
        let scope = self.scope.write().await.take();
        let result = self.twin.lock().await.stop(force).await;
        if let Some(scope) = scope {
            scope.cancel();
        }
        *self.state.write().await = RunnerState::Stopped;
        result
    }

    pub async fn health_check(&self) -> Result<DeviceStatus, DriverError> {
        self.twin.lock().await.health_check().await
    }

    /// Soft read: serve from the property cache. `property_id ==
    /// ALL_PROPERTIES` reads every property; any cache miss for any
    /// requested property fails the whole call with *NotReady* (spec §4.4).
    pub async fn read(&self, property_id: &str) -> Result<Fields, DriverError> {
        let ids: Vec<&str> = if property_id == ALL_PROPERTIES {
            self.properties.keys().map(String::as_str).collect()
        } else {
            if !self.properties.contains_key(property_id) {
                return Err(DriverError::BadRequest(format!(
                    "undefined property: {property_id}"
                )));
            }
            vec![property_id]
        };

        let mut values = Fields::new();
        for id in ids {
            let value = self
                .property_cache
                .get(id)
                .await
                .ok_or_else(|| DriverError::NotReady(format!("the property[{id}] hasn't been ready")))?;
            values.insert(id.to_string(), value);
        }
        Ok(values)
    }

    /// Hard read: round-trip to the real device via the twin, then refresh
    /// the cache entry for every property returned.
    pub async fn hard_read(&self, property_id: &str) -> Result<Fields, DriverError> {
        if property_id != ALL_PROPERTIES && !self.properties.contains_key(property_id) {
            return Err(DriverError::BadRequest(format!(
                "undefined property: {property_id}"
            )));
        }
        let values = self.twin.lock().await.read(&property_id.to_string()).await?;
        for (key, value) in &values {
            self.property_cache.set(key.clone(), value.clone()).await;
        }
        Ok(values)
    }

    /// Write `values` to the named property, after checking every field
    /// exists and is writeable (spec §4.4 "Validates every field"; edge case
    /// "write to a read-only property" fails with *BadRequest*, not
    /// *DeviceTwin* — a client-side rejection must not imply the Exception
    /// transition/auto-reconnect side effects `DeviceTwin` carries, spec §7).
    pub async fn write(&self, property_id: &str, values: Fields) -> Result<(), DriverError> {
        for field_id in values.keys() {
            let property = self
                .properties
                .get(field_id)
                .ok_or_else(|| DriverError::NotFound(format!("undefined property: {field_id}")))?;
            if !property.writeable {
                return Err(DriverError::BadRequest(format!(
                    "the property[{field_id}] is read only"
                )));
            }
        }
        self.twin.lock().await.write(&property_id.to_string(), values).await
    }

    /// Invoke a method, validating declared inputs before the call and
    /// declared outputs after it (spec §4.4 edge case "missing input").
    pub async fn call(&self, method_id: &str, ins: Fields) -> Result<Fields, DriverError> {
        let method = self
            .methods
            .get(method_id)
            .ok_or_else(|| DriverError::NotFound(format!("undefined method: {method_id}")))?;
        for input in &method.ins {
            if !ins.contains_key(&input.id) {
                return Err(DriverError::BadRequest(format!(
                    "missing method input: {}",
                    input.id
                )));
            }
        }

        let outs = self.twin.lock().await.call(&method_id.to_string(), ins).await?;
        for output in &method.outs {
            if !outs.contains_key(&output.id) {
                return Err(DriverError::BadRequest(format!(
                    "missing method output: {}",
                    output.id
                )));
            }
        }
        Ok(outs)
    }

    /// Spawn one watcher task per poll-interval bucket, each hard-reading
    /// its properties on its own ticker and queuing the batch onto the
    /// coordinator's props channel (spec §4.4, original's `watch`).
    fn watch(self: &Arc<Self>, scope: Scope) {
        for (duration, property_ids) in self.watch_buckets.clone() {
            let runner = Arc::clone(self);
            let scope = scope.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(duration);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let func_id = if property_ids.len() == 1 {
                                property_ids[0].clone()
                            } else {
                                ALL_PROPERTIES.to_string()
                            };
                            let mut properties = Fields::new();
                            for property_id in &property_ids {
                                match runner.hard_read(property_id).await {
                                    Ok(values) => properties.extend(values),
                                    Err(err) => tracing::error!(
                                        property = %property_id, error = %err,
                                        "watch: periodic hard read failed"
                                    ),
                                }
                            }
                            let wrapper = DeviceDataWrapper {
                                product_id: runner.product.id.clone(),
                                device_id: runner.device_id.clone(),
                                func_id,
                                properties,
                            };
                            let _ = runner.props_tx.send(wrapper).await;
                        }
                        _ = scope.cancelled() => return,
                    }
                }
            });
        }
    }

    /// Subscribe to every product event, forwarding samples to the
    /// coordinator's event channel until the scope is cancelled.
    async fn subscribe_events(self: &Arc<Self>, scope: Scope) -> Result<(), DriverError> {
        for event in self.product.events.clone() {
            let (tx, mut rx): (EventSink, _) = mpsc::channel(100);
            self.twin.lock().await.subscribe(&event.id, tx).await?;

            let runner = Arc::clone(self);
            let event_id = event.id.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(fields) = rx.recv() => {
                            let wrapper = DeviceDataWrapper {
                                product_id: runner.product.id.clone(),
                                device_id: runner.device_id.clone(),
                                func_id: event_id.clone(),
                                properties: fields,
                            };
                            let _ = runner.event_tx.send(wrapper).await;
                        }
                        _ = scope.cancelled() => return,
                        else => return,
                    }
                }
            });
        }
        Ok(())
    }

    /// On a ticker, health-check the twin and react to its reported
    /// state: stay running, stop outright on `Disconnected`, or restart
    /// on `Exception` (spec §4.4, original's `autoReconnect`).
    async fn auto_reconnect(self: Arc<Self>, parent_scope: Scope) {
        let interval = Duration::from_secs(self.options.device_auto_reconnect_interval_second);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = match self.health_check().await {
                        Ok(status) => status,
                        Err(_) => continue,
                    };
                    match status.state {
                        DeviceState::Connected | DeviceState::Reconnecting => continue,
                        DeviceState::Disconnected => {
                            let _ = self.stop(false).await;
                            return;
                        }
                        DeviceState::Exception => {
                            if let Err(err) = self.start_once(parent_scope.clone()).await {
                                tracing::error!(
                                    device_id = %self.device_id, error = %err,
                                    "auto-reconnect: failed to restart the twin runner"
                                );
                            }
                        }
                    }
                }
                _ = parent_scope.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldDescriptor;
    use async_trait::async_trait;

    #[test]
    fn parses_common_interval_suffixes() {
        assert_eq!(parse_interval("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_interval("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_interval("1m").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_unknown_units() {
        assert!(parse_interval("5x").is_err());
        assert!(parse_interval("garbage").is_err());
    }

    struct NoOpTwin;

    #[async_trait]
    impl Twin for NoOpTwin {
        async fn initialize(&mut self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn start(&mut self, _scope: Scope) -> Result<(), DriverError> {
            Ok(())
        }
        async fn stop(&mut self, _force: bool) -> Result<(), DriverError> {
            Ok(())
        }
        async fn health_check(&self) -> Result<DeviceStatus, DriverError> {
            unreachable!("not exercised by these tests")
        }
        async fn read(&self, _property_id: &PropertyId) -> Result<Fields, DriverError> {
            unreachable!("not exercised by these tests")
        }
        async fn write(&self, _property_id: &PropertyId, _values: Fields) -> Result<(), DriverError> {
            panic!("the runner must reject a read-only write before reaching the twin");
        }
        async fn subscribe(&mut self, _event_id: &EventId, _sink: EventSink) -> Result<(), DriverError> {
            Ok(())
        }
        async fn call(&self, _method_id: &MethodId, _ins: Fields) -> Result<Fields, DriverError> {
            unreachable!("not exercised by these tests")
        }
    }

    fn test_product() -> Product {
        Product {
            id: "p1".to_string(),
            protocol_id: "proto1".to_string(),
            name: "test product".to_string(),
            properties: vec![
                PropertyDescriptor {
                    id: "temp".to_string(),
                    name: "temperature".to_string(),
                    scalar_type: crate::domain::ScalarType::Float,
                    writeable: true,
                    report_mode: ReportMode::Mutated,
                    unit: None,
                },
                PropertyDescriptor {
                    id: "serial".to_string(),
                    name: "serial number".to_string(),
                    scalar_type: crate::domain::ScalarType::String,
                    writeable: false,
                    report_mode: ReportMode::Mutated,
                    unit: None,
                },
            ],
            events: vec![],
            methods: vec![MethodDescriptor {
                id: "reboot".to_string(),
                name: "reboot".to_string(),
                ins: vec![FieldDescriptor {
                    id: "delay".to_string(),
                    name: "delay".to_string(),
                    scalar_type: crate::domain::ScalarType::Int,
                }],
                outs: vec![],
            }],
        }
    }

    async fn test_runner() -> Arc<TwinRunner> {
        let (props_tx, _props_rx) = mpsc::channel(8);
        let (event_tx, _event_rx) = mpsc::channel(8);
        let (status_tx, _status_rx) = mpsc::channel(8);
        TwinRunner::initialize(
            "d1".to_string(),
            test_product(),
            Box::new(NoOpTwin),
            DriverOptions::default(),
            props_tx,
            event_tx,
            status_tx,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn write_to_read_only_property_fails_with_bad_request() {
        let runner = test_runner().await;
        let mut values = Fields::new();
        values.insert("serial".to_string(), FieldValue::String("abc".to_string()));

        let err = runner.write("serial", values).await.unwrap_err();
        assert!(matches!(err, DriverError::BadRequest(_)), "expected BadRequest, got {err:?}");
    }

    #[tokio::test]
    async fn write_validates_every_field_not_just_the_func_id() {
        let runner = test_runner().await;
        let mut values = Fields::new();
        values.insert("temp".to_string(), FieldValue::Float(21.0));
        values.insert("serial".to_string(), FieldValue::String("abc".to_string()));

        // func_id names the writeable property, but a read-only field
        // smuggled into the payload must still be rejected.
        let err = runner.write("temp", values).await.unwrap_err();
        assert!(matches!(err, DriverError::BadRequest(_)), "expected BadRequest, got {err:?}");
    }

    #[tokio::test]
    async fn write_to_undefined_property_fails_with_not_found() {
        let runner = test_runner().await;
        let mut values = Fields::new();
        values.insert("missing".to_string(), FieldValue::Float(1.0));

        let err = runner.write("missing", values).await.unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)), "expected NotFound, got {err:?}");
    }
}
