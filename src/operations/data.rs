//! Property/event/method traffic (spec §5 data operations, §7 error
//! surfacing).
//!
//! Grounded in `original_source/internal/operations/device_property_read.go`,
//! `device_property_write.go`, `device_method_call.go`,
//! `device_event_receive.go` for the outbound half, and
//! `original_source/internal/driver/handle_operations_data.go`'s
//! `handleDataOperation` for the inbound subscribe-and-respond half.
//!
//! The two halves use different error-surfacing mechanisms (spec §9, an
//! open question resolved here): soft/hard read and write responses always
//! publish the ordinary `*-rsp` topic with an `error` field populated on
//! failure ([`super::with_error_field`]); only the method `Call` operation
//! uses the dedicated error topic
//! ([`crate::envelope::Envelope::error_response`]), since it alone has a
//! native `Request`/`Response`/`Error` topic triad (spec §4.1).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{Handler, MessageBus};
use crate::domain::device_data::DataOperation;
use crate::domain::{DeviceId, ProductId};
use crate::envelope::Envelope;
use crate::error::DriverError;
use crate::topic::{Topic, WILDCARD};
use crate::value::Fields;

fn data_parts(topic: &Topic) -> Option<(&str, &str, &str)> {
    match topic {
        Topic::Data {
            product_id,
            device_id,
            func_id,
            ..
        } => Some((product_id, device_id, func_id)),
        Topic::Meta { .. } => None,
    }
}

/// Outbound data traffic: the driver publishes property reports, events and
/// status samples it has no reply to wait for.
pub struct DriverDataClient {
    bus: Arc<dyn MessageBus>,
    version: String,
    #[allow(dead_code)]
    call_timeout: Duration,
}

impl DriverDataClient {
    pub fn new(bus: Arc<dyn MessageBus>, version: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            bus,
            version: version.into(),
            call_timeout,
        }
    }

    /// Publish a batch of property values read on the last poll tick or hard
    /// read (spec §4.4/§4.5 `reportingDevicesData`, the `propsBus` arm).
    pub async fn publish_device_props(
        &self,
        product_id: &str,
        device_id: &str,
        func_id: &str,
        properties: Fields,
    ) -> Result<(), DriverError> {
        let topic = Topic::data(&self.version, product_id, device_id, DataOperation::Watch, func_id);
        let envelope = Envelope::new(topic, properties);
        self.bus.publish(&envelope).await
    }

    /// Publish an event sample (spec §4.4/§4.5 `reportingDevicesData`, the
    /// `eventBus` arm).
    pub async fn publish_device_event(
        &self,
        product_id: &str,
        device_id: &str,
        func_id: &str,
        properties: Fields,
    ) -> Result<(), DriverError> {
        let topic = Topic::data(&self.version, product_id, device_id, DataOperation::Event, func_id);
        let envelope = Envelope::new(topic, properties);
        self.bus.publish(&envelope).await
    }
}

/// Inbound data traffic: the driver stands up one handler per operation for
/// the whole process, dispatching internally by product/device id carried
/// in the topic (original's `d.getRunner(deviceID)`).
pub struct DriverDataService {
    bus: Arc<dyn MessageBus>,
    version: String,
}

impl DriverDataService {
    pub fn new(bus: Arc<dyn MessageBus>, version: impl Into<String>) -> Self {
        Self {
            bus,
            version: version.into(),
        }
    }

    async fn subscribe_read<F, Fut>(&self, op: DataOperation, handler: F) -> Result<(), DriverError>
    where
        F: Fn(ProductId, DeviceId, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fields, DriverError>> + Send + 'static,
    {
        let topic = Topic::data(&self.version, WILDCARD, WILDCARD, op, WILDCARD);
        let pattern = topic.to_string();
        let bus = self.bus.clone();
        let callback: Handler = Arc::new(move |envelope: Envelope| {
            let Some((product_id, device_id, func_id)) = data_parts(&envelope.topic) else {
                return;
            };
            let (product_id, device_id, func_id) =
                (product_id.to_string(), device_id.to_string(), func_id.to_string());
            let bus = bus.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let outcome = handler(product_id, device_id, func_id).await;
                let fields = match &outcome {
                    Ok(fields) => fields.clone(),
                    Err(_) => Fields::new(),
                };
                let fields = super::with_error_field(fields, outcome.as_ref().err());
                if let Ok(response) = envelope.response(fields) {
                    let _ = bus.publish(&response).await;
                }
            });
        });
        self.bus.subscribe(&[pattern], callback).await
    }

    /// Register the soft-read handler (original's `handleRead`).
    pub async fn read_handler<F, Fut>(&self, handler: F) -> Result<(), DriverError>
    where
        F: Fn(ProductId, DeviceId, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fields, DriverError>> + Send + 'static,
    {
        self.subscribe_read(DataOperation::SoftReadReq, handler).await
    }

    /// Register the hard-read handler (original's `handleHardRead`).
    pub async fn hard_read_handler<F, Fut>(&self, handler: F) -> Result<(), DriverError>
    where
        F: Fn(ProductId, DeviceId, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fields, DriverError>> + Send + 'static,
    {
        self.subscribe_read(DataOperation::HardReadReq, handler).await
    }

    /// Register the write handler (original's `handleWrite`). The request's
    /// fields carry the values to write; the response carries no payload
    /// beyond the `error` field on failure.
    pub async fn write_handler<F, Fut>(&self, handler: F) -> Result<(), DriverError>
    where
        F: Fn(ProductId, DeviceId, String, Fields) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DriverError>> + Send + 'static,
    {
        let topic = Topic::data(&self.version, WILDCARD, WILDCARD, DataOperation::WriteReq, WILDCARD);
        let pattern = topic.to_string();
        let bus = self.bus.clone();
        let callback: Handler = Arc::new(move |envelope: Envelope| {
            let Some((product_id, device_id, func_id)) = data_parts(&envelope.topic) else {
                return;
            };
            let (product_id, device_id, func_id) =
                (product_id.to_string(), device_id.to_string(), func_id.to_string());
            let values = envelope.fields.clone();
            let bus = bus.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let outcome = handler(product_id, device_id, func_id, values).await;
                let fields = super::with_error_field(Fields::new(), outcome.as_ref().err());
                if let Ok(response) = envelope.response(fields) {
                    let _ = bus.publish(&response).await;
                }
            });
        });
        self.bus.subscribe(&[pattern], callback).await
    }

    /// Register the method-call handler (original's `handleCall`). Unlike
    /// read/write, a failure here publishes to the dedicated error topic
    /// instead of embedding an `error` field, since `Request`/`Response`
    /// carries no such field in its own schema.
    pub async fn call_handler<F, Fut>(&self, handler: F) -> Result<(), DriverError>
    where
        F: Fn(ProductId, DeviceId, String, Fields) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Fields, DriverError>> + Send + 'static,
    {
        let topic = Topic::data(&self.version, WILDCARD, WILDCARD, DataOperation::Request, WILDCARD);
        let pattern = topic.to_string();
        let bus = self.bus.clone();
        let callback: Handler = Arc::new(move |envelope: Envelope| {
            let Some((product_id, device_id, func_id)) = data_parts(&envelope.topic) else {
                return;
            };
            let (product_id, device_id, func_id) =
                (product_id.to_string(), device_id.to_string(), func_id.to_string());
            let ins = envelope.fields.clone();
            let bus = bus.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                match handler(product_id, device_id, func_id, ins).await {
                    Ok(outs) => {
                        if let Ok(response) = envelope.response(outs) {
                            let _ = bus.publish(&response).await;
                        }
                    }
                    Err(err) => {
                        if let Ok(response) = envelope.error_response(&err) {
                            let _ = bus.publish(&response).await;
                        }
                    }
                }
            });
        });
        self.bus.subscribe(&[pattern], callback).await
    }
}
