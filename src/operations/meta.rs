//! Protocol/product/device lifecycle traffic (spec §5 meta operations).
//!
//! Grounded in `original_source/internal/operations/operation_protocol_register.go`,
//! `operation_protocol_unregister.go`, `operation_product_list.go` and
//! `meta_device_list.go` for the outbound `Call`-based half, and
//! `original_source/internal/driver/handle_operations_meta.go`'s
//! `subscribeMetaMutation` for the inbound subscribe-and-respond half.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{Handler, MessageBus};
use crate::domain::{Device, DeviceId, Product, ProductId, Protocol, ProtocolId};
use crate::envelope::Envelope;
use crate::error::DriverError;
use crate::topic::{MetaMode, MetaOp, MetaType, Topic};
use crate::value::{decode_fields, encode_fields, Fields};

#[derive(Debug, Serialize, Deserialize)]
struct RegisterProtocolRequest {
    protocol: Protocol,
}

#[derive(Debug, Serialize, Deserialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct UnregisterProtocolRequest {
    protocol_id: ProtocolId,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListProductsRequest {
    protocol_id: ProtocolId,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListProductsResponse {
    products: Vec<Product>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListDevicesRequest {
    product_id: ProductId,
}

#[derive(Debug, Serialize, Deserialize)]
struct ListDevicesResponse {
    devices: Vec<Device>,
}

/// Outbound meta traffic: the driver places every one of these as a
/// request/response `Call` (`client_service.go`'s `deviceService*` half).
pub struct DriverMetaClient {
    bus: Arc<dyn MessageBus>,
    version: String,
    call_timeout: Duration,
}

impl DriverMetaClient {
    pub fn new(bus: Arc<dyn MessageBus>, version: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            bus,
            version: version.into(),
            call_timeout,
        }
    }

    pub async fn register_protocol(&self, protocol: &Protocol) -> Result<(), DriverError> {
        let topic = Topic::meta(
            &self.version,
            MetaType::Protocol,
            MetaOp::Create,
            MetaMode::Request,
            protocol.id.clone(),
        );
        let request = Envelope::encode(topic, &RegisterProtocolRequest { protocol: protocol.clone() })?;
        let response = self.bus.call(request, self.call_timeout).await?;
        let parsed: SuccessResponse = response.decode()?;
        if !parsed.success {
            return Err(DriverError::RemoteError("failed to register protocol".to_string()));
        }
        Ok(())
    }

    pub async fn unregister_protocol(&self, protocol_id: &str) -> Result<(), DriverError> {
        let topic = Topic::meta(
            &self.version,
            MetaType::Protocol,
            MetaOp::Delete,
            MetaMode::Request,
            protocol_id,
        );
        let request = Envelope::encode(
            topic,
            &UnregisterProtocolRequest {
                protocol_id: protocol_id.to_string(),
            },
        )?;
        let response = self.bus.call(request, self.call_timeout).await?;
        let parsed: SuccessResponse = response.decode()?;
        if !parsed.success {
            return Err(DriverError::RemoteError("failed to unregister protocol".to_string()));
        }
        Ok(())
    }

    pub async fn list_products(&self, protocol_id: &str) -> Result<Vec<Product>, DriverError> {
        let topic = Topic::meta(
            &self.version,
            MetaType::Product,
            MetaOp::List,
            MetaMode::Request,
            protocol_id,
        );
        let request = Envelope::encode(
            topic,
            &ListProductsRequest {
                protocol_id: protocol_id.to_string(),
            },
        )?;
        let response = self.bus.call(request, self.call_timeout).await?;
        let parsed: ListProductsResponse = response.decode()?;
        Ok(parsed.products)
    }

    pub async fn list_devices(&self, product_id: &str) -> Result<Vec<Device>, DriverError> {
        let topic = Topic::meta(
            &self.version,
            MetaType::Device,
            MetaOp::List,
            MetaMode::Request,
            product_id,
        );
        let request = Envelope::encode(
            topic,
            &ListDevicesRequest {
                product_id: product_id.to_string(),
            },
        )?;
        let response = self.bus.call(request, self.call_timeout).await?;
        let parsed: ListDevicesResponse = response.decode()?;
        Ok(parsed.devices)
    }

    /// Fire-and-forget: the driver's own heartbeat (spec §4.5
    /// `reportingDriverHealth`). No response is expected, so this
    /// publishes rather than calls.
    pub async fn publish_driver_status(
        &self,
        status: &crate::domain::DriverStatus,
    ) -> Result<(), DriverError> {
        let topic = Topic::meta(
            &self.version,
            MetaType::Protocol,
            MetaOp::Update,
            MetaMode::Response,
            status.protocol_id.clone(),
        );
        let envelope = Envelope::encode(topic, status)?;
        self.bus.publish(&envelope).await
    }

    /// Fire-and-forget per-device health status (spec §4.5 `reportingDevicesHealth`).
    pub async fn publish_device_status(
        &self,
        status: &crate::domain::DeviceStatus,
    ) -> Result<(), DriverError> {
        let topic = Topic::meta(
            &self.version,
            MetaType::Device,
            MetaOp::Update,
            MetaMode::Response,
            status.device_id.clone(),
        );
        let envelope = Envelope::encode(topic, status)?;
        self.bus.publish(&envelope).await
    }
}

/// Inbound meta traffic: the driver stands these handlers up once at
/// startup and the device manager addresses them directly (spec §5,
/// `subscribeMetaMutation`).
pub struct DriverMetaService {
    bus: Arc<dyn MessageBus>,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct InitializeDriverRequest {
    products: Vec<Product>,
    devices: Vec<Device>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProductPayload {
    product: Product,
}

#[derive(Debug, Serialize, Deserialize)]
struct DevicePayload {
    device: Device,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceIdPayload {
    device_id: DeviceId,
}

impl DriverMetaService {
    pub fn new(bus: Arc<dyn MessageBus>, version: impl Into<String>) -> Self {
        Self {
            bus,
            version: version.into(),
        }
    }

    async fn subscribe_respond<Req, F, Fut>(
        &self,
        topic: Topic,
        handler: F,
    ) -> Result<(), DriverError>
    where
        Req: for<'de> Deserialize<'de> + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DriverError>> + Send + 'static,
    {
        let pattern = topic.to_string();
        let bus = self.bus.clone();
        let callback: Handler = Arc::new(move |envelope: Envelope| {
            let handler_result: Result<Req, DriverError> = decode_fields(&envelope.fields);
            let bus = bus.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let outcome = match handler_result {
                    Ok(request) => handler(request).await,
                    Err(err) => Err(err),
                };
                let fields = super::with_error_field(Fields::new(), outcome.as_ref().err());
                if let Ok(response) = envelope.response(fields) {
                    let _ = bus.publish(&response).await;
                }
            });
        });
        self.bus.subscribe(&[pattern], callback).await
    }

    /// Register the handler that receives the full product/device bootstrap
    /// payload once at startup (original's `InitializeDriverHandler`,
    /// reconstructed here against `MetaType::Protocol`/`Get` since the
    /// retrieved pack never defines this request's own wire schema).
    pub async fn initialize_driver_handler<F, Fut>(
        &self,
        protocol_id: &str,
        handler: F,
    ) -> Result<(), DriverError>
    where
        F: Fn(Vec<Product>, Vec<Device>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DriverError>> + Send + 'static,
    {
        let topic = Topic::meta(
            &self.version,
            MetaType::Protocol,
            MetaOp::Get,
            MetaMode::Request,
            protocol_id,
        );
        self.subscribe_respond::<InitializeDriverRequest, _, _>(topic, move |req| {
            handler(req.products, req.devices)
        })
        .await
    }

    /// Register the product update/remove handlers (original's
    /// `MutateProductHandler`).
    pub async fn mutate_product_handler<FU, FutU, FR, FutR>(
        &self,
        protocol_id: &str,
        on_update: FU,
        on_remove: FR,
    ) -> Result<(), DriverError>
    where
        FU: Fn(Product) -> FutU + Send + Sync + 'static,
        FutU: Future<Output = Result<(), DriverError>> + Send + 'static,
        FR: Fn(ProductId) -> FutR + Send + Sync + 'static,
        FutR: Future<Output = Result<(), DriverError>> + Send + 'static,
    {
        let update_topic = Topic::meta(
            &self.version,
            MetaType::Product,
            MetaOp::Update,
            MetaMode::Request,
            protocol_id,
        );
        self.subscribe_respond::<ProductPayload, _, _>(update_topic, move |payload| {
            on_update(payload.product)
        })
        .await?;

        let remove_topic = Topic::meta(
            &self.version,
            MetaType::Product,
            MetaOp::Delete,
            MetaMode::Request,
            protocol_id,
        );
        self.subscribe_respond::<ProductPayload, _, _>(remove_topic, move |payload| {
            on_remove(payload.product.id.clone())
        })
        .await
    }

    /// Register the device update/remove handlers (original's
    /// `MutateDeviceHandler`).
    pub async fn mutate_device_handler<FU, FutU, FR, FutR>(
        &self,
        protocol_id: &str,
        on_update: FU,
        on_remove: FR,
    ) -> Result<(), DriverError>
    where
        FU: Fn(Device) -> FutU + Send + Sync + 'static,
        FutU: Future<Output = Result<(), DriverError>> + Send + 'static,
        FR: Fn(DeviceId) -> FutR + Send + Sync + 'static,
        FutR: Future<Output = Result<(), DriverError>> + Send + 'static,
    {
        let update_topic = Topic::meta(
            &self.version,
            MetaType::Device,
            MetaOp::Update,
            MetaMode::Request,
            protocol_id,
        );
        self.subscribe_respond::<DevicePayload, _, _>(update_topic, move |payload| {
            on_update(payload.device)
        })
        .await?;

        let remove_topic = Topic::meta(
            &self.version,
            MetaType::Device,
            MetaOp::Delete,
            MetaMode::Request,
            protocol_id,
        );
        self.subscribe_respond::<DeviceIdPayload, _, _>(remove_topic, move |payload| {
            on_remove(payload.device_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_protocol_request_round_trips_through_fields() {
        let protocol = Protocol {
            id: "modbus".to_string(),
            name: "Modbus TCP".to_string(),
            category: "industrial".to_string(),
            capabilities: vec!["read".to_string(), "write".to_string()],
            device_props: Vec::new(),
            aux_props: Vec::new(),
        };
        let request = RegisterProtocolRequest { protocol };
        let fields = encode_fields(&request).unwrap();
        let back: RegisterProtocolRequest = decode_fields(&fields).unwrap();
        assert_eq!(back.protocol.id, "modbus");
    }
}
