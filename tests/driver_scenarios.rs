//! End-to-end scenario tests (spec §8) driven against an in-memory message
//! bus double and a scripted twin, exercising the full register ->
//! activate -> poll/read/write/call path without a real broker or device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use edge_driver_sdk::bus::{Handler, MessageBus};
use edge_driver_sdk::config::DriverOptions;
use edge_driver_sdk::domain::device_data::DataOperation;
use edge_driver_sdk::domain::{
    Device, DeviceState, DeviceStatus, FieldDescriptor, MethodDescriptor, Product,
    PropertyDescriptor, Protocol, ReportMode,
};
use edge_driver_sdk::domain::ScalarType;
use edge_driver_sdk::envelope::Envelope;
use edge_driver_sdk::error::DriverError;
use edge_driver_sdk::scope::Scope;
use edge_driver_sdk::topic::{MetaMode, MetaOp, MetaType, Topic};
use edge_driver_sdk::twin::{EventSink, Twin, TwinBuilder};
use edge_driver_sdk::value::{decode_fields, encode_fields, FieldValue, Fields};
use edge_driver_sdk::DriverCoordinator;

const VERSION: &str = "v1";

/// An in-memory bus matching the segment-wildcard subscription grammar of
/// spec §4.1 (`#` in any position matches that one segment): unlike a real
/// NATS `#` (which only matches as a trailing token), this SDK's topics use
/// `#` per-segment, so a test double has to match the same way a
/// `bus::nats::NatsMessageBus` subscription would against those subjects.
#[derive(Default)]
struct FakeBus {
    routes: StdMutex<HashMap<String, Handler>>,
}

fn topic_matches(pattern: &str, subject: &str) -> bool {
    let p: Vec<&str> = pattern.split('/').collect();
    let s: Vec<&str> = subject.split('/').collect();
    p.len() == s.len() && p.iter().zip(s.iter()).all(|(a, b)| *a == "#" || a == b)
}

#[async_trait]
impl MessageBus for FakeBus {
    async fn is_connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), DriverError> {
        envelope.topic.require_publishable()?;
        let subject = envelope.topic.to_string();
        let handlers: Vec<Handler> = {
            let routes = self.routes.lock().unwrap();
            routes
                .iter()
                .filter(|(pattern, _)| topic_matches(pattern, &subject))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in handlers {
            handler(envelope.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String], handler: Handler) -> Result<(), DriverError> {
        let mut routes = self.routes.lock().unwrap();
        for pattern in patterns {
            routes.insert(pattern.clone(), handler.clone());
        }
        Ok(())
    }

    async fn unsubscribe(&self, patterns: &[String]) -> Result<(), DriverError> {
        let mut routes = self.routes.lock().unwrap();
        for pattern in patterns {
            routes.remove(pattern);
        }
        Ok(())
    }
}

/// A scripted twin standing in for a protocol implementation: reports a
/// single `temp` property, answers one method (`Intn`), optionally fails
/// `start`, and counts how many times `write` was actually invoked so
/// tests can assert the writeable guard short-circuits before reaching it.
struct ScriptedTwin {
    device_id: String,
    temp: Arc<AsyncMutex<f64>>,
    write_calls: Arc<AtomicU32>,
    fail_start: bool,
}

#[async_trait]
impl Twin for ScriptedTwin {
    async fn initialize(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn start(&mut self, _scope: Scope) -> Result<(), DriverError> {
        if self.fail_start {
            Err(DriverError::DeviceTwin("simulated connection failure".to_string()))
        } else {
            Ok(())
        }
    }

    async fn stop(&mut self, _force: bool) -> Result<(), DriverError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<DeviceStatus, DriverError> {
        Ok(DeviceStatus {
            device_id: self.device_id.clone(),
            state: DeviceState::Connected,
            state_detail: None,
        })
    }

    async fn read(&self, property_id: &String) -> Result<Fields, DriverError> {
        let mut fields = Fields::new();
        if property_id == "temp" || property_id == "*" {
            fields.insert("temp".to_string(), FieldValue::Float(*self.temp.lock().await));
        }
        Ok(fields)
    }

    async fn write(&self, _property_id: &String, _values: Fields) -> Result<(), DriverError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&mut self, _event_id: &String, _sink: EventSink) -> Result<(), DriverError> {
        Ok(())
    }

    async fn call(&self, method_id: &String, ins: Fields) -> Result<Fields, DriverError> {
        if method_id != "Intn" {
            return Err(DriverError::NotFound(format!("unknown method: {method_id}")));
        }
        let n = ins.get("n").and_then(FieldValue::as_f64).unwrap_or(0.0) as i64;
        let mut outs = Fields::new();
        outs.insert("v".to_string(), FieldValue::Int(n / 2));
        Ok(outs)
    }
}

fn temp_product(protocol_id: &str, writeable: bool) -> Product {
    Product {
        id: "P".to_string(),
        protocol_id: protocol_id.to_string(),
        name: "Thermostat".to_string(),
        properties: vec![PropertyDescriptor {
            id: "temp".to_string(),
            name: "Temperature".to_string(),
            scalar_type: ScalarType::Float,
            writeable,
            report_mode: ReportMode::Periodical("150ms".to_string()),
            unit: Some("celsius".to_string()),
        }],
        events: Vec::new(),
        methods: vec![MethodDescriptor {
            id: "Intn".to_string(),
            name: "Intn".to_string(),
            ins: vec![FieldDescriptor {
                id: "n".to_string(),
                name: "n".to_string(),
                scalar_type: ScalarType::Int,
            }],
            outs: vec![FieldDescriptor {
                id: "v".to_string(),
                name: "v".to_string(),
                scalar_type: ScalarType::Int,
            }],
        }],
    }
}

fn test_protocol(id: &str) -> Protocol {
    Protocol {
        id: id.to_string(),
        name: "Test Protocol".to_string(),
        category: "industrial".to_string(),
        capabilities: vec!["read".to_string(), "write".to_string()],
        device_props: Vec::new(),
        aux_props: Vec::new(),
    }
}

fn fast_options(auto_reconnect: bool) -> DriverOptions {
    DriverOptions {
        driver_health_check_interval_second: 60,
        device_health_check_interval_second: 60,
        protocol_register_interval_second: 1,
        device_auto_reconnect: auto_reconnect,
        device_auto_reconnect_interval_second: 60,
        property_cache_expiration_second: 30,
        property_cache_cleanup_interval_second: 60,
    }
}

/// Stand in for the device manager's registration responder: answers every
/// `protocol/create/request` with `{success: true}`, exactly the shape
/// `DriverMetaClient::register_protocol` expects back.
async fn install_register_responder(bus: Arc<dyn MessageBus>, protocol_id: &str) {
    let request_topic = Topic::meta(VERSION, MetaType::Protocol, MetaOp::Create, MetaMode::Request, protocol_id);
    let pattern = request_topic.to_string();
    let responder_bus = bus.clone();
    let handler: Handler = Arc::new(move |envelope: Envelope| {
        let bus = responder_bus.clone();
        tokio::spawn(async move {
            let mut fields = Fields::new();
            fields.insert("success".to_string(), FieldValue::Bool(true));
            if let Ok(response) = envelope.response(fields) {
                let _ = bus.publish(&response).await;
            }
        });
    });
    bus.subscribe(&[pattern], handler).await.unwrap();
}

#[derive(Serialize)]
struct InitPayload {
    products: Vec<Product>,
    devices: Vec<Device>,
}

async fn initialize_driver(bus: &Arc<dyn MessageBus>, protocol_id: &str, product: Product, device: Device) {
    let topic = Topic::meta(VERSION, MetaType::Protocol, MetaOp::Get, MetaMode::Request, protocol_id);
    let fields = encode_fields(&InitPayload {
        products: vec![product],
        devices: vec![device],
    })
    .unwrap();
    let request = Envelope::new(topic, fields);
    let response = bus.call(request, Duration::from_millis(500)).await.unwrap();
    assert!(!response.fields.contains_key("error"), "unexpected init error: {:?}", response.fields);
}

fn spawn_coordinator(
    protocol: Protocol,
    twin_builder: TwinBuilder,
    options: DriverOptions,
    bus: Arc<dyn MessageBus>,
) -> Arc<DriverCoordinator> {
    let coordinator = DriverCoordinator::new(protocol, twin_builder, options, bus, VERSION, Duration::from_millis(500));
    let serving = coordinator.clone();
    tokio::spawn(async move {
        let _ = serving.serve().await;
    });
    coordinator
}

async fn soft_read(bus: &Arc<dyn MessageBus>, device_id: &str) -> Fields {
    let topic = Topic::data(VERSION, "P", device_id, DataOperation::SoftReadReq, "temp");
    let response = bus
        .call(Envelope::new(topic, Fields::new()), Duration::from_millis(500))
        .await
        .unwrap();
    response.fields
}

#[tokio::test]
async fn periodic_watch_fills_cache_for_soft_reads() {
    let bus: Arc<dyn MessageBus> = Arc::new(FakeBus::default());
    let protocol = test_protocol("thermo");
    install_register_responder(bus.clone(), &protocol.id).await;

    let temp = Arc::new(AsyncMutex::new(21.5));
    let write_calls = Arc::new(AtomicU32::new(0));
    let temp_for_builder = temp.clone();
    let writes_for_builder = write_calls.clone();
    let twin_builder: TwinBuilder = Arc::new(move |_product, device| {
        Ok(Box::new(ScriptedTwin {
            device_id: device.id.clone(),
            temp: temp_for_builder.clone(),
            write_calls: writes_for_builder.clone(),
            fail_start: false,
        }) as Box<dyn Twin>)
    });

    let watch_topic = Topic::data(VERSION, "P", "D", DataOperation::Watch, "temp");
    let (watch_tx, mut watch_rx) = mpsc::channel::<Envelope>(8);
    let watch_handler: Handler = Arc::new(move |envelope| {
        let _ = watch_tx.try_send(envelope);
    });
    bus.subscribe(&[watch_topic.to_string()], watch_handler).await.unwrap();

    let _coordinator = spawn_coordinator(protocol.clone(), twin_builder, fast_options(true), bus.clone());

    let device = Device {
        id: "D".to_string(),
        product_id: "P".to_string(),
        props: HashMap::new(),
        state: DeviceState::Connected,
    };
    initialize_driver(&bus, &protocol.id, temp_product(&protocol.id, false), device).await;

    // Scenario 2 (spec §8): a soft read before any watch tick misses the cache.
    let before = soft_read(&bus, "D").await;
    assert!(before.get("error").is_some(), "expected NotReady before first tick: {before:?}");

    // Scenario 1 (spec §8): within 1.2s of init, at least one watch publish
    // with `temp` arrives.
    let published = tokio::time::timeout(Duration::from_millis(1200), watch_rx.recv())
        .await
        .expect("a watch publish within 1.2s")
        .expect("channel open");
    assert!(published.fields.contains_key("temp"));

    // Scenario 2 continued: the same soft read now succeeds from the cache
    // the watch tick just filled via a hard read.
    let after = soft_read(&bus, "D").await;
    assert!(after.get("error").is_none(), "expected a value after a tick: {after:?}");
    assert!(matches!(after.get("temp"), Some(FieldValue::Float(_))));
}

#[tokio::test]
async fn write_to_read_only_property_is_rejected_before_reaching_the_twin() {
    let bus: Arc<dyn MessageBus> = Arc::new(FakeBus::default());
    let protocol = test_protocol("thermo-ro");
    install_register_responder(bus.clone(), &protocol.id).await;

    let temp = Arc::new(AsyncMutex::new(20.0));
    let write_calls = Arc::new(AtomicU32::new(0));
    let temp_for_builder = temp.clone();
    let writes_for_builder = write_calls.clone();
    let twin_builder: TwinBuilder = Arc::new(move |_product, device| {
        Ok(Box::new(ScriptedTwin {
            device_id: device.id.clone(),
            temp: temp_for_builder.clone(),
            write_calls: writes_for_builder.clone(),
            fail_start: false,
        }) as Box<dyn Twin>)
    });

    let _coordinator = spawn_coordinator(protocol.clone(), twin_builder, fast_options(true), bus.clone());

    let device = Device {
        id: "D".to_string(),
        product_id: "P".to_string(),
        props: HashMap::new(),
        state: DeviceState::Connected,
    };
    initialize_driver(&bus, &protocol.id, temp_product(&protocol.id, false), device).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let topic = Topic::data(VERSION, "P", "D", DataOperation::WriteReq, "temp");
    let mut values = Fields::new();
    values.insert("temp".to_string(), FieldValue::Float(1.0));
    let response = bus
        .call(Envelope::new(topic, values), Duration::from_millis(500))
        .await
        .unwrap();

    let error = response.fields.get("error").and_then(FieldValue::as_str).unwrap_or("");
    assert!(error.contains("read only"), "unexpected error message: {error}");
    assert_eq!(write_calls.load(Ordering::SeqCst), 0, "twin.write must not be called");
}

#[tokio::test]
async fn method_call_succeeds_and_rejects_missing_input() {
    let bus: Arc<dyn MessageBus> = Arc::new(FakeBus::default());
    let protocol = test_protocol("thermo-method");
    install_register_responder(bus.clone(), &protocol.id).await;

    let temp = Arc::new(AsyncMutex::new(20.0));
    let write_calls = Arc::new(AtomicU32::new(0));
    let twin_builder: TwinBuilder = Arc::new(move |_product, device| {
        Ok(Box::new(ScriptedTwin {
            device_id: device.id.clone(),
            temp: temp.clone(),
            write_calls: write_calls.clone(),
            fail_start: false,
        }) as Box<dyn Twin>)
    });

    let _coordinator = spawn_coordinator(protocol.clone(), twin_builder, fast_options(true), bus.clone());

    let device = Device {
        id: "D".to_string(),
        product_id: "P".to_string(),
        props: HashMap::new(),
        state: DeviceState::Connected,
    };
    initialize_driver(&bus, &protocol.id, temp_product(&protocol.id, false), device).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let topic = Topic::data(VERSION, "P", "D", DataOperation::Request, "Intn");

    let mut ins = Fields::new();
    ins.insert("n".to_string(), FieldValue::Int(100));
    let response = bus
        .call(Envelope::new(topic.clone(), ins), Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(response.fields.get("v"), Some(&FieldValue::Int(50)));

    let missing_input = bus.call(Envelope::new(topic, Fields::new()), Duration::from_millis(500)).await;
    match missing_input {
        Err(DriverError::RemoteError(message)) => {
            assert!(message.contains("missing method input"), "unexpected message: {message}")
        }
        other => panic!("expected a RemoteError for the missing input, got {other:?}"),
    }
}

#[derive(Serialize)]
struct ProductPayload {
    product: Product,
}

#[tokio::test]
async fn product_removal_deactivates_every_device_of_that_product() {
    let bus: Arc<dyn MessageBus> = Arc::new(FakeBus::default());
    let protocol = test_protocol("thermo-remove");
    install_register_responder(bus.clone(), &protocol.id).await;

    let temp = Arc::new(AsyncMutex::new(20.0));
    let write_calls = Arc::new(AtomicU32::new(0));
    let twin_builder: TwinBuilder = Arc::new(move |_product, device| {
        Ok(Box::new(ScriptedTwin {
            device_id: device.id.clone(),
            temp: temp.clone(),
            write_calls: write_calls.clone(),
            fail_start: false,
        }) as Box<dyn Twin>)
    });

    let _coordinator = spawn_coordinator(protocol.clone(), twin_builder, fast_options(true), bus.clone());

    let product = temp_product(&protocol.id, false);
    let device = Device {
        id: "D".to_string(),
        product_id: "P".to_string(),
        props: HashMap::new(),
        state: DeviceState::Connected,
    };
    initialize_driver(&bus, &protocol.id, product.clone(), device).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Confirm the device is active before removal.
    let active = soft_read(&bus, "D").await;
    assert!(active.get("error").map_or(true, |e| !matches!(e, FieldValue::String(s) if s.contains("not activated"))));

    let remove_topic = Topic::meta(VERSION, MetaType::Product, MetaOp::Delete, MetaMode::Request, &protocol.id);
    let fields = encode_fields(&ProductPayload { product }).unwrap();
    bus.publish(&Envelope::new(remove_topic, fields)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let after_removal = soft_read(&bus, "D").await;
    let error = after_removal.get("error").and_then(FieldValue::as_str).unwrap_or("");
    assert!(error.contains("not activated"), "expected the runner to be gone: {after_removal:?}");
}

#[tokio::test]
async fn twin_start_failure_without_auto_reconnect_drops_the_device_and_reports_exception() {
    let bus: Arc<dyn MessageBus> = Arc::new(FakeBus::default());
    let protocol = test_protocol("thermo-fail");
    install_register_responder(bus.clone(), &protocol.id).await;

    let temp = Arc::new(AsyncMutex::new(20.0));
    let write_calls = Arc::new(AtomicU32::new(0));
    let twin_builder: TwinBuilder = Arc::new(move |_product, device| {
        Ok(Box::new(ScriptedTwin {
            device_id: device.id.clone(),
            temp: temp.clone(),
            write_calls: write_calls.clone(),
            fail_start: true,
        }) as Box<dyn Twin>)
    });

    let status_topic = Topic::meta(VERSION, MetaType::Device, MetaOp::Update, MetaMode::Response, "D");
    let (status_tx, mut status_rx) = mpsc::channel::<Envelope>(8);
    let status_handler: Handler = Arc::new(move |envelope| {
        let _ = status_tx.try_send(envelope);
    });
    bus.subscribe(&[status_topic.to_string()], status_handler).await.unwrap();

    // auto_reconnect = false: a failed Start must drop the device entirely.
    let _coordinator = spawn_coordinator(protocol.clone(), twin_builder, fast_options(false), bus.clone());

    let device = Device {
        id: "D".to_string(),
        product_id: "P".to_string(),
        props: HashMap::new(),
        state: DeviceState::Connected,
    };
    initialize_driver(&bus, &protocol.id, temp_product(&protocol.id, false), device).await;

    let status_envelope = tokio::time::timeout(Duration::from_millis(500), status_rx.recv())
        .await
        .expect("a device status publish")
        .expect("channel open");
    let status: DeviceStatus = decode_fields(&status_envelope.fields).unwrap();
    assert_eq!(status.state, DeviceState::Exception);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = soft_read(&bus, "D").await;
    let error = after.get("error").and_then(FieldValue::as_str).unwrap_or("");
    assert!(error.contains("not activated"), "expected no runner left in cache: {after:?}");
}
