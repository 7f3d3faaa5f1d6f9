//! Product: the catalog of a device kind's properties, events and methods.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{EventId, MethodId, ProductId, PropertyId, ProtocolId, ScalarType};

/// How a property reports its value to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "interval")]
pub enum ReportMode {
    /// Reported on a fixed schedule; `interval` is a duration string such
    /// as `"5s"` or `"1m"`, parsed the same way `humantime`/`chrono`
    /// duration strings are (spec §3, §4.4).
    Periodical(String),
    /// Reported only when the underlying value changes.
    Mutated,
}

/// A single property's descriptor within a product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub id: PropertyId,
    pub name: String,
    pub scalar_type: ScalarType,
    pub writeable: bool,
    pub report_mode: ReportMode,
    pub unit: Option<String>,
}

/// An event's descriptor: the shape of the fields it carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub id: EventId,
    pub name: String,
    pub outs: Vec<FieldDescriptor>,
}

/// A method's descriptor: input and output field shapes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDescriptor {
    pub id: MethodId,
    pub name: String,
    pub ins: Vec<FieldDescriptor>,
    pub outs: Vec<FieldDescriptor>,
}

/// A single named, typed field of an event's output or a method's input/output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub id: String,
    pub name: String,
    pub scalar_type: ScalarType,
}

/// A product: the catalog of properties/events/methods a class of devices
/// exposes (spec §3). Cached by id by the coordinator; upserted on
/// `InitializeDriver` and product mutation add/update, removed (cascading
/// to device deactivation) on product delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub protocol_id: ProtocolId,
    pub name: String,
    pub properties: Vec<PropertyDescriptor>,
    pub events: Vec<EventDescriptor>,
    pub methods: Vec<MethodDescriptor>,
}

impl Product {
    /// Index properties by id for O(1) lookup, as the twin runner does on
    /// initialization (spec §4.4).
    pub fn properties_by_id(&self) -> HashMap<PropertyId, &PropertyDescriptor> {
        self.properties.iter().map(|p| (p.id.clone(), p)).collect()
    }

    /// Index methods by id for O(1) lookup.
    pub fn methods_by_id(&self) -> HashMap<MethodId, &MethodDescriptor> {
        self.methods.iter().map(|m| (m.id.clone(), m)).collect()
    }

    pub fn property(&self, id: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.id == id)
    }

    pub fn method(&self, id: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.id == id)
    }
}
