//! Analytics and commerce event payloads.

use serde_json::{json, Map, Value};

/// Events with service-defined names and semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardEvent {
    Purchase,
    AddToCart,
    ViewItem,
    CompleteRegistration,
    Login,
    Search,
    Share,
}

impl StandardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StandardEvent::Purchase => "PURCHASE",
            StandardEvent::AddToCart => "ADD_TO_CART",
            StandardEvent::ViewItem => "VIEW_ITEM",
            StandardEvent::CompleteRegistration => "COMPLETE_REGISTRATION",
            StandardEvent::Login => "LOGIN",
            StandardEvent::Search => "SEARCH",
            StandardEvent::Share => "SHARE",
        }
    }
}

/// One event to log against the attribution service.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    name: String,
    is_standard: bool,
    alias: Option<String>,
    revenue: Option<f64>,
    currency: Option<String>,
    properties: Map<String, Value>,
}

impl EventData {
    pub fn standard(event: StandardEvent) -> Self {
        Self {
            name: event.name().to_string(),
            is_standard: true,
            alias: None,
            revenue: None,
            currency: None,
            properties: Map::new(),
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_standard: false,
            alias: None,
            revenue: None,
            currency: None,
            properties: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Developer-facing alias reported alongside the canonical name.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn revenue(mut self, amount: f64, currency: impl Into<String>) -> Self {
        self.revenue = Some(amount);
        self.currency = Some(currency.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// Request body for the event-logging operation.
    pub fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("name".to_string(), json!(self.name));
        payload.insert(
            "is_standard_event".to_string(),
            json!(self.is_standard),
        );
        if let Some(ref alias) = self.alias {
            payload.insert("customer_event_alias".to_string(), json!(alias));
        }
        if self.revenue.is_some() || self.currency.is_some() {
            let mut commerce = Map::new();
            if let Some(revenue) = self.revenue {
                commerce.insert("revenue".to_string(), json!(revenue));
            }
            if let Some(ref currency) = self.currency {
                commerce.insert("currency".to_string(), json!(currency));
            }
            payload.insert("event_data".to_string(), Value::Object(commerce));
        }
        if !self.properties.is_empty() {
            payload.insert(
                "custom_data".to_string(),
                Value::Object(self.properties.clone()),
            );
        }
        Value::Object(payload)
    }
}
