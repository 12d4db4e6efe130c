//! Message envelope shared by the inbound and outbound bus.
//!
//! An [`Envelope`] keeps AMQP basic properties in a typed [`Properties`]
//! struct and the open-ended application headers in a separate map. On the
//! wire the headers travel as the `application_headers` property table.

pub mod codec;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::Result;
pub use codec::{Body, APPLICATION_GZIP, APPLICATION_JSON, TEXT_PLAIN};

/// Application header table (`application_headers` on the wire)
pub type Headers = BTreeMap<String, serde_json::Value>;

pub const HEADER_VERSION: &str = "version";
pub const HEADER_DATE_TIME: &str = "dateTime";
pub const HEADER_JOB_ID: &str = "jobId";
pub const HEADER_STATUS_CODE: &str = "statusCode";
pub const HEADER_STATUS_MESSAGE: &str = "statusMessage";

const DEFAULT_VERSION: &str = "1.0.0";
const PERSISTENT: u8 = 2;

/// AMQP basic properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Seconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub expiration: Option<String>,
    pub delivery_mode: Option<u8>,
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub reply_to: Option<String>,
    pub priority: Option<u8>,
    pub cluster_id: Option<String>,
}

/// Broker-side facts about an inbound message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Encoded message as it crosses the broker boundary
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessage {
    pub properties: Properties,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Message envelope used for all bus traffic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub properties: Properties,
    pub headers: Headers,
    pub body: Body,
    /// Present only on envelopes built from a delivery
    pub delivery: Option<DeliveryInfo>,
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}

impl Envelope {
    /// Create an outbound envelope with generated defaults
    pub fn new() -> Self {
        let now = Utc::now();
        let mut headers = Headers::new();
        headers.insert(HEADER_VERSION.to_string(), DEFAULT_VERSION.into());
        headers.insert(
            HEADER_DATE_TIME.to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
        );

        Self {
            properties: Properties {
                content_type: Some(APPLICATION_JSON.to_string()),
                content_encoding: Some("utf-8".to_string()),
                message_id: Some(Uuid::new_v4().to_string()),
                correlation_id: Some(Uuid::new_v4().to_string()),
                timestamp: u64::try_from(now.timestamp()).ok(),
                delivery_mode: Some(PERSISTENT),
                ..Properties::default()
            },
            headers,
            body: Body::Empty,
            delivery: None,
        }
    }

    /// Create an envelope carrying a structured body for the given operation
    pub fn with_payload(kind: impl Into<String>, payload: impl Serialize) -> Result<Self> {
        let mut envelope = Self::new().with_type(kind);
        envelope.set_body_json(&payload)?;
        Ok(envelope)
    }

    /// Rebuild an envelope from a wire message and its delivery facts.
    ///
    /// Missing identifiers are generated so that every envelope can be
    /// correlated, even when the publisher did not set them.
    pub fn from_wire(message: WireMessage, delivery: Option<DeliveryInfo>) -> Result<Self> {
        let mut properties = message.properties;
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }
        if properties.correlation_id.is_none() {
            properties.correlation_id = Some(Uuid::new_v4().to_string());
        }
        let content_type = properties
            .content_type
            .get_or_insert_with(|| APPLICATION_JSON.to_string())
            .clone();

        let body = codec::decode(&content_type, &message.body)?;

        Ok(Self {
            properties,
            headers: message.headers,
            body,
            delivery,
        })
    }

    /// Encode this envelope for publishing
    pub fn to_wire(&self) -> Result<WireMessage> {
        let body = codec::encode(self.content_type(), &self.body)?;
        Ok(WireMessage {
            properties: self.properties.clone(),
            headers: self.headers.clone(),
            body,
        })
    }

    pub fn content_type(&self) -> &str {
        self.properties
            .content_type
            .as_deref()
            .unwrap_or(APPLICATION_JSON)
    }

    /// Operation name carried in the `type` property
    pub fn kind(&self) -> Option<&str> {
        self.properties.kind.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    pub fn is_redelivered(&self) -> bool {
        self.delivery
            .as_ref()
            .map(|delivery| delivery.redelivered)
            .unwrap_or(false)
    }

    pub fn with_type(mut self, kind: impl Into<String>) -> Self {
        self.properties.kind = Some(kind.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Add an application header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get an application header
    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }

    pub fn job_id(&self) -> Option<&serde_json::Value> {
        self.header(HEADER_JOB_ID)
    }

    pub fn status_code(&self) -> Option<i64> {
        self.header(HEADER_STATUS_CODE).and_then(|value| value.as_i64())
    }

    pub fn status_message(&self) -> Option<&str> {
        self.header(HEADER_STATUS_MESSAGE).and_then(|value| value.as_str())
    }

    /// Replace the body with a serialized value
    pub fn set_body_json<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<()> {
        self.body = Body::Structured(serde_json::to_value(payload)?);
        Ok(())
    }

    /// Deserialize the body to a specific type
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.to_value()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_envelope_defaults() {
        let envelope = Envelope::new();

        assert!(Uuid::parse_str(envelope.message_id().unwrap()).is_ok());
        assert!(Uuid::parse_str(envelope.correlation_id().unwrap()).is_ok());
        assert_ne!(envelope.message_id(), envelope.correlation_id());
        assert_eq!(envelope.content_type(), APPLICATION_JSON);
        assert_eq!(envelope.properties.delivery_mode, Some(2));
        assert_eq!(envelope.header(HEADER_VERSION), Some(&json!("1.0.0")));
        assert!(envelope.header(HEADER_DATE_TIME).is_some());
        assert!(envelope.reply_to().is_none());
        assert!(!envelope.is_redelivered());
    }

    #[test]
    fn test_from_wire_generates_missing_ids() {
        let wire = WireMessage {
            properties: Properties {
                content_type: Some(APPLICATION_JSON.to_string()),
                kind: Some("doSomething".to_string()),
                ..Properties::default()
            },
            headers: Headers::new(),
            body: br#"{"id":7}"#.to_vec(),
        };
        let delivery = DeliveryInfo {
            delivery_tag: 3,
            redelivered: true,
            exchange: String::new(),
            routing_key: "inbound.commands".to_string(),
        };

        let envelope = Envelope::from_wire(wire, Some(delivery)).unwrap();
        assert!(envelope.correlation_id().is_some());
        assert!(envelope.message_id().is_some());
        assert!(envelope.is_redelivered());
        assert_eq!(envelope.kind(), Some("doSomething"));
        assert_eq!(envelope.body, Body::Structured(json!({"id": 7})));
    }

    #[test]
    fn test_from_wire_keeps_existing_ids() {
        let wire = WireMessage {
            properties: Properties {
                correlation_id: Some("abc-123".to_string()),
                message_id: Some("msg-1".to_string()),
                ..Properties::default()
            },
            ..WireMessage::default()
        };

        let envelope = Envelope::from_wire(wire, None).unwrap();
        assert_eq!(envelope.correlation_id(), Some("abc-123"));
        assert_eq!(envelope.message_id(), Some("msg-1"));
        assert_eq!(envelope.body, Body::Empty);
    }

    #[test]
    fn test_to_wire_rejects_unknown_content_type() {
        let envelope = Envelope::new()
            .with_content_type("application/xml")
            .with_body(Body::Text("<a/>".to_string()));
        assert!(envelope.to_wire().is_err());
    }

    #[test]
    fn test_typed_body_and_headers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Invoice {
            number: u32,
            total: f64,
        }

        let envelope = Envelope::with_payload("createInvoice", Invoice { number: 9, total: 12.5 })
            .unwrap()
            .with_header(HEADER_JOB_ID, "job-77")
            .with_header(HEADER_STATUS_CODE, 200)
            .with_header(HEADER_STATUS_MESSAGE, "OK");

        let invoice: Invoice = envelope.body_as().unwrap();
        assert_eq!(invoice, Invoice { number: 9, total: 12.5 });
        assert_eq!(envelope.job_id(), Some(&json!("job-77")));
        assert_eq!(envelope.status_code(), Some(200));
        assert_eq!(envelope.status_message(), Some("OK"));
    }
}
