use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminator of a channel binding (`is`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelIs {
    #[serde(rename = "routingKey")]
    RoutingKey,
    #[serde(rename = "queue")]
    Queue,
}

/// Broker object a channel maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Exchange,
    Queue,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::Queue => "queue",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation a channel is used for, derived from its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Publish,
    Subscribe,
}

impl OperationKind {
    /// Key of the operation object in the contract document
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        }
    }
}

/// `channels.<name>.bindings.amqp`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    pub is: ChannelIs,
    pub name: String,
    /// Exchange type (`direct`, `topic`, `fanout`, `headers`)
    #[serde(rename = "type", default)]
    pub exchange_type: Option<String>,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub exclusive: Option<bool>,
    #[serde(default = "default_vhost")]
    pub vhost: String,
}

fn default_vhost() -> String {
    "/".to_string()
}

impl ChannelBinding {
    /// `routingKey` channels are exchanges, everything else is a queue
    pub fn kind(&self) -> ChannelKind {
        match self.is {
            ChannelIs::RoutingKey => ChannelKind::Exchange,
            ChannelIs::Queue => ChannelKind::Queue,
        }
    }

    pub fn operation_kind(&self) -> OperationKind {
        match self.kind() {
            ChannelKind::Exchange => OperationKind::Publish,
            ChannelKind::Queue => OperationKind::Subscribe,
        }
    }
}

/// `channels.<name>.<operation>.bindings.amqp`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationBinding {
    #[serde(default = "default_ack")]
    pub ack: bool,
    #[serde(default)]
    pub mandatory: Option<bool>,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds
    #[serde(default)]
    pub expiration: Option<u64>,
    #[serde(default)]
    pub delivery_mode: Option<u8>,
    /// `<exchange-or-queue>|<routingKey>` binding rules
    #[serde(default)]
    pub cc: Vec<String>,
}

fn default_ack() -> bool {
    true
}

impl Default for OperationBinding {
    fn default() -> Self {
        Self {
            ack: default_ack(),
            mandatory: None,
            priority: None,
            expiration: None,
            delivery_mode: None,
            cc: Vec::new(),
        }
    }
}

/// `channels.<name>.<operation>.message.bindings.amqp`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBinding {
    #[serde(default)]
    pub content_encoding: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
}

/// One parsed `cc` rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcRule {
    pub partner: String,
    pub routing_key: String,
}

impl CcRule {
    pub fn parse(rule: &str) -> Option<Self> {
        let (partner, routing_key) = rule.split_once('|')?;
        if partner.is_empty() {
            return None;
        }
        Some(Self {
            partner: partner.to_string(),
            routing_key: routing_key.to_string(),
        })
    }
}
