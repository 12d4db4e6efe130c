//! Channel contract: parsing, schema validation and typed binding lookup.
//!
//! A contract is a declarative document (YAML or JSON) with one entry per
//! logical channel:
//!
//! ```yaml
//! channels:
//!   inbound/commands:
//!     bindings:
//!       amqp: { is: queue, name: inbound.commands, durable: true }
//!     subscribe:
//!       bindings:
//!         amqp: { ack: true, cc: ["outbound/events|commands.#"] }
//!       message:
//!         bindings:
//!           amqp: { contentEncoding: utf-8, messageType: command }
//! ```
//!
//! The channel binding discriminator `is` decides everything downstream: a
//! `routingKey` channel is an exchange used for `publish`, any other channel is
//! a queue used for `subscribe`.

pub mod binding;
pub mod validator;

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::ContractSettings;
use crate::error::{PoolError, Result};
pub use binding::{
    CcRule, ChannelBinding, ChannelIs, ChannelKind, MessageBinding, OperationBinding,
    OperationKind,
};
pub use validator::{validate, BindingKind, SchemaViolation};

/// Names of the protocol default exchange, never declared nor bound
pub const DEFAULT_EXCHANGE_NAMES: [&str; 2] = ["", "amqp/default"];

pub fn is_default_exchange(name: &str) -> bool {
    DEFAULT_EXCHANGE_NAMES.contains(&name)
}

/// All bindings of one contract channel
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChannel {
    /// Logical channel name in the contract
    pub name: String,
    pub channel: ChannelBinding,
    pub operation: OperationBinding,
    pub message: MessageBinding,
    pub cc: Vec<CcRule>,
}

impl ResolvedChannel {
    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    pub fn operation_kind(&self) -> OperationKind {
        self.channel.operation_kind()
    }

    /// Broker-side name of the exchange or queue
    pub fn broker_name(&self) -> &str {
        &self.channel.name
    }

    pub fn is_default_exchange(&self) -> bool {
        is_default_exchange(&self.name) || is_default_exchange(&self.channel.name)
    }
}

/// Read-only map of channel name to bindings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedContract {
    channels: BTreeMap<String, ResolvedChannel>,
}

impl ResolvedContract {
    /// Load, validate and resolve the contract named in the settings
    pub fn load(settings: &ContractSettings) -> Result<Self> {
        let document = load(settings)?;
        validate(&document, &settings.validator_dir, &settings.protocol)?;
        let contract = Self::resolve(&document, &settings.protocol)?;
        info!(
            "📜 Loaded contract '{}' with {} channel(s)",
            settings.name,
            contract.len()
        );
        Ok(contract)
    }

    /// Build typed bindings from an already validated document
    pub fn resolve(document: &Value, protocol: &str) -> Result<Self> {
        let channels = document
            .get("channels")
            .and_then(Value::as_object)
            .ok_or_else(|| PoolError::contract_parse("contract has no 'channels' object"))?;

        let mut resolved = BTreeMap::new();
        for (name, node) in channels {
            let raw_channel = validator::binding_object(Some(node), protocol);
            let channel: ChannelBinding = serde_json::from_value(raw_channel.clone())
                .map_err(|e| PoolError::contract_parse(format!("channel '{}': {}", name, e)))?;

            let operation_node = node.get(channel.operation_kind().as_str());
            let operation: OperationBinding =
                optional_binding(validator::binding_object(operation_node, protocol))
                    .map_err(|e| PoolError::contract_parse(format!("operation of '{}': {}", name, e)))?;
            let message: MessageBinding = optional_binding(validator::binding_object(
                operation_node.and_then(|op| op.get("message")),
                protocol,
            ))
            .map_err(|e| PoolError::contract_parse(format!("message of '{}': {}", name, e)))?;

            let cc = operation
                .cc
                .iter()
                .map(|rule| {
                    CcRule::parse(rule).ok_or_else(|| {
                        PoolError::contract_parse(format!(
                            "channel '{}' has malformed cc rule '{}'",
                            name, rule
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            debug!("Resolved channel '{}' as {} '{}'", name, channel.kind(), channel.name);
            resolved.insert(
                name.clone(),
                ResolvedChannel {
                    name: name.clone(),
                    channel,
                    operation,
                    message,
                    cc,
                },
            );
        }

        Ok(Self { channels: resolved })
    }

    /// Look up a channel, failing for names outside the contract
    pub fn channel(&self, name: &str) -> Result<&ResolvedChannel> {
        self.channels.get(name).ok_or_else(|| PoolError::UnknownChannel {
            channel: name.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedChannel> {
        self.channels.get(name)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ResolvedChannel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Broker name for a `cc` partner given as a contract channel name or a raw name
    pub fn partner_name<'a>(&'a self, partner: &'a str) -> &'a str {
        self.channels
            .get(partner)
            .map(|channel| channel.broker_name())
            .unwrap_or(partner)
    }
}

fn optional_binding<T: serde::de::DeserializeOwned + Default>(
    value: &Value,
) -> std::result::Result<T, serde_json::Error> {
    if value.is_null() {
        Ok(T::default())
    } else {
        serde_json::from_value(value.clone())
    }
}

/// Resolve the document path for the configured contract name
pub fn contract_path(settings: &ContractSettings) -> Result<PathBuf> {
    let source = settings.sources.get(&settings.name).ok_or_else(|| {
        PoolError::contract_parse(format!("no contract source named '{}'", settings.name))
    })?;
    let path = source.path.as_ref().ok_or_else(|| {
        PoolError::contract_parse(format!("contract '{}' has no source path", settings.name))
    })?;
    let definitions = source.definitions.as_ref().ok_or_else(|| {
        PoolError::contract_parse(format!("contract '{}' has no definitions", settings.name))
    })?;
    Ok(path.join(definitions))
}

/// Read and parse the configured contract document into a value tree
pub fn load(settings: &ContractSettings) -> Result<Value> {
    let path = contract_path(settings)?;
    let raw = std::fs::read_to_string(&path).map_err(|e| {
        PoolError::contract_parse(format!("cannot read {}: {}", path.display(), e))
    })?;
    let document: Value = serde_yaml::from_str(&raw).map_err(|e| {
        PoolError::contract_parse(format!("cannot parse {}: {}", path.display(), e))
    })?;

    if !document.is_object() {
        return Err(PoolError::contract_parse(format!(
            "{} does not contain a mapping",
            path.display()
        )));
    }

    debug!("Parsed contract document {}", path.display());
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContractSource;
    use std::path::Path;

    fn fixture_settings() -> ContractSettings {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        let mut settings = ContractSettings {
            name: "orders".to_string(),
            validator_dir: root.join("schemas"),
            ..ContractSettings::default()
        };
        settings.sources.insert(
            "orders".to_string(),
            ContractSource {
                path: Some(root.join("tests/fixtures")),
                definitions: Some("contract.yaml".to_string()),
            },
        );
        settings
    }

    #[test]
    fn test_load_fixture_contract() {
        let contract = ResolvedContract::load(&fixture_settings()).unwrap();

        let commands = contract.channel("inbound/commands").unwrap();
        assert_eq!(commands.kind(), ChannelKind::Queue);
        assert_eq!(commands.operation_kind(), OperationKind::Subscribe);
        assert!(commands.operation.ack);
        assert_eq!(commands.broker_name(), "inbound.commands");
        assert_eq!(commands.message.message_type.as_deref(), Some("command"));

        let events = contract.channel("outbound/events").unwrap();
        assert_eq!(events.kind(), ChannelKind::Exchange);
        assert_eq!(events.channel.exchange_type.as_deref(), Some("topic"));

        assert!(matches!(
            contract.channel("nope"),
            Err(PoolError::UnknownChannel { .. })
        ));
    }

    #[test]
    fn test_every_channel_kind_follows_discriminator() {
        let contract = ResolvedContract::load(&fixture_settings()).unwrap();
        for channel in contract.channels() {
            let expected = if channel.channel.is == ChannelIs::RoutingKey {
                "exchange"
            } else {
                "queue"
            };
            assert_eq!(channel.kind().as_str(), expected, "channel {}", channel.name);
        }
    }

    #[test]
    fn test_partner_name_resolution() {
        let contract = ResolvedContract::load(&fixture_settings()).unwrap();
        assert_eq!(contract.partner_name("outbound/events"), "events");
        assert_eq!(contract.partner_name("audit"), "audit");
    }

    #[test]
    fn test_missing_source_is_parse_error() {
        let mut settings = fixture_settings();
        settings.name = "unknown".to_string();
        assert!(matches!(load(&settings), Err(PoolError::ContractParse { .. })));

        let mut settings = fixture_settings();
        if let Some(source) = settings.sources.get_mut("orders") {
            source.definitions = None;
        }
        assert!(matches!(load(&settings), Err(PoolError::ContractParse { .. })));

        let mut settings = fixture_settings();
        if let Some(source) = settings.sources.get_mut("orders") {
            source.definitions = Some("missing.yaml".to_string());
        }
        assert!(matches!(load(&settings), Err(PoolError::ContractParse { .. })));
    }

    #[test]
    fn test_malformed_cc_rule_is_rejected() {
        let document = serde_json::json!({
            "channels": {
                "inbound/commands": {
                    "bindings": {"amqp": {"is": "queue", "name": "inbound.commands"}},
                    "subscribe": {"bindings": {"amqp": {"cc": ["no-separator"]}}}
                }
            }
        });
        assert!(matches!(
            ResolvedContract::resolve(&document, "amqp"),
            Err(PoolError::ContractParse { .. })
        ));
    }

    #[test]
    fn test_default_exchange_names() {
        assert!(is_default_exchange(""));
        assert!(is_default_exchange("amqp/default"));
        assert!(!is_default_exchange("events"));
    }
}
