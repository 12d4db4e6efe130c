//! Broker topology setup driven by the contract.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerChannel;
use crate::connector::Connector;
use crate::contract::{CcRule, ChannelKind, ResolvedChannel, ResolvedContract};
use crate::error::{PoolError, Result};
use crate::transformer::{AmqpTransformer, DeclareOptions};

/// Declares exchanges and queues and binds `cc` rules
#[derive(Debug, Clone)]
pub struct Setup {
    connector: Arc<Connector>,
    contract: Arc<ResolvedContract>,
}

impl Setup {
    pub fn new(connector: Arc<Connector>, contract: Arc<ResolvedContract>) -> Self {
        Self {
            connector,
            contract,
        }
    }

    /// Declare every contract channel, then bind every `cc` rule.
    ///
    /// With `passive` set, each declare first checks for an existing target
    /// and forces creation on a fresh channel when the check fails. Failures
    /// are logged and never returned.
    pub async fn setup(&self, passive: bool) {
        let mut declared = 0;
        for channel in self.contract.channels() {
            if channel.is_default_exchange() {
                continue;
            }
            match self.declare(channel, passive).await {
                Ok(()) => declared += 1,
                Err(e) => error!(
                    channel = %channel.name,
                    "Failed to declare {} '{}': {}",
                    channel.kind(),
                    channel.broker_name(),
                    e
                ),
            }
        }

        let mut bound = 0;
        for channel in self.contract.channels() {
            for rule in &channel.cc {
                match self.bind(channel, rule).await {
                    Ok(()) => bound += 1,
                    Err(e) => error!(
                        channel = %channel.name,
                        "Failed to bind '{}' with '{}': {}",
                        channel.broker_name(),
                        rule.partner,
                        e
                    ),
                }
            }
        }

        info!("🏗️ Setup declared {} channel(s) and {} binding(s)", declared, bound);
    }

    async fn declare(&self, channel: &ResolvedChannel, passive: bool) -> Result<()> {
        let check = self.connector.get_channel().await?;
        let result = declare_on(check.as_ref(), channel, DeclareOptions::passive(passive)).await;
        close_quietly(check.as_ref()).await;

        match result {
            Err(e) if passive => {
                debug!(
                    "Passive declare of '{}' failed ({}), forcing creation",
                    channel.broker_name(),
                    e
                );
                let retry = self.connector.get_channel().await?;
                let forced = declare_on(retry.as_ref(), channel, DeclareOptions::passive(false)).await;
                close_quietly(retry.as_ref()).await;
                forced
            }
            other => other,
        }
    }

    async fn bind(&self, channel: &ResolvedChannel, rule: &CcRule) -> Result<()> {
        let partner = self.contract.partner_name(&rule.partner);
        let broker_channel = self.connector.get_channel().await?;
        let result = match channel.kind() {
            ChannelKind::Queue => {
                broker_channel
                    .queue_bind(channel.broker_name(), partner, &rule.routing_key)
                    .await
            }
            ChannelKind::Exchange => {
                broker_channel
                    .exchange_bind(channel.broker_name(), partner, &rule.routing_key)
                    .await
            }
        };
        close_quietly(broker_channel.as_ref()).await;

        if result.is_ok() {
            debug!(
                "Bound {} '{}' to '{}' on '{}'",
                channel.kind(),
                channel.broker_name(),
                partner,
                rule.routing_key
            );
        }
        result
    }

    /// Purge a queue channel; exchanges and unknown names yield `false`
    pub async fn purge(&self, channel_name: &str) -> Result<bool> {
        let channel = match self.contract.channel(channel_name) {
            Ok(channel) if channel.kind() == ChannelKind::Queue => channel,
            Ok(_) | Err(PoolError::UnknownChannel { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let broker_channel = self.connector.get_channel().await?;
        let result = broker_channel.queue_purge(channel.broker_name()).await;
        close_quietly(broker_channel.as_ref()).await;

        let purged = result?;
        info!("Purged {} message(s) from '{}'", purged, channel.broker_name());
        Ok(true)
    }
}

async fn declare_on(
    broker_channel: &dyn BrokerChannel,
    channel: &ResolvedChannel,
    options: DeclareOptions,
) -> Result<()> {
    let transformer = AmqpTransformer::new(channel);
    match channel.kind() {
        ChannelKind::Exchange => {
            broker_channel
                .exchange_declare(&transformer.to_exchange_declare_args(options))
                .await
        }
        ChannelKind::Queue => {
            broker_channel
                .queue_declare(&transformer.to_queue_declare_args(options))
                .await
        }
    }
}

pub(crate) async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        warn!("Failed to close protocol channel: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionFactory, MemoryBroker};
    use crate::config::{AmqpSettings, ContractSettings, ContractSource};
    use crate::message::WireMessage;
    use std::path::Path;
    use std::time::Duration;

    fn contract() -> Arc<ResolvedContract> {
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
        Arc::new(ResolvedContract::load(&settings).unwrap())
    }

    async fn setup(broker: &MemoryBroker) -> Setup {
        let args = AmqpTransformer::to_connection_args(&AmqpSettings::default());
        let connection = broker.connect(&args).await.unwrap();
        Setup::new(Arc::new(Connector::new(connection, Duration::ZERO)), contract())
    }

    #[tokio::test]
    async fn test_setup_forces_missing_declares_and_binds_cc() {
        let broker = MemoryBroker::new();
        setup(&broker).await.setup(true).await;

        assert!(broker.has_exchange("events"));
        assert!(broker.has_exchange("audit"));
        assert!(broker.has_queue("inbound.commands"));
        assert!(broker.has_queue("rpc.replies"));
        assert!(!broker.has_exchange(""));

        assert!(broker.is_bound("events", "inbound.commands", "commands.#"));
        assert!(broker.is_bound("events", "audit", "#"));
    }

    #[tokio::test]
    async fn test_cc_partner_is_always_the_source() {
        let broker = MemoryBroker::new();
        setup(&broker).await.setup(true).await;

        assert!(broker.is_bound("events", "inbound.commands", "commands.#"));
        // `audit` carries "outbound/events|#", so events feeds audit
        assert!(broker.is_bound("events", "audit", "#"));
        assert!(!broker.is_bound("audit", "events", "#"));
    }

    #[tokio::test]
    async fn test_setup_is_repeatable() {
        let broker = MemoryBroker::new();
        let setup = setup(&broker).await;
        setup.setup(true).await;
        setup.setup(true).await;
        assert!(broker.has_queue("inbound.commands"));
    }

    #[tokio::test]
    async fn test_setup_swallows_failures() {
        let broker = MemoryBroker::new();
        let setup = setup(&broker).await;
        setup.connector.disconnect().await.unwrap();
        setup.setup(true).await;
        assert!(!broker.has_queue("inbound.commands"));
    }

    #[tokio::test]
    async fn test_purge_only_queues() {
        let broker = MemoryBroker::new();
        let setup = setup(&broker).await;
        setup.setup(true).await;
        broker.enqueue("inbound.commands", WireMessage::default());

        assert!(setup.purge("inbound/commands").await.unwrap());
        assert_eq!(broker.queue_depth("inbound.commands"), 0);
        assert!(!setup.purge("outbound/events").await.unwrap());
        assert!(!setup.purge("does/not/exist").await.unwrap());
    }
}
