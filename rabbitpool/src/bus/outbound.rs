use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{BrokerChannel, Confirmation};
use crate::config::AppSettings;
use crate::connector::Connector;
use crate::contract::ResolvedContract;
use crate::error::{PoolError, Result};
use crate::message::{Envelope, WireMessage, HEADER_JOB_ID, HEADER_VERSION};
use crate::setup::close_quietly;
use crate::transformer::{AmqpTransformer, PublishArgs};

/// Publishes envelopes with broker confirmation
#[derive(Debug, Clone)]
pub struct OutboundBus {
    connector: Arc<Connector>,
    contract: Arc<ResolvedContract>,
    app: AppSettings,
    confirm_timeout: Duration,
}

impl OutboundBus {
    pub fn new(
        connector: Arc<Connector>,
        contract: Arc<ResolvedContract>,
        app: AppSettings,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            contract,
            app,
            confirm_timeout,
        }
    }

    /// Publish to a contract channel and wait for the broker confirm.
    ///
    /// `timeout` defaults to the configured confirm timeout. A confirm that
    /// does not arrive in time fails with [`PoolError::Timeout`].
    pub async fn publish(
        &self,
        message: &Envelope,
        channel_name: &str,
        routing_key: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let channel = self.contract.channel(channel_name)?;
        let transformer = AmqpTransformer::new(channel);
        let args = transformer.to_publish_args(Some(routing_key));

        let mut wire = message.to_wire()?;
        transformer.apply_message_defaults(&mut wire.properties);
        self.send(wire, &args, timeout.unwrap_or(self.confirm_timeout))
            .await?;

        debug!(
            channel = channel_name,
            correlation_id = message.correlation_id().unwrap_or_default(),
            "Published '{}' to '{}' with key '{}'",
            message.kind().unwrap_or_default(),
            args.exchange,
            args.routing_key
        );
        Ok(())
    }

    /// Send a handler result back to the requester.
    ///
    /// Returns `false` without publishing when the request has no `reply_to`.
    pub async fn publish_response(&self, response: Envelope, request: &Envelope) -> Result<bool> {
        let Some(reply_to) = request.reply_to() else {
            debug!("Request has no reply_to, dropping response");
            return Ok(false);
        };

        let response = prepare_response(response, request);
        let args = PublishArgs::direct_to_queue(reply_to);
        self.send(response.to_wire()?, &args, self.confirm_timeout)
            .await?;

        info!(
            correlation_id = response.correlation_id().unwrap_or_default(),
            "↩️ Sent '{}' to '{}'",
            response.kind().unwrap_or_default(),
            reply_to
        );
        Ok(true)
    }

    async fn send(&self, mut wire: WireMessage, args: &PublishArgs, timeout: Duration) -> Result<()> {
        if wire.properties.app_id.is_none() {
            wire.properties.app_id = Some(self.app.id.clone());
        }
        wire.headers
            .insert(HEADER_VERSION.to_string(), self.app.version.clone().into());

        let broker_channel = self.connector.get_channel().await?;
        let result = self
            .confirmed_publish(broker_channel.as_ref(), args, wire, timeout)
            .await;
        close_quietly(broker_channel.as_ref()).await;
        result
    }

    async fn confirmed_publish(
        &self,
        broker_channel: &dyn BrokerChannel,
        args: &PublishArgs,
        wire: WireMessage,
        timeout: Duration,
    ) -> Result<()> {
        let _writing = self.connector.writing();
        broker_channel.confirm_select().await?;
        let pending = broker_channel.basic_publish(args, wire).await?;

        let confirmation = tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| PoolError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;

        match confirmation {
            Confirmation::Ack | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack => Err(PoolError::PublishNacked {
                exchange: args.exchange.clone(),
                routing_key: args.routing_key.clone(),
            }),
            Confirmation::Returned => Err(PoolError::PublishReturned {
                exchange: args.exchange.clone(),
                routing_key: args.routing_key.clone(),
            }),
        }
    }
}

/// Stamp a handler result as the response to `request`
pub fn prepare_response(mut response: Envelope, request: &Envelope) -> Envelope {
    response.properties.kind = Some(format!("{}Response", request.kind().unwrap_or_default()));
    response.properties.correlation_id = request.properties.correlation_id.clone();
    if let Some(job_id) = request.job_id() {
        response
            .headers
            .insert(HEADER_JOB_ID.to_string(), job_id.clone());
    }
    response.properties.reply_to = None;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnectionFactory, MemoryBroker};
    use crate::config::{AmqpSettings, ContractSettings, ContractSource};
    use crate::setup::Setup;
    use std::path::Path;

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

    async fn outbound(broker: &MemoryBroker) -> OutboundBus {
        let args = AmqpTransformer::to_connection_args(&AmqpSettings::default());
        let connection = broker.connect(&args).await.unwrap();
        let connector = Arc::new(Connector::new(connection, Duration::ZERO));
        let contract = contract();
        Setup::new(connector.clone(), contract.clone()).setup(true).await;
        OutboundBus::new(
            connector,
            contract,
            AppSettings {
                id: "billing".to_string(),
                version: "2.1.0".to_string(),
            },
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_publish_applies_bindings() {
        let broker = MemoryBroker::new();
        let outbound = outbound(&broker).await;
        let message = Envelope::with_payload("orderCreated", serde_json::json!({"id": 7})).unwrap();

        outbound
            .publish(&message, "outbound/events", "commands.create", None)
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "events");
        assert_eq!(published[0].routing_key, "commands.create");
        assert_eq!(published[0].message.properties.priority, Some(5));
        assert_eq!(published[0].message.properties.app_id.as_deref(), Some("billing"));
        assert_eq!(
            published[0].message.headers.get(HEADER_VERSION),
            Some(&serde_json::json!("2.1.0"))
        );
        assert_eq!(broker.queue_depth("inbound.commands"), 1);
    }

    #[tokio::test]
    async fn test_publish_unknown_channel() {
        let broker = MemoryBroker::new();
        let outbound = outbound(&broker).await;
        let result = outbound
            .publish(&Envelope::new(), "nowhere", "", None)
            .await;
        assert!(matches!(result, Err(PoolError::UnknownChannel { .. })));
    }

    #[tokio::test]
    async fn test_publish_confirm_timeout_propagates() {
        let broker = MemoryBroker::new();
        let outbound = outbound(&broker).await;
        broker.withhold_confirms(true);

        let result = outbound
            .publish(
                &Envelope::new(),
                "outbound/events",
                "commands.create",
                Some(Duration::from_millis(20)),
            )
            .await;
        assert!(matches!(result, Err(PoolError::Timeout { timeout_ms: 20 })));
    }

    #[tokio::test]
    async fn test_response_without_reply_to_is_noop() {
        let broker = MemoryBroker::new();
        let outbound = outbound(&broker).await;
        let request = Envelope::new().with_type("doSomething");

        let sent = outbound
            .publish_response(Envelope::new(), &request)
            .await
            .unwrap();
        assert!(!sent);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_response_goes_to_reply_queue() {
        let broker = MemoryBroker::new();
        let outbound = outbound(&broker).await;
        let request = Envelope::new()
            .with_type("getInvoice")
            .with_reply_to("rpc.replies")
            .with_header(HEADER_JOB_ID, "job-42");

        let sent = outbound
            .publish_response(Envelope::new().with_reply_to("elsewhere"), &request)
            .await
            .unwrap();
        assert!(sent);

        let published = broker.published();
        assert_eq!(published[0].exchange, "");
        assert_eq!(published[0].routing_key, "rpc.replies");
        let properties = &published[0].message.properties;
        assert_eq!(properties.kind.as_deref(), Some("getInvoiceResponse"));
        assert_eq!(properties.correlation_id, request.properties.correlation_id);
        assert_eq!(properties.reply_to, None);
        assert_eq!(
            published[0].message.headers.get(HEADER_JOB_ID),
            Some(&serde_json::json!("job-42"))
        );
        assert_eq!(broker.queue_depth("rpc.replies"), 1);
    }
}
