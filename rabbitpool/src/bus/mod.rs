//! Message bus of one worker: inbound consumption, outbound publishing and
//! topology setup, all sharing the worker's single connector and contract.

pub mod inbound;
pub mod outbound;

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::broker::ConnectionFactory;
use crate::config::{BusSettings, Settings};
use crate::connector::Connector;
use crate::contract::ResolvedContract;
use crate::error::{PoolError, Result};
use crate::message::Envelope;
use crate::pool::ThreadConfiguration;
use crate::router::Router;
use crate::setup::Setup;
use crate::transformer::AmqpTransformer;

pub use inbound::{settlement, InboundBus, Settlement};
pub use outbound::{prepare_response, OutboundBus};

/// Per-worker bus; never shared across threads
#[derive(Debug)]
pub struct Bus {
    connector: Arc<Connector>,
    contract: Arc<ResolvedContract>,
    settings: BusSettings,
    inbound: InboundBus,
    outbound: OutboundBus,
    setup: Setup,
}

impl Bus {
    /// Load the contract and open the worker's broker connection
    pub async fn connect(settings: &Settings, factory: &dyn ConnectionFactory) -> Result<Self> {
        let contract = ResolvedContract::load(&settings.contract)?;
        let args = AmqpTransformer::to_connection_args(&settings.amqp);
        let connector = Connector::connect(&args, factory).await?;
        Ok(Self::new(connector, contract, settings))
    }

    pub fn new(connector: Connector, contract: ResolvedContract, settings: &Settings) -> Self {
        let connector = Arc::new(connector);
        let contract = Arc::new(contract);
        Self {
            inbound: InboundBus::new(connector.clone(), contract.clone(), settings.bus.clone()),
            outbound: OutboundBus::new(
                connector.clone(),
                contract.clone(),
                settings.app.clone(),
                settings.bus.confirm_timeout(),
            ),
            setup: Setup::new(connector.clone(), contract.clone()),
            settings: settings.bus.clone(),
            connector,
            contract,
        }
    }

    pub fn inbound(&self) -> &InboundBus {
        &self.inbound
    }

    pub fn outbound(&self) -> &OutboundBus {
        &self.outbound
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn contract(&self) -> &ResolvedContract {
        &self.contract
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Pump one delivery through `router` on behalf of `thread`
    pub async fn iterate(&self, router: &Router, thread: &ThreadConfiguration) -> Result<usize> {
        let context = Context::new(self, thread);
        self.inbound.iterate(router, &context).await
    }

    /// Stop consuming and close the connection
    pub async fn close(&self) -> Result<()> {
        self.inbound.stop().await;
        self.connector.disconnect().await
    }
}

/// What a handler can do with the bus while handling a message
pub struct Context<'a> {
    bus: &'a Bus,
    thread: &'a ThreadConfiguration,
}

impl<'a> Context<'a> {
    pub fn new(bus: &'a Bus, thread: &'a ThreadConfiguration) -> Self {
        Self { bus, thread }
    }

    pub fn bus(&self) -> &'a Bus {
        self.bus
    }

    pub fn thread(&self) -> &'a ThreadConfiguration {
        self.thread
    }

    /// Publish to a contract channel this thread may write to
    pub async fn publish(&self, message: &Envelope, channel: &str, routing_key: &str) -> Result<()> {
        if !self.thread.channels.is_empty() && !self.thread.channels.iter().any(|c| c == channel) {
            return Err(PoolError::ChannelNotAllowed {
                channel: channel.to_string(),
            });
        }
        self.bus
            .outbound
            .publish(message, channel, routing_key, None)
            .await
    }

    /// Publish a request and wait for its correlated reply on `reply_queue`.
    ///
    /// `reply_queue` is a contract channel or broker queue name. Yields
    /// `None` when no reply arrives within `timeout` (default: configured
    /// RPC timeout).
    pub async fn request(
        &self,
        message: Envelope,
        channel: &str,
        routing_key: &str,
        reply_queue: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Envelope>> {
        if !self.thread.rpc_allowed {
            return Err(PoolError::RpcNotAllowed);
        }

        let reply_to = self.bus.contract.partner_name(reply_queue).to_string();
        let message = message.with_reply_to(reply_to.clone());
        let correlation_id = message.correlation_id().map(str::to_string);
        self.publish(&message, channel, routing_key).await?;

        debug!(
            correlation_id = correlation_id.as_deref().unwrap_or_default(),
            "Waiting for reply on '{}'", reply_to
        );
        self.bus
            .inbound
            .get(
                &reply_to,
                correlation_id.as_deref(),
                timeout.unwrap_or(self.bus.settings.rpc_timeout()),
            )
            .await
    }
}
