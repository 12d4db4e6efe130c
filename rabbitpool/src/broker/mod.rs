//! Broker transport seam.
//!
//! The bus talks to the broker only through [`BrokerConnection`] and
//! [`BrokerChannel`]. [`amqp`] implements them on top of lapin and
//! [`memory`] provides an in-process broker with the same routing,
//! acknowledgement and confirm semantics for tests and local runs.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use std::fmt;

use crate::error::Result;
use crate::message::{DeliveryInfo, WireMessage};
use crate::transformer::{
    ConnectionArgs, ConsumeArgs, ExchangeDeclareArgs, PublishArgs, QueueDeclareArgs,
};

pub use crate::config::QosSettings as Qos;
pub use amqp::LapinConnectionFactory;
pub use memory::MemoryBroker;

/// Stream of deliveries produced by `basic_consume`
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Outstanding publisher confirm
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation>>;

/// Broker answer to a confirmed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Mandatory message could not be routed
    Returned,
    /// Channel is not in confirm mode
    NotRequested,
}

/// Settles one delivery
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Settles nothing; used for auto-acknowledged deliveries
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// A message handed out by the broker
pub struct Delivery {
    pub info: DeliveryInfo,
    pub message: WireMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(info: DeliveryInfo, message: WireMessage, acker: Box<dyn Acker>) -> Self {
        Self {
            info,
            message,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("info", &self.info)
            .field("message", &self.message)
            .finish()
    }
}

/// One physical broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new protocol channel
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    fn is_connected(&self) -> bool;

    /// Emit or verify a heartbeat on the connection
    async fn heartbeat(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One protocol channel on a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, args: &ExchangeDeclareArgs) -> Result<()>;

    async fn queue_declare(&self, args: &QueueDeclareArgs) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn exchange_bind(&self, destination: &str, source: &str, routing_key: &str) -> Result<()>;

    /// Returns the number of purged messages
    async fn queue_purge(&self, queue: &str) -> Result<u32>;

    async fn basic_qos(&self, qos: &Qos) -> Result<()>;

    async fn confirm_select(&self) -> Result<()>;

    /// Publish and hand back the pending broker confirmation
    async fn basic_publish(&self, args: &PublishArgs, message: WireMessage) -> Result<PendingConfirm>;

    async fn basic_consume(&self, args: &ConsumeArgs) -> Result<DeliveryStream>;

    /// Fetch one message without acknowledging it
    async fn basic_get(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn close(&self) -> Result<()>;
}

/// Opens broker connections for a worker
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, args: &ConnectionArgs) -> Result<Box<dyn BrokerConnection>>;
}
