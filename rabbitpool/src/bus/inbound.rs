use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::Context;
use crate::broker::{BrokerChannel, Delivery, DeliveryStream, Qos};
use crate::config::BusSettings;
use crate::connector::Connector;
use crate::contract::{ResolvedChannel, ResolvedContract};
use crate::error::{PoolError, Result};
use crate::message::Envelope;
use crate::router::Router;
use crate::setup::close_quietly;
use crate::transformer::{AmqpTransformer, ConsumeArgs, ConsumeOptions};
use crate::worker::panic_message;

/// How a delivery is settled after handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
    /// Auto-acknowledged consume, nothing to settle
    Skip,
}

/// Settle a handled delivery. A failed delivery is requeued once; a failed
/// redelivery is dropped.
pub fn settlement(ack_mode: bool, redelivered: bool, handled: bool) -> Settlement {
    match (ack_mode, handled) {
        (false, _) => Settlement::Skip,
        (true, true) => Settlement::Ack,
        (true, false) => Settlement::Nack {
            requeue: !redelivered,
        },
    }
}

struct Consumer {
    channel: Box<dyn BrokerChannel>,
    stream: DeliveryStream,
    binding: ResolvedChannel,
}

/// Consumes deliveries and polls reply queues
pub struct InboundBus {
    connector: Arc<Connector>,
    contract: Arc<ResolvedContract>,
    settings: BusSettings,
    consumer: Mutex<Option<Consumer>>,
}

impl InboundBus {
    pub fn new(connector: Arc<Connector>, contract: Arc<ResolvedContract>, settings: BusSettings) -> Self {
        Self {
            connector,
            contract,
            settings,
            consumer: Mutex::new(None),
        }
    }

    /// Subscribe to a contract channel; `qos` defaults to the configured one
    pub async fn consume(&self, channel_name: &str, options: ConsumeOptions, qos: Option<Qos>) -> Result<()> {
        let binding = self.contract.channel(channel_name)?.clone();
        let args = AmqpTransformer::new(&binding).to_consume_args(options);
        let qos = qos.unwrap_or(self.settings.qos);

        let channel = self.connector.get_channel().await?;
        let stream = match subscribe(channel.as_ref(), &qos, &args).await {
            Ok(stream) => stream,
            Err(e) => {
                close_quietly(channel.as_ref()).await;
                return Err(e);
            }
        };

        info!(
            channel = channel_name,
            "🎧 Consuming '{}' (prefetch {}, ack {})",
            args.queue,
            qos.prefetch_count,
            !args.no_ack
        );

        let previous = self.consumer.lock().await.replace(Consumer {
            channel,
            stream,
            binding,
        });
        if let Some(previous) = previous {
            close_quietly(previous.channel.as_ref()).await;
        }
        Ok(())
    }

    pub async fn is_consuming(&self) -> bool {
        self.consumer.lock().await.is_some()
    }

    /// Wait briefly for one delivery and handle it.
    ///
    /// Returns the number of deliveries handled. Nothing arriving within the
    /// wait is normal. A heartbeat check always follows. A panicking handler
    /// has its delivery settled like any failure, then surfaces as
    /// [`PoolError::HandlerPanic`].
    pub async fn iterate(&self, router: &Router, context: &Context<'_>) -> Result<usize> {
        let handled = {
            let mut guard = self.consumer.lock().await;
            match guard.as_mut() {
                None => 0,
                Some(consumer) => {
                    match tokio::time::timeout(self.settings.iterate_wait(), consumer.stream.next()).await {
                        Err(_) => 0,
                        Ok(None) => {
                            return Err(PoolError::ConnectionClosed {
                                reason: format!("consumer of '{}' was cancelled", consumer.binding.name),
                            })
                        }
                        Ok(Some(Err(e))) => {
                            warn!(channel = %consumer.binding.name, "Delivery failed: {}", e);
                            0
                        }
                        Ok(Some(Ok(delivery))) => {
                            self.handle(&consumer.binding, delivery, router, context).await?;
                            1
                        }
                    }
                }
            }
        };

        self.connector.check_heartbeat().await?;
        Ok(handled)
    }

    async fn handle(
        &self,
        binding: &ResolvedChannel,
        delivery: Delivery,
        router: &Router,
        context: &Context<'_>,
    ) -> Result<()> {
        let redelivered = delivery.info.redelivered;
        let outcome = match Envelope::from_wire(delivery.message.clone(), Some(delivery.info.clone())) {
            Ok(envelope) => AssertUnwindSafe(self.route(envelope, router, context))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(PoolError::HandlerPanic(panic_message(payload.as_ref())))),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            error!(
                channel = %binding.name,
                delivery_tag = delivery.info.delivery_tag,
                redelivered,
                "Handling '{}' failed: {}",
                delivery.message.properties.kind.as_deref().unwrap_or_default(),
                e
            );
        }

        let settled = match settlement(binding.operation.ack, redelivered, outcome.is_ok()) {
            Settlement::Ack => delivery.ack().await,
            Settlement::Nack { requeue } => {
                debug!("Rejecting delivery {} (requeue: {})", delivery.info.delivery_tag, requeue);
                delivery.nack(requeue).await
            }
            Settlement::Skip => Ok(()),
        };
        if let Err(e) = settled {
            warn!(
                channel = %binding.name,
                delivery_tag = delivery.info.delivery_tag,
                "Failed to settle delivery: {}",
                e
            );
        }

        // a panicking handler leaves the worker in an unknown state
        match outcome {
            Err(panic @ PoolError::HandlerPanic(_)) => Err(panic),
            _ => Ok(()),
        }
    }

    async fn route(&self, envelope: Envelope, router: &Router, context: &Context<'_>) -> Result<()> {
        let request = envelope.clone();
        let Some(response) = router.dispatch(envelope, context).await? else {
            return Ok(());
        };

        if let Err(e) = context.bus().outbound().publish_response(response, &request).await {
            error!(
                correlation_id = request.correlation_id().unwrap_or_default(),
                "Failed to publish response: {}",
                e
            );
        }
        Ok(())
    }

    /// Poll a queue until a message with the wanted correlation id arrives.
    ///
    /// Non-matching messages are discarded. Returns `None` once `timeout`
    /// has elapsed without a match. `queue` may be a contract channel name
    /// or a broker queue name.
    pub async fn get(
        &self,
        queue: &str,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let queue = self.contract.partner_name(queue);
        let channel = self.connector.get_channel().await?;
        let result = self.poll(channel.as_ref(), queue, correlation_id, timeout).await;
        close_quietly(channel.as_ref()).await;
        result
    }

    async fn poll(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<Envelope>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = channel.basic_get(queue).await? {
                let wanted = correlation_id.map_or(true, |id| {
                    delivery.message.properties.correlation_id.as_deref() == Some(id)
                });
                if wanted {
                    delivery.ack().await?;
                    let envelope = Envelope::from_wire(delivery.message, Some(delivery.info))?;
                    return Ok(Some(envelope));
                }
                debug!(
                    "Discarding reply {:?} on '{}' while waiting for {:?}",
                    delivery.message.properties.correlation_id,
                    queue,
                    correlation_id
                );
                delivery.nack(false).await?;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No reply on '{}' within {:?}", queue, timeout);
                return Ok(None);
            }
            tokio::time::sleep(self.settings.rpc_poll_interval().min(deadline - now)).await;
        }
    }

    /// Cancel the consumer, if any
    pub async fn stop(&self) {
        if let Some(consumer) = self.consumer.lock().await.take() {
            close_quietly(consumer.channel.as_ref()).await;
        }
    }
}

async fn subscribe(
    channel: &dyn BrokerChannel,
    qos: &Qos,
    args: &ConsumeArgs,
) -> Result<DeliveryStream> {
    channel.basic_qos(qos).await?;
    channel.basic_consume(args).await
}

impl std::fmt::Debug for InboundBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundBus")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_requeues_once() {
        assert_eq!(settlement(true, false, true), Settlement::Ack);
        assert_eq!(settlement(true, false, false), Settlement::Nack { requeue: true });
        assert_eq!(settlement(true, true, false), Settlement::Nack { requeue: false });
        assert_eq!(settlement(true, true, true), Settlement::Ack);
    }

    #[test]
    fn test_settlement_without_ack_mode() {
        assert_eq!(settlement(false, false, false), Settlement::Skip);
        assert_eq!(settlement(false, true, true), Settlement::Skip);
    }
}
