use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, BrokerConnection, ConnectionFactory};
use crate::error::{PoolError, Result};
use crate::transformer::ConnectionArgs;

/// Owns the single physical broker connection of one worker.
///
/// Protocol channels are opened per operation with [`Connector::get_channel`]
/// and closed by the caller right after use. Heartbeats are driven by the
/// worker loop through [`Connector::check_heartbeat`]; nothing runs in the
/// background.
pub struct Connector {
    connection: Box<dyn BrokerConnection>,
    heartbeat: Duration,
    last_heartbeat: Mutex<Instant>,
    writing: AtomicBool,
    closed: AtomicBool,
}

impl Connector {
    /// Connect through the given factory using resolved connection arguments
    pub async fn connect(args: &ConnectionArgs, factory: &dyn ConnectionFactory) -> Result<Self> {
        let connection = factory.connect(args).await?;
        info!("🔌 Connected to {}", args.redacted_uri());
        Ok(Self::new(
            connection,
            Duration::from_secs(u64::from(args.heartbeat)),
        ))
    }

    /// Wrap an already open connection; a zero heartbeat disables heartbeat checks
    pub fn new(connection: Box<dyn BrokerConnection>, heartbeat: Duration) -> Self {
        Self {
            connection,
            heartbeat,
            last_heartbeat: Mutex::new(Instant::now()),
            writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a fresh protocol channel on the owned connection
    pub async fn get_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::ConnectionClosed {
                reason: "connector was disconnected".to_string(),
            });
        }
        let channel = self.connection.open_channel().await?;
        debug!("Opened protocol channel");
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connection.is_connected()
    }

    /// Mark the connection as busy writing until the guard is dropped
    pub fn writing(&self) -> WritingGuard<'_> {
        self.writing.store(true, Ordering::SeqCst);
        WritingGuard { connector: self }
    }

    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::SeqCst)
    }

    /// Emit a heartbeat when more than half the negotiated interval has passed.
    ///
    /// Does nothing while heartbeats are disabled or a publish is in flight.
    pub async fn check_heartbeat(&self) -> Result<()> {
        if self.heartbeat.is_zero() || self.is_writing() || self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut last = self.last_heartbeat.lock().await;
        if last.elapsed() > self.heartbeat / 2 {
            self.connection.heartbeat().await?;
            *last = Instant::now();
            debug!("💓 Heartbeat sent");
        }
        Ok(())
    }

    /// Close the connection; calling it again is a no-op
    pub async fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.connection.close().await {
            warn!("Error while closing broker connection: {}", e);
            return Err(e);
        }
        info!("Disconnected from broker");
        Ok(())
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("heartbeat", &self.heartbeat)
            .field("writing", &self.is_writing())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Clears the writing flag on drop
pub struct WritingGuard<'a> {
    connector: &'a Connector,
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.connector.writing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::AmqpSettings;
    use crate::transformer::AmqpTransformer;

    async fn connector(broker: &MemoryBroker, heartbeat: Duration) -> Connector {
        let args = AmqpTransformer::to_connection_args(&AmqpSettings::default());
        Connector::new(broker.connect(&args).await.unwrap(), heartbeat)
    }

    #[tokio::test]
    async fn test_heartbeat_disabled() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        connector.check_heartbeat().await.unwrap();
        assert_eq!(broker.heartbeats(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_after_half_interval() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, Duration::from_millis(40)).await;

        connector.check_heartbeat().await.unwrap();
        assert_eq!(broker.heartbeats(), 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        connector.check_heartbeat().await.unwrap();
        assert_eq!(broker.heartbeats(), 1);

        connector.check_heartbeat().await.unwrap();
        assert_eq!(broker.heartbeats(), 1);
    }

    #[tokio::test]
    async fn test_no_heartbeat_while_writing() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        {
            let _guard = connector.writing();
            connector.check_heartbeat().await.unwrap();
            assert_eq!(broker.heartbeats(), 0);
        }

        assert!(!connector.is_writing());
        connector.check_heartbeat().await.unwrap();
        assert_eq!(broker.heartbeats(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = MemoryBroker::new();
        let connector = connector(&broker, Duration::ZERO).await;
        connector.disconnect().await.unwrap();
        connector.disconnect().await.unwrap();
        assert!(!connector.is_connected());
        assert!(matches!(
            connector.get_channel().await,
            Err(PoolError::ConnectionClosed { .. })
        ));
    }
}
