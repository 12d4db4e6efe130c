//! Worker pool daemon.
//!
//! Loads `rabbitpool.toml` (plus `RABBITPOOL_*` environment overrides),
//! registers the routers referenced by the topology and supervises the
//! pool until ctrl-c.
//!
//! ```text
//! cargo run --example worker_pool             # against the configured broker
//! cargo run --example worker_pool -- --memory # against an in-process broker
//! ```

use anyhow::Result;
use async_trait::async_trait;
use rabbitpool::{
    ConnectionFactory, Context, Envelope, LapinConnectionFactory, MemoryBroker, MessageHandler,
    Router, RouterRegistry, Settings, ThreadPoolManager,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Deserialize)]
struct CreateInvoice {
    order_id: String,
    amount_cents: u64,
}

#[derive(Debug, Serialize)]
struct InvoiceCreated {
    invoice_id: String,
    order_id: String,
}

/// Creates an invoice, announces it and answers the requester
struct CreateInvoiceHandler;

#[async_trait]
impl MessageHandler for CreateInvoiceHandler {
    async fn handle(&self, message: Envelope, context: &Context<'_>) -> rabbitpool::Result<Option<Envelope>> {
        let request: CreateInvoice = message.body_as()?;
        tracing::info!(
            "Creating invoice for order {} ({} cents)",
            request.order_id,
            request.amount_cents
        );

        let created = InvoiceCreated {
            invoice_id: uuid::Uuid::new_v4().to_string(),
            order_id: request.order_id,
        };
        let event = Envelope::with_payload("invoiceCreated", &created)?;
        context
            .publish(&event, "outbound/events", "billing.invoice.created")
            .await?;

        Ok(Some(Envelope::with_payload("invoice", &created)?))
    }

    fn name(&self) -> &str {
        "CreateInvoiceHandler"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worker_pool=debug,rabbitpool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    tracing::info!("Configuration loaded for {} {}", settings.app.id, settings.app.version);

    let billing = Router::builder()
        .route("createInvoice", CreateInvoiceHandler)
        .function("ping", |message| async move {
            tracing::debug!("ping {:?}", message.correlation_id());
            Ok(Some(Envelope::new()))
        })
        .build();
    let registry = RouterRegistry::new().with("billing", billing);

    let factory: Arc<dyn ConnectionFactory> = if std::env::args().any(|arg| arg == "--memory") {
        tracing::info!("Using the in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(LapinConnectionFactory::new(settings.app.id.clone()))
    };

    let mut manager = ThreadPoolManager::new(settings, registry, factory);
    manager.setup()?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, stopping workers");
            signal.store(true, Ordering::SeqCst);
        }
    });

    manager.start(stop).await?;
    Ok(())
}
