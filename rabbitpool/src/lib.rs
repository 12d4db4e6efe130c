//! # RabbitPool - Contract-Driven AMQP Worker Pools
//!
//! RabbitPool runs AMQP microservice workers as supervised OS threads. Every
//! exchange, queue, QoS and publish argument comes from a schema-validated
//! channel contract instead of being hard-coded.
//!
//! - [`contract`] parses and validates the contract and resolves bindings
//! - [`transformer`] turns bindings into AMQP call arguments
//! - [`bus`] consumes, publishes with confirms and does RPC over AMQP
//! - [`pool`] spawns worker threads and supervises them over [`ipc`]
//! - [`worker`] is the loop each thread runs
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rabbitpool::{LapinConnectionFactory, Router, RouterRegistry, Settings, ThreadPoolManager};
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load()?;
//!
//!     let orders = Router::builder()
//!         .function("createOrder", |msg| async move {
//!             tracing::info!("creating order {:?}", msg.correlation_id());
//!             Ok(None)
//!         })
//!         .build();
//!     let registry = RouterRegistry::new().with("orders", orders);
//!
//!     let mut manager = ThreadPoolManager::new(
//!         settings,
//!         registry,
//!         Arc::new(LapinConnectionFactory::default()),
//!     );
//!     manager.setup()?;
//!     manager.start(Arc::new(AtomicBool::new(false))).await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod connector;
pub mod contract;
pub mod error;
pub mod ipc;
pub mod message;
pub mod pool;
pub mod router;
pub mod setup;
pub mod transformer;
pub mod worker;

pub use broker::{ConnectionFactory, LapinConnectionFactory, MemoryBroker};
pub use bus::{Bus, Context};
pub use config::Settings;
pub use connector::Connector;
pub use contract::ResolvedContract;
pub use error::{PoolError, Result};
pub use ipc::{IpcChannel, IpcEnvelope, IpcMethod};
pub use message::{Body, Envelope};
pub use pool::{StartupParameters, ThreadConfiguration, ThreadPoolManager, ThreadType};
pub use router::{FunctionHandler, MessageHandler, Router, RouterRegistry};
pub use worker::{run_worker_thread, WorkerExit};
