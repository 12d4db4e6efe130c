//! Worker pool: topology, spawned thread instances and their supervisor.

pub mod instance;
pub mod manager;
pub mod topology;

pub use instance::{StartupParameters, ThreadInstance, WorkerEntry};
pub use manager::ThreadPoolManager;
pub use topology::{
    ChannelThreads, ThreadConfiguration, ThreadOverrides, ThreadTemplates, ThreadType,
    TopologyConfig,
};
