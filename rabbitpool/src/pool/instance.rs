use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;
use uuid::Uuid;

use super::ThreadConfiguration;
use crate::broker::ConnectionFactory;
use crate::config::Settings;
use crate::error::{PoolError, Result};
use crate::ipc::{self, IpcChannel, IpcEnvelope};
use crate::router::Router;

/// Everything a freshly spawned unit needs, handed over by value
#[derive(Clone)]
pub struct StartupParameters {
    pub id: Uuid,
    pub settings: Arc<Settings>,
    pub thread: ThreadConfiguration,
    pub router: Router,
    pub factory: Arc<dyn ConnectionFactory>,
}

impl std::fmt::Debug for StartupParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartupParameters")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("router", &self.router)
            .finish()
    }
}

/// Entry point run on the spawned thread with the worker end of the IPC pair
pub type WorkerEntry = Arc<dyn Fn(StartupParameters, IpcChannel) + Send + Sync>;

/// Supervisor-side handle to one spawned unit
pub struct ThreadInstance {
    id: Uuid,
    config: ThreadConfiguration,
    channel: IpcChannel,
    handle: Option<JoinHandle<()>>,
    abort_sent: bool,
}

impl ThreadInstance {
    /// Start `entry` on a new named OS thread
    pub fn spawn(parameters: StartupParameters, entry: WorkerEntry) -> Result<Self> {
        let (supervisor, worker) = ipc::duplex();
        let id = parameters.id;
        let config = parameters.thread.clone();
        let name = thread_name(&config, id);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || entry(parameters, worker))
            .map_err(|e| PoolError::Spawn(format!("{}: {}", name, e)))?;

        debug!("Started thread {}", name);
        Ok(Self {
            id,
            config,
            channel: supervisor,
            handle: Some(handle),
            abort_sent: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ThreadConfiguration {
        &self.config
    }

    pub fn send(&self, envelope: IpcEnvelope) -> Result<()> {
        self.channel.send(envelope)
    }

    /// Ask the unit to stop; repeated requests are not resent
    pub fn abort(&mut self) -> Result<()> {
        if self.abort_sent {
            return Ok(());
        }
        self.channel.send(IpcEnvelope::abort())?;
        self.abort_sent = true;
        Ok(())
    }

    pub fn abort_sent(&self) -> bool {
        self.abort_sent
    }

    pub fn try_recv(&mut self) -> Result<Option<IpcEnvelope>> {
        self.channel.try_recv()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Close the IPC pair and hand back the thread handle for joining
    pub fn close(mut self) -> Option<JoinHandle<()>> {
        self.channel.close();
        self.handle.take()
    }
}

impl std::fmt::Debug for ThreadInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadInstance")
            .field("id", &self.id)
            .field("thread_type", &self.config.thread_type)
            .field("channel_name", &self.config.channel_name)
            .field("abort_sent", &self.abort_sent)
            .finish()
    }
}

fn thread_name(config: &ThreadConfiguration, id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("rabbitpool-{}-{}", config.thread_type, &simple[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::ipc::IpcMethod;

    fn parameters() -> StartupParameters {
        StartupParameters {
            id: Uuid::new_v4(),
            settings: Arc::new(Settings::default()),
            thread: ThreadConfiguration::worker("inbound/commands"),
            router: Router::default(),
            factory: Arc::new(MemoryBroker::new()),
        }
    }

    #[test]
    fn test_spawned_thread_is_named_and_talks_back() {
        let entry: WorkerEntry = Arc::new(|parameters, channel| {
            let name = thread::current().name().unwrap_or_default().to_string();
            assert!(name.starts_with("rabbitpool-worker-"));
            channel
                .send(IpcEnvelope::respawn().with_source(parameters.id.to_string()))
                .unwrap();
        });

        let mut instance = ThreadInstance::spawn(parameters(), entry).unwrap();
        let handle = loop {
            if let Some(envelope) = instance.try_recv().unwrap() {
                assert_eq!(envelope.method(), IpcMethod::Respawn);
                assert_eq!(envelope.source(), Some(instance.id().to_string().as_str()));
                break instance.close();
            }
            thread::sleep(std::time::Duration::from_millis(1));
        };

        handle.unwrap().join().unwrap();
    }

    #[test]
    fn test_abort_is_sent_once() {
        let entry: WorkerEntry = Arc::new(|_, mut channel| {
            let mut aborts = 0;
            while let Some(envelope) = channel.blocking_recv() {
                if envelope.method() == IpcMethod::Abort {
                    aborts += 1;
                    channel.send(IpcEnvelope::aborting()).ok();
                }
            }
            assert_eq!(aborts, 1);
        });

        let mut instance = ThreadInstance::spawn(parameters(), entry).unwrap();
        instance.abort().unwrap();
        instance.abort().unwrap();
        assert!(instance.abort_sent());

        while instance.try_recv().unwrap().is_none() {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        instance.close().unwrap().join().unwrap();
    }
}
