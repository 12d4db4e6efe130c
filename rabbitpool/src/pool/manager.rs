use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::instance::{StartupParameters, ThreadInstance, WorkerEntry};
use super::topology::{ThreadConfiguration, ThreadType};
use crate::broker::ConnectionFactory;
use crate::config::Settings;
use crate::error::{PoolError, Result};
use crate::ipc::{IpcEnvelope, IpcMethod};
use crate::router::{Router, RouterRegistry};
use crate::worker::run_worker_thread;

#[derive(Debug)]
enum PoolEvent {
    Envelope(Uuid, IpcEnvelope),
    /// Worker end dropped without a final envelope
    Disconnected(Uuid),
}

/// Spawns the thread topology and supervises it over IPC.
///
/// Termination is always cooperative: the supervisor sends `abort`, waits
/// for `aborting` and only then forgets the instance.
pub struct ThreadPoolManager {
    settings: Arc<Settings>,
    registry: RouterRegistry,
    factory: Arc<dyn ConnectionFactory>,
    entry: WorkerEntry,
    instances: HashMap<Uuid, ThreadInstance>,
    retired: Vec<JoinHandle<()>>,
    stopping: bool,
}

impl ThreadPoolManager {
    /// Manager running the standard worker loop on every thread
    pub fn new(settings: Settings, registry: RouterRegistry, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_entry(settings, registry, factory, Arc::new(run_worker_thread))
    }

    /// Manager running a custom thread entry point
    pub fn with_entry(
        settings: Settings,
        registry: RouterRegistry,
        factory: Arc<dyn ConnectionFactory>,
        entry: WorkerEntry,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
            factory,
            entry,
            instances: HashMap::new(),
            retired: Vec::new(),
            stopping: false,
        }
    }

    /// Spawn `minimum` instances of every enabled thread configuration
    pub fn setup(&mut self) -> Result<usize> {
        let mut spawned = 0;
        for configuration in self.settings.topology.thread_configurations() {
            if !configuration.enabled {
                debug!("Skipping disabled {} pool {}", configuration.thread_type, configuration.pool_key());
                continue;
            }
            for _ in 0..configuration.minimum {
                if self.spawn(configuration.clone())?.is_some() {
                    spawned += 1;
                }
            }
        }
        info!("🧵 Thread pool started with {} instance(s)", spawned);
        Ok(spawned)
    }

    /// Spawn one instance unless its pool is already at `maximum`
    pub fn spawn(&mut self, configuration: ThreadConfiguration) -> Result<Option<Uuid>> {
        let key = configuration.pool_key();
        let live = self.count_for(&key);
        if configuration.maximum > 0 && live >= configuration.maximum {
            warn!(
                "Pool {} is at its maximum of {} instance(s), not spawning",
                key, configuration.maximum
            );
            return Ok(None);
        }
        self.spawn_unchecked(configuration).map(Some)
    }

    fn spawn_unchecked(&mut self, configuration: ThreadConfiguration) -> Result<Uuid> {
        let router = self.router_for(&configuration)?;
        let id = Uuid::new_v4();
        let parameters = StartupParameters {
            id,
            settings: self.settings.clone(),
            thread: configuration,
            router,
            factory: self.factory.clone(),
        };

        let instance = ThreadInstance::spawn(parameters, self.entry.clone())?;
        info!(
            worker_id = %id,
            "Spawned {} thread for {}",
            instance.config().thread_type,
            instance.config().channel_name.as_deref().unwrap_or("-")
        );
        self.instances.insert(id, instance);
        Ok(id)
    }

    fn router_for(&self, configuration: &ThreadConfiguration) -> Result<Router> {
        if configuration.thread_type != ThreadType::Worker {
            return Ok(Router::default());
        }
        let handler = configuration
            .handler_name()
            .ok_or_else(|| PoolError::UnknownHandler {
                handler: String::new(),
            })?;
        self.registry.get(handler)
    }

    pub fn live_count(&self) -> usize {
        self.instances.len()
    }

    /// Live instances of one pool, see [`ThreadConfiguration::pool_key`]
    pub fn count_for(&self, pool_key: &str) -> usize {
        self.instances
            .values()
            .filter(|instance| instance.config().pool_key() == pool_key)
            .count()
    }

    pub fn instance_ids(&self) -> Vec<Uuid> {
        self.instances.keys().copied().collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Supervise until `stop` is raised and every instance has acknowledged its abort
    pub async fn start(&mut self, stop: Arc<AtomicBool>) -> Result<()> {
        let poll_timeout = self.settings.runtime.ipc_poll_timeout();
        loop {
            if !self.stopping && stop.load(Ordering::SeqCst) {
                self.begin_shutdown();
            }

            let events = self.poll_events();
            let idle = events.is_empty();
            for event in events {
                self.handle_event(event);
            }

            if self.stopping && self.instances.is_empty() {
                break;
            }
            if idle {
                tokio::time::sleep(poll_timeout).await;
            }
        }

        self.join_retired().await;
        info!("🛑 Thread pool stopped");
        Ok(())
    }

    fn begin_shutdown(&mut self) {
        info!("Stop requested, aborting {} instance(s)", self.instances.len());
        self.stopping = true;
        for instance in self.instances.values_mut() {
            if let Err(e) = instance.abort() {
                debug!(worker_id = %instance.id(), "Abort not delivered: {}", e);
            }
        }
    }

    fn poll_events(&mut self) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        for (id, instance) in self.instances.iter_mut() {
            loop {
                match instance.try_recv() {
                    Ok(Some(envelope)) => events.push(PoolEvent::Envelope(*id, envelope)),
                    Ok(None) => break,
                    Err(_) => {
                        events.push(PoolEvent::Disconnected(*id));
                        break;
                    }
                }
            }
        }
        events
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Envelope(id, envelope) => match envelope.method() {
                IpcMethod::Abort => {
                    if let Some(instance) = self.instances.get_mut(&id) {
                        debug!(worker_id = %id, "Worker asked to be stopped");
                        if let Err(e) = instance.abort() {
                            warn!(worker_id = %id, "Abort not delivered: {}", e);
                        }
                    }
                }
                IpcMethod::Aborting => {
                    debug!(worker_id = %id, "Worker acknowledged abort");
                    self.retire(id);
                }
                IpcMethod::Respawn => self.respawn(id),
            },
            PoolEvent::Disconnected(id) => {
                let Some(configuration) = self.instances.get(&id).map(|i| i.config().clone()) else {
                    return;
                };
                self.retire(id);
                if self.stopping {
                    return;
                }
                warn!(worker_id = %id, "Worker ended without notice, replacing it");
                if let Err(e) = self.spawn_unchecked(configuration) {
                    error!("Failed to replace worker {}: {}", id, e);
                }
            }
        }
    }

    fn respawn(&mut self, id: Uuid) {
        let Some(configuration) = self.instances.get(&id).map(|i| i.config().clone()) else {
            return;
        };
        if self.stopping {
            debug!(worker_id = %id, "Respawn requested during shutdown, retiring");
        } else {
            info!(worker_id = %id, "♻️ Respawning {} thread", configuration.thread_type);
            if let Err(e) = self.spawn_unchecked(configuration) {
                error!("Failed to respawn worker {}: {}", id, e);
            }
        }
        self.retire(id);
    }

    fn retire(&mut self, id: Uuid) {
        if let Some(instance) = self.instances.remove(&id) {
            if let Some(handle) = instance.close() {
                self.retired.push(handle);
            }
        }
    }

    async fn join_retired(&mut self) {
        let handles = std::mem::take(&mut self.retired);
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("A retired thread panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("Failed to join retired threads: {}", e);
        }
    }
}

impl std::fmt::Debug for ThreadPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolManager")
            .field("instances", &self.instances.len())
            .field("stopping", &self.stopping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::ipc::IpcChannel;
    use crate::pool::{ChannelThreads, ThreadOverrides, TopologyConfig};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn settings(minimum: usize, maximum: usize) -> Settings {
        let mut settings = Settings::default();
        settings.runtime.ipc_poll_timeout_ms = 5;
        settings.topology = TopologyConfig {
            channels: vec![ChannelThreads {
                channel_name: "inbound/commands".to_string(),
                overrides: ThreadOverrides {
                    handler: Some("billing".to_string()),
                    minimum: Some(minimum),
                    maximum: Some(maximum),
                    ..ThreadOverrides::default()
                },
            }],
            ..TopologyConfig::default()
        };
        settings
    }

    fn registry() -> RouterRegistry {
        RouterRegistry::new().with("billing", Router::default())
    }

    /// Worker that acknowledges `abort` and exits
    fn obedient(channel: &mut IpcChannel) {
        while let Some(envelope) = channel.blocking_recv() {
            if envelope.method() == IpcMethod::Abort {
                channel.send(IpcEnvelope::aborting()).ok();
                return;
            }
        }
    }

    fn manager(settings: Settings, entry: WorkerEntry) -> ThreadPoolManager {
        ThreadPoolManager::with_entry(settings, registry(), Arc::new(MemoryBroker::new()), entry)
    }

    fn stop_after(delay: Duration) -> Arc<AtomicBool> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
        });
        stop
    }

    #[tokio::test]
    async fn test_stop_aborts_every_instance() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        let entry: WorkerEntry = Arc::new(move |_, mut channel| {
            counter.fetch_add(1, Ordering::SeqCst);
            obedient(&mut channel);
        });

        let mut manager = manager(settings(3, 0), entry);
        assert_eq!(manager.setup().unwrap(), 3);
        manager.start(stop_after(Duration::from_millis(30))).await.unwrap();

        assert_eq!(manager.live_count(), 0);
        assert_eq!(spawned.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_respawn_starts_exactly_one_replacement() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        let entry: WorkerEntry = Arc::new(move |parameters, mut channel| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                assert_eq!(parameters.thread.channel_name.as_deref(), Some("inbound/commands"));
                channel.send(IpcEnvelope::respawn()).ok();
                return;
            }
            obedient(&mut channel);
        });

        let mut manager = manager(settings(1, 1), entry);
        manager.setup().unwrap();
        manager.start(stop_after(Duration::from_millis(60))).await.unwrap();

        assert_eq!(spawned.load(Ordering::SeqCst), 2);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_exit_is_replaced() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        let entry: WorkerEntry = Arc::new(move |_, mut channel| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return;
            }
            obedient(&mut channel);
        });

        let mut manager = manager(settings(1, 0), entry);
        manager.setup().unwrap();
        manager.start(stop_after(Duration::from_millis(60))).await.unwrap();

        assert_eq!(spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_worker_requested_abort() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = spawned.clone();
        let entry: WorkerEntry = Arc::new(move |_, mut channel| {
            counter.fetch_add(1, Ordering::SeqCst);
            channel.send(IpcEnvelope::abort()).ok();
            obedient(&mut channel);
        });

        let mut manager = manager(settings(1, 0), entry);
        manager.setup().unwrap();
        manager.start(stop_after(Duration::from_millis(60))).await.unwrap();

        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_maximum_caps_instances() {
        let entry: WorkerEntry = Arc::new(|_, mut channel| obedient(&mut channel));
        let mut manager = manager(settings(3, 2), entry);

        assert_eq!(manager.setup().unwrap(), 2);
        assert_eq!(manager.count_for("worker:inbound/commands"), 2);

        manager.start(Arc::new(AtomicBool::new(true))).await.unwrap();
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn test_unknown_handler_is_refused() {
        let entry: WorkerEntry = Arc::new(|_, mut channel| obedient(&mut channel));
        let mut manager = ThreadPoolManager::with_entry(
            settings(1, 0),
            RouterRegistry::new(),
            Arc::new(MemoryBroker::new()),
            entry,
        );

        assert!(matches!(manager.setup(), Err(PoolError::UnknownHandler { .. })));
        assert_eq!(manager.live_count(), 0);
    }
}
