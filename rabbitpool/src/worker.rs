use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::error::{PoolError, Result};
use crate::ipc::{IpcChannel, IpcEnvelope, IpcMethod};
use crate::pool::{StartupParameters, ThreadType};
use crate::transformer::ConsumeOptions;

/// Why a worker loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// `abort` received and acknowledged with `aborting`
    Aborted,
    /// The worker wants to be replaced
    Respawn(String),
    /// The supervisor end of the IPC pair is gone
    SupervisorGone,
}

/// Thread entry point used by the pool manager.
///
/// Builds a private current-thread runtime, runs the worker loop and makes
/// sure the supervisor hears about the end of the worker: errors and panics
/// become a `respawn` request.
pub fn run_worker_thread(parameters: StartupParameters, mut channel: IpcChannel) {
    let id = parameters.id;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<WorkerExit> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(WorkerRuntime::new(&parameters).run(&mut channel))
    }));

    let exit = match outcome {
        Ok(Ok(exit)) => exit,
        Ok(Err(e)) => {
            error!(worker_id = %id, "❌ Worker failed: {}", e);
            WorkerExit::Respawn(e.to_string())
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(worker_id = %id, "💥 Worker panicked: {}", reason);
            WorkerExit::Respawn(reason)
        }
    };

    if let WorkerExit::Respawn(reason) = &exit {
        let envelope = IpcEnvelope::respawn()
            .with_source(id.to_string())
            .with_body(serde_json::json!([reason]));
        if channel.send(envelope).is_err() {
            debug!(worker_id = %id, "Supervisor gone, respawn not requested");
        }
    }
    debug!(worker_id = %id, "Worker thread exiting: {:?}", exit);
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Boot and main loop of one worker thread
pub struct WorkerRuntime<'a> {
    parameters: &'a StartupParameters,
}

impl<'a> WorkerRuntime<'a> {
    pub fn new(parameters: &'a StartupParameters) -> Self {
        Self { parameters }
    }

    /// Connect, boot by thread type, loop, then close the connection
    pub async fn run(&self, channel: &mut IpcChannel) -> Result<WorkerExit> {
        let bus = Bus::connect(&self.parameters.settings, self.parameters.factory.as_ref()).await?;
        let result = match self.boot(&bus).await {
            Ok(()) => self.run_loop(&bus, channel).await,
            Err(e) => Err(e),
        };

        if let Err(e) = bus.close().await {
            warn!(worker_id = %self.parameters.id, "Failed to close bus: {}", e);
        }
        result
    }

    async fn boot(&self, bus: &Bus) -> Result<()> {
        let thread = &self.parameters.thread;
        match thread.thread_type {
            ThreadType::Infrastructure => {
                bus.setup().setup(true).await;
                tokio::time::sleep(self.parameters.settings.runtime.infrastructure_settle()).await;
            }
            ThreadType::Configuration => {}
            ThreadType::Worker => {
                let channel_name = thread.channel_name.as_deref().ok_or_else(|| {
                    PoolError::internal_error("worker thread has no channel to consume")
                })?;
                let options = ConsumeOptions {
                    consumer_tag: Some(format!("rabbitpool-{}", self.parameters.id)),
                    ..ConsumeOptions::default()
                };
                bus.inbound().consume(channel_name, options, None).await?;
            }
        }
        info!(
            worker_id = %self.parameters.id,
            "🏁 {} thread running",
            thread.thread_type
        );
        Ok(())
    }

    async fn run_loop(&self, bus: &Bus, channel: &mut IpcChannel) -> Result<WorkerExit> {
        let thread = &self.parameters.thread;
        let cadence = self.parameters.settings.runtime.loop_interval();
        let started = Instant::now();
        let mut jobs: u64 = 0;

        loop {
            let tick = Instant::now();

            match channel.try_recv() {
                Ok(Some(envelope)) if envelope.method() == IpcMethod::Abort => {
                    debug!(worker_id = %self.parameters.id, "Abort received");
                    let aborting = IpcEnvelope::aborting().with_source(self.parameters.id.to_string());
                    if channel.send(aborting).is_err() {
                        return Ok(WorkerExit::SupervisorGone);
                    }
                    return Ok(WorkerExit::Aborted);
                }
                Ok(Some(envelope)) => {
                    debug!("Ignoring unexpected '{}' from supervisor", envelope.method());
                }
                Ok(None) => {}
                Err(_) => return Ok(WorkerExit::SupervisorGone),
            }

            jobs += bus.iterate(&self.parameters.router, thread).await? as u64;

            if thread.max_jobs > 0 && jobs >= thread.max_jobs {
                info!(worker_id = %self.parameters.id, "Handled {} job(s), recycling", jobs);
                return Ok(WorkerExit::Respawn(format!("max_jobs {} reached", thread.max_jobs)));
            }
            if let Some(ttl) = thread.ttl_duration() {
                if started.elapsed() >= ttl {
                    info!(worker_id = %self.parameters.id, "Lived {:?}, recycling", ttl);
                    return Ok(WorkerExit::Respawn(format!("ttl {}s reached", thread.ttl)));
                }
            }

            let elapsed = tick.elapsed();
            if elapsed < cadence {
                tokio::time::sleep(cadence - elapsed).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
