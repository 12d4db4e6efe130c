//! Supervisor/worker signalling.
//!
//! Each worker owns a pair of unidirectional channels: the supervisor sends
//! on one and the worker on the other. Nothing else is shared between them.
//!
//! | method     | direction           | meaning                    |
//! |------------|---------------------|----------------------------|
//! | `abort`    | supervisor → worker | stop at the next poll      |
//! | `aborting` | worker → supervisor | abort acknowledged, exiting |
//! | `respawn`  | worker → supervisor | replace me, I am exiting   |

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::error::{PoolError, Result};

pub const ENCODING_ARRAY: &str = "array";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMethod {
    Abort,
    Aborting,
    Respawn,
}

impl IpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpcMethod::Abort => "abort",
            IpcMethod::Aborting => "aborting",
            IpcMethod::Respawn => "respawn",
        }
    }
}

impl fmt::Display for IpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcHeaders {
    pub method: IpcMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub encoding: String,
}

/// One signal between supervisor and worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcEnvelope {
    pub headers: IpcHeaders,
    pub body: serde_json::Value,
}

impl IpcEnvelope {
    pub fn new(method: IpcMethod) -> Self {
        Self {
            headers: IpcHeaders {
                method,
                source: None,
                encoding: ENCODING_ARRAY.to_string(),
            },
            body: serde_json::Value::Array(Vec::new()),
        }
    }

    pub fn abort() -> Self {
        Self::new(IpcMethod::Abort)
    }

    pub fn aborting() -> Self {
        Self::new(IpcMethod::Aborting)
    }

    pub fn respawn() -> Self {
        Self::new(IpcMethod::Respawn)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.headers.source = Some(source.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    pub fn method(&self) -> IpcMethod {
        self.headers.method
    }

    pub fn source(&self) -> Option<&str> {
        self.headers.source.as_deref()
    }
}

/// One end of a supervisor/worker channel pair
#[derive(Debug)]
pub struct IpcChannel {
    tx: UnboundedSender<IpcEnvelope>,
    rx: UnboundedReceiver<IpcEnvelope>,
}

/// Create the supervisor end and the worker end of a channel pair
pub fn duplex() -> (IpcChannel, IpcChannel) {
    let (to_worker, from_supervisor) = mpsc::unbounded_channel();
    let (to_supervisor, from_worker) = mpsc::unbounded_channel();
    (
        IpcChannel {
            tx: to_worker,
            rx: from_worker,
        },
        IpcChannel {
            tx: to_supervisor,
            rx: from_supervisor,
        },
    )
}

impl IpcChannel {
    /// Fails once the other end is gone
    pub fn send(&self, envelope: IpcEnvelope) -> Result<()> {
        let method = envelope.method();
        self.tx
            .send(envelope)
            .map_err(|_| PoolError::ipc_error(format!("peer is gone, cannot send '{}'", method)))
    }

    /// Non-blocking receive: `Ok(None)` when nothing is pending, an error once
    /// the peer has gone away and every pending envelope was drained
    pub fn try_recv(&mut self) -> Result<Option<IpcEnvelope>> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(PoolError::ipc_error("peer disconnected")),
        }
    }

    /// Wait for the next envelope; `None` once the peer is gone
    pub async fn recv(&mut self) -> Option<IpcEnvelope> {
        self.rx.recv().await
    }

    /// Blocking variant of [`IpcChannel::recv`] for plain threads; must not
    /// be called from inside an async runtime
    pub fn blocking_recv(&mut self) -> Option<IpcEnvelope> {
        self.rx.blocking_recv()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the receiving half; pending envelopes can still be drained
    pub fn close(&mut self) {
        self.rx.close();
    }
}
