use thiserror::Error;

use crate::contract::SchemaViolation;

/// Result type alias for rabbitpool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error types for the worker-pool runtime
#[derive(Error, Debug)]
pub enum PoolError {
    /// AMQP transport errors raised by lapin
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Contract document could not be parsed as YAML/JSON
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Contract reference or document is missing or malformed
    #[error("Contract parse error: {reason}")]
    ContractParse { reason: String },

    /// One or more bindings failed schema validation
    #[error("Contract validation failed with {} violation(s){}", errors.len(), first_violation(errors))]
    ContractValidation { errors: Vec<SchemaViolation> },

    /// Channel name is not part of the resolved contract
    #[error("Channel '{channel}' is not defined in the contract")]
    UnknownChannel { channel: String },

    /// The broker closed a protocol channel (e.g. passive declare on a missing target)
    #[error("Channel exception: {reason}")]
    ChannelException { reason: String },

    /// The connection is no longer usable
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Body codec does not support the content type
    #[error("Unsupported content type '{content_type}'")]
    ContentType { content_type: String },

    /// Caller-visible deadline expired
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Broker refused a confirmed publish
    #[error("Broker rejected publish to '{exchange}' with routing key '{routing_key}'")]
    PublishNacked { exchange: String, routing_key: String },

    /// Mandatory publish could not be routed and was returned
    #[error("Broker returned unroutable message published to '{exchange}' with routing key '{routing_key}'")]
    PublishReturned { exchange: String, routing_key: String },

    /// No handler registered for the message type
    #[error("No route registered for operation '{operation}'")]
    RouteNotFound { operation: String },

    /// Handler name in a thread configuration has no router
    #[error("No router registered under handler name '{handler}'")]
    UnknownHandler { handler: String },

    /// Thread configuration forbids synchronous requests
    #[error("RPC requests are not allowed for this thread")]
    RpcNotAllowed,

    /// Thread configuration forbids publishing to the channel
    #[error("Publishing to channel '{channel}' is not allowed for this thread")]
    ChannelNotAllowed { channel: String },

    /// Business handler errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// A handler panicked while processing a delivery
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    /// IPC channel errors
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Worker thread could not be started
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    /// Connection settings that cannot form a URI
    #[error("Invalid connection URI: {reason}")]
    InvalidUri { reason: String },

    /// Connection URI could not be parsed
    #[error("Connection URI error: {0}")]
    Uri(#[from] url::ParseError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Internal runtime errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn first_violation(errors: &[SchemaViolation]) -> String {
    errors
        .first()
        .map(|violation| format!(": {}", violation))
        .unwrap_or_default()
}

impl PoolError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Create a new contract parse error
    pub fn contract_parse<T: ToString>(reason: T) -> Self {
        Self::ContractParse {
            reason: reason.to_string(),
        }
    }

    /// Create a new IPC error
    pub fn ipc_error<T: ToString>(message: T) -> Self {
        Self::Ipc(message.to_string())
    }

    /// Create a new internal error
    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    /// Check if error is recoverable (should be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ConnectionClosed { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::BindingKind;

    #[test]
    fn test_validation_error_reports_first_violation() {
        let error = PoolError::ContractValidation {
            errors: vec![SchemaViolation {
                channel: "inbound/commands".to_string(),
                binding: BindingKind::Channel,
                path: "/is".to_string(),
                message: "\"topic\" is not one of [\"routingKey\",\"queue\"]".to_string(),
            }],
        };

        let rendered = error.to_string();
        assert!(rendered.starts_with("Contract validation failed with 1 violation(s)"));
        assert!(rendered.contains("inbound/commands"));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(PoolError::Timeout { timeout_ms: 10 }.is_recoverable());
        assert!(!PoolError::RpcNotAllowed.is_recoverable());
        assert!(!PoolError::contract_parse("missing path").is_recoverable());
    }
}
