//! JSON Schema validation of contract bindings.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::error::{PoolError, Result};

/// Which binding object a violation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingKind {
    Channel,
    Operation,
    Message,
}

impl BindingKind {
    fn schema_file(&self) -> &'static str {
        match self {
            Self::Channel => "channel.json",
            Self::Operation => "operation.json",
            Self::Message => "message.json",
        }
    }
}

impl fmt::Display for BindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Channel => "channel",
            Self::Operation => "operation",
            Self::Message => "message",
        };
        f.write_str(name)
    }
}

/// One schema failure
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaViolation {
    /// Contract channel name, empty for schema loading failures
    pub channel: String,
    pub binding: BindingKind,
    /// JSON pointer into the binding object
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.channel.is_empty() {
            write!(f, "{} schema: {}", self.binding, self.message)
        } else {
            write!(
                f,
                "{} binding of '{}' at '{}': {}",
                self.binding, self.channel, self.path, self.message
            )
        }
    }
}

struct BindingSchemas {
    channel: jsonschema::Validator,
    operation: jsonschema::Validator,
    message: jsonschema::Validator,
}

impl BindingSchemas {
    fn load(schema_dir: &Path, protocol: &str) -> std::result::Result<Self, Vec<SchemaViolation>> {
        let dir = schema_dir.join(protocol);
        let mut violations = Vec::new();
        let mut load_kind = |kind: BindingKind| match compile(&dir.join(kind.schema_file())) {
            Ok(validator) => Some(validator),
            Err(message) => {
                violations.push(SchemaViolation {
                    channel: String::new(),
                    binding: kind,
                    path: String::new(),
                    message,
                });
                None
            }
        };

        let channel = load_kind(BindingKind::Channel);
        let operation = load_kind(BindingKind::Operation);
        let message = load_kind(BindingKind::Message);

        match (channel, operation, message) {
            (Some(channel), Some(operation), Some(message)) => Ok(Self {
                channel,
                operation,
                message,
            }),
            _ => Err(violations),
        }
    }

    fn for_kind(&self, kind: BindingKind) -> &jsonschema::Validator {
        match kind {
            BindingKind::Channel => &self.channel,
            BindingKind::Operation => &self.operation,
            BindingKind::Message => &self.message,
        }
    }
}

fn compile(path: &Path) -> std::result::Result<jsonschema::Validator, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let schema: Value = serde_json::from_str(&raw)
        .map_err(|e| format!("{} is not valid JSON: {}", path.display(), e))?;
    jsonschema::validator_for(&schema)
        .map_err(|e| format!("{} is not a valid schema: {}", path.display(), e))
}

/// Extract `channels.<name>.<...path>.bindings.<protocol>`, defaulting to `{}`
pub(crate) fn binding_object<'a>(node: Option<&'a Value>, protocol: &str) -> &'a Value {
    static EMPTY: Value = Value::Null;
    node.and_then(|node| node.get("bindings"))
        .and_then(|bindings| bindings.get(protocol))
        .unwrap_or(&EMPTY)
}

fn or_empty_object(value: &Value) -> Value {
    if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value.clone()
    }
}

/// Operation key implied by a raw channel binding
pub(crate) fn operation_key(channel_binding: &Value) -> &'static str {
    if channel_binding.get("is").and_then(Value::as_str) == Some("routingKey") {
        "publish"
    } else {
        "subscribe"
    }
}

/// Validate every channel, operation and message binding of a contract.
///
/// All three schemas must be present in `<schema_dir>/<protocol>/`. Nothing is
/// accepted when one of them cannot be loaded.
pub fn validate(document: &Value, schema_dir: &Path, protocol: &str) -> Result<()> {
    let schemas = BindingSchemas::load(schema_dir, protocol)
        .map_err(|errors| PoolError::ContractValidation { errors })?;

    let channels = document
        .get("channels")
        .and_then(Value::as_object)
        .ok_or_else(|| PoolError::contract_parse("contract has no 'channels' object"))?;

    let mut violations = Vec::new();

    for (name, channel) in channels {
        let channel_binding = binding_object(Some(channel), protocol);
        let operation = channel.get(operation_key(channel_binding));
        let operation_binding = binding_object(operation, protocol);
        let message_binding = binding_object(operation.and_then(|op| op.get("message")), protocol);

        for (kind, instance) in [
            (BindingKind::Channel, channel_binding),
            (BindingKind::Operation, operation_binding),
            (BindingKind::Message, message_binding),
        ] {
            let instance = or_empty_object(instance);
            for error in schemas.for_kind(kind).iter_errors(&instance) {
                violations.push(SchemaViolation {
                    channel: name.clone(),
                    binding: kind,
                    path: error.instance_path.to_string(),
                    message: error.to_string(),
                });
            }
        }
    }

    if violations.is_empty() {
        debug!("Validated {} contract channel(s) against {} schemas", channels.len(), protocol);
        Ok(())
    } else {
        Err(PoolError::ContractValidation { errors: violations })
    }
}
