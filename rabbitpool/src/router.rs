use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::Context;
use crate::error::{PoolError, Result};
use crate::message::Envelope;

/// Handles one operation, selected by the message `type` property
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a delivered message; a returned envelope is sent back to `reply_to`
    async fn handle(&self, message: Envelope, context: &Context<'_>) -> Result<Option<Envelope>>;

    /// Get handler name for debugging
    fn name(&self) -> &str {
        "MessageHandler"
    }
}

/// Simple function-based handler that does not need the bus context
pub struct FunctionHandler<F> {
    name: String,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FunctionHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Envelope>>> + Send + 'static,
{
    async fn handle(&self, message: Envelope, _context: &Context<'_>) -> Result<Option<Envelope>> {
        (self.handler)(message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Immutable map of operation name to handler
#[derive(Clone, Default)]
pub struct Router {
    routes: Arc<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Route a message by its `type` property
    pub async fn dispatch(&self, message: Envelope, context: &Context<'_>) -> Result<Option<Envelope>> {
        let operation = message.kind().unwrap_or_default().to_string();
        let handler = self
            .routes
            .get(&operation)
            .ok_or_else(|| PoolError::RouteNotFound {
                operation: operation.clone(),
            })?;

        debug!("Dispatching '{}' to {}", operation, handler.name());
        handler.handle(message, context).await
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.routes.contains_key(operation)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<&str> = self.operations().collect();
        operations.sort_unstable();
        f.debug_struct("Router").field("operations", &operations).finish()
    }
}

/// Collects routes before they are frozen into a [`Router`]
#[derive(Default)]
pub struct RouterBuilder {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl RouterBuilder {
    /// Register a handler for an operation, replacing any previous one
    pub fn route<H>(mut self, operation: impl Into<String>, handler: H) -> Self
    where
        H: MessageHandler + 'static,
    {
        self.routes.insert(operation.into(), Arc::new(handler));
        self
    }

    /// Register a function-based handler
    pub fn function<F, Fut>(self, operation: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Envelope>>> + Send + 'static,
    {
        let operation = operation.into();
        let function_handler = FunctionHandler::new(operation.clone(), handler);
        self.route(operation, function_handler)
    }

    pub fn build(self) -> Router {
        Router {
            routes: Arc::new(self.routes),
        }
    }
}

/// Routers by handler name, as referenced from thread configurations
#[derive(Debug, Clone, Default)]
pub struct RouterRegistry {
    routers: HashMap<String, Router>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, router: Router) {
        let name = name.into();
        info!("Registered router '{}' with {} operation(s)", name, router.len());
        self.routers.insert(name, router);
    }

    pub fn with(mut self, name: impl Into<String>, router: Router) -> Self {
        self.register(name, router);
        self
    }

    /// Resolve a handler name to its router
    pub fn get(&self, name: &str) -> Result<Router> {
        self.routers
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownHandler {
                handler: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_registers_routes() {
        let router = Router::builder()
            .function("createOrder", |_msg| async { Ok(None) })
            .function("cancelOrder", |msg| async move { Ok(Some(msg)) })
            .build();

        assert_eq!(router.len(), 2);
        assert!(router.contains("createOrder"));
        assert!(!router.contains("deleteOrder"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = RouterRegistry::new().with("billing", Router::builder().build());
        assert!(registry.contains("billing"));
        assert!(registry.get("billing").is_ok());
        assert!(matches!(
            registry.get("shipping"),
            Err(PoolError::UnknownHandler { .. })
        ));
    }
}
