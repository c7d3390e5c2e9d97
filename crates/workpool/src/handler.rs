use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::handlers;

/// A pure, synchronous task processor. Runs on an execution unit's thread, so
/// it may block freely.
pub trait TaskHandler
where
    Self: Send + Sync + 'static,
{
    fn handle(&self, payload: Value) -> anyhow::Result<Value>;
}

/// Wraps a closure or function as a [`TaskHandler`].
pub struct FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    op: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    pub fn new(op: F) -> Self {
        Self { op }
    }
}

impl<F> From<F> for FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn from(op: F) -> Self {
        Self::new(op)
    }
}

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        (self.op)(payload)
    }
}

/// Dispatch table from task kind to handler. Frozen once a pool is built; the
/// client checks it on submission so unknown kinds never reach a unit.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the handlers in [`crate::handlers`].
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        handlers::register_builtin(&mut registry);
        registry
    }

    /// Register `handler` under `kind`, replacing any previous handler.
    pub fn register<H>(&mut self, kind: impl Into<String>, handler: H) -> &mut Self
    where
        H: TaskHandler,
    {
        let kind = kind.into();
        if self.handlers.insert(kind.clone(), Arc::new(handler)).is_some() {
            tracing::debug!("Replaced handler for task kind `{}`", kind);
        }
        self
    }

    pub fn with_handler<H>(mut self, kind: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler,
    {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds = self.handlers.keys().map(String::as_str).collect::<Vec<_>>();
        kinds.sort_unstable();
        kinds
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
