use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::handler::{HandlerRegistry, TaskHandler};
use crate::pool::{CancelOutcome, Command, PoolManager, PoolStats, QueueEntry};
use crate::task::{TaskEnvelope, TaskHandle, TaskId};
use crate::unit::UnitSnapshot;
use crate::{Error, Result};

/// Builds a pool and returns the [`Client`] that drives it.
///
/// ## Example
///
/// ```rust,no_run
/// # use workpool::{Client, PoolConfig};
/// # use serde_json::json;
/// # async fn run() -> workpool::Result<()> {
/// let client = Client::builder()
///     .with_config(PoolConfig::default().with_max_units(4))
///     .with_builtin_handlers()
///     .build()?;
///
/// let stats = client
///     .execute("aggregate", json!({ "values": [0.71, 0.64, 0.58] }))
///     .await?;
/// println!("{stats}");
///
/// client.shutdown().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct PoolBuilder {
    config: PoolConfig,
    registry: HandlerRegistry,
}

impl PoolBuilder {
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_builtin_handlers(mut self) -> Self {
        crate::handlers::register_builtin(&mut self.registry);
        self
    }

    pub fn with_handler<H>(mut self, kind: impl Into<String>, handler: H) -> Self
    where
        H: TaskHandler,
    {
        self.registry.register(kind, handler);
        self
    }

    /// Start the pool on the current Tokio runtime.
    pub fn build(self) -> Result<Client> {
        if self.registry.is_empty() {
            tracing::warn!("Starting a pool without any task handlers");
        }
        let registry = Arc::new(self.registry);
        let tx = PoolManager::start(self.config, registry.clone())?;
        Ok(Client { tx, registry })
    }
}

/// Typed front end of a pool. Cheap to clone; the pool stops once
/// [`Client::shutdown`] is called or the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    /// Pool command channel
    tx: UnboundedSender<Command>,

    registry: Arc<HandlerRegistry>,
}

impl Client {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Queue a task without waiting for it. Rejections that depend on pool
    /// state, such as a full queue, arrive through the returned handle.
    pub fn submit(&self, kind: &str, payload: Value) -> Result<TaskHandle> {
        if !self.registry.contains(kind) {
            return Err(Error::UnknownKind(kind.to_owned()));
        }

        let envelope = TaskEnvelope::new(kind, payload);
        let id = envelope.id();
        let (tx, rx) = oneshot::channel();

        self.tx
            .send(Command::Submit(QueueEntry::new(envelope, tx)))
            .map_err(|_| Error::PoolShutdown)?;

        Ok(TaskHandle::new(id, rx))
    }

    /// Submit a task and wait for its result.
    pub async fn execute(&self, kind: &str, payload: Value) -> Result<Value> {
        let handle = self.submit(kind, payload)?;
        handle.await.into_result()
    }

    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        self.request(Command::Stats).await
    }

    pub async fn unit_info(&self) -> Result<Vec<UnitSnapshot>> {
        self.request(Command::UnitInfo).await
    }

    /// Stop the pool: running tasks fail with [`Error::Terminated`], queued
    /// ones with [`Error::Cancelled`], and every later call on any clone fails
    /// with [`Error::PoolShutdown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Task kinds this pool accepts.
    pub fn kinds(&self) -> Vec<&str> {
        self.registry.kinds()
    }

    async fn request<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command,
    {
        let (tx, rx) = oneshot::channel();
        self.tx.send(command(tx)).map_err(|_| Error::PoolShutdown)?;
        rx.await.map_err(|_| Error::PoolShutdown)
    }
}
