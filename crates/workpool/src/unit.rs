use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use crate::handler::HandlerRegistry;
use crate::task::{TaskEnvelope, TaskId};
use crate::{Error, Result};

/// Identity of an execution unit. Never reused within a pool, so a replaced
/// unit always shows up under a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(u64);

impl From<u64> for UnitId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Idle,
    Busy,
    Terminating,
}

/// Point-in-time view of one unit, as returned by
/// [`Client::unit_info`](crate::Client::unit_info).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSnapshot {
    pub id: UnitId,
    pub status: UnitStatus,
    pub current_task: Option<TaskId>,
    /// Milliseconds in the current status: time spent idle, or time spent on
    /// the current task
    pub since_last_active_ms: u64,
    pub tasks_completed: u64,
}

/// Completion event a unit thread posts back to the pool, one per assigned task.
#[derive(Debug)]
pub(crate) struct UnitEvent {
    pub unit: UnitId,
    pub task_id: TaskId,
    pub outcome: Result<Value>,
    pub duration: Duration,
}

/// Number of unit threads still running, including threads of units that
/// already left the pool but are stuck in a handler.
#[derive(Debug, Clone, Default)]
pub(crate) struct ThreadCount(Arc<AtomicUsize>);

impl ThreadCount {
    pub(crate) fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn enter(&self) -> ThreadGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        ThreadGuard(self.0.clone())
    }
}

struct ThreadGuard(Arc<AtomicUsize>);

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pool-side record of a unit. The work itself happens on a dedicated thread
/// that only shares the inbox and the event channel with the pool.
#[derive(Debug)]
pub(crate) struct ExecutionUnit {
    id: UnitId,
    status: UnitStatus,
    current_task: Option<TaskId>,
    last_active_at: Instant,
    tasks_completed: u64,

    /// Inbox of the unit thread; `None` once terminated
    tx: Option<Sender<TaskEnvelope>>,
}

impl ExecutionUnit {
    pub(crate) fn spawn(
        id: UnitId,
        registry: Arc<HandlerRegistry>,
        events: UnboundedSender<UnitEvent>,
        threads: &ThreadCount,
    ) -> Result<Self> {
        // One slot: a unit never holds more than the task it is working on
        let (tx, rx) = channel::bounded(1);

        // Released when the thread exits, or right away if it never starts
        let guard = threads.enter();
        std::thread::Builder::new()
            .name(format!("workpool-{id}"))
            .spawn(move || {
                let _guard = guard;
                unit_loop(id, rx, registry, events)
            })?;

        tracing::debug!("Spawned {}", id);

        Ok(Self {
            id,
            status: UnitStatus::Idle,
            current_task: None,
            last_active_at: Instant::now(),
            tasks_completed: 0,
            tx: Some(tx),
        })
    }

    pub(crate) fn id(&self) -> UnitId {
        self.id
    }

    pub(crate) fn status(&self) -> UnitStatus {
        self.status
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.status == UnitStatus::Idle
    }

    /// Hand `task` to the unit thread.
    pub(crate) fn assign(&mut self, task: TaskEnvelope) -> Result<()> {
        match self.status {
            UnitStatus::Busy => return Err(Error::AlreadyBusy(self.id)),
            UnitStatus::Terminating => return Err(Error::Terminated),
            UnitStatus::Idle => {}
        }
        let tx = self.tx.as_ref().ok_or(Error::Terminated)?;

        let task_id = task.id();
        match tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(Error::AlreadyBusy(self.id)),
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!("{} thread is gone", self.id);
                self.terminate();
                return Err(Error::Terminated);
            }
        }

        self.status = UnitStatus::Busy;
        self.current_task = Some(task_id);
        self.last_active_at = Instant::now();
        Ok(())
    }

    /// Mark the unit idle after it reported on `task_id`. Returns false for
    /// events that don't belong to the current assignment.
    pub(crate) fn release(&mut self, task_id: TaskId) -> bool {
        if self.status != UnitStatus::Busy || self.current_task != Some(task_id) {
            return false;
        }
        self.status = UnitStatus::Idle;
        self.current_task = None;
        self.last_active_at = Instant::now();
        self.tasks_completed += 1;
        true
    }

    /// Close the unit's inbox and give up its current task, if any. The thread
    /// exits once its running handler returns; whatever it reports afterwards
    /// is discarded by the pool. Calling this twice is a no-op.
    pub(crate) fn terminate(&mut self) -> Option<TaskId> {
        if self.status != UnitStatus::Terminating {
            tracing::debug!("Terminating {}", self.id);
        }
        self.status = UnitStatus::Terminating;
        self.tx = None;
        self.current_task.take()
    }

    /// How long the unit has been idle, or `None` while it is busy.
    pub(crate) fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.is_idle()
            .then(|| now.saturating_duration_since(self.last_active_at))
    }

    pub(crate) fn snapshot(&self, now: Instant) -> UnitSnapshot {
        UnitSnapshot {
            id: self.id,
            status: self.status,
            current_task: self.current_task,
            since_last_active_ms: now.saturating_duration_since(self.last_active_at).as_millis()
                as u64,
            tasks_completed: self.tasks_completed,
        }
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn unit_loop(
    id: UnitId,
    rx: Receiver<TaskEnvelope>,
    registry: Arc<HandlerRegistry>,
    events: UnboundedSender<UnitEvent>,
) {
    while let Ok(task) = rx.recv() {
        let task_id = task.id();
        tracing::trace!(
            "{} processing task {} ({}), submitted {}ms ago",
            id,
            task_id,
            task.kind(),
            task.submitted_at().elapsed().as_millis()
        );

        let start = Instant::now();
        let outcome = run_task(&registry, task);
        let duration = start.elapsed();

        let event = UnitEvent {
            unit: id,
            task_id,
            outcome,
            duration,
        };
        if events.send(event).is_err() {
            tracing::debug!("{} lost its pool, exiting", id);
            return;
        }
    }
    tracing::debug!("{} stopped", id);
}

/// Run the handler for `task`, turning handler errors and panics into a
/// failed outcome.
fn run_task(registry: &HandlerRegistry, task: TaskEnvelope) -> Result<Value> {
    let handler = registry
        .get(task.kind())
        .ok_or_else(|| Error::UnknownKind(task.kind().to_owned()))?;
    let payload = task.into_payload();

    match catch_unwind(AssertUnwindSafe(|| handler.handle(payload))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Error::handler(err)),
        Err(panic) => Err(Error::Handler(format!(
            "handler panicked: {}",
            panic_message(&*panic)
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use serde_json::json;
    use std::sync::mpsc;
    use tokio::sync::mpsc::unbounded_channel;

    fn registry() -> Arc<HandlerRegistry> {
        let registry = HandlerRegistry::new()
            .with_handler(
                "echo",
                FnHandler::new(|v: Value| -> anyhow::Result<Value> { Ok(v) }),
            )
            .with_handler(
                "fail",
                FnHandler::new(|_: Value| -> anyhow::Result<Value> {
                    anyhow::bail!("bad payload")
                }),
            )
            .with_handler(
                "panic",
                FnHandler::new(|_: Value| -> anyhow::Result<Value> { panic!("boom") }),
            );
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_unit_round_trip() -> Result<()> {
        let (tx, mut rx) = unbounded_channel();
        let mut unit = ExecutionUnit::spawn(UnitId::from(0), registry(), tx, &ThreadCount::default())?;

        let task = TaskEnvelope::new("echo", json!({"x": 1}));
        let task_id = task.id();
        unit.assign(task)?;
        assert_eq!(unit.status(), UnitStatus::Busy);

        let event = rx.recv().await.expect("unit event");
        assert_eq!(event.unit, UnitId::from(0));
        assert_eq!(event.task_id, task_id);
        assert_eq!(event.outcome?, json!({"x": 1}));

        assert!(unit.release(task_id));
        assert!(unit.is_idle());
        assert_eq!(unit.snapshot(Instant::now()).tasks_completed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_assign_while_busy_fails() -> Result<()> {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = std::sync::Mutex::new(gate_rx);
        let registry = HandlerRegistry::new().with_handler(
            "wait",
            FnHandler::new(move |v: Value| -> anyhow::Result<Value> {
                gate_rx.lock().unwrap().recv()?;
                Ok(v)
            }),
        );

        let (tx, mut rx) = unbounded_channel();
        let threads = ThreadCount::default();
        let mut unit = ExecutionUnit::spawn(UnitId::from(1), Arc::new(registry), tx, &threads)?;
        assert_eq!(threads.get(), 1);

        // Busy time counts from the assignment, not from creation
        std::thread::sleep(Duration::from_millis(100));
        unit.assign(TaskEnvelope::new("wait", json!(1)))?;
        let snapshot = unit.snapshot(Instant::now());
        assert_eq!(snapshot.status, UnitStatus::Busy);
        assert!(snapshot.since_last_active_ms < 100);

        let err = unit.assign(TaskEnvelope::new("wait", json!(2))).unwrap_err();
        assert!(matches!(err, Error::AlreadyBusy(id) if id == UnitId::from(1)));

        // A terminated unit's thread keeps counting until its handler returns
        unit.terminate();
        assert_eq!(threads.get(), 1);
        gate_tx.send(()).unwrap();
        assert!(rx.recv().await.expect("unit event").outcome.is_ok());
        for _ in 0..200 {
            if threads.get() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(threads.get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_kill_unit() -> Result<()> {
        let (tx, mut rx) = unbounded_channel();
        let mut unit = ExecutionUnit::spawn(UnitId::from(2), registry(), tx, &ThreadCount::default())?;

        for (kind, expected) in [
            ("fail", "Task handler failed: bad payload"),
            ("panic", "Task handler failed: handler panicked: boom"),
        ] {
            let task = TaskEnvelope::new(kind, json!(null));
            let task_id = task.id();
            unit.assign(task)?;
            let event = rx.recv().await.expect("unit event");
            assert_eq!(event.outcome.unwrap_err().to_string(), expected);
            assert!(unit.release(task_id));
        }

        let task = TaskEnvelope::new("echo", json!("still alive"));
        unit.assign(task)?;
        let event = rx.recv().await.expect("unit event");
        assert_eq!(event.outcome?, json!("still alive"));
        Ok(())
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() -> Result<()> {
        let (tx, _rx) = unbounded_channel();
        let mut unit = ExecutionUnit::spawn(UnitId::from(3), registry(), tx, &ThreadCount::default())?;
        let task = TaskEnvelope::new("echo", json!(1));
        let task_id = task.id();
        unit.assign(task)?;

        assert_eq!(unit.terminate(), Some(task_id));
        assert_eq!(unit.terminate(), None);
        assert_eq!(unit.status(), UnitStatus::Terminating);
        assert!(matches!(
            unit.assign(TaskEnvelope::new("echo", json!(2))),
            Err(Error::Terminated)
        ));
        assert!(!unit.release(task_id));
        Ok(())
    }

    #[test]
    fn test_unit_id_display() {
        assert_eq!(UnitId::from(7).to_string(), "unit-7");
    }
}
