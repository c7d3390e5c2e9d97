use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PoolConfig;
use crate::handler::HandlerRegistry;
use crate::task::{TaskEnvelope, TaskId, TaskReport};
use crate::unit::{ExecutionUnit, ThreadCount, UnitEvent, UnitId, UnitSnapshot, UnitStatus};
use crate::{Error, Result};

/// Counters and gauges describing the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_units: usize,
    pub busy_units: usize,
    pub idle_units: usize,
    pub queue_length: usize,
    /// Threads of units that left the pool while stuck in a handler, still
    /// running until the handler returns
    pub detached_units: usize,
    pub total_submitted: u64,
    pub total_completed: u64,
    /// Handler errors, timeouts and terminations
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_timed_out: u64,
    /// Submissions turned away because the queue was full
    pub total_rejected: u64,
}

/// What [`Client::cancel`](crate::Client::cancel) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was still queued and never reached a unit
    Dequeued,
    /// The task was running; its unit was terminated
    Aborted,
    /// No queued or running task has this id
    NotFound,
}

/// Queue entry
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub envelope: TaskEnvelope,

    /// Resolves the caller's [`TaskHandle`](crate::TaskHandle)
    pub response_tx: oneshot::Sender<TaskReport>,
}

impl QueueEntry {
    pub fn new(envelope: TaskEnvelope, response_tx: oneshot::Sender<TaskReport>) -> Self {
        Self {
            envelope,
            response_tx,
        }
    }

    fn reject(self, error: Error) {
        let task_id = self.envelope.id();
        let queue_wait = self.envelope.submitted_at().elapsed();
        if self
            .response_tx
            .send(TaskReport::unassigned(task_id, error, queue_wait))
            .is_err()
        {
            tracing::trace!("Caller of task {} is no longer waiting", task_id);
        }
    }
}

/// A task that has been handed to a unit.
#[derive(Debug)]
struct InFlight {
    unit: UnitId,
    response_tx: oneshot::Sender<TaskReport>,
    started_at: Instant,
    queue_wait: Duration,
}

impl InFlight {
    fn resolve(self, task_id: TaskId, outcome: Result<Value>, duration: Duration) {
        let report = TaskReport {
            task_id,
            outcome,
            duration,
            queue_wait: self.queue_wait,
        };
        if self.response_tx.send(report).is_ok() {
            tracing::trace!("Sent report for task {}", task_id);
        } else {
            tracing::trace!("Caller of task {} is no longer waiting", task_id);
        }
    }

    fn fail(self, task_id: TaskId, error: Error) {
        let duration = self.started_at.elapsed();
        self.resolve(task_id, Err(error), duration);
    }
}

/// Pool command
#[derive(Debug)]
pub(crate) enum Command {
    Submit(QueueEntry),
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Stats(oneshot::Sender<PoolStats>),
    UnitInfo(oneshot::Sender<Vec<UnitSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    rejected: u64,
}

/// Pool bookkeeping. Owned by a single background task, so every decision
/// about units, the queue and in-flight tasks is serialized.
///
/// Invariants between operations:
/// - a task id lives in exactly one of `pending` and `in_flight` until it
///   resolves, and in neither afterwards;
/// - after each `dispatch`, `pending` is only non-empty while no unit is idle
///   and the pool is at `max_units`;
/// - `units.len() <= max_units`.
#[derive(Debug)]
pub(crate) struct PoolManager {
    config: PoolConfig,
    registry: Arc<HandlerRegistry>,
    units: BTreeMap<UnitId, ExecutionUnit>,
    pending: VecDeque<QueueEntry>,
    in_flight: HashMap<TaskId, InFlight>,
    counters: Counters,
    next_unit_id: u64,
    events_tx: UnboundedSender<UnitEvent>,
    threads: ThreadCount,
}

impl PoolManager {
    fn new(
        config: PoolConfig,
        registry: Arc<HandlerRegistry>,
        events_tx: UnboundedSender<UnitEvent>,
    ) -> Self {
        Self {
            config,
            registry,
            units: BTreeMap::new(),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            counters: Counters::default(),
            next_unit_id: 0,
            events_tx,
            threads: ThreadCount::default(),
        }
    }

    /// Validate `config` and launch the coordinator on the current Tokio
    /// runtime. Returns the command channel.
    pub(crate) fn start(
        config: PoolConfig,
        registry: Arc<HandlerRegistry>,
    ) -> Result<UnboundedSender<Command>> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()?;

        let (tx, rx) = unbounded_channel();
        let (events_tx, events_rx) = unbounded_channel();

        tracing::info!(
            "Starting pool: max {} units, idle timeout {}ms, task timeout {}ms, queue limit {}",
            config.max_units,
            config.idle_timeout_ms,
            config.task_timeout_ms,
            config.max_queue_length
        );

        let manager = Self::new(config, registry, events_tx);
        runtime.spawn(manager.run(rx, events_rx));

        Ok(tx)
    }

    async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut events: UnboundedReceiver<UnitEvent>,
    ) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'main: loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::info!("All clients dropped");
                        self.shutdown();
                        break 'main;
                    };

                    // Take everything that is already waiting before placing
                    // work, so a cancel sent right behind its submit wins.
                    let mut next = Some(cmd);
                    while let Some(cmd) = next.take() {
                        if let ControlFlow::Break(reply) = self.handle_command(cmd) {
                            commands.close();
                            self.shutdown();
                            // Late commands only hold oneshot senders; dropping
                            // them resolves their callers with `PoolShutdown`.
                            while commands.try_recv().is_ok() {}
                            let _ = reply.send(());
                            break 'main;
                        }
                        next = commands.try_recv().ok();
                    }
                    self.dispatch();
                }
                Some(event) = events.recv() => self.handle_event(event),
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        tracing::info!("Pool stopped");
    }

    /// Apply one command. A shutdown request is handed back to the run loop,
    /// which owns the command channel.
    fn handle_command(&mut self, cmd: Command) -> ControlFlow<oneshot::Sender<()>> {
        match cmd {
            Command::Submit(entry) => self.submit(entry),
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Stats(reply) => {
                self.dispatch();
                let _ = reply.send(self.stats());
            }
            Command::UnitInfo(reply) => {
                self.dispatch();
                let _ = reply.send(self.unit_info(Instant::now()));
            }
            Command::Shutdown(reply) => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    /// Admit a task to the back of the queue. It is placed on a unit by the
    /// next `dispatch`.
    fn submit(&mut self, entry: QueueEntry) {
        let free_slots = self.units.values().filter(|u| u.is_idle()).count()
            + self.config.max_units.saturating_sub(self.units.len());

        if self.pending.len() >= free_slots + self.config.max_queue_length {
            tracing::warn!(
                "Rejecting task {}: {} tasks already queued",
                entry.envelope.id(),
                self.pending.len()
            );
            self.counters.rejected += 1;
            entry.reject(Error::QueueOverflow {
                limit: self.config.max_queue_length,
            });
            return;
        }

        tracing::trace!(
            "Queued task {} ({})",
            entry.envelope.id(),
            entry.envelope.kind()
        );
        self.counters.submitted += 1;
        self.pending.push_back(entry);
    }

    /// Place queued tasks, oldest first, on idle units, growing the pool up
    /// to `max_units` when none is idle.
    fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            let unit_id = match self.idle_unit() {
                Some(unit_id) => unit_id,
                None if self.units.len() < self.config.max_units => match self.spawn_unit() {
                    Ok(unit_id) => unit_id,
                    Err(err) if self.units.is_empty() => {
                        // Nothing will ever free up, so don't leave the task hanging
                        tracing::error!("Failed to spawn a unit for an empty pool: {}", err);
                        if let Some(entry) = self.pending.pop_front() {
                            self.counters.failed += 1;
                            entry.reject(err);
                        }
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!("Failed to grow pool: {}", err);
                        break;
                    }
                },
                None => break,
            };

            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            self.assign(unit_id, entry);
        }
    }

    fn idle_unit(&self) -> Option<UnitId> {
        self.units
            .values()
            .find(|unit| unit.is_idle())
            .map(ExecutionUnit::id)
    }

    fn spawn_unit(&mut self) -> Result<UnitId> {
        let unit_id = UnitId::from(self.next_unit_id);
        let unit = ExecutionUnit::spawn(
            unit_id,
            self.registry.clone(),
            self.events_tx.clone(),
            &self.threads,
        )?;
        self.next_unit_id += 1;
        self.units.insert(unit_id, unit);
        Ok(unit_id)
    }

    fn assign(&mut self, unit_id: UnitId, entry: QueueEntry) {
        let QueueEntry {
            envelope,
            response_tx,
        } = entry;
        let task_id = envelope.id();
        let queue_wait = envelope.submitted_at().elapsed();

        let assigned = match self.units.get_mut(&unit_id) {
            Some(unit) => unit.assign(envelope),
            None => Err(Error::Terminated),
        };

        match assigned {
            Ok(()) => {
                tracing::trace!(
                    "Assigned task {} to {} after {}ms in queue",
                    task_id,
                    unit_id,
                    queue_wait.as_millis()
                );
                self.in_flight.insert(
                    task_id,
                    InFlight {
                        unit: unit_id,
                        response_tx,
                        started_at: Instant::now(),
                        queue_wait,
                    },
                );
            }
            Err(err) => {
                tracing::error!("Failed to assign task {} to {}: {}", task_id, unit_id, err);
                if matches!(err, Error::Terminated) {
                    self.retire_unit(unit_id);
                }
                self.counters.failed += 1;
                let _ = response_tx.send(TaskReport::unassigned(task_id, err, queue_wait));
            }
        }
    }

    fn handle_event(&mut self, event: UnitEvent) {
        let UnitEvent {
            unit,
            task_id,
            outcome,
            duration,
        } = event;

        let released = self
            .units
            .get_mut(&unit)
            .is_some_and(|u| u.release(task_id));
        if !released {
            tracing::debug!("Discarding late result of task {} from {}", task_id, unit);
            return;
        }

        let Some(in_flight) = self.in_flight.remove(&task_id) else {
            tracing::error!("{} finished task {} that was not in flight", unit, task_id);
            self.dispatch();
            return;
        };

        match &outcome {
            Ok(_) => self.counters.completed += 1,
            Err(err) => {
                tracing::debug!("Task {} failed on {}: {}", task_id, unit, err);
                self.counters.failed += 1;
            }
        }
        in_flight.resolve(task_id, outcome, duration);

        self.dispatch();
    }

    fn cancel(&mut self, id: TaskId) -> CancelOutcome {
        if let Some(position) = self.pending.iter().position(|e| e.envelope.id() == id) {
            if let Some(entry) = self.pending.remove(position) {
                tracing::debug!("Cancelled queued task {}", id);
                self.counters.cancelled += 1;
                entry.reject(Error::Cancelled);
            }
            return CancelOutcome::Dequeued;
        }

        if let Some(in_flight) = self.in_flight.remove(&id) {
            // Handlers are synchronous and can't be interrupted, so the unit
            // goes and a fresh one is spawned on demand.
            tracing::debug!("Cancelled running task {} on {}", id, in_flight.unit);
            self.retire_unit(in_flight.unit);
            self.counters.cancelled += 1;
            in_flight.fail(id, Error::Cancelled);
            return CancelOutcome::Aborted;
        }

        CancelOutcome::NotFound
    }

    /// Fail tasks that ran past the task timeout and reclaim units that sat
    /// idle past the idle timeout.
    fn sweep(&mut self, now: Instant) {
        let task_timeout = self.config.task_timeout();
        let expired = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.started_at) > task_timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for task_id in expired {
            if let Some(in_flight) = self.in_flight.remove(&task_id) {
                self.retire_unit(in_flight.unit);
                tracing::warn!(
                    "Task {} exceeded {}ms on {}, replacing unit ({} detached threads still running)",
                    task_id,
                    task_timeout.as_millis(),
                    in_flight.unit,
                    self.detached_units()
                );
                self.counters.failed += 1;
                self.counters.timed_out += 1;
                in_flight.fail(task_id, Error::Timeout(task_timeout));
            }
        }

        let idle_timeout = self.config.idle_timeout();
        let idle = self
            .units
            .values()
            .filter(|unit| unit.idle_for(now).is_some_and(|idle| idle > idle_timeout))
            .map(ExecutionUnit::id)
            .collect::<Vec<_>>();

        for unit_id in idle {
            tracing::debug!("Reclaiming idle {}", unit_id);
            self.retire_unit(unit_id);
        }

        // Replacements for timed out units
        self.dispatch();
    }

    /// Remove a unit from the pool. Its current task, if any, must already be
    /// out of `in_flight`.
    fn retire_unit(&mut self, unit_id: UnitId) {
        if let Some(mut unit) = self.units.remove(&unit_id) {
            if let Some(task_id) = unit.terminate() {
                if self.in_flight.contains_key(&task_id) {
                    tracing::error!("{} retired while task {} still in flight", unit_id, task_id);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        tracing::info!(
            "Shutting down pool: {} units, {} running, {} queued",
            self.units.len(),
            self.in_flight.len(),
            self.pending.len()
        );

        for (_, mut unit) in std::mem::take(&mut self.units) {
            unit.terminate();
        }
        for (task_id, in_flight) in self.in_flight.drain() {
            self.counters.failed += 1;
            in_flight.fail(task_id, Error::Terminated);
        }
        for entry in self.pending.drain(..) {
            self.counters.cancelled += 1;
            entry.reject(Error::Cancelled);
        }
    }

    /// Unit threads still alive without a unit in the pool.
    fn detached_units(&self) -> usize {
        self.threads.get().saturating_sub(self.units.len())
    }

    fn stats(&self) -> PoolStats {
        let busy_units = self
            .units
            .values()
            .filter(|u| u.status() == UnitStatus::Busy)
            .count();
        let idle_units = self.units.values().filter(|u| u.is_idle()).count();

        PoolStats {
            total_units: self.units.len(),
            busy_units,
            idle_units,
            queue_length: self.pending.len(),
            detached_units: self.detached_units(),
            total_submitted: self.counters.submitted,
            total_completed: self.counters.completed,
            total_failed: self.counters.failed,
            total_cancelled: self.counters.cancelled,
            total_timed_out: self.counters.timed_out,
            total_rejected: self.counters.rejected,
        }
    }

    fn unit_info(&self, now: Instant) -> Vec<UnitSnapshot> {
        self.units.values().map(|unit| unit.snapshot(now)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use serde_json::json;

    fn echo_registry() -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry::new().with_handler(
            "echo",
            FnHandler::new(|v: Value| -> anyhow::Result<Value> { Ok(v) }),
        ))
    }

    fn manager(config: PoolConfig) -> (PoolManager, UnboundedReceiver<UnitEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        (PoolManager::new(config, echo_registry(), events_tx), events_rx)
    }

    fn entry(payload: Value) -> (QueueEntry, oneshot::Receiver<TaskReport>) {
        let (tx, rx) = oneshot::channel();
        (QueueEntry::new(TaskEnvelope::new("echo", payload), tx), rx)
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_spawns_nothing() {
        let (mut manager, _events) = manager(PoolConfig::default().with_max_units(2));
        let (entry, mut rx) = entry(json!(1));
        let id = entry.envelope.id();

        manager.submit(entry);
        assert_eq!(manager.cancel(id), CancelOutcome::Dequeued);
        manager.dispatch();

        let report = rx.try_recv().expect("resolved");
        assert!(matches!(report.outcome, Err(Error::Cancelled)));
        assert_eq!(manager.next_unit_id, 0);
        assert_eq!(manager.stats().total_cancelled, 1);
        assert_eq!(manager.cancel(id), CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_dispatch_respects_max_units() {
        let (mut manager, _events) = manager(PoolConfig::default().with_max_units(2));
        for i in 0..5 {
            let (entry, _rx) = entry(json!(i));
            manager.submit(entry);
        }
        manager.dispatch();

        let stats = manager.stats();
        assert_eq!(stats.total_units, 2);
        assert_eq!(stats.busy_units, 2);
        assert_eq!(stats.queue_length, 3);
        assert_eq!(stats.total_submitted, 5);
    }

    #[tokio::test]
    async fn test_queue_overflow_counts_free_slots() {
        let config = PoolConfig::default()
            .with_max_units(1)
            .with_max_queue_length(1);
        let (mut manager, _events) = manager(config);

        let (first, _rx1) = entry(json!(1));
        let (second, _rx2) = entry(json!(2));
        let (third, mut rx3) = entry(json!(3));
        manager.submit(first);
        manager.submit(second);
        manager.submit(third);

        let report = rx3.try_recv().expect("rejected");
        assert!(matches!(report.outcome, Err(Error::QueueOverflow { limit: 1 })));
        assert_eq!(manager.stats().total_rejected, 1);
        assert_eq!(manager.stats().queue_length, 2);
    }

    #[tokio::test]
    async fn test_completion_event_frees_unit_for_queue_head() {
        let (mut manager, mut events) = manager(PoolConfig::default().with_max_units(1));
        let (first, rx1) = entry(json!("first"));
        let (second, rx2) = entry(json!("second"));
        let second_id = second.envelope.id();
        manager.submit(first);
        manager.submit(second);
        manager.dispatch();
        assert_eq!(manager.stats().queue_length, 1);

        let event = events.recv().await.expect("event");
        manager.handle_event(event);
        assert_eq!(rx1.await.unwrap().into_result().unwrap(), json!("first"));

        let info = manager.unit_info(Instant::now());
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].current_task, Some(second_id));
        assert_eq!(info[0].tasks_completed, 1);

        let event = events.recv().await.expect("event");
        manager.handle_event(event);
        assert_eq!(rx2.await.unwrap().into_result().unwrap(), json!("second"));
        assert_eq!(manager.stats().total_completed, 2);
        assert_eq!(manager.stats().idle_units, 1);
    }

    #[tokio::test]
    async fn test_late_event_from_retired_unit_is_discarded() {
        let (mut manager, mut events) = manager(PoolConfig::default().with_max_units(1));
        let (entry, rx) = entry(json!(1));
        let id = entry.envelope.id();
        manager.submit(entry);
        manager.dispatch();

        assert_eq!(manager.cancel(id), CancelOutcome::Aborted);
        assert!(matches!(rx.await.unwrap().outcome, Err(Error::Cancelled)));

        // The thread may or may not have reported before its inbox closed
        if let Ok(event) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            manager.handle_event(event.expect("event"));
        }
        let stats = manager.stats();
        assert_eq!(stats.total_units, 0);
        assert_eq!(stats.total_completed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_command_is_handed_to_run_loop() {
        let (mut manager, _events) = manager(PoolConfig::default());
        let (entry, _rx) = entry(json!(1));
        manager.submit(entry);

        let (tx, mut rx) = oneshot::channel();
        let ControlFlow::Break(reply) = manager.handle_command(Command::Shutdown(tx)) else {
            panic!("shutdown must stop the run loop");
        };
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.stats().queue_length, 1);

        reply.send(()).unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_sweep_reclaims_idle_units() {
        let config = PoolConfig::default()
            .with_max_units(1)
            .with_idle_timeout(Duration::from_secs(1));
        let (mut manager, mut events) = manager(config);
        let (entry, _rx) = entry(json!(1));
        manager.submit(entry);
        manager.dispatch();
        manager.handle_event(events.recv().await.expect("event"));

        manager.sweep(Instant::now());
        assert_eq!(manager.stats().total_units, 1);

        manager.sweep(Instant::now() + Duration::from_secs(2));
        assert_eq!(manager.stats().total_units, 0);
    }
}
