use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use workpool::{Client, TaskId, TaskReport};

use crate::server::ServerError;

/// Bounds on results kept for `GET /v1/tasks/:id`.
#[derive(Debug, Clone, Copy)]
pub struct ParkingLimits {
    pub max_parked: usize,
    pub result_ttl: Duration,
}

/// A task submitted without waiting. A collector task owns its handle and
/// stores the report here, so a caller that stops waiting loses nothing.
#[derive(Debug)]
enum Parked {
    Running(watch::Receiver<bool>),
    Finished { report: TaskReport, at: Instant },
}

/// Represents the state of the server.
#[derive(Debug)]
pub struct ServerState {
    pub client: Client,
    limits: ParkingLimits,
    parked: Mutex<HashMap<TaskId, Parked>>,
}

impl ServerState {
    pub fn new(client: Client, limits: ParkingLimits) -> Self {
        Self {
            client,
            limits,
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Periodically drop results nobody collected within the TTL. Stops once
    /// the state is dropped.
    pub fn start_reaper(self: &Arc<Self>) {
        let state = Arc::downgrade(self);
        let period = (self.limits.result_ttl / 4).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                state.evict_expired(Instant::now()).await;
            }
        });
    }

    /// Submit a task whose result is collected later with [`Self::collect`].
    pub async fn submit(
        self: &Arc<Self>,
        kind: &str,
        payload: Value,
    ) -> Result<TaskId, ServerError> {
        let (handle, done_tx) = {
            let mut parked = self.parked.lock().await;
            if parked.len() >= self.limits.max_parked {
                evict_finished(&mut parked, Instant::now(), self.limits.result_ttl);
            }
            if parked.len() >= self.limits.max_parked {
                return Err(ServerError::TooManyParked(self.limits.max_parked));
            }

            let handle = self.client.submit(kind, payload)?;
            let (done_tx, done_rx) = watch::channel(false);
            parked.insert(handle.id(), Parked::Running(done_rx));
            (handle, done_tx)
        };

        let id = handle.id();
        let state = Arc::downgrade(self);
        tokio::spawn(async move {
            let report = handle.await;
            if let Some(state) = state.upgrade() {
                // Forgotten tasks have no slot left
                if let Some(slot) = state.parked.lock().await.get_mut(&id) {
                    *slot = Parked::Finished {
                        report,
                        at: Instant::now(),
                    };
                }
            }
            done_tx.send_replace(true);
        });

        Ok(id)
    }

    /// Wait for a parked task and take its report. A report is handed out
    /// once; dropping this future early leaves it parked.
    pub async fn collect(&self, id: &TaskId) -> Result<TaskReport, ServerError> {
        loop {
            let mut done = {
                let mut parked = self.parked.lock().await;
                match parked.remove(id) {
                    None => return Err(ServerError::TaskNotFound(*id)),
                    Some(Parked::Finished { report, .. }) => return Ok(report),
                    Some(Parked::Running(done)) => {
                        let waiter = done.clone();
                        parked.insert(*id, Parked::Running(done));
                        waiter
                    }
                }
            };

            if done.wait_for(|done| *done).await.is_err() {
                tracing::error!("Collector of task {} stopped without a report", id);
                self.parked.lock().await.remove(id);
                return Err(workpool::Error::PoolShutdown.into());
            }
        }
    }

    /// Stop tracking a task, dropping its result if one arrives.
    pub async fn forget(&self, id: &TaskId) -> bool {
        self.parked.lock().await.remove(id).is_some()
    }

    pub async fn evict_expired(&self, now: Instant) {
        let mut parked = self.parked.lock().await;
        let evicted = evict_finished(&mut parked, now, self.limits.result_ttl);
        if evicted > 0 {
            tracing::debug!("Evicted {} uncollected task results", evicted);
        }
    }
}

fn evict_finished(parked: &mut HashMap<TaskId, Parked>, now: Instant, ttl: Duration) -> usize {
    let before = parked.len();
    parked.retain(|_, slot| match slot {
        Parked::Finished { at, .. } => now.saturating_duration_since(*at) <= ttl,
        Parked::Running(_) => true,
    });
    before - parked.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workpool::PoolConfig;

    fn state(limits: ParkingLimits) -> Arc<ServerState> {
        let client = Client::builder()
            .with_config(PoolConfig::default().with_max_units(2))
            .with_builtin_handlers()
            .build()
            .expect("pool");
        Arc::new(ServerState::new(client, limits))
    }

    async fn wait_finished(state: &ServerState, id: &TaskId) {
        for _ in 0..500 {
            if let Some(Parked::Finished { .. }) = state.parked.lock().await.get(id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never finished");
    }

    #[tokio::test]
    async fn test_parking_is_bounded() -> anyhow::Result<()> {
        let state = state(ParkingLimits {
            max_parked: 2,
            result_ttl: Duration::from_millis(50),
        });

        let first = state.submit("echo", json!(1)).await?;
        let second = state.submit("echo", json!(2)).await?;
        wait_finished(&state, &first).await;
        wait_finished(&state, &second).await;

        let err = state.submit("echo", json!(3)).await.unwrap_err();
        assert!(matches!(err, ServerError::TooManyParked(2)));

        // Expired results make room
        tokio::time::sleep(Duration::from_millis(100)).await;
        let third = state.submit("echo", json!(3)).await?;
        assert!(matches!(
            state.collect(&first).await,
            Err(ServerError::TaskNotFound(_))
        ));
        assert_eq!(state.collect(&third).await?.into_result()?, json!(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_reaper_evicts_uncollected_results() -> anyhow::Result<()> {
        let state = state(ParkingLimits {
            max_parked: 10,
            result_ttl: Duration::from_millis(50),
        });
        state.start_reaper();

        let id = state.submit("echo", json!("late")).await?;
        wait_finished(&state, &id).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(state.parked.lock().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_forgotten_task_is_not_collected() -> anyhow::Result<()> {
        let state = state(ParkingLimits {
            max_parked: 10,
            result_ttl: Duration::from_secs(60),
        });

        let id = state.submit("echo", json!(1)).await?;
        assert!(state.forget(&id).await);
        assert!(!state.forget(&id).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.parked.lock().await.is_empty());
        Ok(())
    }
}
