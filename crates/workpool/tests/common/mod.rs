#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use workpool::{FnHandler, HandlerRegistry};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workpool=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Lets a test decide when each gated task may finish. Tasks carry `{"n": k}`
/// and block until `release(k)`.
#[derive(Clone, Default)]
pub struct Gate {
    released: Arc<(Mutex<HashSet<u64>>, Condvar)>,
    started: Arc<Mutex<Vec<u64>>>,
}

impl Gate {
    pub fn payload(n: u64) -> Value {
        json!({ "n": n })
    }

    pub fn release(&self, n: u64) {
        let (lock, cvar) = &*self.released;
        lock.lock().unwrap().insert(n);
        cvar.notify_all();
    }

    pub fn started(&self) -> Vec<u64> {
        self.started.lock().unwrap().clone()
    }

    pub async fn wait_started(&self, n: u64) {
        until(|| self.started().contains(&n)).await;
    }

    fn run(&self, payload: Value) -> anyhow::Result<Value> {
        let n = payload["n"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("gate payload needs `n`"))?;
        self.started.lock().unwrap().push(n);

        let (lock, cvar) = &*self.released;
        let mut released = lock.lock().unwrap();
        while !released.contains(&n) {
            released = cvar.wait(released).unwrap();
        }
        Ok(payload)
    }

    pub fn registry(&self) -> HandlerRegistry {
        let gate = self.clone();
        HandlerRegistry::with_builtin()
            .with_handler(
                "gate",
                FnHandler::new(move |payload: Value| -> anyhow::Result<Value> {
                    gate.run(payload)
                }),
            )
            .with_handler(
                "sleep",
                FnHandler::new(|payload: Value| -> anyhow::Result<Value> {
                    let ms = payload.as_u64().unwrap_or_default();
                    std::thread::sleep(Duration::from_millis(ms));
                    Ok(payload)
                }),
            )
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn until<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    let wait = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached within 5s");
}
