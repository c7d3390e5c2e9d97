//! # `workpool`
//!
//! A bounded, self-scaling pool of dedicated worker threads for running
//! blocking work (file processing, parsing, compression, aggregation) without
//! stalling async code.
//!
//! Tasks are JSON payloads tagged with a kind. The pool grows lazily up to
//! `max_units` threads, queues the rest in strict FIFO order, reclaims threads
//! that sit idle, and replaces threads whose task overruns its timeout.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use workpool::{Client, PoolConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> workpool::Result<()> {
//! let client = Client::builder()
//!     .with_config(PoolConfig::default())
//!     .with_builtin_handlers()
//!     .build()?;
//!
//! let rows = client
//!     .execute("parse_csv", json!({ "text": "epoch,loss\n1,0.71\n2,0.64" }))
//!     .await?;
//! println!("{rows}");
//!
//! println!("{:?}", client.stats().await?);
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod pool;
pub mod task;
pub mod unit;

pub use client::{Client, PoolBuilder};
pub use config::PoolConfig;
pub use error::{Error, Result};
pub use handler::{FnHandler, HandlerRegistry, TaskHandler};
pub use pool::{CancelOutcome, PoolStats};
pub use task::{TaskEnvelope, TaskHandle, TaskId, TaskReport};
pub use unit::{UnitId, UnitSnapshot, UnitStatus};
