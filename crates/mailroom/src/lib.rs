//! Mailroom - Durable Filesystem Job Queue
//!
//! A file-system-backed job queue with a supervised worker pool:
//! - Messages persisted as individual files; state transitions are atomic
//!   same-filesystem renames
//! - Crash recovery: in-flight messages are requeued as timeouts on open
//! - Retry accounting encoded in file names, with dead-letter routing
//! - TTL expiry, capacity and payload-size bounds on push
//! - Workers that run each job in an isolated task under a hard kill timer
//! - Named dispatch groups broadcasting pull wake-ups to idle workers
//! - Queue telemetry through the `metrics` facade
//!
//! # Architecture
//!
//! ```text
//!  Producer                                   Worker
//!     │                                          │
//!     │ push: tmp write + rename                 │ pull: rename
//!     ▼                                          ▼
//!  ┌─────────────────────────────────────────────────────────────┐
//!  │  <root_dir>/<queue_name>/                                   │
//!  │                                                             │
//!  │   queued/<ts>[.<flag>]*  ──rename──▶  pulled/<ts>[.<flag>]* │
//!  │        ▲                                  │                 │
//!  │        └────────── fail: rename ──────────┤                 │
//!  │                    (flag appended)        │                 │
//!  └───────────────────────────────────────────┼─────────────────┘
//!                                              │
//!                     acknowledge: delete  ◀───┤
//!                                              │
//!  ┌───────────────────────────────────────────▼─────────────────┐
//!  │  <root_dir>/<dead_letter_queue>/queued/<ts>[.<flag>]*.dead  │
//!  └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A message lives in exactly one state directory at any instant. Two
//! workers racing for the same head lose and win a single rename; there are
//! no locks anywhere.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailroom::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     let settings = QueueSettings::new("/var/lib/mailroom", "emails")
//!         .with_max_retries(Some(3))
//!         .with_dead_letters(QueueSettings::new("/var/lib/mailroom", "emails_dead"));
//!     let queue = Arc::new(Queue::open(settings).await?);
//!
//!     let dispatch = Dispatch::new();
//!     let pool = WorkerPool::start(
//!         4,
//!         Arc::clone(&queue),
//!         mailroom::worker::handler(|payload| async move {
//!             println!("processing {} bytes", payload.len());
//!             Ok(())
//!         }),
//!         WorkerConfig::default(),
//!         &dispatch,
//!     )?;
//!
//!     queue.push(b"hello").await?;
//!     dispatch.broadcast("workers", Signal::PullJob);
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod worker;

pub use config::{QueueSettings, WorkerConfig};
pub use dispatch::{Dispatch, Signal};
pub use error::{QueueError, QueueResult};
pub use message::{Flag, Message};
pub use metrics::{register_metrics, QueueMetrics};
pub use queue::{Queue, QueueBackend};
pub use worker::{handler, JobHandler, Worker, WorkerHandle, WorkerPool};

/// Re-export of the commonly used surface.
pub mod prelude {
    pub use crate::config::{QueueSettings, WorkerConfig};
    pub use crate::dispatch::{Dispatch, Signal};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::message::{Flag, Message};
    pub use crate::queue::{Queue, QueueBackend};
    pub use crate::worker::{Worker, WorkerPool};
}
