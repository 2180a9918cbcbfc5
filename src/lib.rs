//! A beanstalkd-style work queue that keeps its jobs in a relational table.
//!
//! Producers `put` payloads onto named tubes; consumers `reserve` them back in
//! priority order and then `delete`, `release` or `bury` each one. Meant for
//! low-throughput queues where running a dedicated queue daemon isn't worth it.
//!
//! ```no_run
//! # async fn demo() -> Result<(), table_beans::QueueError> {
//! use std::sync::Arc;
//! use table_beans::store::MemoryStore;
//! use table_beans::Queue;
//!
//! let mut queue = Queue::new(Arc::new(MemoryStore::new()));
//! queue.choose("mail").put(&"hello", Default::default())?;
//! queue.watch(["mail"], true);
//! if let Some(mut job) = queue.reserve(None).await? {
//!     let body: String = job.body()?;
//!     println!("{body}");
//!     job.delete()?;
//! }
//! # Ok(())
//! # }
//! ```
pub mod config;
pub mod error;
pub mod job;
pub mod queue;
pub mod store;
pub mod types;
pub mod util;

pub use config::QueueConfig;
pub use error::{QueueError, StoreError};
pub use job::Job;
pub use queue::{
    IntoVerdict, ProcessOptions, ProcessStats, PutOptions, Queue, QueueState,
    Verdict,
};
