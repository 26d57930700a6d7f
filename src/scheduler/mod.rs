//! Bounded-parallelism batch execution.
//!
//! ```text
//!                   ┌──────────────┐
//!                   │ Batch queue  │  (planned order)
//!                   └──────┬───────┘
//!         ┌────────────────┼────────────────┐
//!         ▼                ▼                ▼
//!    ┌─────────┐      ┌─────────┐      ┌─────────┐
//!    │ Worker 0│      │ Worker 1│      │ Worker N│   cache → remote → local
//!    └────┬────┘      └────┬────┘      └────┬────┘
//!         └────────────────┼────────────────┘
//!                          ▼
//!                 mpsc<BatchResult> ──► job controller
//! ```
//!
//! The cache, circuit breaker and memory monitor are shared by every worker
//! and synchronize internally. Batches and records are read-only.

pub mod worker_pool;

pub use worker_pool::{default_max_workers, BatchResult, PoolConfig, PoolError, PoolStats, WorkerPool};
