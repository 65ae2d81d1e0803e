//! Persistence for samples, alerts and remediation logs
//!
//! ## Design
//!
//! - **Trait-based**: `StorageBackend` lets the engine run on SQLite or in memory
//! - **Async**: All operations are async for compatibility with Tokio actors
//! - **Guarantees in the store**: alert deduplication and the per-device
//!   remediation slot are enforced by the backend, not by callers
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with WAL
//! - **In-Memory**: No persistence, for tests or `"backend": "none"`
//!
//! ## Usage
//!
//! ```no_run
//! use netpulse::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./netpulse.db").await?;
//!     println!("{}", backend.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, QueryRange, StorageBackend};
pub use error::{StorageError, StorageResult};
pub use ingest::{IngestReport, MetricIngestor};
pub use memory::MemoryBackend;
pub use schema::{
    Alert, AlertFilter, AlertKey, AlertStatus, AlertTransition, AlertUpsert, MetricSample,
    MetricType, NewAlert, NewRemediation, RemediationFilter, RemediationLog, RemediationOutcome,
    RemediationStatus, Severity,
};
