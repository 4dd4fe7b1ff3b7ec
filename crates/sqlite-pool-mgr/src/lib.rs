//! # sqlite-pool-mgr
//!
//! Connection pooling and transactional execution for embedded single-file
//! SQLite databases, over the raw `libsqlite3-sys` bindings.
//!
//! ## Core Types
//!
//! - **[`DatabaseManager`]**: High-level entry point with a prepared-statement
//!   cache and explicit transaction state
//! - **[`ConnectionManager`]**: Configure-once owner of the pool and its
//!   maintenance scheduler; runs closures transactionally with a time budget
//! - **[`ConnectionPool`]**: Bounded pool handing out [`PooledConnection`]
//!   leases, with background health checks
//! - **[`DatabaseConnection`]**: RAII wrapper for one native connection handle
//! - **[`PreparedStatement`]**: One compiled statement, safe to outlive the
//!   pool's interest in its connection
//! - **[`Error`]**: Error type for all database operations
//!
//! ## Architecture
//!
//! - **Bounded pool**: Connections stay between `min_connections` and
//!   `max_connections`; acquisition blocks with a timeout under contention
//! - **Self-healing**: Periodic sweeps discard unhealthy or idle connections
//!   and backfill toward the minimum
//! - **Statement reuse**: An LRU cache with count and memory limits hands the
//!   same compiled statement back for repeated SQL
//! - **Guarded transactions**: Closure-based execution commits on success and
//!   rolls back on error, panic, or an exceeded time budget

mod config;
mod connection;
mod database;
mod error;
mod manager;
mod pool;
mod scheduler;
mod statement;

// Re-export public types
pub use config::{ManagerConfig, PoolConfig, StatementCacheConfig};
pub use connection::{ConnectionState, DatabaseConnection};
pub use database::{CacheStats, DatabaseManager, SharedStatement};
pub use error::{Error, Result};
pub use manager::{ConnectionManager, DEFAULT_TRANSACTION_TIMEOUT};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use scheduler::{RepeatingTask, Scheduler, WorkerScheduler};
pub use statement::{PreparedStatement, StepOutcome, Value};
