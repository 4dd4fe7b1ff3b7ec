//! Configuration for the connection pool, the statement cache, and the manager

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`ConnectionPool`](crate::ConnectionPool)
///
/// # Examples
///
/// ```
/// use sqlite_pool_mgr::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just one field
/// let config = PoolConfig {
///    max_connections: 8,
///    ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
   /// Number of connections opened eagerly and maintained by backfills
   ///
   /// Default: 5
   pub min_connections: usize,

   /// Hard upper bound on simultaneously open connections
   ///
   /// Default: 20
   pub max_connections: usize,

   /// Connections idle longer than this are closed instead of reused
   ///
   /// Default: 300 seconds
   pub idle_timeout: Duration,

   /// Interval between background health-check sweeps
   ///
   /// Default: 60 seconds
   pub health_check_interval: Duration,

   /// Default wait budget when acquiring a connection
   ///
   /// Default: 10 seconds
   pub connection_timeout: Duration,

   /// Whether to register the periodic health-check sweep
   ///
   /// Default: true
   pub enable_health_checks: bool,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         min_connections: 5,
         max_connections: 20,
         idle_timeout: Duration::from_secs(300),
         health_check_interval: Duration::from_secs(60),
         connection_timeout: Duration::from_secs(10),
         enable_health_checks: true,
      }
   }
}

/// Limits for the prepared-statement cache owned by
/// [`DatabaseManager`](crate::DatabaseManager)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementCacheConfig {
   /// Maximum number of cached statements before single-entry LRU eviction
   ///
   /// Default: 100
   pub max_statements: usize,

   /// Estimated-memory budget; exceeding it triggers bulk eviction of the
   /// oldest half of the cache
   ///
   /// Default: 10 MiB
   pub max_memory_bytes: usize,
}

impl Default for StatementCacheConfig {
   fn default() -> Self {
      Self {
         max_statements: 100,
         max_memory_bytes: 10 * 1024 * 1024,
      }
   }
}

/// Configuration for [`ConnectionManager`](crate::ConnectionManager)
///
/// The connection string and worker-thread count come from the application's
/// own configuration layer; this struct is the hand-off point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
   /// Path to the database file, or a `file:` URI with query parameters
   pub connection_string: String,

   /// Worker threads backing the scheduler that runs pool health checks
   ///
   /// Default: 4
   pub worker_threads: usize,

   /// Pool sizing and timing
   pub pool: PoolConfig,
}

impl ManagerConfig {
   /// Config with defaults for everything but the connection string.
   pub fn new(connection_string: impl Into<String>) -> Self {
      Self {
         connection_string: connection_string.into(),
         worker_threads: 4,
         pool: PoolConfig::default(),
      }
   }
}
