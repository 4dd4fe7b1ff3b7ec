//! Configure-once facade over the pool, the scheduler, and transactional
//! execution

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ManagerConfig;
use crate::connection::{DEFAULT_BUSY_TIMEOUT_MS, DatabaseConnection};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::scheduler::WorkerScheduler;

/// Wall-clock budget for [`ConnectionManager::execute_transaction`].
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

struct ManagerInner {
   pool: Arc<ConnectionPool>,
   scheduler: Arc<WorkerScheduler>,
   connection_timeout: Duration,
}

/// Configuration is strictly one-way: a shut-down manager stays shut down
/// instead of becoming configurable again.
enum ManagerSlot {
   Unconfigured,
   Running(ManagerInner),
   ShutDown,
}

/// Owns the [`ConnectionPool`] and its maintenance scheduler, and runs
/// closures transactionally with a wall-clock budget.
///
/// Created unconfigured; [`configure`](Self::configure) wires it up exactly
/// once. Every other method fails cleanly until then, so start-up ordering
/// bugs surface as errors instead of panics.
pub struct ConnectionManager {
   inner: Mutex<ManagerSlot>,
}

impl ConnectionManager {
   /// Create an unconfigured manager.
   pub fn new() -> Self {
      Self {
         inner: Mutex::new(ManagerSlot::Unconfigured),
      }
   }

   /// Build the scheduler and the pool from `config`.
   ///
   /// Fails if already configured, or configured at any point in the past;
   /// reconfiguration would orphan outstanding leases.
   pub fn configure(&self, config: ManagerConfig) -> Result<()> {
      let mut slot = self.inner.lock();
      match *slot {
         ManagerSlot::Unconfigured => {}
         ManagerSlot::Running(_) => {
            return Err(Error::internal("connection manager is already configured"));
         }
         ManagerSlot::ShutDown => {
            return Err(Error::internal("connection manager has been shut down"));
         }
      }

      let scheduler = Arc::new(WorkerScheduler::new(config.worker_threads));
      let pool = Arc::new(ConnectionPool::new(
         &config.connection_string,
         config.pool.clone(),
         Some(scheduler.as_ref()),
      ));

      *slot = ManagerSlot::Running(ManagerInner {
         pool,
         scheduler,
         connection_timeout: config.pool.connection_timeout,
      });
      debug!("connection manager configured");
      Ok(())
   }

   /// Whether the manager is configured and serving connections.
   pub fn is_configured(&self) -> bool {
      matches!(*self.inner.lock(), ManagerSlot::Running(_))
   }

   /// Acquire a pooled connection, waiting up to the configured
   /// `connection_timeout`.
   pub fn acquire_connection(&self) -> Result<PooledConnection> {
      let timeout = self.configured()?.1;
      self.acquire_with_timeout(timeout)
   }

   /// Acquire a pooled connection with an explicit wait budget.
   pub fn acquire_with_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
      let pool = self.configured()?.0;
      let started = Instant::now();
      match pool.acquire(timeout) {
         Some(lease) => Ok(lease),
         None if started.elapsed() >= timeout => Err(Error::timeout(format!(
            "no connection became available within {timeout:?}"
         ))),
         None => Err(Error::connection("failed to open a new connection")),
      }
   }

   /// Run `f` on a pooled connection, returning the lease afterward.
   pub fn with_connection<T>(
      &self,
      f: impl FnOnce(&DatabaseConnection) -> Result<T>,
   ) -> Result<T> {
      let lease = self.acquire_connection()?;
      f(&lease)
   }

   /// Run `f` inside a transaction with the default budget.
   ///
   /// See [`execute_transaction_with_timeout`](Self::execute_transaction_with_timeout).
   pub fn execute_transaction<T>(
      &self,
      f: impl FnOnce(&DatabaseConnection) -> Result<T>,
   ) -> Result<T> {
      self.execute_transaction_with_timeout(f, DEFAULT_TRANSACTION_TIMEOUT)
   }

   /// Run `f` inside a transaction, committing only if `f` succeeds and the
   /// whole attempt stayed within `timeout`.
   ///
   /// The budget is checked twice: after `BEGIN` (acquisition may have eaten
   /// it) and again before `COMMIT`. Exceeding it at either checkpoint rolls
   /// back and returns [`Error::Timeout`]. Any error from `f`, and any panic,
   /// also rolls back; the connection's busy-timeout is restored before the
   /// lease returns to the pool either way.
   pub fn execute_transaction_with_timeout<T>(
      &self,
      f: impl FnOnce(&DatabaseConnection) -> Result<T>,
      timeout: Duration,
   ) -> Result<T> {
      let started = Instant::now();
      let lease = self.acquire_connection()?;

      // Bound lock waits inside the transaction by the same budget.
      lease.set_busy_timeout(timeout);
      lease.begin_transaction().map_err(as_transaction)?;
      let mut guard = RollbackGuard::new(&lease);

      if started.elapsed() > timeout {
         return Err(Error::timeout(
            "transaction budget exhausted before execution",
         ));
      }

      let value = f(&lease)?;

      if started.elapsed() > timeout {
         return Err(Error::timeout("transaction budget exhausted before commit"));
      }

      lease.commit().map_err(as_transaction)?;
      guard.disarm();
      Ok(value)
   }

   /// Counters from the underlying pool.
   pub fn get_pool_stats(&self) -> Result<PoolStats> {
      Ok(self.configured()?.0.get_stats())
   }

   /// Force one pool health-check sweep on the caller's thread.
   pub fn run_health_check(&self) -> Result<()> {
      self.configured()?.0.run_health_check();
      Ok(())
   }

   /// Shut down the pool, then stop and join the scheduler workers.
   ///
   /// Idempotent. The manager stays shut down permanently; it cannot be
   /// reconfigured.
   pub fn shutdown(&self) {
      let mut slot = self.inner.lock();
      if !matches!(*slot, ManagerSlot::Running(_)) {
         return;
      }
      let ManagerSlot::Running(inner) = std::mem::replace(&mut *slot, ManagerSlot::ShutDown)
      else {
         return;
      };
      drop(slot);

      inner.pool.shutdown();
      inner.scheduler.shutdown();
      debug!("connection manager shut down");
   }

   fn configured(&self) -> Result<(Arc<ConnectionPool>, Duration)> {
      match &*self.inner.lock() {
         ManagerSlot::Running(inner) => Ok((Arc::clone(&inner.pool), inner.connection_timeout)),
         ManagerSlot::Unconfigured => Err(Error::internal("connection manager is not configured")),
         ManagerSlot::ShutDown => Err(Error::internal("connection manager is shut down")),
      }
   }
}

impl Default for ConnectionManager {
   fn default() -> Self {
      Self::new()
   }
}

impl Drop for ConnectionManager {
   fn drop(&mut self) {
      self.shutdown();
   }
}

impl std::fmt::Debug for ConnectionManager {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionManager")
         .field("configured", &self.is_configured())
         .finish_non_exhaustive()
   }
}

/// Report BEGIN/COMMIT failures as transaction errors instead of plain query
/// failures.
pub(crate) fn as_transaction(err: Error) -> Error {
   match err {
      Error::QueryFailed { message, code } => Error::TransactionFailed { message, code },
      other => other,
   }
}

/// Rolls back on drop unless disarmed by a successful commit, and always
/// restores the connection's default busy-timeout.
struct RollbackGuard<'a> {
   conn: &'a DatabaseConnection,
   armed: bool,
}

impl<'a> RollbackGuard<'a> {
   fn new(conn: &'a DatabaseConnection) -> Self {
      Self { conn, armed: true }
   }

   fn disarm(&mut self) {
      self.armed = false;
   }
}

impl Drop for RollbackGuard<'_> {
   fn drop(&mut self) {
      if self.armed {
         if let Err(e) = self.conn.rollback() {
            // Never mask the error that armed us.
            warn!(error = %e, "rollback failed");
         }
      }
      self
         .conn
         .set_busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS as u64));
   }
}
