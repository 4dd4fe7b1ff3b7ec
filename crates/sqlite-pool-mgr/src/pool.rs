//! Bounded connection pool with leases, blocking acquisition, and health sweeps

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::connection::DatabaseConnection;
use crate::error::Result;
use crate::scheduler::Scheduler;

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
   /// Connections currently counted against `max_connections`
   pub total_connections: usize,
   /// Connections sitting idle in the pool
   pub available_connections: usize,
   /// Connections currently held by leases
   pub active_connections: usize,
   /// Cumulative count of connections that failed to open
   pub failed_connections: usize,
}

struct PoolState {
   available: VecDeque<Arc<DatabaseConnection>>,
   total_count: usize,
   failed_count: usize,
   running: bool,
}

struct PoolShared {
   connection_string: String,
   config: PoolConfig,
   state: Mutex<PoolState>,
   available_cond: Condvar,
}

/// Thread-safe pool of [`DatabaseConnection`]s.
///
/// Bounds the number of simultaneously open connections between
/// `min_connections` and `max_connections`, serves [`PooledConnection`]
/// leases under contention, and keeps itself warm by discarding unhealthy or
/// idle connections and backfilling toward the minimum.
///
/// Every connection counted in the total is either in the available queue or
/// held by exactly one lease; the pool never hands the same connection to two
/// leases at once.
pub struct ConnectionPool {
   shared: Arc<PoolShared>,
}

impl ConnectionPool {
   /// Create a pool and eagerly open `min_connections` connections.
   ///
   /// Initial open failures are counted but not fatal: an empty pool is valid
   /// and grows lazily on demand. When health checks are enabled and a
   /// `scheduler` is supplied, a repeating sweep is registered at
   /// `health_check_interval`; the task deregisters itself after
   /// [`shutdown`](Self::shutdown).
   pub fn new(
      connection_string: impl Into<String>,
      config: PoolConfig,
      scheduler: Option<&dyn Scheduler>,
   ) -> Self {
      let shared = Arc::new(PoolShared {
         connection_string: connection_string.into(),
         config,
         state: Mutex::new(PoolState {
            available: VecDeque::new(),
            total_count: 0,
            failed_count: 0,
            running: true,
         }),
         available_cond: Condvar::new(),
      });

      {
         let mut state = shared.state.lock();
         for _ in 0..shared.config.min_connections {
            match open_connection(&shared) {
               Ok(conn) => {
                  state.total_count += 1;
                  state.available.push_back(conn);
               }
               Err(e) => {
                  state.failed_count += 1;
                  warn!(error = %e, "failed to open initial pool connection");
               }
            }
         }
         debug!(
            opened = state.total_count,
            failed = state.failed_count,
            "connection pool created"
         );
      }

      if shared.config.enable_health_checks {
         if let Some(scheduler) = scheduler {
            let weak = Arc::downgrade(&shared);
            scheduler.schedule_repeating(
               shared.config.health_check_interval,
               Box::new(move || match weak.upgrade() {
                  Some(shared) => health_sweep(&shared),
                  None => false,
               }),
            );
         }
      }

      Self { shared }
   }

   /// Acquire a connection, waiting up to `timeout` for one to free up or for
   /// room to open a new one.
   ///
   /// Returns `None` on timeout, open failure, or a shut-down pool; callers
   /// treat that as resource exhaustion, not a crash. The timeout cancels only
   /// the wait — a connection already being opened is allowed to finish.
   pub fn acquire(&self, timeout: Duration) -> Option<PooledConnection> {
      let shared = &self.shared;
      let deadline = Instant::now() + timeout;
      let mut state = shared.state.lock();

      loop {
         if !state.running {
            return None;
         }

         // Prefer reuse. An unhealthy connection leaves the total before the
         // growth check below, so the discard can never suppress a legal
         // replacement.
         while let Some(conn) = state.available.pop_front() {
            if conn.is_open() && conn.check_health() {
               conn.touch();
               return Some(PooledConnection::new(conn, Arc::downgrade(shared)));
            }
            state.total_count -= 1;
            conn.close();
            debug!("discarded unhealthy pooled connection");
         }

         if state.total_count < shared.config.max_connections {
            // Reserve the slot so concurrent acquirers respect the bound
            // while we open outside the lock.
            state.total_count += 1;
            drop(state);
            match open_connection(shared) {
               Ok(conn) => return Some(PooledConnection::new(conn, Arc::downgrade(shared))),
               Err(e) => {
                  warn!(error = %e, "failed to open pool connection");
                  let mut state = shared.state.lock();
                  state.total_count -= 1;
                  state.failed_count += 1;
                  drop(state);
                  // The released slot is progress for another waiter.
                  shared.available_cond.notify_one();
                  return None;
               }
            }
         }

         let now = Instant::now();
         if now >= deadline {
            return None;
         }
         let wait = shared.available_cond.wait_for(&mut state, deadline - now);
         if wait.timed_out()
            && state.available.is_empty()
            && state.total_count >= shared.config.max_connections
         {
            return None;
         }
      }
   }

   /// Current pool counters.
   pub fn get_stats(&self) -> PoolStats {
      let state = self.shared.state.lock();
      PoolStats {
         total_connections: state.total_count,
         available_connections: state.available.len(),
         active_connections: state.total_count - state.available.len(),
         failed_connections: state.failed_count,
      }
   }

   /// Run one health-check sweep on the caller's thread.
   ///
   /// The same sweep the scheduler runs periodically; exposed so tests and
   /// administrative callers can force one deterministically.
   pub fn run_health_check(&self) {
      health_sweep(&self.shared);
   }

   /// Stop serving leases, wake all waiters, and close every idle connection.
   ///
   /// Idempotent. Leases still outstanding close their connections on return.
   pub fn shutdown(&self) {
      let mut state = self.shared.state.lock();
      if !state.running {
         return;
      }
      state.running = false;
      let drained: Vec<_> = state.available.drain(..).collect();
      state.total_count -= drained.len();
      drop(state);

      for conn in &drained {
         conn.close();
      }
      self.shared.available_cond.notify_all();
      debug!(closed = drained.len(), "connection pool shut down");
   }
}

impl Drop for ConnectionPool {
   fn drop(&mut self) {
      self.shutdown();
   }
}

impl std::fmt::Debug for ConnectionPool {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let stats = self.get_stats();
      f.debug_struct("ConnectionPool")
         .field("stats", &stats)
         .finish_non_exhaustive()
   }
}

/// A lease on one pooled connection.
///
/// Move-only; dropping the lease returns the connection to the pool exactly
/// once. If the pool is already gone the connection is simply closed.
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledConnection {
   conn: Option<Arc<DatabaseConnection>>,
   pool: Weak<PoolShared>,
}

impl PooledConnection {
   fn new(conn: Arc<DatabaseConnection>, pool: Weak<PoolShared>) -> Self {
      Self {
         conn: Some(conn),
         pool,
      }
   }

   /// The shared connection backing this lease, for callers (like the
   /// statement cache) that must keep the handle alive past the lease.
   pub(crate) fn shared_connection(&self) -> &Arc<DatabaseConnection> {
      self.conn.as_ref().expect("lease already returned")
   }
}

impl Deref for PooledConnection {
   type Target = DatabaseConnection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("lease already returned")
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         match self.pool.upgrade() {
            Some(shared) => return_connection(&shared, conn),
            None => conn.close(),
         }
      }
   }
}

impl std::fmt::Debug for PooledConnection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PooledConnection")
         .field("conn", &self.conn)
         .finish_non_exhaustive()
   }
}

fn open_connection(shared: &PoolShared) -> Result<Arc<DatabaseConnection>> {
   let conn = Arc::new(DatabaseConnection::new());
   conn.open(&shared.connection_string)?;
   Ok(conn)
}

/// Re-queue a returned connection, or close it and backfill toward the
/// minimum if it is no longer healthy or has idled out.
fn return_connection(shared: &Arc<PoolShared>, conn: Arc<DatabaseConnection>) {
   let mut state = shared.state.lock();

   if !state.running {
      state.total_count = state.total_count.saturating_sub(1);
      drop(state);
      conn.close();
      return;
   }

   if conn.is_open() && conn.check_health() && conn.idle_time() < shared.config.idle_timeout {
      state.available.push_back(conn);
      drop(state);
      shared.available_cond.notify_one();
      return;
   }

   state.total_count -= 1;
   let backfill = state.total_count < shared.config.min_connections
      && state.total_count < shared.config.max_connections;
   if backfill {
      state.total_count += 1;
   }
   drop(state);
   conn.close();
   debug!("closed returned connection");

   if backfill {
      match open_connection(shared) {
         Ok(new_conn) => {
            let mut state = shared.state.lock();
            if state.running {
               state.available.push_back(new_conn);
               drop(state);
               shared.available_cond.notify_one();
            } else {
               state.total_count -= 1;
               drop(state);
               new_conn.close();
            }
         }
         Err(e) => {
            let mut state = shared.state.lock();
            state.total_count -= 1;
            state.failed_count += 1;
            warn!(error = %e, "failed to backfill pool connection");
         }
      }
   }
}

/// One sweep of the available queue: evict broken or idled-out connections,
/// backfill to the minimum, wake waiters. Returns false once the pool has
/// shut down so the scheduled task deregisters itself.
fn health_sweep(shared: &Arc<PoolShared>) -> bool {
   let mut state = shared.state.lock();
   if !state.running {
      return false;
   }

   let mut kept = VecDeque::with_capacity(state.available.len());
   let mut evicted = 0usize;
   while let Some(conn) = state.available.pop_front() {
      if conn.is_open() && conn.check_health() && conn.idle_time() < shared.config.idle_timeout {
         kept.push_back(conn);
      } else {
         state.total_count -= 1;
         conn.close();
         evicted += 1;
      }
   }
   state.available = kept;

   // Reserve backfill slots under the lock, open outside it so a slow open
   // never stalls acquire/return beyond this single pass.
   let mut to_open = 0usize;
   while state.available.len() + to_open < shared.config.min_connections
      && state.total_count < shared.config.max_connections
   {
      state.total_count += 1;
      to_open += 1;
   }
   drop(state);

   if evicted > 0 {
      debug!(evicted, "health check evicted connections");
   }

   let mut opened = 0usize;
   for _ in 0..to_open {
      match open_connection(shared) {
         Ok(conn) => {
            let mut state = shared.state.lock();
            if state.running {
               state.available.push_back(conn);
               opened += 1;
            } else {
               state.total_count -= 1;
               drop(state);
               conn.close();
            }
         }
         Err(e) => {
            let mut state = shared.state.lock();
            state.total_count -= 1;
            state.failed_count += 1;
            warn!(error = %e, "health check backfill failed");
         }
      }
   }

   if evicted > 0 || opened > 0 {
      shared.available_cond.notify_all();
   }
   true
}
