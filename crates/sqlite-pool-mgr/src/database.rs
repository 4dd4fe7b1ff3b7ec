//! High-level entry point: cached prepared statements and explicit
//! transaction state over a [`ConnectionManager`]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::config::StatementCacheConfig;
use crate::error::{Error, Result};
use crate::manager::{ConnectionManager, as_transaction};
use crate::pool::PooledConnection;
use crate::statement::{PreparedStatement, StepOutcome, Value};

/// A cached statement, shared between the cache and its users.
pub type SharedStatement = Arc<PreparedStatement>;

/// Point-in-time statement-cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
   /// Number of statements currently cached
   pub cached_statements: usize,
   /// Estimated bytes held by cached statements
   pub cache_memory_estimate: usize,
}

/// LRU statement cache with a count limit and an estimated-memory budget.
///
/// The recency queue keeps the most recently used SQL at the front. Exceeding
/// the count limit evicts one entry; exceeding the memory budget evicts the
/// older half of the cache at once so a burst of large statements cannot
/// thrash one-by-one.
struct StatementCache {
   config: StatementCacheConfig,
   entries: HashMap<String, SharedStatement>,
   recency: VecDeque<String>,
   memory_estimate: usize,
}

impl StatementCache {
   fn new(config: StatementCacheConfig) -> Self {
      Self {
         config,
         entries: HashMap::new(),
         recency: VecDeque::new(),
         memory_estimate: 0,
      }
   }

   /// Look up `sql`, refresh its recency, and hand it back rewound.
   ///
   /// An entry that fails to rewind is evicted and reported as a miss so the
   /// caller recompiles it.
   fn hit(&mut self, sql: &str) -> Option<SharedStatement> {
      let stmt = Arc::clone(self.entries.get(sql)?);

      if stmt.reset().is_err() || stmt.clear_bindings().is_err() {
         self.remove(sql);
         debug!(sql, "evicted statement that failed to rewind");
         return None;
      }

      if let Some(pos) = self.recency.iter().position(|s| s == sql) {
         let key = self.recency.remove(pos).unwrap_or_else(|| sql.to_string());
         self.recency.push_front(key);
      }
      trace!(sql, "statement cache hit");
      Some(stmt)
   }

   fn insert(&mut self, sql: String, stmt: SharedStatement) {
      if self.entries.len() >= self.config.max_statements {
         self.evict_lru();
      }

      let size = stmt.estimated_size();
      while self.memory_estimate + size > self.config.max_memory_bytes && !self.recency.is_empty()
      {
         let bulk = self.recency.len().div_ceil(2);
         debug!(evicting = bulk, "statement cache over memory budget");
         for _ in 0..bulk {
            self.evict_lru();
         }
      }

      self.memory_estimate += size;
      self.entries.insert(sql.clone(), stmt);
      self.recency.push_front(sql);
   }

   fn evict_lru(&mut self) {
      if let Some(key) = self.recency.pop_back() {
         if let Some(stmt) = self.entries.remove(&key) {
            self.memory_estimate = self.memory_estimate.saturating_sub(stmt.estimated_size());
         }
      }
   }

   fn remove(&mut self, sql: &str) {
      if let Some(stmt) = self.entries.remove(sql) {
         self.memory_estimate = self.memory_estimate.saturating_sub(stmt.estimated_size());
      }
      if let Some(pos) = self.recency.iter().position(|s| s == sql) {
         self.recency.remove(pos);
      }
   }

   fn clear(&mut self) {
      self.entries.clear();
      self.recency.clear();
      self.memory_estimate = 0;
   }

   fn stats(&self) -> CacheStats {
      CacheStats {
         cached_statements: self.entries.len(),
         cache_memory_estimate: self.memory_estimate,
      }
   }
}

/// High-level database access: SQL execution, a prepared-statement cache, and
/// an explicit-transaction slot.
///
/// At most one explicit transaction is active at a time; while it is, every
/// [`execute`](Self::execute) and [`prepare_statement`](Self::prepare_statement)
/// call runs on the transaction's reserved connection so the work actually
/// lands inside the transaction.
pub struct DatabaseManager {
   manager: Arc<ConnectionManager>,
   cache: Mutex<StatementCache>,
   txn: Mutex<Option<PooledConnection>>,
}

impl DatabaseManager {
   /// Wrap `manager` with default cache limits.
   pub fn new(manager: Arc<ConnectionManager>) -> Self {
      Self::with_cache_config(manager, StatementCacheConfig::default())
   }

   /// Wrap `manager` with explicit cache limits.
   pub fn with_cache_config(manager: Arc<ConnectionManager>, config: StatementCacheConfig) -> Self {
      Self {
         manager,
         cache: Mutex::new(StatementCache::new(config)),
         txn: Mutex::new(None),
      }
   }

   /// Run a single SQL statement.
   ///
   /// Inside an explicit transaction this runs on the reserved connection;
   /// otherwise a pooled connection is borrowed for the call.
   pub fn execute(&self, sql: &str) -> Result<()> {
      let started = std::time::Instant::now();
      let result = {
         let txn = self.txn.lock();
         if let Some(lease) = txn.as_ref() {
            lease.execute(sql)
         } else {
            drop(txn);
            self.manager.with_connection(|conn| conn.execute(sql))
         }
      };
      match &result {
         Ok(()) => trace!(elapsed = ?started.elapsed(), "execute"),
         Err(e) => error!(elapsed = ?started.elapsed(), error = %e, "execute failed"),
      }
      result
   }

   /// Compile `sql`, or return the cached compilation rewound and with
   /// bindings cleared.
   ///
   /// The returned statement stays valid even if its backing connection is
   /// later discarded by the pool.
   pub fn prepare_statement(&self, sql: &str) -> Result<SharedStatement> {
      let mut cache = self.cache.lock();
      if let Some(stmt) = cache.hit(sql) {
         return Ok(stmt);
      }

      let txn_conn = {
         let txn = self.txn.lock();
         txn.as_ref().map(|lease| Arc::clone(lease.shared_connection()))
      };
      let stmt = match txn_conn {
         Some(conn) => Arc::new(PreparedStatement::prepare(conn, sql)?),
         None => {
            // The lease must outlive the compile: returning it early lets the
            // pool close the connection before sqlite sees the SQL.
            let lease = self.manager.acquire_connection()?;
            let conn = Arc::clone(lease.shared_connection());
            Arc::new(PreparedStatement::prepare(conn, sql)?)
         }
      };

      cache.insert(sql.to_string(), Arc::clone(&stmt));
      trace!(sql, "statement compiled and cached");
      Ok(stmt)
   }

   /// Bind `params` positionally, run the statement to completion, and invoke
   /// `on_row` for each result row. Returns the number of rows seen.
   pub fn execute_prepared<F>(
      &self,
      stmt: &SharedStatement,
      params: &[Value],
      mut on_row: F,
   ) -> Result<usize>
   where
      F: FnMut(&PreparedStatement) -> Result<()>,
   {
      stmt.reset()?;
      stmt.clear_bindings()?;
      for (i, value) in params.iter().enumerate() {
         stmt.bind(i + 1, value)?;
      }

      let mut rows = 0;
      loop {
         match stmt.step()? {
            StepOutcome::Row => {
               on_row(stmt)?;
               rows += 1;
            }
            StepOutcome::Done => return Ok(rows),
         }
      }
   }

   /// Begin an explicit transaction on a reserved connection.
   ///
   /// Fails if one is already active.
   pub fn begin_transaction(&self) -> Result<()> {
      let mut txn = self.txn.lock();
      if txn.is_some() {
         return Err(Error::transaction("a transaction is already active"));
      }

      let lease = self.manager.acquire_connection()?;
      lease.begin_transaction().map_err(as_transaction)?;
      *txn = Some(lease);
      trace!("transaction started");
      Ok(())
   }

   /// Commit the active transaction and release its connection.
   ///
   /// A failed COMMIT is rolled back so the connection never returns to the
   /// pool with a transaction still open. The slot is cleared either way.
   pub fn commit_transaction(&self) -> Result<()> {
      let lease = self
         .txn
         .lock()
         .take()
         .ok_or_else(|| Error::transaction("no active transaction"))?;

      if let Err(e) = lease.commit() {
         if let Err(re) = lease.rollback() {
            warn!(error = %re, "rollback after failed commit also failed");
         }
         return Err(as_transaction(e));
      }
      trace!("transaction committed");
      Ok(())
   }

   /// Roll back the active transaction and release its connection.
   pub fn rollback_transaction(&self) -> Result<()> {
      let lease = self
         .txn
         .lock()
         .take()
         .ok_or_else(|| Error::transaction("no active transaction"))?;

      lease.rollback().map_err(as_transaction)?;
      trace!("transaction rolled back");
      Ok(())
   }

   /// Whether an explicit transaction is currently active.
   pub fn in_transaction(&self) -> bool {
      self.txn.lock().is_some()
   }

   /// Run `f` inside an explicit transaction.
   ///
   /// Commits when `f` succeeds; rolls back when it errors or panics. `f`
   /// receives this manager, so statements it executes and prepares run on
   /// the transaction connection.
   pub fn with_transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
      self.begin_transaction()?;
      let mut guard = TxnGuard::new(self);
      let value = f(self)?;
      guard.disarm();
      self.commit_transaction()?;
      Ok(value)
   }

   /// Drop every cached statement.
   pub fn clear_statement_cache(&self) {
      self.cache.lock().clear();
      debug!("statement cache cleared");
   }

   /// Current cache counters.
   pub fn get_cache_stats(&self) -> CacheStats {
      self.cache.lock().stats()
   }
}

impl Drop for DatabaseManager {
   fn drop(&mut self) {
      if let Some(lease) = self.txn.lock().take() {
         if let Err(e) = lease.rollback() {
            warn!(error = %e, "rollback of abandoned transaction failed");
         }
      }
   }
}

impl std::fmt::Debug for DatabaseManager {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("DatabaseManager")
         .field("cache", &self.get_cache_stats())
         .field("in_transaction", &self.in_transaction())
         .finish_non_exhaustive()
   }
}

/// Rolls back on drop unless disarmed; arms [`DatabaseManager::with_transaction`]
/// against early returns and panics in the closure.
struct TxnGuard<'a> {
   db: &'a DatabaseManager,
   armed: bool,
}

impl<'a> TxnGuard<'a> {
   fn new(db: &'a DatabaseManager) -> Self {
      Self { db, armed: true }
   }

   fn disarm(&mut self) {
      self.armed = false;
   }
}

impl Drop for TxnGuard<'_> {
   fn drop(&mut self) {
      if self.armed {
         if let Err(e) = self.db.rollback_transaction() {
            warn!(error = %e, "rollback failed");
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use crate::connection::DatabaseConnection;

   use super::*;

   fn cached_stmt(conn: &Arc<DatabaseConnection>, sql: &str) -> SharedStatement {
      Arc::new(PreparedStatement::prepare(Arc::clone(conn), sql).unwrap())
   }

   fn test_conn() -> Arc<DatabaseConnection> {
      let conn = Arc::new(DatabaseConnection::new());
      conn.open(":memory:").unwrap();
      conn
   }

   #[test]
   fn count_limit_evicts_single_lru_entry() {
      let conn = test_conn();
      let mut cache = StatementCache::new(StatementCacheConfig {
         max_statements: 2,
         ..Default::default()
      });

      cache.insert("SELECT 1".into(), cached_stmt(&conn, "SELECT 1"));
      cache.insert("SELECT 2".into(), cached_stmt(&conn, "SELECT 2"));

      // Refresh "SELECT 1" so "SELECT 2" becomes the LRU victim.
      assert!(cache.hit("SELECT 1").is_some());
      cache.insert("SELECT 3".into(), cached_stmt(&conn, "SELECT 3"));

      assert_eq!(cache.stats().cached_statements, 2);
      assert!(cache.hit("SELECT 2").is_none());
      assert!(cache.hit("SELECT 1").is_some());
      assert!(cache.hit("SELECT 3").is_some());
   }

   #[test]
   fn memory_budget_evicts_older_half() {
      let conn = test_conn();
      let mut cache = StatementCache::new(StatementCacheConfig {
         max_statements: 100,
         max_memory_bytes: 1,
      });

      // Each insert exceeds the one-byte budget, so the previous entry is
      // evicted and the count never exceeds one.
      cache.insert("SELECT 1".into(), cached_stmt(&conn, "SELECT 1"));
      assert_eq!(cache.stats().cached_statements, 1);

      cache.insert("SELECT 2".into(), cached_stmt(&conn, "SELECT 2"));
      assert_eq!(cache.stats().cached_statements, 1);
      assert!(cache.hit("SELECT 1").is_none());
      assert!(cache.hit("SELECT 2").is_some());
   }

   #[test]
   fn clear_resets_counters() {
      let conn = test_conn();
      let mut cache = StatementCache::new(StatementCacheConfig::default());
      cache.insert("SELECT 1".into(), cached_stmt(&conn, "SELECT 1"));
      assert!(cache.stats().cache_memory_estimate > 0);

      cache.clear();
      assert_eq!(
         cache.stats(),
         CacheStats {
            cached_statements: 0,
            cache_memory_estimate: 0,
         }
      );
   }
}
