//! RAII wrapper for a single SQLite connection handle

use std::ffi::{CStr, CString, c_char};
use std::ptr;
use std::time::{Duration, Instant};

use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};

// The pregenerated bindings shipped with libsqlite3-sys omit this declaration,
// but the bundled SQLite library exports the symbol; declare it directly.
unsafe extern "C" {
   fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> std::os::raw::c_int;
}

/// Busy-timeout applied to every freshly opened connection. Callers with a
/// stricter budget override it via [`DatabaseConnection::set_busy_timeout`].
pub(crate) const DEFAULT_BUSY_TIMEOUT_MS: i32 = 5_000;

/// Pragmas applied to every connection on open. Failures are ignored: an
/// engine built without one of these features still yields a usable
/// connection.
const OPEN_PRAGMAS: &[&CStr] = &[
   c"PRAGMA journal_mode=WAL",
   c"PRAGMA synchronous=NORMAL",
   c"PRAGMA foreign_keys=ON",
   c"PRAGMA cache_size=-64000",
   c"PRAGMA temp_store=MEMORY",
   c"PRAGMA mmap_size=268435456",
];

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
   Disconnected,
   Connected,
   Error,
}

struct ConnectionInner {
   /// Raw engine handle; null while disconnected
   handle: *mut ffi::sqlite3,
   state: ConnectionState,
   connection_string: String,
   last_error: Option<String>,
   last_activity: Instant,
}

/// A single connection to an embedded SQLite database.
///
/// The native handle is owned exclusively by this value: opening acquires it,
/// [`DatabaseConnection::close`] (or drop) releases it. An internal mutex
/// serializes all access, so a `DatabaseConnection` can be shared behind an
/// `Arc` — which is exactly how [`ConnectionPool`](crate::ConnectionPool)
/// hands it out.
///
/// Closing uses `sqlite3_close_v2`, so a handle with outstanding prepared
/// statements lingers as a zombie until the last statement finalizes rather
/// than invalidating them.
pub struct DatabaseConnection {
   inner: Mutex<ConnectionInner>,
}

// SAFETY: the raw handle is only reachable through the inner mutex, and the
// bundled SQLite is compiled in serialized threading mode (connections are
// opened without SQLITE_OPEN_NOMUTEX), so the engine itself also tolerates
// cross-thread use of the handle held by outstanding prepared statements.
unsafe impl Send for DatabaseConnection {}
unsafe impl Sync for DatabaseConnection {}

impl DatabaseConnection {
   /// Create a closed connection.
   pub fn new() -> Self {
      Self {
         inner: Mutex::new(ConnectionInner {
            handle: ptr::null_mut(),
            state: ConnectionState::Disconnected,
            connection_string: String::new(),
            last_error: None,
            last_activity: Instant::now(),
         }),
      }
   }

   /// Open the database at `path`, creating it if necessary.
   ///
   /// No-op if already connected. On failure any partially opened handle is
   /// released and the connection is left in the `Error` state.
   pub fn open(&self, path: &str) -> Result<()> {
      self.open_with_flags(path, ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE)
   }

   /// Open with explicit `SQLITE_OPEN_*` flags.
   ///
   /// `file:` connection strings get `SQLITE_OPEN_URI` added automatically.
   pub fn open_with_flags(&self, path: &str, flags: i32) -> Result<()> {
      let mut inner = self.inner.lock();

      if inner.state == ConnectionState::Connected {
         return Ok(());
      }

      let mut flags = flags;
      if path.starts_with("file:") {
         flags |= ffi::SQLITE_OPEN_URI;
      }

      let c_path = CString::new(path)
         .map_err(|_| Error::invalid("connection string contains a NUL byte"))?;

      let mut handle: *mut ffi::sqlite3 = ptr::null_mut();
      // SAFETY: c_path outlives the call; handle is an out-parameter.
      let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut handle, flags, ptr::null()) };

      if rc != ffi::SQLITE_OK {
         let message = if handle.is_null() {
            "failed to allocate connection handle".to_string()
         } else {
            // SAFETY: non-null handle from sqlite3_open_v2 is valid even on
            // failure, precisely so the error message can be read.
            let message = unsafe { errmsg(handle) };
            unsafe { sqlite3_close_v2(handle) };
            message
         };
         inner.state = ConnectionState::Error;
         inner.last_error = Some(message.clone());
         return Err(Error::connection_code(rc, message));
      }

      // SAFETY: handle is the valid connection we just opened.
      unsafe {
         configure(handle);
      }

      // Gate on a cheap integrity probe so the pool never serves a corrupt
      // database file.
      // SAFETY: handle is valid and exclusively ours until stored.
      if !unsafe { health_probe(handle) } {
         unsafe { sqlite3_close_v2(handle) };
         inner.state = ConnectionState::Error;
         inner.last_error = Some("integrity check failed on open".to_string());
         return Err(Error::connection_code(
            ffi::SQLITE_CORRUPT,
            "integrity check failed on open",
         ));
      }

      inner.handle = handle;
      inner.state = ConnectionState::Connected;
      inner.connection_string = path.to_string();
      inner.last_activity = Instant::now();
      trace!(path = %path, "connection opened");
      Ok(())
   }

   /// Run a single SQL statement without preparing it.
   pub fn execute(&self, sql: &str) -> Result<()> {
      let mut inner = self.inner.lock();

      if inner.handle.is_null() {
         return Err(Error::invalid("connection is not open"));
      }
      inner.last_activity = Instant::now();

      let c_sql = CString::new(sql).map_err(|_| Error::invalid("sql contains a NUL byte"))?;

      let mut raw_msg: *mut c_char = ptr::null_mut();
      // SAFETY: handle is open and guarded by the inner lock; c_sql outlives
      // the call; raw_msg is an out-parameter we free below.
      let rc = unsafe {
         ffi::sqlite3_exec(
            inner.handle,
            c_sql.as_ptr(),
            None,
            ptr::null_mut(),
            &mut raw_msg,
         )
      };

      if rc != ffi::SQLITE_OK {
         let message = if raw_msg.is_null() {
            format!("sqlite error code {rc}")
         } else {
            // SAFETY: non-null raw_msg is a NUL-terminated string allocated by
            // SQLite; we copy it out and hand it back to sqlite3_free.
            let message = unsafe { CStr::from_ptr(raw_msg) }
               .to_string_lossy()
               .into_owned();
            unsafe { ffi::sqlite3_free(raw_msg.cast()) };
            message
         };
         inner.last_error = Some(message.clone());
         return Err(Error::query(rc, message));
      }

      Ok(())
   }

   /// Begin an explicit transaction.
   ///
   /// Like [`commit`](Self::commit) and [`rollback`](Self::rollback) this is
   /// a thin statement wrapper; tracking whether a transaction is actually
   /// open is the caller's job.
   pub fn begin_transaction(&self) -> Result<()> {
      self.execute("BEGIN TRANSACTION")
   }

   /// Commit the current transaction.
   pub fn commit(&self) -> Result<()> {
      self.execute("COMMIT")
   }

   /// Roll back the current transaction.
   pub fn rollback(&self) -> Result<()> {
      self.execute("ROLLBACK")
   }

   /// Cheap liveness probe (`PRAGMA quick_check`).
   pub fn check_health(&self) -> bool {
      let inner = self.inner.lock();
      if inner.handle.is_null() {
         return false;
      }
      // SAFETY: handle is open and guarded by the inner lock.
      unsafe { health_probe(inner.handle) }
   }

   /// Close the connection, releasing the native handle.
   ///
   /// Idempotent; also runs on drop.
   pub fn close(&self) {
      let mut inner = self.inner.lock();
      if !inner.handle.is_null() {
         // SAFETY: handle is the open connection we own; close_v2 defers
         // teardown past any statements still holding it.
         unsafe { sqlite3_close_v2(inner.handle) };
         inner.handle = ptr::null_mut();
         inner.state = ConnectionState::Disconnected;
         inner.connection_string.clear();
         trace!("connection closed");
      }
   }

   /// Whether the connection currently holds an open handle.
   pub fn is_open(&self) -> bool {
      let inner = self.inner.lock();
      inner.state == ConnectionState::Connected && !inner.handle.is_null()
   }

   /// Current lifecycle state.
   pub fn state(&self) -> ConnectionState {
      self.inner.lock().state
   }

   /// The connection string this handle was opened with.
   pub fn connection_string(&self) -> String {
      self.inner.lock().connection_string.clone()
   }

   /// Message of the most recent engine failure on this connection.
   pub fn last_error(&self) -> Option<String> {
      self.inner.lock().last_error.clone()
   }

   /// Time since the connection was last used. Drives the pool's idle-timeout
   /// policy.
   pub fn idle_time(&self) -> Duration {
      self.inner.lock().last_activity.elapsed()
   }

   /// Rowid produced by the most recent successful INSERT.
   pub fn last_insert_rowid(&self) -> i64 {
      let inner = self.inner.lock();
      if inner.handle.is_null() {
         return 0;
      }
      // SAFETY: handle is open and guarded by the inner lock.
      unsafe { ffi::sqlite3_last_insert_rowid(inner.handle) }
   }

   /// Rows changed by the most recent statement.
   pub fn changes(&self) -> i64 {
      let inner = self.inner.lock();
      if inner.handle.is_null() {
         return 0;
      }
      // SAFETY: handle is open and guarded by the inner lock.
      unsafe { i64::from(ffi::sqlite3_changes(inner.handle)) }
   }

   /// Bound how long the engine waits on a lock before failing a statement.
   pub fn set_busy_timeout(&self, timeout: Duration) {
      let inner = self.inner.lock();
      if inner.handle.is_null() {
         return;
      }
      let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
      // SAFETY: handle is open and guarded by the inner lock.
      unsafe { ffi::sqlite3_busy_timeout(inner.handle, ms) };
   }

   /// Mark the connection as just used.
   ///
   /// The pool calls this on checkout so a connection that sat idle in the
   /// queue is not treated as idled-out the moment its lease returns.
   pub(crate) fn touch(&self) {
      self.inner.lock().last_activity = Instant::now();
   }

   /// Run `f` with the raw handle while holding the connection lock.
   ///
   /// Used by the statement layer to compile against this connection.
   pub(crate) fn with_handle<T>(
      &self,
      f: impl FnOnce(*mut ffi::sqlite3) -> Result<T>,
   ) -> Result<T> {
      let mut inner = self.inner.lock();
      if inner.handle.is_null() {
         return Err(Error::invalid("connection is not open"));
      }
      inner.last_activity = Instant::now();
      f(inner.handle)
   }
}

impl Default for DatabaseConnection {
   fn default() -> Self {
      Self::new()
   }
}

impl Drop for DatabaseConnection {
   fn drop(&mut self) {
      self.close();
   }
}

impl std::fmt::Debug for DatabaseConnection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let inner = self.inner.lock();
      f.debug_struct("DatabaseConnection")
         .field("state", &inner.state)
         .field("connection_string", &inner.connection_string)
         .finish_non_exhaustive()
   }
}

/// Read the connection's current error message.
///
/// # Safety
///
/// `handle` must be a live connection handle.
pub(crate) unsafe fn errmsg(handle: *mut ffi::sqlite3) -> String {
   // SAFETY: sqlite3_errmsg always returns a valid NUL-terminated string for
   // a live handle.
   unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(handle)) }
      .to_string_lossy()
      .into_owned()
}

/// Apply the fixed pragma set and default busy-timeout.
///
/// # Safety
///
/// `handle` must be a live connection handle not shared with another thread.
unsafe fn configure(handle: *mut ffi::sqlite3) {
   for pragma in OPEN_PRAGMAS {
      let mut raw_msg: *mut c_char = ptr::null_mut();
      // SAFETY: pragma strings are static NUL-terminated literals.
      let rc = unsafe { ffi::sqlite3_exec(handle, pragma.as_ptr(), None, ptr::null_mut(), &mut raw_msg) };
      if rc != ffi::SQLITE_OK && !raw_msg.is_null() {
         // SAFETY: non-null message from sqlite3_exec.
         unsafe { ffi::sqlite3_free(raw_msg.cast()) };
      }
   }
   // SAFETY: handle is live per the function contract.
   unsafe { ffi::sqlite3_busy_timeout(handle, DEFAULT_BUSY_TIMEOUT_MS) };
}

/// Run `PRAGMA quick_check` and report whether the database answered "ok".
///
/// # Safety
///
/// `handle` must be a live connection handle.
unsafe fn health_probe(handle: *mut ffi::sqlite3) -> bool {
   let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
   // SAFETY: the SQL literal is static; stmt is an out-parameter.
   let rc = unsafe {
      ffi::sqlite3_prepare_v2(
         handle,
         c"PRAGMA quick_check".as_ptr(),
         -1,
         &mut stmt,
         ptr::null_mut(),
      )
   };
   if rc != ffi::SQLITE_OK {
      return false;
   }

   let mut healthy = false;
   // SAFETY: stmt was successfully prepared above and is finalized below.
   unsafe {
      if ffi::sqlite3_step(stmt) == ffi::SQLITE_ROW {
         let text = ffi::sqlite3_column_text(stmt, 0);
         if !text.is_null() {
            healthy = CStr::from_ptr(text.cast::<c_char>()).to_bytes() == b"ok";
         }
      }
      ffi::sqlite3_finalize(stmt);
   }
   healthy
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn open_close_lifecycle() {
      let conn = DatabaseConnection::new();
      assert_eq!(conn.state(), ConnectionState::Disconnected);
      assert!(!conn.is_open());

      conn.open(":memory:").unwrap();
      assert_eq!(conn.state(), ConnectionState::Connected);
      assert!(conn.is_open());
      assert_eq!(conn.connection_string(), ":memory:");

      // Idempotent open
      conn.open(":memory:").unwrap();
      assert!(conn.is_open());

      conn.close();
      assert_eq!(conn.state(), ConnectionState::Disconnected);
      assert!(!conn.is_open());

      // Idempotent close
      conn.close();
      assert!(!conn.is_open());
   }

   #[test]
   fn execute_and_row_accounting() {
      let conn = DatabaseConnection::new();
      conn.open(":memory:").unwrap();

      conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
         .unwrap();
      conn.execute("INSERT INTO t (v) VALUES ('a')").unwrap();
      assert_eq!(conn.last_insert_rowid(), 1);
      assert_eq!(conn.changes(), 1);
   }

   #[test]
   fn execute_on_closed_connection_is_invalid_parameter() {
      let conn = DatabaseConnection::new();
      let err = conn.execute("SELECT 1").unwrap_err();
      assert!(matches!(err, Error::InvalidParameter { .. }));
   }

   #[test]
   fn syntax_error_reports_query_failure() {
      let conn = DatabaseConnection::new();
      conn.open(":memory:").unwrap();
      let err = conn.execute("NOT REAL SQL").unwrap_err();
      assert!(matches!(err, Error::QueryFailed { .. }));
      assert!(conn.last_error().is_some());
   }

   #[test]
   fn constraint_violation_is_classified() {
      let conn = DatabaseConnection::new();
      conn.open(":memory:").unwrap();
      conn
         .execute("CREATE TABLE u (id INTEGER PRIMARY KEY, name TEXT UNIQUE)")
         .unwrap();
      conn
         .execute("INSERT INTO u (name) VALUES ('dup')")
         .unwrap();
      let err = conn
         .execute("INSERT INTO u (name) VALUES ('dup')")
         .unwrap_err();
      assert!(matches!(err, Error::ConstraintViolation { .. }));
   }

   #[test]
   fn health_check_reflects_connection_state() {
      let conn = DatabaseConnection::new();
      assert!(!conn.check_health());
      conn.open(":memory:").unwrap();
      assert!(conn.check_health());
      conn.close();
      assert!(!conn.check_health());
   }

   #[test]
   fn transaction_statement_wrappers() {
      let conn = DatabaseConnection::new();
      conn.open(":memory:").unwrap();
      conn.execute("CREATE TABLE t (v INTEGER)").unwrap();

      conn.begin_transaction().unwrap();
      conn.execute("INSERT INTO t (v) VALUES (1)").unwrap();
      conn.rollback().unwrap();

      conn.begin_transaction().unwrap();
      conn.execute("INSERT INTO t (v) VALUES (2)").unwrap();
      conn.commit().unwrap();
      assert_eq!(conn.changes(), 1);
   }
}
