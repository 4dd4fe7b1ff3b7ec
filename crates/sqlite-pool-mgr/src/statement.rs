//! Prepared statements and the values bound to and read from them

use std::ffi::{CStr, CString, c_char, c_int};
use std::ptr;
use std::sync::Arc;

use libsqlite3_sys as ffi;
use parking_lot::Mutex;

use crate::connection::{DatabaseConnection, errmsg};
use crate::error::{Error, Result};

/// Rough fixed cost of keeping one compiled statement alive, used by the
/// statement cache's memory estimate alongside the SQL text length.
pub(crate) const STATEMENT_OVERHEAD_BYTES: usize = 256;

/// A value bound to, or read from, a statement column
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl Value {
   pub fn as_integer(&self) -> Option<i64> {
      match self {
         Value::Integer(v) => Some(*v),
         _ => None,
      }
   }

   pub fn as_real(&self) -> Option<f64> {
      match self {
         Value::Real(v) => Some(*v),
         _ => None,
      }
   }

   pub fn as_text(&self) -> Option<&str> {
      match self {
         Value::Text(v) => Some(v),
         _ => None,
      }
   }

   pub fn as_blob(&self) -> Option<&[u8]> {
      match self {
         Value::Blob(v) => Some(v),
         _ => None,
      }
   }
}

impl From<i64> for Value {
   fn from(v: i64) -> Self {
      Value::Integer(v)
   }
}

impl From<f64> for Value {
   fn from(v: f64) -> Self {
      Value::Real(v)
   }
}

impl From<&str> for Value {
   fn from(v: &str) -> Self {
      Value::Text(v.to_string())
   }
}

impl From<String> for Value {
   fn from(v: String) -> Self {
      Value::Text(v)
   }
}

impl From<Vec<u8>> for Value {
   fn from(v: Vec<u8>) -> Self {
      Value::Blob(v)
   }
}

/// Result of advancing a statement one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
   /// A row is available for column reads
   Row,
   /// The statement ran to completion
   Done,
}

struct RawStatement(*mut ffi::sqlite3_stmt);

/// One compiled statement, tied to the connection it was compiled on.
///
/// Holds an `Arc` of that connection so the handle outlives the statement
/// even if the pool has since discarded the connection. bind/step/reset only;
/// result rows are read through the column accessors while
/// [`step`](Self::step) reports [`StepOutcome::Row`].
pub struct PreparedStatement {
   raw: Mutex<RawStatement>,
   /// Keeps the owning connection alive for as long as the statement exists.
   _conn: Arc<DatabaseConnection>,
   sql: String,
}

// SAFETY: the raw statement pointer is only used under the raw mutex, and the
// bundled SQLite runs in serialized threading mode, so statement calls may
// race connection calls on other threads without data races in the engine.
unsafe impl Send for PreparedStatement {}
unsafe impl Sync for PreparedStatement {}

impl PreparedStatement {
   /// Compile `sql` against `conn`.
   pub fn prepare(conn: Arc<DatabaseConnection>, sql: &str) -> Result<Self> {
      let c_sql = CString::new(sql).map_err(|_| Error::invalid("sql contains a NUL byte"))?;

      let stmt = conn.with_handle(|handle| {
         let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
         // SAFETY: handle is live while with_handle holds the connection
         // lock; c_sql outlives the call.
         let rc = unsafe {
            ffi::sqlite3_prepare_v2(handle, c_sql.as_ptr(), -1, &mut stmt, ptr::null_mut())
         };
         if rc != ffi::SQLITE_OK {
            // SAFETY: handle is still live.
            return Err(Error::statement(rc, unsafe { errmsg(handle) }));
         }
         if stmt.is_null() {
            // Whitespace or a bare comment compiles to nothing.
            return Err(Error::invalid("sql does not contain a statement"));
         }
         Ok(stmt)
      })?;

      Ok(Self {
         raw: Mutex::new(RawStatement(stmt)),
         _conn: conn,
         sql: sql.to_string(),
      })
   }

   /// Bind a parameter by 1-based index.
   pub fn bind(&self, index: usize, value: &Value) -> Result<()> {
      let raw = self.raw.lock();
      let idx = c_int::try_from(index)
         .map_err(|_| Error::invalid(format!("parameter index {index} out of range")))?;
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let rc = unsafe { bind_at(raw.0, idx, value) };
      if rc != ffi::SQLITE_OK {
         return Err(Error::statement(
            rc,
            format!("failed to bind parameter {index}"),
         ));
      }
      Ok(())
   }

   /// Bind a parameter by name (e.g. `:name` or `?1`).
   pub fn bind_named(&self, name: &str, value: &Value) -> Result<()> {
      let c_name =
         CString::new(name).map_err(|_| Error::invalid("parameter name contains a NUL byte"))?;
      let raw = self.raw.lock();
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let idx = unsafe { ffi::sqlite3_bind_parameter_index(raw.0, c_name.as_ptr()) };
      if idx == 0 {
         return Err(Error::invalid(format!("no parameter named {name}")));
      }
      // SAFETY: as above; idx came from the statement itself.
      let rc = unsafe { bind_at(raw.0, idx, value) };
      if rc != ffi::SQLITE_OK {
         return Err(Error::statement(
            rc,
            format!("failed to bind parameter {name}"),
         ));
      }
      Ok(())
   }

   /// Advance the statement one step.
   pub fn step(&self) -> Result<StepOutcome> {
      let raw = self.raw.lock();
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let rc = unsafe { ffi::sqlite3_step(raw.0) };
      match rc {
         ffi::SQLITE_ROW => Ok(StepOutcome::Row),
         ffi::SQLITE_DONE => Ok(StepOutcome::Done),
         _ => {
            // SAFETY: a statement always has a live owning connection handle.
            let db = unsafe { ffi::sqlite3_db_handle(raw.0) };
            let message = if db.is_null() {
               format!("step failed with code {rc}")
            } else {
               // SAFETY: non-null db handle from sqlite3_db_handle.
               unsafe { errmsg(db) }
            };
            Err(Error::query(rc, message))
         }
      }
   }

   /// Rewind the statement so it can be stepped again.
   pub fn reset(&self) -> Result<()> {
      let raw = self.raw.lock();
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let rc = unsafe { ffi::sqlite3_reset(raw.0) };
      if rc != ffi::SQLITE_OK {
         return Err(Error::statement(rc, "failed to reset statement"));
      }
      Ok(())
   }

   /// Clear all bound parameters back to NULL.
   pub fn clear_bindings(&self) -> Result<()> {
      let raw = self.raw.lock();
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let rc = unsafe { ffi::sqlite3_clear_bindings(raw.0) };
      if rc != ffi::SQLITE_OK {
         return Err(Error::statement(rc, "failed to clear bindings"));
      }
      Ok(())
   }

   /// Number of columns produced by this statement.
   pub fn column_count(&self) -> usize {
      let raw = self.raw.lock();
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let count = unsafe { ffi::sqlite3_column_count(raw.0) };
      usize::try_from(count).unwrap_or(0)
   }

   /// Name of the column at `index` (0-based), if in range.
   pub fn column_name(&self, index: usize) -> Option<String> {
      let raw = self.raw.lock();
      let idx = c_int::try_from(index).ok()?;
      // SAFETY: raw.0 is a live statement guarded by the raw mutex; an
      // out-of-range index yields a null pointer, handled below.
      let name = unsafe { ffi::sqlite3_column_name(raw.0, idx) };
      if name.is_null() {
         return None;
      }
      // SAFETY: non-null column name is a NUL-terminated string owned by the
      // statement; we copy it before releasing the lock.
      Some(
         unsafe { CStr::from_ptr(name) }
            .to_string_lossy()
            .into_owned(),
      )
   }

   /// Value of the column at `index` (0-based) for the current row.
   ///
   /// Out-of-range indexes read as [`Value::Null`].
   pub fn column_value(&self, index: usize) -> Value {
      let raw = self.raw.lock();
      let Ok(idx) = c_int::try_from(index) else {
         return Value::Null;
      };
      // SAFETY: raw.0 is a live statement guarded by the raw mutex.
      let count = unsafe { ffi::sqlite3_column_count(raw.0) };
      if idx >= count {
         return Value::Null;
      }

      // SAFETY: idx is in range; the pointers returned by the column readers
      // are valid until the next step/reset, which the raw mutex excludes
      // while we copy the data out.
      unsafe {
         match ffi::sqlite3_column_type(raw.0, idx) {
            ffi::SQLITE_INTEGER => Value::Integer(ffi::sqlite3_column_int64(raw.0, idx)),
            ffi::SQLITE_FLOAT => Value::Real(ffi::sqlite3_column_double(raw.0, idx)),
            ffi::SQLITE_TEXT => {
               let text = ffi::sqlite3_column_text(raw.0, idx);
               if text.is_null() {
                  Value::Text(String::new())
               } else {
                  Value::Text(
                     CStr::from_ptr(text.cast::<c_char>())
                        .to_string_lossy()
                        .into_owned(),
                  )
               }
            }
            ffi::SQLITE_BLOB => {
               let blob = ffi::sqlite3_column_blob(raw.0, idx);
               let len = ffi::sqlite3_column_bytes(raw.0, idx);
               if blob.is_null() || len <= 0 {
                  Value::Blob(Vec::new())
               } else {
                  Value::Blob(
                     std::slice::from_raw_parts(blob.cast::<u8>(), len as usize).to_vec(),
                  )
               }
            }
            _ => Value::Null,
         }
      }
   }

   /// The SQL this statement was compiled from.
   pub fn sql(&self) -> &str {
      &self.sql
   }

   /// Rough memory footprint, used by the statement cache's byte budget.
   pub fn estimated_size(&self) -> usize {
      STATEMENT_OVERHEAD_BYTES + self.sql.len()
   }
}

impl Drop for PreparedStatement {
   fn drop(&mut self) {
      let raw = self.raw.lock();
      // SAFETY: raw.0 is the live statement we own; finalize releases it and,
      // if its connection was closed with close_v2 in the meantime, lets the
      // zombie handle tear down.
      unsafe { ffi::sqlite3_finalize(raw.0) };
   }
}

impl std::fmt::Debug for PreparedStatement {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PreparedStatement")
         .field("sql", &self.sql)
         .finish_non_exhaustive()
   }
}

/// Bind `value` at a validated 1-based index.
///
/// # Safety
///
/// `stmt` must be a live statement pointer; callers hold the raw mutex.
unsafe fn bind_at(stmt: *mut ffi::sqlite3_stmt, idx: c_int, value: &Value) -> c_int {
   // SAFETY: per function contract; SQLITE_TRANSIENT makes the engine copy
   // text/blob payloads before we return.
   unsafe {
      match value {
         Value::Null => ffi::sqlite3_bind_null(stmt, idx),
         Value::Integer(v) => ffi::sqlite3_bind_int64(stmt, idx, *v),
         Value::Real(v) => ffi::sqlite3_bind_double(stmt, idx, *v),
         Value::Text(v) => ffi::sqlite3_bind_text(
            stmt,
            idx,
            v.as_ptr().cast::<c_char>(),
            c_int::try_from(v.len()).unwrap_or(c_int::MAX),
            ffi::SQLITE_TRANSIENT(),
         ),
         Value::Blob(v) => ffi::sqlite3_bind_blob(
            stmt,
            idx,
            v.as_ptr().cast(),
            c_int::try_from(v.len()).unwrap_or(c_int::MAX),
            ffi::SQLITE_TRANSIENT(),
         ),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn test_conn() -> Arc<DatabaseConnection> {
      let conn = Arc::new(DatabaseConnection::new());
      conn.open(":memory:").unwrap();
      conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, score REAL, data BLOB)")
         .unwrap();
      conn
   }

   #[test]
   fn bind_step_and_read_back() {
      let conn = test_conn();

      let insert = PreparedStatement::prepare(
         Arc::clone(&conn),
         "INSERT INTO t (name, score, data) VALUES (?1, ?2, ?3)",
      )
      .unwrap();
      insert.bind(1, &Value::from("alice")).unwrap();
      insert.bind(2, &Value::from(0.5)).unwrap();
      insert.bind(3, &Value::from(vec![1u8, 2, 3])).unwrap();
      assert_eq!(insert.step().unwrap(), StepOutcome::Done);

      let select = PreparedStatement::prepare(
         Arc::clone(&conn),
         "SELECT name, score, data FROM t WHERE id = 1",
      )
      .unwrap();
      assert_eq!(select.step().unwrap(), StepOutcome::Row);
      assert_eq!(select.column_count(), 3);
      assert_eq!(select.column_name(0).as_deref(), Some("name"));
      assert_eq!(select.column_value(0), Value::Text("alice".to_string()));
      assert_eq!(select.column_value(1), Value::Real(0.5));
      assert_eq!(select.column_value(2), Value::Blob(vec![1, 2, 3]));
      assert_eq!(select.column_value(99), Value::Null);
      assert_eq!(select.step().unwrap(), StepOutcome::Done);
   }

   #[test]
   fn named_parameters() {
      let conn = test_conn();
      let insert = PreparedStatement::prepare(
         Arc::clone(&conn),
         "INSERT INTO t (name) VALUES (:name)",
      )
      .unwrap();
      insert.bind_named(":name", &Value::from("bob")).unwrap();
      assert_eq!(insert.step().unwrap(), StepOutcome::Done);

      let err = insert.bind_named(":missing", &Value::Null).unwrap_err();
      assert!(matches!(err, Error::InvalidParameter { .. }));
   }

   #[test]
   fn reset_allows_reuse() {
      let conn = test_conn();
      conn.execute("INSERT INTO t (name) VALUES ('x')").unwrap();

      let select =
         PreparedStatement::prepare(Arc::clone(&conn), "SELECT COUNT(*) FROM t").unwrap();
      assert_eq!(select.step().unwrap(), StepOutcome::Row);
      assert_eq!(select.column_value(0), Value::Integer(1));
      assert_eq!(select.step().unwrap(), StepOutcome::Done);

      select.reset().unwrap();
      assert_eq!(select.step().unwrap(), StepOutcome::Row);
      assert_eq!(select.column_value(0), Value::Integer(1));
   }

   #[test]
   fn preparing_garbage_fails() {
      let conn = test_conn();
      let err = PreparedStatement::prepare(Arc::clone(&conn), "NOT REAL SQL").unwrap_err();
      assert!(matches!(err, Error::PreparedStatementFailed { .. }));
   }

   #[test]
   fn out_of_range_bind_fails() {
      let conn = test_conn();
      let insert =
         PreparedStatement::prepare(Arc::clone(&conn), "INSERT INTO t (name) VALUES (?1)")
            .unwrap();
      let err = insert.bind(5, &Value::from("x")).unwrap_err();
      assert!(matches!(err, Error::PreparedStatementFailed { .. }));
   }

   #[test]
   fn size_estimate_tracks_sql_length() {
      let conn = test_conn();
      let stmt = PreparedStatement::prepare(Arc::clone(&conn), "SELECT 1").unwrap();
      assert_eq!(stmt.estimated_size(), STATEMENT_OVERHEAD_BYTES + "SELECT 1".len());
   }
}
