use std::sync::Arc;
use std::time::Duration;

use sqlite_pool_mgr::{
   ConnectionManager, DatabaseConnection, Error, ManagerConfig, PoolConfig, PreparedStatement,
   StepOutcome,
};
use tempfile::TempDir;

fn test_manager() -> (Arc<ConnectionManager>, String, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let path = temp_dir.path().join("test.db").to_string_lossy().into_owned();

   let manager = Arc::new(ConnectionManager::new());
   manager
      .configure(ManagerConfig {
         worker_threads: 1,
         pool: PoolConfig {
            min_connections: 1,
            max_connections: 2,
            enable_health_checks: false,
            ..Default::default()
         },
         ..ManagerConfig::new(&path)
      })
      .unwrap();

   (manager, path, temp_dir)
}

/// Count rows in `table` over a dedicated connection.
fn count_rows(path: &str, table: &str) -> i64 {
   let conn = Arc::new(DatabaseConnection::new());
   conn.open(path).unwrap();
   let stmt =
      PreparedStatement::prepare(Arc::clone(&conn), &format!("SELECT COUNT(*) FROM {table}"))
         .unwrap();
   assert_eq!(stmt.step().unwrap(), StepOutcome::Row);
   stmt.column_value(0).as_integer().unwrap()
}

// ─── Configuration lifecycle ───

#[test]
fn configure_exactly_once() {
   let (manager, path, _temp) = test_manager();
   assert!(manager.is_configured());

   let err = manager.configure(ManagerConfig::new(&path)).unwrap_err();
   assert!(matches!(err, Error::Internal { .. }));
}

#[test]
fn unconfigured_operations_fail_cleanly() {
   let manager = ConnectionManager::new();
   assert!(matches!(
      manager.acquire_connection().unwrap_err(),
      Error::Internal { .. }
   ));
   assert!(manager.get_pool_stats().is_err());
   assert!(manager.run_health_check().is_err());
   assert!(manager.execute_transaction(|_| Ok(())).is_err());
}

#[test]
fn shutdown_unconfigures_and_is_idempotent() {
   let (manager, _path, _temp) = test_manager();

   manager.shutdown();
   assert!(!manager.is_configured());
   assert!(manager.acquire_connection().is_err());

   manager.shutdown();
}

#[test]
fn shutdown_manager_rejects_reconfiguration() {
   let (manager, path, _temp) = test_manager();
   manager.shutdown();

   // Configuration is one-time for the manager's whole life, not per run.
   let err = manager.configure(ManagerConfig::new(&path)).unwrap_err();
   assert!(matches!(err, Error::Internal { .. }));
   assert!(!manager.is_configured());
}

// ─── Connection access ───

#[test]
fn with_connection_borrows_and_returns() {
   let (manager, _path, _temp) = test_manager();

   manager
      .with_connection(|conn| conn.execute("CREATE TABLE t (v INTEGER)"))
      .unwrap();

   let stats = manager.get_pool_stats().unwrap();
   assert_eq!(stats.active_connections, 0);
   assert!(stats.total_connections >= 1);
}

#[test]
fn acquire_with_timeout_reports_timeout_when_saturated() {
   let (manager, _path, _temp) = test_manager();

   let a = manager.acquire_connection().unwrap();
   let b = manager.acquire_connection().unwrap();

   let err = manager
      .acquire_with_timeout(Duration::from_millis(50))
      .unwrap_err();
   assert!(matches!(err, Error::Timeout { .. }));

   drop((a, b));
}

// ─── Transactional execution ───

#[test]
fn successful_transaction_commits() {
   let (manager, path, _temp) = test_manager();

   manager
      .with_connection(|conn| conn.execute("CREATE TABLE t (v INTEGER)"))
      .unwrap();

   let rowid = manager
      .execute_transaction(|conn| {
         conn.execute("INSERT INTO t (v) VALUES (42)")?;
         Ok(conn.last_insert_rowid())
      })
      .unwrap();

   assert_eq!(rowid, 1);
   assert_eq!(count_rows(&path, "t"), 1);
}

#[test]
fn failing_closure_rolls_back() {
   let (manager, path, _temp) = test_manager();

   manager
      .with_connection(|conn| conn.execute("CREATE TABLE t (v INTEGER)"))
      .unwrap();

   let err = manager
      .execute_transaction(|conn| {
         conn.execute("INSERT INTO t (v) VALUES (1)")?;
         Err::<(), _>(Error::Internal {
            message: "caller bail-out".into(),
         })
      })
      .unwrap_err();

   assert!(matches!(err, Error::Internal { .. }));
   assert_eq!(count_rows(&path, "t"), 0);
}

#[test]
fn constraint_violation_inside_transaction_rolls_back() {
   let (manager, path, _temp) = test_manager();

   manager
      .with_connection(|conn| conn.execute("CREATE TABLE u (name TEXT UNIQUE)"))
      .unwrap();

   let err = manager
      .execute_transaction(|conn| {
         conn.execute("INSERT INTO u (name) VALUES ('dup')")?;
         conn.execute("INSERT INTO u (name) VALUES ('dup')")?;
         Ok(())
      })
      .unwrap_err();

   assert!(matches!(err, Error::ConstraintViolation { .. }));
   assert_eq!(count_rows(&path, "u"), 0);
}

#[test]
fn exhausted_budget_rolls_back_with_timeout() {
   let (manager, path, _temp) = test_manager();

   manager
      .with_connection(|conn| conn.execute("CREATE TABLE t (v INTEGER)"))
      .unwrap();

   let err = manager
      .execute_transaction_with_timeout(
         |conn| {
            conn.execute("INSERT INTO t (v) VALUES (1)")?;
            Ok(())
         },
         Duration::ZERO,
      )
      .unwrap_err();

   assert!(matches!(err, Error::Timeout { .. }));
   assert_eq!(count_rows(&path, "t"), 0);
}

#[test]
fn panicking_closure_rolls_back_and_frees_the_connection() {
   let (manager, path, _temp) = test_manager();

   manager
      .with_connection(|conn| conn.execute("CREATE TABLE t (v INTEGER)"))
      .unwrap();

   let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      manager.execute_transaction(|conn| -> sqlite_pool_mgr::Result<()> {
         conn.execute("INSERT INTO t (v) VALUES (1)").unwrap();
         panic!("mid-transaction panic");
      })
   }));
   assert!(result.is_err());

   assert_eq!(count_rows(&path, "t"), 0);
   // The lease was still returned; the pool is not leaking connections.
   assert_eq!(manager.get_pool_stats().unwrap().active_connections, 0);
}
