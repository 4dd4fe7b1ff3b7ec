//! Error types for sqlite-pool-mgr

use libsqlite3_sys as ffi;
use thiserror::Error;

/// Errors that may occur when working with connections, the pool, or the
/// statement cache.
///
/// Variants that wrap an engine failure carry the native SQLite result code
/// when one is available. Constraint failures are always reported as
/// [`Error::ConstraintViolation`], regardless of which operation hit them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
   /// Opening a connection failed, or no connection could be acquired
   #[error("connection failed: {message}")]
   ConnectionFailed { message: String, code: Option<i32> },

   /// A statement failed to execute
   #[error("query failed: {message}")]
   QueryFailed { message: String, code: Option<i32> },

   /// Beginning, committing, or rolling back a transaction failed, or the
   /// transaction state machine was misused
   #[error("transaction failed: {message}")]
   TransactionFailed { message: String, code: Option<i32> },

   /// Compiling or operating on a prepared statement failed
   #[error("prepared statement failed: {message}")]
   PreparedStatementFailed { message: String, code: Option<i32> },

   /// The engine rejected a statement because it would violate a constraint
   #[error("constraint violation: {message}")]
   ConstraintViolation { message: String, code: Option<i32> },

   /// A wait or a transaction exceeded its wall-clock budget
   #[error("operation timed out: {message}")]
   Timeout { message: String },

   /// A caller-supplied value was unusable (closed connection, bad index, ...)
   #[error("invalid parameter: {message}")]
   InvalidParameter { message: String },

   /// An unexpected internal failure
   #[error("internal error: {message}")]
   Internal { message: String },
}

impl Error {
   /// The native SQLite result code, if this error carries one.
   pub fn code(&self) -> Option<i32> {
      match self {
         Error::ConnectionFailed { code, .. }
         | Error::QueryFailed { code, .. }
         | Error::TransactionFailed { code, .. }
         | Error::PreparedStatementFailed { code, .. }
         | Error::ConstraintViolation { code, .. } => *code,
         Error::Timeout { .. } | Error::InvalidParameter { .. } | Error::Internal { .. } => None,
      }
   }

   pub(crate) fn connection(message: impl Into<String>) -> Self {
      Error::ConnectionFailed {
         message: message.into(),
         code: None,
      }
   }

   pub(crate) fn connection_code(code: i32, message: impl Into<String>) -> Self {
      Error::ConnectionFailed {
         message: message.into(),
         code: Some(code),
      }
   }

   /// Classify an execution failure, diverting constraint codes.
   pub(crate) fn query(code: i32, message: impl Into<String>) -> Self {
      if is_constraint(code) {
         Error::ConstraintViolation {
            message: message.into(),
            code: Some(code),
         }
      } else {
         Error::QueryFailed {
            message: message.into(),
            code: Some(code),
         }
      }
   }

   /// Classify a prepared-statement failure, diverting constraint codes.
   pub(crate) fn statement(code: i32, message: impl Into<String>) -> Self {
      if is_constraint(code) {
         Error::ConstraintViolation {
            message: message.into(),
            code: Some(code),
         }
      } else {
         Error::PreparedStatementFailed {
            message: message.into(),
            code: Some(code),
         }
      }
   }

   pub(crate) fn transaction(message: impl Into<String>) -> Self {
      Error::TransactionFailed {
         message: message.into(),
         code: None,
      }
   }

   pub(crate) fn timeout(message: impl Into<String>) -> Self {
      Error::Timeout {
         message: message.into(),
      }
   }

   pub(crate) fn invalid(message: impl Into<String>) -> Self {
      Error::InvalidParameter {
         message: message.into(),
      }
   }

   pub(crate) fn internal(message: impl Into<String>) -> Self {
      Error::Internal {
         message: message.into(),
      }
   }
}

/// Extended constraint codes (e.g. `SQLITE_CONSTRAINT_UNIQUE`) share the
/// primary code in their low byte.
fn is_constraint(code: i32) -> bool {
   code & 0xff == ffi::SQLITE_CONSTRAINT
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn constraint_codes_divert_to_constraint_violation() {
      let err = Error::query(ffi::SQLITE_CONSTRAINT, "UNIQUE constraint failed");
      assert!(matches!(err, Error::ConstraintViolation { .. }));

      // Extended constraint code: SQLITE_CONSTRAINT_UNIQUE = 2067
      let err = Error::statement(2067, "UNIQUE constraint failed");
      assert!(matches!(err, Error::ConstraintViolation { .. }));
      assert_eq!(err.code(), Some(2067));
   }

   #[test]
   fn non_constraint_codes_keep_their_kind() {
      let err = Error::query(ffi::SQLITE_BUSY, "database is locked");
      assert!(matches!(err, Error::QueryFailed { .. }));
      assert_eq!(err.code(), Some(ffi::SQLITE_BUSY));
   }
}
