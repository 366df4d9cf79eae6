// =============================================================================
// Engine error taxonomy
// =============================================================================
//
// Each variant maps to one handling policy:
//   NoPrice            -> skip the operation this tick, warn
//   InsufficientFunds  -> refuse to open, info
//   Invalid*           -> programming error, propagate immediately
//   NotOpen            -> repeated close, caller decides
//   DatabaseTransient  -> retried with backoff (3 attempts) before surfacing
//   DatabaseFatal      -> session ends with `error`
//   StrategyFailed     -> strategy skipped for the tick, session continues
//   Cancelled          -> graceful shutdown path
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no usable mark price for {symbol}: {detail}")]
    NoPrice { symbol: String, detail: String },

    #[error("insufficient funds: need ${required:.2}, available ${available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("invalid side: {0}")]
    InvalidSide(String),

    #[error("invalid size: {0}")]
    InvalidSize(f64),

    #[error("invalid leverage {requested} (allowed 1..={cap})")]
    InvalidLeverage { requested: f64, cap: f64 },

    #[error("position {0} is not open")]
    NotOpen(i64),

    #[error("transient database error: {0}")]
    DatabaseTransient(String),

    #[error("fatal database error: {0}")]
    DatabaseFatal(String),

    #[error("strategy {strategy} failed: {detail}")]
    StrategyFailed { strategy: String, detail: String },

    #[error("cancellation requested")]
    Cancelled,
}

impl EngineError {
    /// Whether the engine may retry the failed transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DatabaseTransient(_))
    }

    /// Errors that end the session with `end_reason = error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DatabaseFatal(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::DatabaseTransient(e.to_string())
            }
            _ => Self::DatabaseFatal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let mapped = EngineError::from(err);
        assert!(mapped.is_transient());
        assert!(!mapped.is_fatal());
    }

    #[test]
    fn other_sqlite_errors_are_fatal() {
        let err = rusqlite::Error::InvalidQuery;
        let mapped = EngineError::from(err);
        assert!(mapped.is_fatal());
    }

    #[test]
    fn display_includes_amounts() {
        let e = EngineError::InsufficientFunds {
            required: 5002.5,
            available: 4000.0,
        };
        let msg = e.to_string();
        assert!(msg.contains("5002.50"));
        assert!(msg.contains("4000.00"));
    }
}
