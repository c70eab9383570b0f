use num_bigint::BigInt;
use thiserror::Error;

use crate::app_database::AppDatabaseError;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("transaction too big")]
    TxTooBig,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("overspend: have {have}, want {want}")]
    Overspend { have: BigInt, want: BigInt },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("database: {0:?}")]
    Database(AppDatabaseError),
    #[error("diesel: {0}")]
    Diesel(#[from] diesel::result::Error),
}

impl PoolError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        PoolError::InvalidState(msg.into())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        PoolError::Transient(msg.to_string())
    }

    /// Business-rule violations abort the DB transaction and get surfaced to
    /// the notifier. Everything else is either retried next tick or ignored.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            PoolError::Overspend { .. } | PoolError::InvalidState(_)
        )
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, PoolError::Duplicate(_))
    }
}

impl From<AppDatabaseError> for PoolError {
    fn from(e: AppDatabaseError) -> Self {
        PoolError::Database(e)
    }
}

impl From<redis::RedisError> for PoolError {
    fn from(e: redis::RedisError) -> Self {
        PoolError::Transient(format!("kv: {}", e))
    }
}

impl From<reqwest::Error> for PoolError {
    fn from(e: reqwest::Error) -> Self {
        PoolError::Transient(format!("http: {}", e))
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::InvalidState(format!("json: {}", e))
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_kinds() {
        let overspend = PoolError::Overspend {
            have: BigInt::from(99),
            want: BigInt::from(100),
        };
        assert!(overspend.is_business_rule());
        assert!(PoolError::invalid("round mismatch").is_business_rule());
        assert!(!PoolError::transient("node down").is_business_rule());
        assert!(!PoolError::TxTooBig.is_business_rule());
        assert!(PoolError::Duplicate("tx".into()).is_duplicate());
        assert_eq!(overspend.to_string(), "overspend: have 99, want 100");
    }
}
