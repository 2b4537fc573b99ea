use serde::Serialize;

/// Stable machine-readable codes surfaced in the error envelope.
///
/// The taxonomy is closed: new failure conditions must pick an existing
/// code rather than extend the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    AlreadyExists,
    Conflict,
    AccountFrozen,
    AccountClosed,
    InsufficientBalance,
    CurrencyMismatch,
    ChainIntegrityViolation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::AccountFrozen => "ACCOUNT_FROZEN",
            ErrorCode::AccountClosed => "ACCOUNT_CLOSED",
            ErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            ErrorCode::CurrencyMismatch => "CURRENCY_MISMATCH",
            ErrorCode::ChainIntegrityViolation => "CHAIN_INTEGRITY_VIOLATION",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// HTTP status the code maps to in the error envelope.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidArgument => 400,
            ErrorCode::AlreadyExists
            | ErrorCode::Conflict
            | ErrorCode::AccountFrozen
            | ErrorCode::AccountClosed
            | ErrorCode::InsufficientBalance
            | ErrorCode::CurrencyMismatch => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::ChainIntegrityViolation | ErrorCode::Internal => 500,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Conflict(String),
    #[error("account is frozen: {0}")]
    AccountFrozen(String),
    #[error("account is closed: {0}")]
    AccountClosed(String),
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },
    #[error("currency mismatch: {expected} vs {actual}")]
    CurrencyMismatch { expected: String, actual: String },
    #[error("chain integrity violation: {0}")]
    ChainIntegrity(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: i64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LedgerError::NotFound(_) => ErrorCode::NotFound,
            LedgerError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            LedgerError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            LedgerError::Conflict(_) => ErrorCode::Conflict,
            LedgerError::AccountFrozen(_) => ErrorCode::AccountFrozen,
            LedgerError::AccountClosed(_) => ErrorCode::AccountClosed,
            LedgerError::InsufficientBalance { .. } => ErrorCode::InsufficientBalance,
            LedgerError::CurrencyMismatch { .. } => ErrorCode::CurrencyMismatch,
            LedgerError::ChainIntegrity(_) => ErrorCode::ChainIntegrityViolation,
            LedgerError::RateLimited { .. } => ErrorCode::RateLimited,
            LedgerError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }

    /// Message safe to return to a caller. Internal failures are masked so
    /// driver-level details never leak through the HTTP surface.
    pub fn public_message(&self) -> String {
        match self {
            LedgerError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Lock conflicts and serialization failures may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => LedgerError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db) => {
                // 23505 unique_violation, 40001 serialization_failure,
                // 40P01 deadlock_detected, 55P03 lock_not_available.
                match db.code().as_deref() {
                    Some("23505") => LedgerError::AlreadyExists(db.message().to_string()),
                    Some("40001") | Some("40P01") | Some("55P03") => {
                        LedgerError::Conflict(db.message().to_string())
                    }
                    _ => LedgerError::Internal(err.to_string()),
                }
            }
            _ => LedgerError::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Internal(format!("serialization error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_the_envelope_contract() {
        assert_eq!(ErrorCode::NotFound.status(), 404);
        assert_eq!(ErrorCode::InvalidArgument.status(), 400);
        assert_eq!(ErrorCode::AlreadyExists.status(), 409);
        assert_eq!(ErrorCode::InsufficientBalance.status(), 409);
        assert_eq!(ErrorCode::RateLimited.status(), 429);
        assert_eq!(ErrorCode::ChainIntegrityViolation.status(), 500);
        assert_eq!(ErrorCode::Internal.status(), 500);
    }

    #[test]
    fn internal_errors_are_masked() {
        let err = LedgerError::Internal("connection refused at 10.0.0.3".to_string());
        assert_eq!(err.public_message(), "internal error");
        let err = LedgerError::InsufficientBalance {
            available: 5000,
            requested: 10000,
        };
        assert!(err.public_message().contains("5000"));
    }

    #[test]
    fn conflict_is_retryable() {
        assert!(LedgerError::Conflict("version clash".into()).is_retryable());
        assert!(!LedgerError::NotFound("x".into()).is_retryable());
    }
}
