//! Error taxonomy for the ledger engine.
//!
//! One variant per failure condition, each mapping onto a machine-readable
//! [`ErrorCode`]. Callers branch on the code; the retry loop in the
//! transaction manager branches on [`LedgerError::is_retryable`].

use serde::Serialize;

use crate::store::{AccountId, TransferId};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error(
        "Insufficient funds on account {account_id}: available {available}, \
         requested {requested}"
    )]
    InsufficientFunds {
        account_id: AccountId,
        available: i64,
        requested: i64,
    },
    #[error("Account {0} is frozen")]
    AccountFrozen(AccountId),
    #[error("Account {0} is closed")]
    AccountClosed(AccountId),
    #[error("{0}")]
    LimitExceeded(String),
    #[error("Chain integrity violation: {0}")]
    ChainIntegrityViolation(String),
    #[error("Hold {0} has expired")]
    HoldExpired(TransferId),
    #[error("Operation timed out")]
    Timeout,
    #[error("Concurrent update conflict, retry")]
    VersionConflict,
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    Internal(#[from] anyhow::Error),
}

/// Stable machine-readable codes surfaced to callers alongside the human
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    Conflict,
    InsufficientFunds,
    AccountFrozen,
    AccountClosed,
    LimitExceeded,
    ChainIntegrityViolation,
    Timeout,
    Internal,
}

impl LedgerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) | Self::VersionConflict | Self::NotUnique(_) => {
                ErrorCode::Conflict
            }
            Self::InsufficientFunds { .. } => ErrorCode::InsufficientFunds,
            Self::AccountFrozen(_) => ErrorCode::AccountFrozen,
            Self::AccountClosed(_) => ErrorCode::AccountClosed,
            Self::LimitExceeded(_) => ErrorCode::LimitExceeded,
            Self::ChainIntegrityViolation(_) => {
                ErrorCode::ChainIntegrityViolation
            }
            Self::HoldExpired(_) => ErrorCode::InvalidArgument,
            Self::Timeout => ErrorCode::Timeout,
            Self::Database(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the transaction manager may roll back and re-run the
    /// operation. Integrity violations and idempotency conflicts are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict | Self::Timeout => true,
            // A lost race on the per-aggregate version constraint surfaces
            // as a unique violation; the retry re-reads the chain head.
            Self::NotUnique(_) => true,
            // Serialization failures under REPEATABLE READ.
            Self::Database(e) => sqlstate(e)
                .is_some_and(|code| code == "40001" || code == "40P01"),
            _ => false,
        }
    }
}

fn sqlstate(e: &sqlx::Error) -> Option<String> {
    match e {
        sqlx::Error::Database(db_err) => {
            db_err.code().map(|c| c.into_owned())
        }
        _ => None,
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            if db_err.is_unique_violation() {
                return LedgerError::NotUnique(e);
            }
            // 55P03 lock_not_available (FOR UPDATE NOWAIT / lock_timeout),
            // 57014 query_canceled (statement_timeout).
            if let Some(code) = db_err.code() {
                if code == "55P03" || code == "57014" {
                    return LedgerError::Timeout;
                }
            }
        }
        LedgerError::Database(e)
    }
}
