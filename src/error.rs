//! High-level error taxonomy.
//!
//! Component modules carry their own error enums; this type is what crosses
//! the crate boundary. The variants encode the propagation policy: transient
//! kinds are retried and never transition swap state, the rest are surfaced
//! on the swap row.

use crate::chain::ChainError;
use crate::database::DatabaseError;
use crate::exchange::ExchangeError;
use crate::lightning::LightningError;
use crate::swap::error::{TreeError, TxBuildError};
use crate::wallet::WalletError;

/// The crate-level error.
#[derive(Debug)]
pub enum Error {
    /// Caller passed something unusable.
    InvalidInput(String),
    /// Referenced swap or wallet does not exist.
    NotFound(String),
    /// The operation is not valid in the swap's current state.
    FailedPrecondition(String),
    /// The exchange sent a tree, address or invoice that fails verification.
    InvalidServerResponse(String),
    /// Network-level failure; retry with backoff, never transition state.
    TransientNetwork(String),
    /// A chain backend or the exchange rejected a broadcast.
    BroadcastRejected(String),
    /// The exchange claims settlement but the local node disagrees.
    InvoiceUnsettled(String),
    /// The autoswap fee budget is exhausted.
    BudgetExhausted,
    /// The wallet needs to be unlocked first.
    WalletLocked,
    /// Anything else.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidInput(e) => write!(f, "invalid input: {e}"),
            Error::NotFound(e) => write!(f, "not found: {e}"),
            Error::FailedPrecondition(e) => write!(f, "failed precondition: {e}"),
            Error::InvalidServerResponse(e) => write!(f, "invalid server response: {e}"),
            Error::TransientNetwork(e) => write!(f, "transient network error: {e}"),
            Error::BroadcastRejected(e) => write!(f, "broadcast rejected: {e}"),
            Error::InvoiceUnsettled(e) => write!(f, "invoice unsettled: {e}"),
            Error::BudgetExhausted => f.write_str("autoswap budget exhausted"),
            Error::WalletLocked => f.write_str("wallet is locked"),
            Error::Internal(e) => write!(f, "internal error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Whether retrying the same operation can succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_))
    }
}

impl From<TreeError> for Error {
    fn from(value: TreeError) -> Self {
        Error::InvalidServerResponse(format!("{value:?}"))
    }
}

impl From<TxBuildError> for Error {
    fn from(value: TxBuildError) -> Self {
        Error::Internal(format!("transaction construction failed: {value:?}"))
    }
}

impl From<ExchangeError> for Error {
    fn from(value: ExchangeError) -> Self {
        if value.is_transient() {
            Error::TransientNetwork(value.to_string())
        } else {
            Error::InvalidServerResponse(value.to_string())
        }
    }
}

impl From<ChainError> for Error {
    fn from(value: ChainError) -> Self {
        match value {
            ChainError::BroadcastRejected(e) => Error::BroadcastRejected(e),
            ChainError::Http(_) | ChainError::Ws(_) | ChainError::Electrum(_) => {
                Error::TransientNetwork(value.to_string())
            }
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<LightningError> for Error {
    fn from(value: LightningError) -> Self {
        match value {
            LightningError::Connection(e) => Error::TransientNetwork(e),
            LightningError::InvalidInvoice(e) => Error::InvalidInput(e),
            LightningError::NotFound => Error::NotFound("lightning object".to_string()),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<DatabaseError> for Error {
    fn from(value: DatabaseError) -> Self {
        match value {
            DatabaseError::NotFound(e) => Error::NotFound(e),
            DatabaseError::MissingPassphrase => Error::WalletLocked,
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<WalletError> for Error {
    fn from(value: WalletError) -> Self {
        match value {
            WalletError::Locked => Error::WalletLocked,
            WalletError::InsufficientFunds { .. } | WalletError::ReadOnly => {
                Error::FailedPrecondition(value.to_string())
            }
            other => Error::Internal(other.to_string()),
        }
    }
}
