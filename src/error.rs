use gridcore_messaging::MessagingError;
use gridcore_near::NearError;
use gridcore_tx::TxError;
use thiserror::Error;

/// Errors surfaced by a grid node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),

    #[error("Near cache error: {0}")]
    Near(#[from] NearError),
}

pub type Result<T> = std::result::Result<T, GridError>;
