use thiserror::Error;

use ldpos_common::{address::AddressError, amount::AmountError, crypto::CryptoError};

use crate::{dal::DalError, network::NetworkError};

// Error taxonomy of the module. Validation, authentication, authorization
// and ordering failures drop the offending object; liveness and transient
// failures are survived by the loops that hit them; config errors abort
// load.
#[derive(Debug, Error)]
pub enum ChainError {
    // validation: malformed object at the wire boundary
    #[error("Invalid transaction {id}: {reason}")]
    InvalidTransaction { id: String, reason: String },

    #[error("Invalid block {id}: {reason}")]
    InvalidBlock { id: String, reason: String },

    #[error("Invalid block signature from {signer_address}: {reason}")]
    InvalidBlockSignature {
        signer_address: String,
        reason: String,
    },

    // authentication: bad signature or wrong key
    #[error("Failed to authenticate transaction {id}: {reason}")]
    TransactionAuthentication { id: String, reason: String },

    // authorization
    #[error("Account {address} balance was insufficient to cover transaction {id}")]
    InsufficientBalance { address: String, id: String },

    #[error("Transaction {id} fee was below the minimum of {minimum}")]
    FeeBelowMinimum { id: String, minimum: String },

    // ordering: stateful-signature window violation
    #[error("Transaction {id} would break the pending key-index ordering: {reason}")]
    OrderingViolation { id: String, reason: String },

    #[error("Mempool rejected transaction {id} from {address}: {reason}")]
    MempoolCapacity {
        id: String,
        address: String,
        reason: String,
    },

    #[error("Pending transaction {0} did not exist")]
    PendingTransactionDidNotExist(String),

    #[error("Account {0} was not a multisig account")]
    AccountWasNotMultisig(String),

    // liveness: absence of a block or signatures within a slot
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    // transient I/O
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Dal(#[from] DalError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    // fatal at load time
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Amount(#[from] AmountError),
}

impl ChainError {
    pub fn invalid_transaction(id: &str, reason: impl Into<String>) -> Self {
        ChainError::InvalidTransaction {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_block(id: &str, reason: impl Into<String>) -> Self {
        ChainError::InvalidBlock {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn authentication(id: &str, reason: impl Into<String>) -> Self {
        ChainError::TransactionAuthentication {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn ordering(id: &str, reason: impl Into<String>) -> Self {
        ChainError::OrderingViolation {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    // Name surfaced to RPC callers, in the InvalidActionError style
    pub fn action_error_name(&self) -> &'static str {
        match self {
            ChainError::InvalidTransaction { .. }
            | ChainError::TransactionAuthentication { .. }
            | ChainError::InsufficientBalance { .. }
            | ChainError::FeeBelowMinimum { .. }
            | ChainError::OrderingViolation { .. }
            | ChainError::MempoolCapacity { .. } => "InvalidTransactionError",
            ChainError::InvalidBlock { .. } => "InvalidBlockError",
            ChainError::InvalidBlockSignature { .. } => "InvalidBlockSignatureError",
            ChainError::PendingTransactionDidNotExist(_) => "PendingTransactionDidNotExistError",
            ChainError::AccountWasNotMultisig(_) => "AccountWasNotMultisigError",
            ChainError::Dal(DalError::AccountDidNotExist(_)) => "AccountDidNotExistError",
            ChainError::Dal(DalError::BlockDidNotExist(_)) => "BlockDidNotExistError",
            _ => "InvalidActionError",
        }
    }
}
