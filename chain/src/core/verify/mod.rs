mod block;
mod signature;
mod transaction;

pub use block::{verify_forged_block, VerifiedBlock};
pub use signature::verify_block_signature;
pub use transaction::{
    multisig_key_usage, sig_key_usage, validate_block_schema, validate_transaction_schema,
    verify_transaction, KeyUsage, SenderContext, VerifyMode,
};
