mod sim;

pub use sim::{SimCryptoClient, SimCryptoVerifier};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    block::{Block, BlockSignature},
    transaction::{SignaturePacket, Transaction},
};

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Crypto client error: {0}")]
    Client(String),

    #[error("Key index {requested} was below the already consumed index {consumed}")]
    KeyIndexRegression { requested: u64, consumed: u64 },
}

// The three stateful key chains an account can hold. Every signature
// consumes one key index, the committed next* fields advance the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Sig,
    Multisig,
    Forging,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Sig => "sig",
            KeyType::Multisig => "multisig",
            KeyType::Forging => "forging",
        }
    }
}

// Verification half of the crypto client. Verification only needs the
// material embedded in the object itself, so a node without any forging
// credentials still carries one of these.
#[async_trait]
pub trait CryptoVerifier: Send + Sync {
    async fn verify_block(&self, block: &Block) -> Result<bool, CryptoError>;

    async fn verify_block_signature(
        &self,
        block_id: &str,
        signature: &BlockSignature,
    ) -> Result<bool, CryptoError>;

    async fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, CryptoError>;

    async fn verify_transaction_id(&self, transaction: &Transaction)
        -> Result<bool, CryptoError>;

    async fn verify_multisig_transaction_signature(
        &self,
        transaction: &Transaction,
        packet: &SignaturePacket,
    ) -> Result<bool, CryptoError>;
}

// A connected wallet that can produce blocks and co-signatures. One
// client per forging credential; the key indexes it consumes advance
// monotonically and never reset.
#[async_trait]
pub trait CryptoClient: CryptoVerifier {
    fn wallet_address(&self) -> &str;

    fn forging_key_index(&self) -> u64;

    // Fill in the forger identity and key commitments, compute the id
    // and sign it
    async fn prepare_block(&self, block: Block) -> Result<Block, CryptoError>;

    async fn sign_block(&self, block: &Block) -> Result<BlockSignature, CryptoError>;

    // Advance the local key index for the given chain up to the
    // committed on-chain next index. Returns whether it advanced.
    async fn sync_key_index(
        &self,
        key_type: KeyType,
        committed_next_index: u64,
    ) -> Result<bool, CryptoError>;
}
