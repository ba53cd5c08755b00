// Deterministic stand-in for the real key-evolving signature client.
// Keys and signatures are plain SHA-256 chains derived from a passphrase;
// every operation is reproducible in tests and local simulation. It
// provides no actual security and must never back a public network.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::{
    address::address_from_public_key,
    block::{Block, BlockSignature},
    transaction::{SignaturePacket, Transaction},
};

use super::{sha256_hex, CryptoClient, CryptoError, CryptoVerifier, KeyType};

// How many key indexes one public key (one "tree") covers before the
// chain rotates to the next public key. Tests use 1 to force a rotation
// on every signature.
pub const DEFAULT_KEYS_PER_TREE: u64 = 8192;

fn tree_public_key(passphrase: &str, key_type: KeyType, tree: u64) -> String {
    sha256_hex(format!("{}:{}:tree:{}", passphrase, key_type.as_str(), tree).as_bytes())
}

fn sign_with_key(public_key: &str, message: &str) -> String {
    sha256_hex(format!("{}:{}", public_key, message).as_bytes())
}

fn verify_with_key(public_key: &str, message: &str, signature: &str) -> bool {
    sign_with_key(public_key, message) == signature
}

// Stateless verification half, for nodes without forging credentials
#[derive(Debug, Default, Clone)]
pub struct SimCryptoVerifier;

#[async_trait]
impl CryptoVerifier for SimCryptoVerifier {
    async fn verify_block(&self, block: &Block) -> Result<bool, CryptoError> {
        let Some(signature) = &block.forger_signature else {
            return Ok(false);
        };
        Ok(block.verify_id() && verify_with_key(&block.forging_public_key, &block.id, signature))
    }

    async fn verify_block_signature(
        &self,
        block_id: &str,
        signature: &BlockSignature,
    ) -> Result<bool, CryptoError> {
        Ok(signature.block_id == block_id
            && verify_with_key(&signature.forging_public_key, block_id, &signature.signature))
    }

    async fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, CryptoError> {
        if !transaction.verify_id() {
            return Ok(false);
        }
        let (Some(public_key), Some(signature)) =
            (&transaction.sig_public_key, &transaction.sender_signature)
        else {
            return Ok(false);
        };
        Ok(verify_with_key(public_key, &transaction.id, signature))
    }

    async fn verify_transaction_id(
        &self,
        transaction: &Transaction,
    ) -> Result<bool, CryptoError> {
        Ok(transaction.verify_id())
    }

    async fn verify_multisig_transaction_signature(
        &self,
        transaction: &Transaction,
        packet: &SignaturePacket,
    ) -> Result<bool, CryptoError> {
        if !transaction.verify_id() {
            return Ok(false);
        }
        let Some(signature) = &packet.signature else {
            return Ok(false);
        };
        Ok(verify_with_key(&packet.multisig_public_key, &transaction.id, signature))
    }
}

pub struct SimCryptoClient {
    network_symbol: String,
    passphrase: String,
    wallet_address: String,
    keys_per_tree: u64,
    forging_key_index: AtomicU64,
    sig_key_index: AtomicU64,
    multisig_key_index: AtomicU64,
    verifier: SimCryptoVerifier,
}

impl SimCryptoClient {
    pub fn new(network_symbol: &str, passphrase: &str) -> Self {
        Self::with_keys_per_tree(network_symbol, passphrase, DEFAULT_KEYS_PER_TREE)
    }

    pub fn with_keys_per_tree(
        network_symbol: &str,
        passphrase: &str,
        keys_per_tree: u64,
    ) -> Self {
        let initial_sig_key = tree_public_key(passphrase, KeyType::Sig, 0);
        let wallet_address = address_from_public_key(network_symbol, &initial_sig_key);
        SimCryptoClient {
            network_symbol: network_symbol.to_string(),
            passphrase: passphrase.to_string(),
            wallet_address,
            keys_per_tree,
            forging_key_index: AtomicU64::new(0),
            sig_key_index: AtomicU64::new(0),
            multisig_key_index: AtomicU64::new(0),
            verifier: SimCryptoVerifier,
        }
    }

    pub fn network_symbol(&self) -> &str {
        &self.network_symbol
    }

    fn tree_of(&self, index: u64) -> u64 {
        index / self.keys_per_tree
    }

    // Public key of the tree that covers the given key index
    pub fn public_key(&self, key_type: KeyType, index: u64) -> String {
        tree_public_key(&self.passphrase, key_type, self.tree_of(index))
    }

    // Public key of a specific tree, independent of the keys-per-tree
    // setting
    pub fn tree_public_key(&self, key_type: KeyType, tree: u64) -> String {
        tree_public_key(&self.passphrase, key_type, tree)
    }

    // Public key of the tree after the one covering the given index
    pub fn next_public_key(&self, key_type: KeyType, index: u64) -> String {
        tree_public_key(&self.passphrase, key_type, self.tree_of(index) + 1)
    }

    fn index_of(&self, key_type: KeyType) -> &AtomicU64 {
        match key_type {
            KeyType::Sig => &self.sig_key_index,
            KeyType::Multisig => &self.multisig_key_index,
            KeyType::Forging => &self.forging_key_index,
        }
    }

    // Sign a transaction as a sig sender, consuming one sig key index
    pub fn sign_transaction(&self, mut transaction: Transaction) -> Transaction {
        let index = self.sig_key_index.fetch_add(1, Ordering::SeqCst);
        let public_key = self.public_key(KeyType::Sig, index);
        transaction.sig_public_key = Some(public_key.clone());
        transaction.next_sig_public_key = Some(self.next_public_key(KeyType::Sig, index));
        transaction.next_sig_key_index = Some(index + 1);
        transaction.sender_signature = None;
        transaction.sender_signature_hash = None;
        transaction.id = transaction.compute_id();
        transaction.sender_signature = Some(sign_with_key(&public_key, &transaction.id));
        transaction
    }

    // Contribute a multisig member packet for an already-identified
    // transaction, consuming one multisig key index
    pub fn make_signature_packet(&self, transaction_id: &str) -> SignaturePacket {
        let index = self.multisig_key_index.fetch_add(1, Ordering::SeqCst);
        let public_key = self.public_key(KeyType::Multisig, index);
        SignaturePacket {
            signer_address: self.wallet_address.clone(),
            multisig_public_key: public_key.clone(),
            next_multisig_public_key: self.next_public_key(KeyType::Multisig, index),
            next_multisig_key_index: index + 1,
            signature: Some(sign_with_key(&public_key, transaction_id)),
            signature_hash: None,
        }
    }
}

#[async_trait]
impl CryptoVerifier for SimCryptoClient {
    async fn verify_block(&self, block: &Block) -> Result<bool, CryptoError> {
        self.verifier.verify_block(block).await
    }

    async fn verify_block_signature(
        &self,
        block_id: &str,
        signature: &BlockSignature,
    ) -> Result<bool, CryptoError> {
        self.verifier.verify_block_signature(block_id, signature).await
    }

    async fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, CryptoError> {
        self.verifier.verify_transaction(transaction).await
    }

    async fn verify_transaction_id(
        &self,
        transaction: &Transaction,
    ) -> Result<bool, CryptoError> {
        self.verifier.verify_transaction_id(transaction).await
    }

    async fn verify_multisig_transaction_signature(
        &self,
        transaction: &Transaction,
        packet: &SignaturePacket,
    ) -> Result<bool, CryptoError> {
        self.verifier
            .verify_multisig_transaction_signature(transaction, packet)
            .await
    }
}

#[async_trait]
impl CryptoClient for SimCryptoClient {
    fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    fn forging_key_index(&self) -> u64 {
        self.forging_key_index.load(Ordering::SeqCst)
    }

    async fn prepare_block(&self, mut block: Block) -> Result<Block, CryptoError> {
        let index = self.forging_key_index.fetch_add(1, Ordering::SeqCst);
        let public_key = self.public_key(KeyType::Forging, index);
        block.forger_address = self.wallet_address.clone();
        block.forging_public_key = public_key.clone();
        block.next_forging_public_key = self.next_public_key(KeyType::Forging, index);
        block.next_forging_key_index = index + 1;
        block.forger_signature = None;
        block.signatures = Vec::new();
        block.id = block.compute_id();
        block.forger_signature = Some(sign_with_key(&public_key, &block.id));
        Ok(block)
    }

    async fn sign_block(&self, block: &Block) -> Result<BlockSignature, CryptoError> {
        let index = self.forging_key_index.fetch_add(1, Ordering::SeqCst);
        let public_key = self.public_key(KeyType::Forging, index);
        Ok(BlockSignature {
            signer_address: self.wallet_address.clone(),
            forging_public_key: public_key.clone(),
            next_forging_public_key: self.next_public_key(KeyType::Forging, index),
            next_forging_key_index: index + 1,
            block_id: block.id.clone(),
            signature: sign_with_key(&public_key, &block.id),
        })
    }

    async fn sync_key_index(
        &self,
        key_type: KeyType,
        committed_next_index: u64,
    ) -> Result<bool, CryptoError> {
        let index = self.index_of(key_type);
        let mut current = index.load(Ordering::SeqCst);
        loop {
            if committed_next_index <= current {
                return Ok(false);
            }
            match index.compare_exchange(
                current,
                committed_next_index,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(true),
                Err(observed) => current = observed,
            }
        }
    }
}
