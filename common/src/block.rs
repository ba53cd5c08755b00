use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{amount::Amount, crypto::sha256_hex, transaction::Transaction};

// A delegate's co-signature over an already forged block. The forging key
// fields commit the signer's next key so processing can advance it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSignature {
    pub signer_address: String,
    pub forging_public_key: String,
    pub next_forging_public_key: String,
    pub next_forging_key_index: u64,
    pub block_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    pub height: u64,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_block_id: Option<String>,
    pub forger_address: String,
    #[serde(default)]
    pub forging_public_key: String,
    #[serde(default)]
    pub next_forging_public_key: String,
    #[serde(default)]
    pub next_forging_key_index: u64,
    // transactions are carried in simplified form
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forger_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<BlockSignature>,
}

impl Block {
    // Canonical id: hash over the sorted-key JSON form minus the id and
    // everything signed over it
    pub fn compute_id(&self) -> String {
        let mut value = serde_json::to_value(self).expect("block serialization");
        if let Value::Object(map) = &mut value {
            map.remove("id");
            map.remove("forgerSignature");
            map.remove("signatures");
        }
        sha256_hex(value.to_string().as_bytes())
    }

    pub fn verify_id(&self) -> bool {
        self.id == self.compute_id()
    }

    pub fn total_fees(&self) -> Amount {
        self.transactions.iter().map(|txn| txn.fee).sum()
    }

    pub fn slot(&self, forging_interval: u64) -> u64 {
        self.timestamp / forging_interval
    }

    // Event form: the co-signature list is dropped, transactions stay in
    // their simplified shape
    pub fn simplified(&self) -> Block {
        let mut block = self.clone();
        block.signatures = Vec::new();
        block
    }

    // The persisted chain tip that precedes the first forged block
    pub fn genesis_tip(genesis_id: String) -> Block {
        Block {
            id: genesis_id,
            height: 0,
            timestamp: 0,
            previous_block_id: None,
            forger_address: String::new(),
            forging_public_key: String::new(),
            next_forging_public_key: String::new(),
            next_forging_key_index: 0,
            transactions: Vec::new(),
            forger_signature: None,
            signatures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        Block {
            id: String::new(),
            height: 1,
            timestamp: 30000,
            previous_block_id: Some("g".to_string()),
            forger_address: format!("ldpos{}", "f".repeat(40)),
            forging_public_key: "a".repeat(64),
            next_forging_public_key: "b".repeat(64),
            next_forging_key_index: 1,
            transactions: Vec::new(),
            forger_signature: Some("c".repeat(64)),
            signatures: Vec::new(),
        }
    }

    #[test]
    fn test_id_ignores_signatures() {
        let mut block = sample_block();
        block.id = block.compute_id();
        assert!(block.verify_id());

        let mut cosigned = block.clone();
        cosigned.signatures.push(BlockSignature {
            signer_address: format!("ldpos{}", "d".repeat(40)),
            forging_public_key: "d".repeat(64),
            next_forging_public_key: "e".repeat(64),
            next_forging_key_index: 2,
            block_id: block.id.clone(),
            signature: "f".repeat(64),
        });
        assert_eq!(cosigned.compute_id(), block.id);

        let mut tampered = block.clone();
        tampered.height = 2;
        assert_ne!(tampered.compute_id(), block.id);
    }

    #[test]
    fn test_slot_and_genesis_tip() {
        let mut block = sample_block();
        block.id = block.compute_id();
        assert_eq!(block.slot(30000), 1);

        let tip = Block::genesis_tip("g".to_string());
        assert_eq!(tip.height, 0);
        assert_eq!(tip.timestamp, 0);
        assert_eq!(tip.previous_block_id, None);
    }

    #[test]
    fn test_simplified_drops_signature_list() {
        let mut block = sample_block();
        block.id = block.compute_id();
        block.signatures.push(BlockSignature {
            signer_address: format!("ldpos{}", "d".repeat(40)),
            forging_public_key: "d".repeat(64),
            next_forging_public_key: "e".repeat(64),
            next_forging_key_index: 2,
            block_id: block.id.clone(),
            signature: "f".repeat(64),
        });
        let simplified = block.simplified();
        assert!(simplified.signatures.is_empty());
        assert_eq!(simplified.id, block.id);
    }
}
