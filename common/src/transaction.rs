use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{amount::Amount, crypto::sha256_hex};

// Typed transaction payload. The wire format is flat JSON with a lower
// camel case "type" tag, so the enum is flattened into the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransactionPayload {
    #[serde(rename_all = "camelCase")]
    Transfer {
        amount: Amount,
        recipient_address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Vote { delegate_address: String },
    #[serde(rename_all = "camelCase")]
    Unvote { delegate_address: String },
    #[serde(rename_all = "camelCase")]
    RegisterSigDetails {
        new_sig_public_key: String,
        new_next_sig_public_key: String,
        new_next_sig_key_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    RegisterMultisigDetails {
        new_multisig_public_key: String,
        new_next_multisig_public_key: String,
        new_next_multisig_key_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    RegisterForgingDetails {
        new_forging_public_key: String,
        new_next_forging_public_key: String,
        new_next_forging_key_index: u64,
    },
    #[serde(rename_all = "camelCase")]
    RegisterMultisigWallet {
        member_addresses: Vec<String>,
        required_signature_count: usize,
    },
}

impl TransactionPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            TransactionPayload::Transfer { .. } => "transfer",
            TransactionPayload::Vote { .. } => "vote",
            TransactionPayload::Unvote { .. } => "unvote",
            TransactionPayload::RegisterSigDetails { .. } => "registerSigDetails",
            TransactionPayload::RegisterMultisigDetails { .. } => "registerMultisigDetails",
            TransactionPayload::RegisterForgingDetails { .. } => "registerForgingDetails",
            TransactionPayload::RegisterMultisigWallet { .. } => "registerMultisigWallet",
        }
    }
}

// One member's contribution to a multisig-sent transaction. A full packet
// carries the signature, a simplified one only its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePacket {
    pub signer_address: String,
    pub multisig_public_key: String,
    pub next_multisig_public_key: String,
    pub next_multisig_key_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_hash: Option<String>,
}

impl SignaturePacket {
    pub fn simplify(&self) -> SignaturePacket {
        SignaturePacket {
            signer_address: self.signer_address.clone(),
            multisig_public_key: self.multisig_public_key.clone(),
            next_multisig_public_key: self.next_multisig_public_key.clone(),
            next_multisig_key_index: self.next_multisig_key_index,
            signature: None,
            signature_hash: self
                .signature_hash
                .clone()
                .or_else(|| self.signature.as_ref().map(|s| sha256_hex(s.as_bytes()))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub sender_address: String,
    pub fee: Amount,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: TransactionPayload,

    // sig sender authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sig_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_sig_key_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_signature_hash: Option<String>,

    // multisig sender authentication
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<SignaturePacket>,

    // set by the DAL once the transaction is part of a persisted block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl Transaction {
    // The id is a hash over the canonical JSON form of everything that is
    // authenticated: signatures (which are computed over the id itself)
    // and the id are excluded, sorted keys make the form canonical.
    pub fn compute_id(&self) -> String {
        let mut value = serde_json::to_value(self).expect("transaction serialization");
        if let Value::Object(map) = &mut value {
            map.remove("id");
            map.remove("senderSignature");
            map.remove("senderSignatureHash");
            map.remove("signatures");
            map.remove("blockId");
        }
        sha256_hex(value.to_string().as_bytes())
    }

    pub fn verify_id(&self) -> bool {
        self.id == self.compute_id()
    }

    // Replace full signatures with their hashes for block inclusion
    pub fn simplify(&self) -> Transaction {
        let mut simplified = self.clone();
        simplified.sender_signature_hash = self
            .sender_signature_hash
            .clone()
            .or_else(|| self.sender_signature.as_ref().map(|s| sha256_hex(s.as_bytes())));
        simplified.sender_signature = None;
        simplified.signatures = self.signatures.iter().map(SignaturePacket::simplify).collect();
        simplified
    }

    // Amount moved out of the sender's balance on top of the fee
    pub fn amount(&self) -> Amount {
        match &self.payload {
            TransactionPayload::Transfer { amount, .. } => *amount,
            _ => Amount::ZERO,
        }
    }

    pub fn recipient_address(&self) -> Option<&str> {
        match &self.payload {
            TransactionPayload::Transfer { recipient_address, .. } => {
                Some(recipient_address.as_str())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transfer() -> Transaction {
        Transaction {
            id: String::new(),
            sender_address: format!("ldpos{}", "a".repeat(40)),
            fee: Amount::from_u64(10),
            timestamp: 30000,
            payload: TransactionPayload::Transfer {
                amount: Amount::from_u64(100),
                recipient_address: format!("ldpos{}", "b".repeat(40)),
                message: None,
            },
            sig_public_key: Some("a".repeat(64)),
            next_sig_public_key: Some("c".repeat(64)),
            next_sig_key_index: Some(1),
            sender_signature: Some("d".repeat(64)),
            sender_signature_hash: None,
            signatures: Vec::new(),
            block_id: None,
        }
    }

    #[test]
    fn test_id_is_deterministic_and_signature_independent() {
        let mut txn = sample_transfer();
        txn.id = txn.compute_id();
        assert!(txn.verify_id());

        // changing the signature must not change the id
        let mut resigned = txn.clone();
        resigned.sender_signature = Some("e".repeat(64));
        assert_eq!(resigned.compute_id(), txn.id);

        // changing authenticated content must change the id
        let mut tampered = txn.clone();
        tampered.fee = Amount::from_u64(11);
        assert_ne!(tampered.compute_id(), txn.id);
    }

    #[test]
    fn test_simplify_preserves_non_signature_fields() {
        let mut txn = sample_transfer();
        txn.id = txn.compute_id();
        let simplified = txn.simplify();

        assert_eq!(simplified.id, txn.id);
        assert_eq!(simplified.sender_address, txn.sender_address);
        assert_eq!(simplified.fee, txn.fee);
        assert_eq!(simplified.payload, txn.payload);
        assert_eq!(simplified.sender_signature, None);
        assert_eq!(
            simplified.sender_signature_hash,
            Some(sha256_hex(txn.sender_signature.as_ref().unwrap().as_bytes()))
        );
        // the id hashes the same canonical form in both shapes
        assert_eq!(simplified.compute_id(), txn.id);
    }

    #[test]
    fn test_wire_format_uses_flat_camel_case() {
        let mut txn = sample_transfer();
        txn.id = txn.compute_id();
        let value = serde_json::to_value(&txn).unwrap();
        assert_eq!(value["type"], "transfer");
        assert_eq!(value["senderAddress"], txn.sender_address);
        assert_eq!(value["recipientAddress"], format!("ldpos{}", "b".repeat(40)));
        assert_eq!(value["amount"], "100");
        assert_eq!(value["fee"], "10");

        let back: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(back, txn);
    }

    #[test]
    fn test_packet_simplify_hashes_signature() {
        let packet = SignaturePacket {
            signer_address: format!("ldpos{}", "c".repeat(40)),
            multisig_public_key: "a".repeat(64),
            next_multisig_public_key: "b".repeat(64),
            next_multisig_key_index: 3,
            signature: Some("sig".to_string()),
            signature_hash: None,
        };
        let simplified = packet.simplify();
        assert_eq!(simplified.signature, None);
        assert_eq!(simplified.signature_hash, Some(sha256_hex(b"sig")));
        assert_eq!(simplified.next_multisig_key_index, 3);
    }
}
