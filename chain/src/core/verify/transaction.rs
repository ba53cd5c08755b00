use std::collections::{HashMap, HashSet};

use ldpos_common::{
    account::Account,
    address::{public_key_matches_address, validate_address},
    amount::Amount,
    block::Block,
    crypto::CryptoVerifier,
    time::TimestampMillis,
    transaction::{SignaturePacket, Transaction, TransactionPayload},
};

use crate::{config::ChainConfig, error::ChainError};

const PUBLIC_KEY_HEX_LENGTH: usize = 64;
const ID_HEX_LENGTH: usize = 64;

// Full mode verifies the actual signatures; id-only mode is used for
// simplified in-block transactions where only the id hash is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Full,
    IdOnly,
}

// Which key of a stateful chain a signature was made with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Current,
    Next,
}

// Sender account snapshot a transaction is verified against. For
// multisig senders the wallet members' accounts ride along.
pub struct SenderContext<'a> {
    pub account: &'a Account,
    pub members: &'a HashMap<String, Account>,
}

fn is_hex_of(value: &str, length: usize) -> bool {
    value.len() == length
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn require_key(id: &str, name: &str, key: &Option<String>) -> Result<(), ChainError> {
    match key {
        Some(value) if is_hex_of(value, PUBLIC_KEY_HEX_LENGTH) => Ok(()),
        Some(_) => Err(ChainError::invalid_transaction(
            id,
            format!("{} was not a valid public key", name),
        )),
        None => Err(ChainError::invalid_transaction(
            id,
            format!("{} was missing", name),
        )),
    }
}

// Structural validation at the wire boundary: field shape, address
// prefixes and size caps. No account state is consulted here.
pub fn validate_transaction_schema(
    config: &ChainConfig,
    txn: &Transaction,
) -> Result<(), ChainError> {
    if !is_hex_of(&txn.id, ID_HEX_LENGTH) {
        return Err(ChainError::invalid_transaction(&txn.id, "id was not a valid hash"));
    }
    validate_address(&config.network_symbol, &txn.sender_address)?;

    if txn.fee.digits() > config.max_spendable_digits {
        return Err(ChainError::invalid_transaction(
            &txn.id,
            format!("fee exceeded {} digits", config.max_spendable_digits),
        ));
    }

    match &txn.payload {
        TransactionPayload::Transfer {
            amount,
            recipient_address,
            message,
        } => {
            validate_address(&config.network_symbol, recipient_address)?;
            if amount.digits() > config.max_spendable_digits {
                return Err(ChainError::invalid_transaction(
                    &txn.id,
                    format!("amount exceeded {} digits", config.max_spendable_digits),
                ));
            }
            if let Some(message) = message {
                if message.len() > config.max_transaction_message_length {
                    return Err(ChainError::invalid_transaction(
                        &txn.id,
                        format!(
                            "message exceeded {} characters",
                            config.max_transaction_message_length
                        ),
                    ));
                }
            }
        }
        TransactionPayload::Vote { delegate_address }
        | TransactionPayload::Unvote { delegate_address } => {
            validate_address(&config.network_symbol, delegate_address)?;
        }
        TransactionPayload::RegisterSigDetails {
            new_sig_public_key,
            new_next_sig_public_key,
            ..
        } => {
            require_key(&txn.id, "newSigPublicKey", &Some(new_sig_public_key.clone()))?;
            require_key(
                &txn.id,
                "newNextSigPublicKey",
                &Some(new_next_sig_public_key.clone()),
            )?;
        }
        TransactionPayload::RegisterMultisigDetails {
            new_multisig_public_key,
            new_next_multisig_public_key,
            ..
        } => {
            require_key(
                &txn.id,
                "newMultisigPublicKey",
                &Some(new_multisig_public_key.clone()),
            )?;
            require_key(
                &txn.id,
                "newNextMultisigPublicKey",
                &Some(new_next_multisig_public_key.clone()),
            )?;
        }
        TransactionPayload::RegisterForgingDetails {
            new_forging_public_key,
            new_next_forging_public_key,
            ..
        } => {
            require_key(
                &txn.id,
                "newForgingPublicKey",
                &Some(new_forging_public_key.clone()),
            )?;
            require_key(
                &txn.id,
                "newNextForgingPublicKey",
                &Some(new_next_forging_public_key.clone()),
            )?;
        }
        TransactionPayload::RegisterMultisigWallet {
            member_addresses,
            required_signature_count,
        } => {
            if member_addresses.len() < config.min_multisig_members
                || member_addresses.len() > config.max_multisig_members
            {
                return Err(ChainError::invalid_transaction(
                    &txn.id,
                    format!(
                        "member count {} was outside the {}..{} bounds",
                        member_addresses.len(),
                        config.min_multisig_members,
                        config.max_multisig_members
                    ),
                ));
            }
            if *required_signature_count == 0
                || *required_signature_count > member_addresses.len()
            {
                return Err(ChainError::invalid_transaction(
                    &txn.id,
                    "requiredSignatureCount was outside the member count",
                ));
            }
            let mut seen = HashSet::new();
            for member in member_addresses {
                validate_address(&config.network_symbol, member)?;
                if !seen.insert(member.as_str()) {
                    return Err(ChainError::invalid_transaction(
                        &txn.id,
                        format!("duplicate member address {}", member),
                    ));
                }
            }
        }
    }

    Ok(())
}

// Structural validation of a peer-supplied block before any chain checks
pub fn validate_block_schema(config: &ChainConfig, block: &Block) -> Result<(), ChainError> {
    if !is_hex_of(&block.id, ID_HEX_LENGTH) {
        return Err(ChainError::invalid_block(&block.id, "id was not a valid hash"));
    }
    validate_address(&config.network_symbol, &block.forger_address)?;
    if block.height == 0 {
        return Err(ChainError::invalid_block(&block.id, "height must be at least 1"));
    }
    if block.forger_signature.is_none() {
        return Err(ChainError::invalid_block(&block.id, "forgerSignature was missing"));
    }
    if !is_hex_of(&block.forging_public_key, PUBLIC_KEY_HEX_LENGTH)
        || !is_hex_of(&block.next_forging_public_key, PUBLIC_KEY_HEX_LENGTH)
    {
        return Err(ChainError::invalid_block(
            &block.id,
            "forging public keys were not valid",
        ));
    }
    if block.transactions.len() > config.max_transactions_per_block {
        return Err(ChainError::invalid_block(
            &block.id,
            format!(
                "transaction count {} exceeded the {} cap",
                block.transactions.len(),
                config.max_transactions_per_block
            ),
        ));
    }
    for txn in &block.transactions {
        validate_transaction_schema(config, txn)?;
    }
    Ok(())
}

// Which of the sender's sig keys a transaction claims to be signed with.
// An account that never registered a sig key accepts a key whose first
// 40 hex characters match the address body (first-use authentication).
pub fn sig_key_usage(
    config: &ChainConfig,
    account: &Account,
    txn: &Transaction,
) -> Result<KeyUsage, ChainError> {
    let claimed = txn.sig_public_key.as_deref().ok_or_else(|| {
        ChainError::invalid_transaction(&txn.id, "sigPublicKey was missing")
    })?;

    match &account.sig_public_key {
        Some(current) if claimed == current => Ok(KeyUsage::Current),
        Some(_) if Some(claimed) == account.next_sig_public_key.as_deref() => Ok(KeyUsage::Next),
        Some(_) => Err(ChainError::authentication(
            &txn.id,
            format!(
                "sigPublicKey did not match the current or next key of account {}",
                account.address
            ),
        )),
        None => {
            if public_key_matches_address(&config.network_symbol, &account.address, claimed) {
                Ok(KeyUsage::Current)
            } else {
                Err(ChainError::authentication(
                    &txn.id,
                    format!(
                        "sigPublicKey did not match the address of account {}",
                        account.address
                    ),
                ))
            }
        }
    }
}

// Which of a member's multisig keys a signature packet claims
pub fn multisig_key_usage(
    member: &Account,
    txn_id: &str,
    packet: &SignaturePacket,
) -> Result<KeyUsage, ChainError> {
    match &member.multisig_public_key {
        Some(current) if packet.multisig_public_key == *current => Ok(KeyUsage::Current),
        _ if Some(packet.multisig_public_key.as_str())
            == member.next_multisig_public_key.as_deref() =>
        {
            Ok(KeyUsage::Next)
        }
        _ => Err(ChainError::authentication(
            txn_id,
            format!(
                "multisigPublicKey did not match the current or next key of member {}",
                packet.signer_address
            ),
        )),
    }
}

async fn authenticate_sig_sender(
    verifier: &dyn CryptoVerifier,
    config: &ChainConfig,
    account: &Account,
    txn: &Transaction,
    mode: VerifyMode,
) -> Result<(), ChainError> {
    sig_key_usage(config, account, txn)?;
    require_key(&txn.id, "nextSigPublicKey", &txn.next_sig_public_key)?;
    if txn.next_sig_key_index.is_none() {
        return Err(ChainError::invalid_transaction(&txn.id, "nextSigKeyIndex was missing"));
    }

    match mode {
        VerifyMode::Full => {
            if txn.sender_signature.is_none() {
                return Err(ChainError::invalid_transaction(
                    &txn.id,
                    "senderSignature was missing",
                ));
            }
            if !verifier.verify_transaction(txn).await? {
                return Err(ChainError::authentication(&txn.id, "senderSignature was invalid"));
            }
        }
        VerifyMode::IdOnly => {
            if !verifier.verify_transaction_id(txn).await? {
                return Err(ChainError::authentication(&txn.id, "id did not match its content"));
            }
        }
    }
    Ok(())
}

async fn authenticate_multisig_sender(
    verifier: &dyn CryptoVerifier,
    account: &Account,
    members: &HashMap<String, Account>,
    txn: &Transaction,
    mode: VerifyMode,
) -> Result<(), ChainError> {
    let required = account.required_signature_count.unwrap_or(0);
    let mut signers = HashSet::new();

    for packet in &txn.signatures {
        if !signers.insert(packet.signer_address.as_str()) {
            return Err(ChainError::authentication(
                &txn.id,
                format!("duplicate signer {}", packet.signer_address),
            ));
        }
        let member = members.get(&packet.signer_address).ok_or_else(|| {
            ChainError::authentication(
                &txn.id,
                format!(
                    "signer {} was not a member of wallet {}",
                    packet.signer_address, account.address
                ),
            )
        })?;
        multisig_key_usage(member, &txn.id, packet)?;

        match mode {
            VerifyMode::Full => {
                if packet.signature.is_none() {
                    return Err(ChainError::invalid_transaction(
                        &txn.id,
                        format!("signature of member {} was missing", packet.signer_address),
                    ));
                }
                if !verifier
                    .verify_multisig_transaction_signature(txn, packet)
                    .await?
                {
                    return Err(ChainError::authentication(
                        &txn.id,
                        format!("signature of member {} was invalid", packet.signer_address),
                    ));
                }
            }
            VerifyMode::IdOnly => {
                if packet.signature_hash.is_none() {
                    return Err(ChainError::invalid_transaction(
                        &txn.id,
                        format!(
                            "signatureHash of member {} was missing",
                            packet.signer_address
                        ),
                    ));
                }
            }
        }
    }

    if signers.len() < required {
        return Err(ChainError::authentication(
            &txn.id,
            format!(
                "only {} of the {} required member signatures were present",
                signers.len(),
                required
            ),
        ));
    }
    if mode == VerifyMode::IdOnly && !verifier.verify_transaction_id(txn).await? {
        return Err(ChainError::authentication(&txn.id, "id did not match its content"));
    }
    Ok(())
}

fn check_min_fee(
    config: &ChainConfig,
    sender: &SenderContext<'_>,
    txn: &Transaction,
) -> Result<(), ChainError> {
    let mut minimum = config.min_transaction_fees.for_payload(&txn.payload);

    if let TransactionPayload::RegisterMultisigWallet { member_addresses, .. } = &txn.payload {
        let surcharge = config
            .min_multisig_registration_fee_per_member
            .checked_mul_u64(member_addresses.len() as u64)
            .ok_or(ChainError::FeeBelowMinimum {
                id: txn.id.clone(),
                minimum: "overflow".to_string(),
            })?;
        minimum = minimum.checked_add(surcharge).unwrap_or(minimum);
    }
    if sender.account.is_multisig() {
        let surcharge = config
            .min_multisig_transaction_fee_per_member
            .checked_mul_u64(sender.members.len() as u64)
            .unwrap_or(Amount::ZERO);
        minimum = minimum.checked_add(surcharge).unwrap_or(minimum);
    }

    if txn.fee < minimum {
        return Err(ChainError::FeeBelowMinimum {
            id: txn.id.clone(),
            minimum: minimum.to_string(),
        });
    }
    Ok(())
}

fn check_balance(sender: &SenderContext<'_>, txn: &Transaction) -> Result<(), ChainError> {
    let spend = txn
        .amount()
        .checked_add(txn.fee)
        .ok_or(ChainError::InsufficientBalance {
            address: sender.account.address.clone(),
            id: txn.id.clone(),
        })?;
    if spend > sender.account.balance {
        return Err(ChainError::InsufficientBalance {
            address: sender.account.address.clone(),
            id: txn.id.clone(),
        });
    }
    Ok(())
}

// The authenticator: schema, key correspondence, signatures, timestamp,
// fee floor (full mode only) and spendable balance, against the given
// sender snapshot. No I/O beyond the crypto verifier.
pub async fn verify_transaction(
    verifier: &dyn CryptoVerifier,
    config: &ChainConfig,
    sender: &SenderContext<'_>,
    txn: &Transaction,
    mode: VerifyMode,
    now: TimestampMillis,
) -> Result<(), ChainError> {
    validate_transaction_schema(config, txn)?;

    if txn.timestamp > now {
        return Err(ChainError::invalid_transaction(
            &txn.id,
            format!("timestamp {} was in the future", txn.timestamp),
        ));
    }

    if sender.account.is_multisig() {
        authenticate_multisig_sender(verifier, sender.account, sender.members, txn, mode).await?;
    } else {
        authenticate_sig_sender(verifier, config, sender.account, txn, mode).await?;
    }

    if mode == VerifyMode::Full {
        check_min_fee(config, sender, txn)?;
    }
    check_balance(sender, txn)
}
