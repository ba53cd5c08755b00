use std::collections::HashMap;

use futures::future::try_join_all;
use log::trace;

use ldpos_common::{
    account::{Account, Delegate},
    block::Block,
    crypto::CryptoVerifier,
    time::TimestampMillis,
};

use crate::{
    config::ChainConfig,
    core::delegates::forger_for_timestamp,
    dal::{AccountProvider, DalError, TransactionProvider},
    error::ChainError,
};

use super::{validate_block_schema, verify_transaction, SenderContext, VerifyMode};

// Outcome of a successful forged-block verification: the per-sender
// account snapshots (balances already debited by the block's own
// transactions) and whether the forger's forging key advanced.
pub struct VerifiedBlock {
    pub sender_accounts: HashMap<String, Account>,
    pub member_accounts: HashMap<String, HashMap<String, Account>>,
    pub delegate_changed_keys: bool,
}

async fn fetch_sender_snapshot<D>(
    dal: &D,
    address: String,
) -> Result<(String, Account, HashMap<String, Account>), ChainError>
where
    D: AccountProvider + ?Sized,
{
    let account = dal.get_account(&address).await?;
    let mut members = HashMap::new();
    if account.is_multisig() {
        for member_address in dal.get_multisig_wallet_members(&address).await? {
            let member = dal.get_account(&member_address).await?;
            members.insert(member_address, member);
        }
    }
    Ok((address, account, members))
}

// Verify a candidate block against the last accepted block: chain link,
// slot alignment, forger identity and key, forger signature, and every
// contained transaction against its sender's snapshot.
pub async fn verify_forged_block<D>(
    dal: &D,
    verifier: &dyn CryptoVerifier,
    config: &ChainConfig,
    active_delegates: &[Delegate],
    block: &Block,
    last_block: &Block,
    now: TimestampMillis,
) -> Result<VerifiedBlock, ChainError>
where
    D: AccountProvider + TransactionProvider + ?Sized,
{
    validate_block_schema(config, block)?;

    if block.id == last_block.id {
        return Err(ChainError::invalid_block(&block.id, "block was already the chain tip"));
    }
    if block.height != last_block.height + 1 {
        return Err(ChainError::invalid_block(
            &block.id,
            format!(
                "height {} did not follow the chain tip at {}",
                block.height, last_block.height
            ),
        ));
    }
    if block.timestamp % config.forging_interval != 0 {
        return Err(ChainError::invalid_block(
            &block.id,
            "timestamp was not aligned to a forging slot",
        ));
    }
    if block.timestamp < last_block.timestamp + config.forging_interval {
        return Err(ChainError::invalid_block(
            &block.id,
            "timestamp did not advance past the previous block's slot",
        ));
    }

    let assigned =
        forger_for_timestamp(active_delegates, config.forging_interval, block.timestamp)
            .ok_or_else(|| {
                ChainError::invalid_block(&block.id, "there were no active delegates")
            })?;
    if assigned.address != block.forger_address {
        return Err(ChainError::invalid_block(
            &block.id,
            format!(
                "forger {} did not own the slot assigned to {}",
                block.forger_address, assigned.address
            ),
        ));
    }

    let forger_account = dal.get_account(&block.forger_address).await?;
    let delegate_changed_keys = if Some(block.forging_public_key.as_str())
        == forger_account.forging_public_key.as_deref()
    {
        false
    } else if Some(block.forging_public_key.as_str())
        == forger_account.next_forging_public_key.as_deref()
    {
        true
    } else {
        return Err(ChainError::invalid_block(
            &block.id,
            format!(
                "forgingPublicKey did not match the current or next key of {}",
                block.forger_address
            ),
        ));
    };

    if block.previous_block_id.as_deref() != Some(last_block.id.as_str()) {
        return Err(ChainError::invalid_block(
            &block.id,
            format!("previousBlockId did not link to the chain tip {}", last_block.id),
        ));
    }
    if !verifier.verify_block(block).await? {
        return Err(ChainError::invalid_block(&block.id, "forgerSignature was invalid"));
    }

    // a transaction id may only ever appear in one block
    for txn in &block.transactions {
        match dal.get_transaction(&txn.id).await {
            Ok(stored) if stored.block_id.as_deref() != Some(block.id.as_str()) => {
                return Err(ChainError::invalid_block(
                    &block.id,
                    format!("transaction {} was already in another block", txn.id),
                ));
            }
            Ok(_) => {}
            Err(DalError::TransactionDidNotExist(_)) => {}
            Err(err) => return Err(err.into()),
        }
    }

    // group by sender, one snapshot fetch per sender, then authorize
    // serially within each sender with in-memory balance decrements
    let mut by_sender: HashMap<&str, Vec<usize>> = HashMap::new();
    for (position, txn) in block.transactions.iter().enumerate() {
        by_sender.entry(&txn.sender_address).or_default().push(position);
    }

    let snapshots = try_join_all(
        by_sender
            .keys()
            .map(|address| fetch_sender_snapshot(dal, address.to_string())),
    )
    .await?;

    let mut sender_accounts = HashMap::new();
    let mut member_accounts = HashMap::new();
    for (address, account, members) in snapshots {
        member_accounts.insert(address.clone(), members);
        sender_accounts.insert(address, account);
    }

    for (address, positions) in &by_sender {
        let members = &member_accounts[*address];
        for &position in positions {
            let txn = &block.transactions[position];
            let account = &sender_accounts[*address];
            trace!("Verifying transaction {} of block {}", txn.id, block.id);
            verify_transaction(
                verifier,
                config,
                &SenderContext { account, members },
                txn,
                VerifyMode::IdOnly,
                now,
            )
            .await?;

            let spend = txn.amount().checked_add(txn.fee).expect("spend overflow");
            let account = sender_accounts.get_mut(*address).expect("snapshot exists");
            account.balance = account
                .balance
                .checked_sub(spend)
                .expect("balance was verified to cover the spend");
        }
    }

    Ok(VerifiedBlock {
        sender_accounts,
        member_accounts,
        delegate_changed_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{BlockProvider, Dal, MemoryDal};
    use ldpos_common::{
        amount::Amount,
        crypto::{CryptoClient, KeyType, SimCryptoClient, SimCryptoVerifier},
        genesis::{Genesis, GenesisAccount},
        transaction::{Transaction, TransactionPayload},
    };

    fn forging_genesis_account(client: &SimCryptoClient, balance: u64) -> GenesisAccount {
        GenesisAccount {
            address: client.wallet_address().to_string(),
            account_type: ldpos_common::account::AccountType::Sig,
            balance: Amount::from_u64(balance),
            sig_public_key: Some(client.public_key(KeyType::Sig, 0)),
            next_sig_public_key: Some(client.next_public_key(KeyType::Sig, 0)),
            next_sig_key_index: Some(0),
            forging_public_key: Some(client.public_key(KeyType::Forging, 0)),
            next_forging_public_key: Some(client.next_public_key(KeyType::Forging, 0)),
            next_forging_key_index: Some(0),
            multisig_public_key: None,
            next_multisig_public_key: None,
            next_multisig_key_index: None,
            votes: vec![client.wallet_address().to_string()],
        }
    }

    async fn setup() -> (MemoryDal, SimCryptoClient, SimCryptoClient, Vec<Delegate>, Block) {
        let forger = SimCryptoClient::new("ldpos", "delegate-1");
        let sender = SimCryptoClient::new("ldpos", "sender-1");
        let dal = MemoryDal::new();
        let genesis = Genesis {
            network_symbol: "ldpos".to_string(),
            accounts: vec![
                forging_genesis_account(&forger, 0),
                GenesisAccount {
                    address: sender.wallet_address().to_string(),
                    account_type: ldpos_common::account::AccountType::Sig,
                    balance: Amount::from_u64(100_000_000),
                    sig_public_key: None,
                    next_sig_public_key: None,
                    next_sig_key_index: None,
                    forging_public_key: None,
                    next_forging_public_key: None,
                    next_forging_key_index: None,
                    multisig_public_key: None,
                    next_multisig_public_key: None,
                    next_multisig_key_index: None,
                    votes: Vec::new(),
                },
            ],
        };
        dal.init(&genesis).await.unwrap();
        let active = vec![Delegate::new(forger.wallet_address().to_string())];
        let tip = Block::genesis_tip(genesis.id());
        (dal, forger, sender, active, tip)
    }

    fn transfer(sender: &SimCryptoClient, recipient: &str, amount: u64, fee: u64) -> Transaction {
        sender.sign_transaction(Transaction {
            id: String::new(),
            sender_address: sender.wallet_address().to_string(),
            fee: Amount::from_u64(fee),
            timestamp: 15_000,
            payload: TransactionPayload::Transfer {
                amount: Amount::from_u64(amount),
                recipient_address: recipient.to_string(),
                message: None,
            },
            sig_public_key: None,
            next_sig_public_key: None,
            next_sig_key_index: None,
            sender_signature: None,
            sender_signature_hash: None,
            signatures: Vec::new(),
            block_id: None,
        })
    }

    async fn forge(forger: &SimCryptoClient, tip: &Block, transactions: Vec<Transaction>) -> Block {
        forger
            .prepare_block(Block {
                id: String::new(),
                height: tip.height + 1,
                timestamp: tip.timestamp + 30_000,
                previous_block_id: Some(tip.id.clone()),
                forger_address: String::new(),
                forging_public_key: String::new(),
                next_forging_public_key: String::new(),
                next_forging_key_index: 0,
                transactions: transactions.iter().map(Transaction::simplify).collect(),
                forger_signature: None,
                signatures: Vec::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_genesis_successor_passes() {
        let (dal, forger, sender, active, tip) = setup().await;
        let recipient = format!("ldpos{}", "9".repeat(40));
        let txn = transfer(&sender, &recipient, 50_000_000, 10_000_000);
        let block = forge(&forger, &tip, vec![txn]).await;

        let config = ChainConfig::default();
        let verified = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &block,
            &tip,
            60_000,
        )
        .await
        .unwrap();
        assert!(!verified.delegate_changed_keys);
        let snapshot = &verified.sender_accounts[sender.wallet_address()];
        assert_eq!(snapshot.balance, Amount::from_u64(40_000_000));
    }

    #[tokio::test]
    async fn test_wrong_height_and_broken_link_fail() {
        let (dal, forger, _sender, active, tip) = setup().await;
        let config = ChainConfig::default();

        let mut wrong_height = forge(&forger, &tip, Vec::new()).await;
        wrong_height.height = 3;
        wrong_height.id = wrong_height.compute_id();
        let result = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &wrong_height,
            &tip,
            60_000,
        )
        .await;
        assert!(matches!(result, Err(ChainError::InvalidBlock { .. })));

        let mut broken_link = forge(&forger, &tip, Vec::new()).await;
        broken_link.previous_block_id = Some("f".repeat(64));
        let result = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &broken_link,
            &tip,
            60_000,
        )
        .await;
        assert!(matches!(result, Err(ChainError::InvalidBlock { .. })));
    }

    #[tokio::test]
    async fn test_misaligned_timestamp_fails() {
        let (dal, forger, _sender, active, tip) = setup().await;
        let config = ChainConfig::default();
        let mut block = forge(&forger, &tip, Vec::new()).await;
        block.timestamp = 30_001;
        block.id = block.compute_id();
        let result = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &block,
            &tip,
            60_000,
        )
        .await;
        assert!(matches!(result, Err(ChainError::InvalidBlock { .. })));
    }

    #[tokio::test]
    async fn test_unassigned_forger_fails() {
        let (dal, forger, _sender, _active, tip) = setup().await;
        let config = ChainConfig::default();
        let block = forge(&forger, &tip, Vec::new()).await;
        // another delegate owns every slot
        let other = vec![Delegate::new(format!("ldpos{}", "7".repeat(40)))];
        let result = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &other,
            &block,
            &tip,
            60_000,
        )
        .await;
        assert!(matches!(result, Err(ChainError::InvalidBlock { .. })));
    }

    #[tokio::test]
    async fn test_transaction_already_in_another_block_fails() {
        let (dal, forger, sender, active, tip) = setup().await;
        let recipient = format!("ldpos{}", "9".repeat(40));
        let txn = transfer(&sender, &recipient, 1_000_000, 10_000_000);

        // the same transaction id is already persisted under another block
        let mut earlier = forge(&forger, &tip, vec![txn.clone()]).await;
        earlier.height = 1;
        dal.upsert_block(&earlier, true).await.unwrap();

        let mut other_tip = tip.clone();
        other_tip.id = "e".repeat(64);
        let block = forge(&forger, &other_tip, vec![txn]).await;
        let config = ChainConfig::default();
        let result = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &block,
            &other_tip,
            60_000,
        )
        .await;
        assert!(matches!(result, Err(ChainError::InvalidBlock { .. })));
    }

    #[tokio::test]
    async fn test_overspending_sender_fails_block() {
        let (dal, forger, sender, active, tip) = setup().await;
        let recipient = format!("ldpos{}", "9".repeat(40));
        // two transfers that individually fit but together overdraw
        let first = transfer(&sender, &recipient, 60_000_000, 10_000_000);
        let second = transfer(&sender, &recipient, 60_000_000, 10_000_000);
        let block = forge(&forger, &tip, vec![first, second]).await;

        let config = ChainConfig::default();
        let result = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &block,
            &tip,
            60_000,
        )
        .await;
        assert!(matches!(result, Err(ChainError::InsufficientBalance { .. })));
    }

    #[tokio::test]
    async fn test_forged_with_next_key_sets_changed_flag() {
        let (dal, _forger, _sender, active, tip) = setup().await;
        // a fresh client whose index 0 tree equals the genesis "next" key
        let rotated = SimCryptoClient::with_keys_per_tree("ldpos", "delegate-1", 1);
        rotated
            .sync_key_index(KeyType::Forging, 1)
            .await
            .unwrap();
        // keys_per_tree=1 makes index 1 fall in tree 1 = genesis next key
        let block = forge(&rotated, &tip, Vec::new()).await;

        let config = ChainConfig::default();
        let verified = verify_forged_block(
            &dal,
            &SimCryptoVerifier,
            &config,
            &active,
            &block,
            &tip,
            60_000,
        )
        .await
        .unwrap();
        assert!(verified.delegate_changed_keys);
    }
}
