use ldpos_common::{
    account::Delegate,
    block::{Block, BlockSignature},
    crypto::CryptoVerifier,
};

use crate::{dal::AccountProvider, error::ChainError};

// Authenticate a delegate's co-signature on the active block: it must
// reference the block, come from an active delegate other than the
// forger, claim one of that delegate's committed forging keys, and
// verify cryptographically.
pub async fn verify_block_signature<D>(
    dal: &D,
    verifier: &dyn CryptoVerifier,
    active_delegates: &[Delegate],
    block: &Block,
    signature: &BlockSignature,
) -> Result<(), ChainError>
where
    D: AccountProvider + ?Sized,
{
    let signer = signature.signer_address.as_str();

    if signature.block_id != block.id {
        return Err(ChainError::InvalidBlockSignature {
            signer_address: signer.to_string(),
            reason: format!("signature was for block {} not {}", signature.block_id, block.id),
        });
    }
    if signer == block.forger_address {
        return Err(ChainError::InvalidBlockSignature {
            signer_address: signer.to_string(),
            reason: "the forger cannot co-sign its own block".to_string(),
        });
    }
    if !active_delegates.iter().any(|delegate| delegate.address == signer) {
        return Err(ChainError::InvalidBlockSignature {
            signer_address: signer.to_string(),
            reason: "signer was not in the top active delegate set".to_string(),
        });
    }

    let account = dal.get_account(signer).await?;
    let key = signature.forging_public_key.as_str();
    if Some(key) != account.forging_public_key.as_deref()
        && Some(key) != account.next_forging_public_key.as_deref()
    {
        return Err(ChainError::InvalidBlockSignature {
            signer_address: signer.to_string(),
            reason: "forgingPublicKey did not match the signer's committed keys".to_string(),
        });
    }

    if !verifier.verify_block_signature(&block.id, signature).await? {
        return Err(ChainError::InvalidBlockSignature {
            signer_address: signer.to_string(),
            reason: "signature was invalid".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::{Dal, MemoryDal};
    use ldpos_common::{
        account::Account,
        crypto::{CryptoClient, KeyType, SimCryptoClient, SimCryptoVerifier},
        genesis::Genesis,
    };

    async fn setup() -> (MemoryDal, SimCryptoClient, SimCryptoClient, Vec<Delegate>, Block) {
        let forger = SimCryptoClient::new("ldpos", "delegate-1");
        let cosigner = SimCryptoClient::new("ldpos", "delegate-2");
        let dal = MemoryDal::new();
        dal.init(&Genesis {
            network_symbol: "ldpos".to_string(),
            accounts: Vec::new(),
        })
        .await
        .unwrap();

        for client in [&forger, &cosigner] {
            let mut account = Account::new(client.wallet_address().to_string());
            account.forging_public_key = Some(client.public_key(KeyType::Forging, 0));
            account.next_forging_public_key = Some(client.next_public_key(KeyType::Forging, 0));
            account.next_forging_key_index = Some(0);
            dal.upsert_account(&account).await.unwrap();
        }

        let active = vec![
            Delegate::new(forger.wallet_address().to_string()),
            Delegate::new(cosigner.wallet_address().to_string()),
        ];
        let block = forger
            .prepare_block(Block::genesis_tip(String::new()))
            .await
            .unwrap();
        (dal, forger, cosigner, active, block)
    }

    #[tokio::test]
    async fn test_valid_cosignature_passes() {
        let (dal, _forger, cosigner, active, block) = setup().await;
        let signature = cosigner.sign_block(&block).await.unwrap();
        verify_block_signature(&dal, &SimCryptoVerifier, &active, &block, &signature)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_forger_self_signature_rejected() {
        let (dal, forger, _cosigner, active, block) = setup().await;
        let signature = forger.sign_block(&block).await.unwrap();
        let result =
            verify_block_signature(&dal, &SimCryptoVerifier, &active, &block, &signature).await;
        assert!(matches!(result, Err(ChainError::InvalidBlockSignature { .. })));
    }

    #[tokio::test]
    async fn test_inactive_signer_rejected() {
        let (dal, _forger, cosigner, mut active, block) = setup().await;
        active.retain(|delegate| delegate.address != cosigner.wallet_address());
        let signature = cosigner.sign_block(&block).await.unwrap();
        let result =
            verify_block_signature(&dal, &SimCryptoVerifier, &active, &block, &signature).await;
        assert!(matches!(result, Err(ChainError::InvalidBlockSignature { .. })));
    }

    #[tokio::test]
    async fn test_wrong_block_id_rejected() {
        let (dal, _forger, cosigner, active, block) = setup().await;
        let mut signature = cosigner.sign_block(&block).await.unwrap();
        signature.block_id = "0".repeat(64);
        let result =
            verify_block_signature(&dal, &SimCryptoVerifier, &active, &block, &signature).await;
        assert!(matches!(result, Err(ChainError::InvalidBlockSignature { .. })));
    }

    #[tokio::test]
    async fn test_unknown_forging_key_rejected() {
        let (dal, _forger, cosigner, active, block) = setup().await;
        let mut signature = cosigner.sign_block(&block).await.unwrap();
        signature.forging_public_key = "e".repeat(64);
        let result =
            verify_block_signature(&dal, &SimCryptoVerifier, &active, &block, &signature).await;
        assert!(matches!(result, Err(ChainError::InvalidBlockSignature { .. })));
    }
}
