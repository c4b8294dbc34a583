//! Transaction signing and sender derivation.

use ed25519_dalek::{Signer as _, SigningKey};
use sha2::{Digest, Sha256};

use crate::types::{Address, CryptoError, Hash, Transaction, TxSignature};

/// Signature scheme marker stored in `TxSignature::v`.
pub const SIGNATURE_V_ED25519: u8 = 1;

/// Capability to hash transactions for signing and recover their sender.
pub trait Signer: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Digest the sender signs: chain id plus the unsigned transaction.
    fn hash(&self, tx: &Transaction) -> Result<Hash, CryptoError>;

    /// Verifies the signature and returns the address that produced it.
    fn sender(&self, tx: &Transaction) -> Result<Address, CryptoError>;

    /// Decodes raw signature bytes into the `(v, r, s)` triple.
    fn signature_values(&self, sig: &[u8]) -> Result<TxSignature, CryptoError>;
}

/// Chain-bound ed25519 signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signer {
    chain_id: u64,
}

impl Ed25519Signer {
    pub fn new(chain_id: u64) -> Self {
        Ed25519Signer { chain_id }
    }
}

impl Signer for Ed25519Signer {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn hash(&self, tx: &Transaction) -> Result<Hash, CryptoError> {
        let encoded =
            bincode::serialize(&tx.unsigned()).map_err(|_| CryptoError::HashConversionError)?;
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.to_le_bytes());
        hasher.update(encoded);
        Ok(hasher.finalize().into())
    }

    fn sender(&self, tx: &Transaction) -> Result<Address, CryptoError> {
        if tx.chain_id() != self.chain_id {
            return Err(CryptoError::ChainIdMismatch {
                expected: self.chain_id,
                got: tx.chain_id(),
            });
        }
        let signature = tx.signature();
        if signature.is_empty() {
            return Err(CryptoError::Unsigned);
        }
        if signature.v != SIGNATURE_V_ED25519 {
            return Err(CryptoError::InvalidSignature);
        }

        let key = tx.sender_key();
        let digest = self.hash(tx)?;
        key.verify(&digest, &signature.to_ed25519())
            .map_err(|_| CryptoError::SignatureVerificationFailed)?;
        Ok(Address::from_public_key(&key))
    }

    fn signature_values(&self, sig: &[u8]) -> Result<TxSignature, CryptoError> {
        let bytes: [u8; 64] = sig.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(TxSignature::from_ed25519(
            SIGNATURE_V_ED25519,
            &ed25519_dalek::Signature::from_bytes(&bytes),
        ))
    }
}

/// Signs `tx` with `key`, returning the signed copy.
///
/// # Errors
///
/// Returns `CryptoError::KeyMismatch` if `key` is not the key named as the
/// transaction sender.
pub fn sign_transaction<G: Signer + ?Sized>(
    signer: &G,
    tx: &Transaction,
    key: &SigningKey,
) -> Result<Transaction, CryptoError> {
    if key.verifying_key().to_bytes() != tx.sender_key().to_bytes() {
        return Err(CryptoError::KeyMismatch);
    }
    let digest = signer.hash(tx)?;
    let signature = key.sign(&digest);
    tx.with_signature(signer, &signature.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PublicKey, TxCommon};
    use primitive_types::U256;
    use rand::rngs::OsRng;

    fn signing_key() -> SigningKey {
        let mut secret_bytes = [0u8; 32];
        rand::Rng::fill(&mut OsRng, &mut secret_bytes);
        SigningKey::from_bytes(&secret_bytes)
    }

    fn unsigned_transfer(key: &SigningKey, chain_id: u64) -> Transaction {
        let sender = PublicKey::from(key.verifying_key());
        Transaction::transfer(
            TxCommon::new(chain_id, sender, 0, U256::from(5)),
            Address([1u8; 20]),
            U256::from(30),
        )
    }

    #[test]
    fn test_sign_and_recover_sender() {
        let signer = Ed25519Signer::new(7);
        let key = signing_key();
        let tx = unsigned_transfer(&key, 7);

        assert!(matches!(signer.sender(&tx), Err(CryptoError::Unsigned)));

        let signed = sign_transaction(&signer, &tx, &key).unwrap();
        let expected = Address::from_public_key(&PublicKey::from(key.verifying_key()));
        assert_eq!(signer.sender(&signed).unwrap(), expected);
        // Signing does not change the signing hash.
        assert_eq!(signer.hash(&tx).unwrap(), signer.hash(&signed).unwrap());

        let message = signed.as_message(&signer).unwrap();
        assert_eq!(message.from, expected);
        assert_eq!(message.value, U256::from(30));
        assert!(message.check_nonce);
    }

    #[test]
    fn test_tampered_transaction_is_rejected() {
        let signer = Ed25519Signer::new(7);
        let key = signing_key();
        let signed = sign_transaction(&signer, &unsigned_transfer(&key, 7), &key).unwrap();

        let Transaction::Transfer { common, receiver, .. } = signed else {
            unreachable!()
        };
        let tampered = Transaction::transfer(common, receiver, U256::from(1_000));
        assert!(matches!(
            signer.sender(&tampered),
            Err(CryptoError::SignatureVerificationFailed)
        ));
    }

    #[test]
    fn test_foreign_chain_is_rejected() {
        let key = signing_key();
        let signer = Ed25519Signer::new(1);
        let signed = sign_transaction(&signer, &unsigned_transfer(&key, 1), &key).unwrap();
        assert!(matches!(
            Ed25519Signer::new(2).sender(&signed),
            Err(CryptoError::ChainIdMismatch { expected: 2, got: 1 })
        ));
    }

    #[test]
    fn test_wrong_key_cannot_sign() {
        let signer = Ed25519Signer::new(1);
        let tx = unsigned_transfer(&signing_key(), 1);
        assert!(matches!(
            sign_transaction(&signer, &tx, &signing_key()),
            Err(CryptoError::KeyMismatch)
        ));
    }

    #[test]
    fn test_signature_values_length() {
        let signer = Ed25519Signer::new(1);
        assert!(signer.signature_values(&[0u8; 63]).is_err());
        let values = signer.signature_values(&[3u8; 64]).unwrap();
        assert_eq!(values.v, SIGNATURE_V_ED25519);
        assert_eq!(values.r, [3u8; 32]);
        assert_eq!(values.s, [3u8; 32]);
    }
}
