//! Core type definitions for the powchain node.
//!
//! This module contains the fundamental data structures shared by the
//! state-transition, sealing and ordering engines: addresses, accounts,
//! signed transactions, messages, block headers and blocks.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, SignatureError, Verifier, VerifyingKey};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::signer::Signer;

/// Width of an account address in bytes.
pub const ADDRESS_LENGTH: usize = 20;
/// Transaction format version written by this node.
pub const TX_VERSION: u8 = 1;
/// Longest title accepted in `NewChain` and `Message` transactions.
pub const MAX_TITLE_LENGTH: usize = 144;

/// A 32-byte SHA-256 digest.
pub type Hash = [u8; 32];

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error")]
    HashConversionError,
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Transaction is not signed")]
    Unsigned,
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Chain id mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: u64, got: u64 },
    #[error("Signing key does not match the transaction sender")]
    KeyMismatch,
}

/// Errors raised while building transactions.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Title is {0} bytes, the limit is {MAX_TITLE_LENGTH}")]
    TitleTooLong(usize),
}

/// Wrapper around ed25519 public key for blockchain operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify(message, signature)
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(vk: VerifyingKey) -> Self {
        PublicKey(vk)
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        PublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Account address: the last 20 bytes of SHA-256 over the public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

impl Address {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest: Hash = Sha256::digest(key.as_bytes()).into();
        let mut address = [0u8; ADDRESS_LENGTH];
        address.copy_from_slice(&digest[32 - ADDRESS_LENGTH..]);
        Address(address)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_LENGTH]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        let bytes: [u8; ADDRESS_LENGTH] = bytes
            .try_into()
            .map_err(|_| {
                CryptoError::InvalidAddress(format!("expected {} bytes", ADDRESS_LENGTH))
            })?;
        Ok(Address(bytes))
    }
}

// Hex strings in JSON config and dumps, raw bytes in bincode.
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            <[u8; ADDRESS_LENGTH]>::deserialize(deserializer).map(Address)
        }
    }
}

/// Format a 32-byte hash as a hexadecimal string.
pub fn format_hex(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

pub(crate) fn u256_to_bytes(value: &U256) -> [u8; 32] {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

/// Account state: balance and replay-protection nonce.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
}

/// Signature triple carried by every transaction.
///
/// `v` is the signature scheme marker; `r` and `s` are the two halves of
/// the ed25519 signature. An all-zero triple means "unsigned".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl TxSignature {
    pub fn is_empty(&self) -> bool {
        self.v == 0 && self.r == [0u8; 32] && self.s == [0u8; 32]
    }

    pub fn from_ed25519(v: u8, signature: &Signature) -> Self {
        let bytes = signature.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        TxSignature { v, r, s }
    }

    pub fn to_ed25519(&self) -> Signature {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        Signature::from_bytes(&bytes)
    }
}

/// Fields shared by every transaction variant.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TxCommon {
    pub version: u8,
    pub option: u8,
    pub chain_id: u64,
    pub nonce: u64,
    /// Unix timestamp in seconds
    pub timestamp: u32,
    /// Flat fee paid to the block beneficiary
    pub fee: U256,
    /// Public key of the signer; the sender address is derived from it
    pub sender: PublicKey,
    pub signature: TxSignature,
}

impl TxCommon {
    pub fn new(chain_id: u64, sender: PublicKey, nonce: u64, fee: U256) -> Self {
        TxCommon {
            version: TX_VERSION,
            option: 0,
            chain_id,
            nonce,
            timestamp: 0,
            fee,
            sender,
            signature: TxSignature::default(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A signed transaction.
///
/// Only `Transfer` moves value; the other variants publish data and pay
/// their fee like any other transaction.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Transaction {
    Transfer {
        common: TxCommon,
        receiver: Address,
        amount: U256,
    },
    PersonalInfo {
        common: TxCommon,
        contact_name: [u8; 32],
        name: [u8; 20],
        profile: [u8; 32],
    },
    NewChain {
        common: TxCommon,
        name: [u8; 20],
        contact: [u8; 32],
        title: Vec<u8>,
        description: [u8; 32],
    },
    Message {
        common: TxCommon,
        refer_id: Option<Hash>,
        title: Vec<u8>,
        content: [u8; 32],
    },
}

impl Transaction {
    pub fn transfer(common: TxCommon, receiver: Address, amount: U256) -> Self {
        Transaction::Transfer { common, receiver, amount }
    }

    pub fn personal_info(
        common: TxCommon,
        contact_name: [u8; 32],
        name: [u8; 20],
        profile: [u8; 32],
    ) -> Self {
        Transaction::PersonalInfo { common, contact_name, name, profile }
    }

    pub fn new_chain(
        common: TxCommon,
        name: [u8; 20],
        contact: [u8; 32],
        title: Vec<u8>,
        description: [u8; 32],
    ) -> Result<Self, TransactionError> {
        check_title(&title)?;
        Ok(Transaction::NewChain { common, name, contact, title, description })
    }

    pub fn message(
        common: TxCommon,
        refer_id: Option<Hash>,
        title: Vec<u8>,
        content: [u8; 32],
    ) -> Result<Self, TransactionError> {
        check_title(&title)?;
        Ok(Transaction::Message { common, refer_id, title, content })
    }

    pub fn common(&self) -> &TxCommon {
        match self {
            Transaction::Transfer { common, .. }
            | Transaction::PersonalInfo { common, .. }
            | Transaction::NewChain { common, .. }
            | Transaction::Message { common, .. } => common,
        }
    }

    fn common_mut(&mut self) -> &mut TxCommon {
        match self {
            Transaction::Transfer { common, .. }
            | Transaction::PersonalInfo { common, .. }
            | Transaction::NewChain { common, .. }
            | Transaction::Message { common, .. } => common,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.common().nonce
    }

    pub fn fee(&self) -> U256 {
        self.common().fee
    }

    pub fn chain_id(&self) -> u64 {
        self.common().chain_id
    }

    pub fn sender_key(&self) -> PublicKey {
        self.common().sender
    }

    pub fn signature(&self) -> TxSignature {
        self.common().signature
    }

    /// Amount moved to the recipient. Zero for data-only variants.
    pub fn value(&self) -> U256 {
        match self {
            Transaction::Transfer { amount, .. } => *amount,
            _ => U256::zero(),
        }
    }

    pub fn to(&self) -> Option<Address> {
        match self {
            Transaction::Transfer { receiver, .. } => Some(*receiver),
            _ => None,
        }
    }

    /// Total balance the sender needs: value plus fee.
    pub fn cost(&self) -> U256 {
        self.value().saturating_add(self.fee())
    }

    /// Copy of the transaction with an empty signature, used as signing input.
    pub fn unsigned(&self) -> Transaction {
        let mut tx = self.clone();
        tx.common_mut().signature = TxSignature::default();
        tx
    }

    /// SHA-256 over the full encoding, signature included.
    pub fn hash(&self) -> Result<Hash, CryptoError> {
        let encoded = bincode::serialize(self).map_err(|_| CryptoError::HashConversionError)?;
        Ok(Sha256::digest(encoded).into())
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> Result<u64, CryptoError> {
        bincode::serialized_size(self).map_err(|_| CryptoError::HashConversionError)
    }

    /// Returns a copy carrying the signature decoded from `sig` by `signer`.
    pub fn with_signature<G: Signer + ?Sized>(
        &self,
        signer: &G,
        sig: &[u8],
    ) -> Result<Transaction, CryptoError> {
        let values = signer.signature_values(sig)?;
        let mut tx = self.clone();
        tx.common_mut().signature = values;
        Ok(tx)
    }

    /// Checks payload limits. Variants built without the checked
    /// constructors, or decoded from the wire, must pass this before use.
    pub fn validate(&self) -> Result<(), TransactionError> {
        match self {
            Transaction::NewChain { title, .. } | Transaction::Message { title, .. } => {
                check_title(title)
            }
            Transaction::Transfer { .. } | Transaction::PersonalInfo { .. } => Ok(()),
        }
    }

    /// Converts the transaction into a message, deriving the sender through `signer`.
    pub fn as_message<G: Signer + ?Sized>(&self, signer: &G) -> Result<Message, CryptoError> {
        Ok(Message {
            from: signer.sender(self)?,
            to: self.to(),
            nonce: self.nonce(),
            value: self.value(),
            fee: self.fee(),
            check_nonce: true,
        })
    }
}

fn check_title(title: &[u8]) -> Result<(), TransactionError> {
    if title.len() > MAX_TITLE_LENGTH {
        return Err(TransactionError::TitleTooLong(title.len()));
    }
    Ok(())
}

/// Returns the transactions of `a` whose hashes do not appear in `b`.
pub fn tx_difference(
    a: &[Transaction],
    b: &[Transaction],
) -> Result<Vec<Transaction>, CryptoError> {
    let remove = b.iter().map(Transaction::hash).collect::<Result<HashSet<_>, _>>()?;
    let mut keep = Vec::with_capacity(a.len());
    for tx in a {
        if !remove.contains(&tx.hash()?) {
            keep.push(tx.clone());
        }
    }
    Ok(keep)
}

/// A decoded, sender-resolved transaction ready for the state-transition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub fee: U256,
    pub check_nonce: bool,
}

impl Message {
    pub fn new(
        from: Address,
        to: Option<Address>,
        nonce: u64,
        value: U256,
        fee: U256,
        check_nonce: bool,
    ) -> Self {
        Message { from, to, nonce, value, fee, check_nonce }
    }
}

/// Block header. `nonce` and `mix_digest` are filled in by the sealer.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: Hash,
    /// Beneficiary credited with the fees of this block
    pub coinbase: Address,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub number: u64,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    pub difficulty: U256,
    pub mix_digest: Hash,
    pub nonce: u64,
}

impl Header {
    fn hash_unsealed(&self, hasher: &mut Sha256) {
        hasher.update(self.parent_hash);
        hasher.update(self.coinbase.as_bytes());
        hasher.update(self.state_root);
        hasher.update(self.tx_root);
        hasher.update(self.number.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(u256_to_bytes(&self.difficulty));
    }

    /// Hash of every field except `nonce` and `mix_digest`; the PoW input.
    pub fn seal_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_unsealed(&mut hasher);
        hasher.finalize().into()
    }

    /// Identity hash of the sealed header.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        self.hash_unsealed(&mut hasher);
        hasher.update(self.mix_digest);
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

/// A block: header plus the transactions it commits to.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        Block { header, transactions }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Replaces the header with its sealed counterpart.
    pub fn with_seal(mut self, header: Header) -> Self {
        self.header = header;
        self
    }

    /// Commitment to the ordered transaction hashes.
    pub fn tx_root(transactions: &[Transaction]) -> Result<Hash, CryptoError> {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash()?);
        }
        Ok(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn random_key() -> PublicKey {
        let mut secret_bytes = [0u8; 32];
        rand::Rng::fill(&mut OsRng, &mut secret_bytes);
        PublicKey::from(SigningKey::from_bytes(&secret_bytes).verifying_key())
    }

    fn transfer(nonce: u64, amount: u64) -> Transaction {
        let key = random_key();
        Transaction::transfer(
            TxCommon::new(1, key, nonce, U256::from(5)),
            Address::from_public_key(&key),
            U256::from(amount),
        )
    }

    #[test]
    fn test_address_parse_and_display() {
        let address = Address::from_public_key(&random_key());
        let text = address.to_string();
        assert!(text.starts_with("0x"));
        assert_eq!(text.len(), 2 + 2 * ADDRESS_LENGTH);
        assert_eq!(text.parse::<Address>().unwrap(), address);
        assert_eq!(text[2..].parse::<Address>().unwrap(), address);
        assert!("0x1234".parse::<Address>().is_err());
        assert!("zz".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_serde_formats() {
        let address = Address([7u8; ADDRESS_LENGTH]);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", address));
        assert_eq!(serde_json::from_str::<Address>(&json).unwrap(), address);

        let encoded = bincode::serialize(&address).unwrap();
        assert_eq!(encoded.len(), ADDRESS_LENGTH);
        assert_eq!(bincode::deserialize::<Address>(&encoded).unwrap(), address);
    }

    #[test]
    fn test_header_seal_hash_ignores_seal_fields() {
        let header = Header {
            number: 3,
            difficulty: U256::from(1000),
            ..Header::default()
        };
        let mut sealed = header.clone();
        sealed.nonce = 42;
        sealed.mix_digest = [9u8; 32];

        assert_eq!(header.seal_hash(), sealed.seal_hash());
        assert_ne!(header.hash(), sealed.hash());

        let mut other = header.clone();
        other.number = 4;
        assert_ne!(header.seal_hash(), other.seal_hash());
    }

    #[test]
    fn test_transaction_hash_covers_payload() {
        let tx = transfer(0, 30);
        let hash = tx.hash().unwrap();
        assert_eq!(hash, tx.clone().hash().unwrap());

        let Transaction::Transfer { common, receiver, .. } = tx.clone() else {
            unreachable!()
        };
        let tampered = Transaction::transfer(common, receiver, U256::from(31));
        assert_ne!(hash, tampered.hash().unwrap());
    }

    #[test]
    fn test_value_and_cost_per_variant() {
        let tx = transfer(0, 30);
        assert_eq!(tx.value(), U256::from(30));
        assert_eq!(tx.cost(), U256::from(35));
        assert!(tx.to().is_some());

        let common = TxCommon::new(1, random_key(), 0, U256::from(2));
        let info = Transaction::personal_info(common, [1; 32], [2; 20], [3; 32]);
        assert_eq!(info.value(), U256::zero());
        assert_eq!(info.cost(), U256::from(2));
        assert!(info.to().is_none());
    }

    #[test]
    fn test_title_length_is_bounded() {
        let common = TxCommon::new(1, random_key(), 0, U256::one());
        let longest = vec![0; MAX_TITLE_LENGTH];
        assert!(Transaction::message(common.clone(), None, longest, [0; 32]).is_ok());
        assert!(matches!(
            Transaction::new_chain(
                common,
                [0; 20],
                [0; 32],
                vec![0; MAX_TITLE_LENGTH + 1],
                [0; 32],
            ),
            Err(TransactionError::TitleTooLong(len)) if len == MAX_TITLE_LENGTH + 1
        ));
    }

    #[test]
    fn test_validate_catches_unchecked_titles() {
        let common = TxCommon::new(1, random_key(), 0, U256::one());
        let literal = Transaction::Message {
            common: common.clone(),
            refer_id: None,
            title: vec![0; MAX_TITLE_LENGTH + 1],
            content: [0; 32],
        };
        assert!(matches!(literal.validate(), Err(TransactionError::TitleTooLong(_))));

        let encoded = bincode::serialize(&literal).unwrap();
        let decoded: Transaction = bincode::deserialize(&encoded).unwrap();
        assert!(decoded.validate().is_err());

        let ok = Transaction::message(common, None, vec![0; MAX_TITLE_LENGTH], [0; 32]).unwrap();
        assert!(ok.validate().is_ok());
        assert!(transfer(0, 1).validate().is_ok());
    }

    #[test]
    fn test_tx_difference() {
        let a = transfer(0, 1);
        let b = transfer(1, 2);
        let c = transfer(2, 3);
        let keep = tx_difference(&[a.clone(), b.clone(), c.clone()], &[b]).unwrap();
        assert_eq!(keep, vec![a, c]);
    }

    #[test]
    fn test_tx_root_depends_on_order() {
        let a = transfer(0, 1);
        let b = transfer(1, 2);
        let forward = Block::tx_root(&[a.clone(), b.clone()]).unwrap();
        let backward = Block::tx_root(&[b, a]).unwrap();
        assert_ne!(forward, backward);
    }
}
