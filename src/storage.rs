use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use thiserror::Error;

use crate::types::{Address, Block, Hash};

const ACCOUNT_PREFIX: &[u8] = b"account:";
const BLOCK_PREFIX: &[u8] = b"block:";
const NUMBER_PREFIX: &[u8] = b"number:";
const HEAD_KEY: &[u8] = b"global:head";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),
    #[error("Data not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
}

/// Opaque key-value store with atomic batches.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;
    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
pub struct StorageBatch {
    pub ops: Vec<StorageOperation>,
}

impl StorageBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(StorageOperation::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(StorageOperation::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug)]
pub enum StorageOperation {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

pub fn account_key(address: &Address) -> Vec<u8> {
    [ACCOUNT_PREFIX, address.as_bytes().as_slice()].concat()
}

pub fn account_prefix() -> &'static [u8] {
    ACCOUNT_PREFIX
}

fn block_key(hash: &Hash) -> Vec<u8> {
    [BLOCK_PREFIX, hash.as_slice()].concat()
}

fn number_key(number: u64) -> Vec<u8> {
    [NUMBER_PREFIX, number.to_be_bytes().as_slice()].concat()
}

fn decode<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>, StorageError> {
    Ok(bytes.map(|b| bincode::deserialize(&b)).transpose()?)
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(value)?)
}

/// Adds the writes that store `block` and make it the chain head.
pub fn stage_block(batch: &mut StorageBatch, block: &Block) -> Result<(), StorageError> {
    let hash = block.hash();
    batch.put(block_key(&hash), encode(block)?);
    batch.put(number_key(block.number()), hash.to_vec());
    batch.put(HEAD_KEY.to_vec(), hash.to_vec());
    Ok(())
}

pub fn get_block<S: Storage + ?Sized>(
    storage: &S,
    hash: &Hash,
) -> Result<Option<Block>, StorageError> {
    decode(storage.get(&block_key(hash))?)
}

pub fn get_block_by_number<S: Storage + ?Sized>(
    storage: &S,
    number: u64,
) -> Result<Option<Block>, StorageError> {
    match storage.get(&number_key(number))? {
        Some(hash) => {
            let hash: Hash = hash.try_into().map_err(|_| StorageError::NotFound)?;
            get_block(storage, &hash)
        }
        None => Ok(None),
    }
}

pub fn get_head_block<S: Storage + ?Sized>(storage: &S) -> Result<Option<Block>, StorageError> {
    match storage.get(HEAD_KEY)? {
        Some(hash) => {
            let hash: Hash = hash.try_into().map_err(|_| StorageError::NotFound)?;
            let block = get_block(storage, &hash)?.ok_or(StorageError::NotFound)?;
            Ok(Some(block))
        }
        None => Ok(None),
    }
}

pub struct SledStorage {
    db: Db,
    state_tree: Tree,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            state_tree: db.open_tree("state")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.state_tree.get(key)?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.state_tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.state_tree.remove(key)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.state_tree.scan_prefix(prefix) {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut tree_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => {
                    tree_batch.insert(key, value);
                }
                StorageOperation::Delete(key) => {
                    tree_batch.remove(key);
                }
            }
        }
        self.state_tree.apply_batch(tree_batch)?;
        Ok(())
    }
}

/// In-memory store for tests and throwaway nodes.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn apply_batch(&self, batch: StorageBatch) -> Result<(), StorageError> {
        let mut entries = self.entries.write();
        for op in batch.ops {
            match op {
                StorageOperation::Put(key, value) => {
                    entries.insert(key, value);
                }
                StorageOperation::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
