//! Account state store.
//!
//! `StateDb` layers a write-back cache over a [`Storage`] backend. Reads fall
//! through to storage, writes stay in the cache until [`StateDb::commit`]
//! flushes them as a single batch. A journal of overwritten entries backs
//! `snapshot`/`revert_to_snapshot`, which the block assembler uses to roll
//! back a rejected transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::storage::{account_key, account_prefix, Storage, StorageBatch, StorageError};
use crate::types::{format_hex, Account, Address, Hash, ADDRESS_LENGTH};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Balance underflow for {0}")]
    BalanceUnderflow(Address),
    #[error("Balance overflow for {0}")]
    BalanceOverflow(Address),
    #[error("Unknown snapshot {0}")]
    InvalidSnapshot(usize),
    #[error("Corrupt account key")]
    CorruptKey,
    #[error("Dump encoding error: {0}")]
    DumpError(#[from] serde_json::Error),
}

/// Account-level read/write primitives consumed by the state-transition engine.
pub trait StateStore {
    fn account(&self, address: &Address) -> Result<Option<Account>, StateError>;
    fn put_account(&mut self, address: &Address, account: Account) -> Result<(), StateError>;

    fn exists(&self, address: &Address) -> Result<bool, StateError> {
        Ok(self.account(address)?.is_some())
    }

    fn create_account(&mut self, address: &Address) -> Result<(), StateError> {
        let account = self.account(address)?.unwrap_or_default();
        self.put_account(address, account)
    }

    fn balance(&self, address: &Address) -> Result<U256, StateError> {
        Ok(self.account(address)?.map(|a| a.balance).unwrap_or_default())
    }

    fn nonce(&self, address: &Address) -> Result<u64, StateError> {
        Ok(self.account(address)?.map(|a| a.nonce).unwrap_or_default())
    }

    fn set_balance(&mut self, address: &Address, balance: U256) -> Result<(), StateError> {
        let mut account = self.account(address)?.unwrap_or_default();
        account.balance = balance;
        self.put_account(address, account)
    }

    fn add_balance(&mut self, address: &Address, amount: U256) -> Result<(), StateError> {
        let balance = self
            .balance(address)?
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow(*address))?;
        self.set_balance(address, balance)
    }

    fn sub_balance(&mut self, address: &Address, amount: U256) -> Result<(), StateError> {
        let balance = self
            .balance(address)?
            .checked_sub(amount)
            .ok_or(StateError::BalanceUnderflow(*address))?;
        self.set_balance(address, balance)
    }

    fn set_nonce(&mut self, address: &Address, nonce: u64) -> Result<(), StateError> {
        let mut account = self.account(address)?.unwrap_or_default();
        account.nonce = nonce;
        self.put_account(address, account)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpAccount {
    /// Decimal balance
    pub balance: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dump {
    pub root: String,
    pub accounts: BTreeMap<Address, DumpAccount>,
}

pub struct StateDb<S: Storage> {
    storage: Arc<S>,
    dirty: BTreeMap<Address, Account>,
    // Previous cache entry for every write, newest last.
    journal: Vec<(Address, Option<Account>)>,
}

impl<S: Storage> StateDb<S> {
    pub fn new(storage: Arc<S>) -> Self {
        StateDb {
            storage,
            dirty: BTreeMap::new(),
            journal: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> usize {
        self.journal.len()
    }

    pub fn revert_to_snapshot(&mut self, snapshot: usize) -> Result<(), StateError> {
        if snapshot > self.journal.len() {
            return Err(StateError::InvalidSnapshot(snapshot));
        }
        for (address, previous) in self.journal.drain(snapshot..).rev() {
            match previous {
                Some(account) => self.dirty.insert(address, account),
                None => self.dirty.remove(&address),
            };
        }
        Ok(())
    }

    /// Every account visible through this state, in address order.
    pub fn accounts(&self) -> Result<BTreeMap<Address, Account>, StateError> {
        let prefix = account_prefix();
        let mut accounts = BTreeMap::new();
        for (key, value) in self.storage.scan_prefix(prefix)? {
            let bytes: [u8; ADDRESS_LENGTH] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StateError::CorruptKey)?;
            let account: Account = bincode::deserialize(&value).map_err(StorageError::from)?;
            accounts.insert(Address(bytes), account);
        }
        accounts.extend(self.dirty.iter().map(|(a, acc)| (*a, acc.clone())));
        Ok(accounts)
    }

    /// Commitment to the full account set.
    pub fn root(&self) -> Result<Hash, StateError> {
        let mut hasher = Sha256::new();
        for (address, account) in self.accounts()? {
            hasher.update(address.as_bytes());
            hasher.update(bincode::serialize(&account).map_err(StorageError::from)?);
        }
        Ok(hasher.finalize().into())
    }

    /// Adds the cached writes to `batch` and clears the cache.
    pub fn stage(&mut self, batch: &mut StorageBatch) -> Result<(), StateError> {
        for (address, account) in std::mem::take(&mut self.dirty) {
            batch.put(
                account_key(&address),
                bincode::serialize(&account).map_err(StorageError::from)?,
            );
        }
        self.journal.clear();
        Ok(())
    }

    /// Writes all cached accounts in one batch and returns the new root.
    pub fn commit(&mut self) -> Result<Hash, StateError> {
        let root = self.root()?;
        let mut batch = StorageBatch::default();
        self.stage(&mut batch)?;
        if !batch.is_empty() {
            self.storage.apply_batch(batch)?;
        }
        tracing::debug!(root = %format_hex(&root), "state committed");
        Ok(root)
    }

    pub fn dump(&self) -> Result<Dump, StateError> {
        let accounts = self
            .accounts()?
            .into_iter()
            .map(|(address, account)| {
                let dumped = DumpAccount {
                    balance: account.balance.to_string(),
                    nonce: account.nonce,
                };
                (address, dumped)
            })
            .collect();
        Ok(Dump {
            root: format_hex(&self.root()?),
            accounts,
        })
    }

    pub fn dump_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(&self.dump()?)?)
    }
}

impl<S: Storage> StateStore for StateDb<S> {
    fn account(&self, address: &Address) -> Result<Option<Account>, StateError> {
        if let Some(account) = self.dirty.get(address) {
            return Ok(Some(account.clone()));
        }
        match self.storage.get(&account_key(address))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(StorageError::from)?)),
            None => Ok(None),
        }
    }

    fn put_account(&mut self, address: &Address, account: Account) -> Result<(), StateError> {
        let previous = self.dirty.insert(*address, account);
        self.journal.push((*address, previous));
        Ok(())
    }
}
