use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use tokio::sync::{mpsc, watch};

use crate::config::{NodeConfig, PoolConfig};
use crate::consensus::{verify_seal, ConsensusError, PowFunction, Sealer};
use crate::ledger::{apply_transaction, BlockContext, LedgerError};
use crate::ordering::TransactionsByFeeAndNonce;
use crate::signer::{Ed25519Signer, Signer};
use crate::state::{Dump, StateDb, StateError, StateStore};
use crate::storage::{self, Storage, StorageBatch, StorageError};
use crate::types::{
    format_hex, Address, Block, CryptoError, Hash, Header, Transaction, TransactionError,
};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),
    #[error("Insufficient funds for {address}: have {balance}, need {cost}")]
    InsufficientFunds { address: Address, balance: U256, cost: U256 },
    #[error("Nonce too far ahead for {address}: state has {state}, transaction has {nonce}")]
    NonceTooFar { address: Address, state: u64, nonce: u64 },
    #[error("Pending queue of {address} is full ({limit} transactions)")]
    SenderQueueFull { address: Address, limit: usize },
    #[error("Mempool is full ({0} transactions)")]
    MempoolFull(usize),
    #[error("Nonce too low for {address}: state has {state}, transaction has {nonce}")]
    StaleNonce { address: Address, state: u64, nonce: u64 },
    #[error("Known transaction: {0}")]
    KnownTransaction(String),
    #[error("Replacement transaction underpriced for {address} at nonce {nonce}")]
    ReplacementUnderpriced { address: Address, nonce: u64 },
    #[error("Sealed block does not extend the current head")]
    StaleHead,
}

/// A block whose transactions have been executed but which is not sealed yet.
pub struct AssembledBlock<S: Storage> {
    pub block: Block,
    /// Hashes of included transactions whose transfer failed
    pub failed: Vec<Hash>,
    /// Senders whose remaining queue was skipped after a rejection
    pub dropped: Vec<Address>,
    state: StateDb<S>,
}

/// The chain layer: mempool, block assembly, sealing and the chain head.
pub struct Runtime<S: Storage, P: PowFunction> {
    storage: Arc<S>,
    signer: Ed25519Signer,
    sealer: Sealer<P>,
    coinbase: Address,
    difficulty: U256,
    max_block_transactions: usize,
    pool: PoolConfig,
    // Per-sender pending transactions keyed by nonce.
    mempool: Mutex<BTreeMap<Address, BTreeMap<u64, Transaction>>>,
    head: RwLock<Block>,
    producing: tokio::sync::Mutex<()>,
}

impl<S: Storage, P: PowFunction> Runtime<S, P> {
    /// Opens the chain in `storage`, writing the genesis block when it is empty.
    pub fn new(storage: Arc<S>, pow: P, config: &NodeConfig) -> Result<Self, RuntimeError> {
        let head = match storage::get_head_block(storage.as_ref())? {
            Some(head) => head,
            None => Self::write_genesis(&storage, config)?,
        };
        tracing::info!(number = head.number(), hash = %format_hex(&head.hash()), "chain opened");

        Ok(Runtime {
            storage,
            signer: Ed25519Signer::new(config.chain_id),
            sealer: Sealer::new(pow, config.sealer.clone()),
            coinbase: config.coinbase,
            difficulty: config.difficulty,
            max_block_transactions: config.max_block_transactions,
            pool: config.pool.clone(),
            mempool: Mutex::new(BTreeMap::new()),
            head: RwLock::new(head),
            producing: tokio::sync::Mutex::new(()),
        })
    }

    fn write_genesis(storage: &Arc<S>, config: &NodeConfig) -> Result<Block, RuntimeError> {
        let mut state = StateDb::new(Arc::clone(storage));
        for (address, balance) in &config.genesis {
            state.set_balance(address, *balance)?;
        }
        let header = Header {
            state_root: state.root()?,
            tx_root: Block::tx_root(&[])?,
            difficulty: config.difficulty,
            ..Header::default()
        };
        let genesis = Block::new(header, Vec::new());

        let mut batch = StorageBatch::default();
        state.stage(&mut batch)?;
        storage::stage_block(&mut batch, &genesis)?;
        storage.apply_batch(batch)?;
        tracing::info!(accounts = config.genesis.len(), "genesis block written");
        Ok(genesis)
    }

    pub fn signer(&self) -> &Ed25519Signer {
        &self.signer
    }

    pub fn sealer(&self) -> &Sealer<P> {
        &self.sealer
    }

    pub fn head(&self) -> Block {
        self.head.read().clone()
    }

    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, RuntimeError> {
        Ok(storage::get_block(self.storage.as_ref(), hash)?)
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, RuntimeError> {
        Ok(storage::get_block_by_number(self.storage.as_ref(), number)?)
    }

    fn state(&self) -> StateDb<S> {
        StateDb::new(Arc::clone(&self.storage))
    }

    pub fn balance(&self, address: &Address) -> Result<U256, RuntimeError> {
        Ok(self.state().balance(address)?)
    }

    pub fn nonce(&self, address: &Address) -> Result<u64, RuntimeError> {
        Ok(self.state().nonce(address)?)
    }

    pub fn dump_state(&self) -> Result<Dump, RuntimeError> {
        Ok(self.state().dump()?)
    }

    /// Adds a signed transaction to the mempool and returns its hash.
    ///
    /// The sender must be able to pay `value + fee` from its committed
    /// balance and the nonce must lie within `max_nonce_gap` of its state
    /// nonce. A transaction at a nonce that is already pending replaces the
    /// pending one only if it pays a strictly higher fee.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash, RuntimeError> {
        tx.validate()?;
        let sender = self.signer.sender(&tx)?;
        let state = self.state();
        let state_nonce = state.nonce(&sender)?;
        if tx.nonce() < state_nonce {
            return Err(RuntimeError::StaleNonce {
                address: sender,
                state: state_nonce,
                nonce: tx.nonce(),
            });
        }
        if tx.nonce() - state_nonce > self.pool.max_nonce_gap {
            return Err(RuntimeError::NonceTooFar {
                address: sender,
                state: state_nonce,
                nonce: tx.nonce(),
            });
        }
        let balance = state.balance(&sender)?;
        if balance < tx.cost() {
            return Err(RuntimeError::InsufficientFunds {
                address: sender,
                balance,
                cost: tx.cost(),
            });
        }
        let hash = tx.hash()?;

        let mut mempool = self.mempool.lock();
        let queued = mempool.get(&sender);
        if !queued.is_some_and(|queue| queue.contains_key(&tx.nonce())) {
            if queued.map_or(0, BTreeMap::len) >= self.pool.max_pending_per_sender {
                return Err(RuntimeError::SenderQueueFull {
                    address: sender,
                    limit: self.pool.max_pending_per_sender,
                });
            }
            if mempool.values().map(BTreeMap::len).sum::<usize>() >= self.pool.max_pending {
                return Err(RuntimeError::MempoolFull(self.pool.max_pending));
            }
        }
        let queue = mempool.entry(sender).or_default();
        if let Some(pending) = queue.get(&tx.nonce()) {
            if pending.hash()? == hash {
                return Err(RuntimeError::KnownTransaction(format_hex(&hash)));
            }
            if tx.fee() <= pending.fee() {
                return Err(RuntimeError::ReplacementUnderpriced {
                    address: sender,
                    nonce: tx.nonce(),
                });
            }
            tracing::debug!(%sender, nonce = tx.nonce(), "replacing pending transaction");
        }
        tracing::debug!(
            %sender,
            nonce = tx.nonce(),
            hash = %format_hex(&hash),
            "transaction accepted"
        );
        queue.insert(tx.nonce(), tx);
        Ok(hash)
    }

    /// Executable mempool transactions: for every sender, the run of
    /// consecutive nonces starting at its current state nonce.
    pub fn pending(&self) -> Result<BTreeMap<Address, Vec<Transaction>>, RuntimeError> {
        let state = self.state();
        let mempool = self.mempool.lock();
        let mut pending = BTreeMap::new();
        for (sender, queue) in mempool.iter() {
            let mut expected = state.nonce(sender)?;
            let mut run = Vec::new();
            for (nonce, tx) in queue.range(expected..) {
                if *nonce != expected {
                    break;
                }
                run.push(tx.clone());
                expected += 1;
            }
            if !run.is_empty() {
                pending.insert(*sender, run);
            }
        }
        Ok(pending)
    }

    pub fn pending_count(&self) -> usize {
        self.mempool.lock().values().map(BTreeMap::len).sum()
    }

    /// Builds the next block on top of the head from the pending transactions.
    ///
    /// Transactions are taken best fee first. A transaction rejected on
    /// validation or with a fatal transfer fault is rolled back and the rest
    /// of its sender's queue is skipped; a stale nonce only skips that
    /// transaction. Storage faults abort assembly.
    ///
    /// `InsufficientBalanceForTransfer` does not abort assembly: the offending
    /// transaction is excluded from the block and assembly continues with the
    /// other senders.
    pub fn assemble_block(&self) -> Result<AssembledBlock<S>, RuntimeError> {
        let parent = self.head();
        let mut header = Header {
            parent_hash: parent.hash(),
            coinbase: self.coinbase,
            number: parent.number() + 1,
            timestamp: current_timestamp().max(parent.header.timestamp),
            difficulty: self.difficulty,
            ..Header::default()
        };
        let ctx = BlockContext::from(&header);

        let mut state = self.state();
        let mut txs = TransactionsByFeeAndNonce::new(&self.signer, self.pending()?);
        let mut included = Vec::new();
        let mut failed = Vec::new();
        let mut dropped = Vec::new();

        while included.len() < self.max_block_transactions {
            let Some(tx) = txs.peek().cloned() else {
                break;
            };
            let snapshot = state.snapshot();
            match apply_transaction(&mut state, &self.signer, &ctx, &tx) {
                Ok(result) => {
                    if let Some(failure) = &result.failure {
                        tracing::debug!(
                            nonce = tx.nonce(),
                            error = %failure,
                            "transaction included with failed transfer"
                        );
                        failed.push(tx.hash()?);
                    }
                    included.push(tx);
                    txs.shift();
                }
                Err(LedgerError::StateError(StateError::StorageError(e))) => {
                    return Err(e.into());
                }
                Err(LedgerError::NonceTooLow { address, state: expected, .. }) => {
                    tracing::trace!(%address, expected, nonce = tx.nonce(), "skipping stale nonce");
                    state.revert_to_snapshot(snapshot)?;
                    txs.shift();
                }
                Err(err) => {
                    tracing::debug!(error = %err, "dropping sender from block");
                    state.revert_to_snapshot(snapshot)?;
                    if let Some(sender) = txs.peek_sender() {
                        dropped.push(sender);
                    }
                    txs.pop();
                }
            }
        }

        header.tx_root = Block::tx_root(&included)?;
        header.state_root = state.root()?;
        tracing::debug!(number = header.number, txs = included.len(), "block assembled");
        Ok(AssembledBlock {
            block: Block::new(header, included),
            failed,
            dropped,
            state,
        })
    }

    /// Assembles, seals and imports the next block.
    ///
    /// Returns `None` if `stop` fired before a seal was found; nothing is
    /// written in that case.
    pub async fn produce_block(
        &self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<Block>, RuntimeError> {
        let _producing = self.producing.lock().await;
        let assembled = self.assemble_block()?;

        let (results, _sealed_rx) = mpsc::channel(1);
        let Some(sealed) = self.sealer.seal(&assembled.block.header, &results, stop).await? else {
            tracing::info!(number = assembled.block.number(), "sealing stopped");
            return Ok(None);
        };
        verify_seal(self.sealer.pow(), &sealed)?;

        let AssembledBlock { block, failed, dropped, mut state } = assembled;
        let block = block.with_seal(sealed);
        if block.header.parent_hash != self.head.read().hash() {
            return Err(RuntimeError::StaleHead);
        }

        let mut batch = StorageBatch::default();
        state.stage(&mut batch)?;
        storage::stage_block(&mut batch, &block)?;
        self.storage.apply_batch(batch)?;
        *self.head.write() = block.clone();
        self.prune_mempool(&dropped)?;

        tracing::info!(
            number = block.number(),
            hash = %format_hex(&block.hash()),
            txs = block.transactions.len(),
            failed = failed.len(),
            "block sealed"
        );
        Ok(Some(block))
    }

    /// Drops mempool entries whose nonce the committed state has passed,
    /// and every pending transaction of the `evict` senders.
    fn prune_mempool(&self, evict: &[Address]) -> Result<(), RuntimeError> {
        let state = self.state();
        let mut mempool = self.mempool.lock();
        for sender in evict {
            if let Some(queue) = mempool.remove(sender) {
                tracing::debug!(%sender, count = queue.len(), "evicted pending transactions");
            }
        }
        for (sender, queue) in mempool.iter_mut() {
            let nonce = state.nonce(sender)?;
            *queue = queue.split_off(&nonce);
        }
        mempool.retain(|_, queue| !queue.is_empty());
        Ok(())
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
