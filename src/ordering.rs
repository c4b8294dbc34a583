//! Fee-priority, nonce-respecting transaction ordering for block assembly.
//!
//! Each account contributes one "ready" head, its lowest-nonce pending
//! transaction. A max-heap over the heads yields the best-paying transaction
//! across accounts while each account's own transactions surface strictly in
//! nonce order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};

use primitive_types::U256;

use crate::signer::Signer;
use crate::types::{Address, Transaction};

/// Heap entry for one account's ready transaction.
///
/// Higher fee wins; equal fees go to the lower nonce, then to the entry
/// pushed first.
#[derive(Debug, PartialEq, Eq)]
struct HeadEntry {
    fee: U256,
    nonce: u64,
    seq: u64,
    slot: usize,
}

impl Ord for HeadEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fee
            .cmp(&other.fee)
            .then_with(|| other.nonce.cmp(&self.nonce))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeadEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Ordered view over per-account pending transactions.
///
/// Account queues live in an arena indexed by slot; the heap only holds
/// `{fee, nonce, seq, slot}` entries, one per account with a ready head.
/// Not meant to be shared across threads: a single block-assembly loop
/// drives `peek`/`shift`/`pop`.
#[derive(Debug)]
pub struct TransactionsByFeeAndNonce {
    queues: Vec<VecDeque<Transaction>>,
    senders: Vec<Address>,
    heads: BinaryHeap<HeadEntry>,
    next_seq: u64,
}

impl TransactionsByFeeAndNonce {
    /// Takes ownership of `txs`, each list sorted ascending by nonce.
    ///
    /// The head of every list is re-derived through `signer`; a list whose
    /// head does not verify, or verifies to an address other than its key,
    /// is dropped whole.
    pub fn new<G: Signer + ?Sized>(signer: &G, txs: BTreeMap<Address, Vec<Transaction>>) -> Self {
        let mut set = TransactionsByFeeAndNonce {
            queues: Vec::with_capacity(txs.len()),
            senders: Vec::with_capacity(txs.len()),
            heads: BinaryHeap::with_capacity(txs.len()),
            next_seq: 0,
        };

        for (from, account_txs) in txs {
            let Some(head) = account_txs.first() else {
                continue;
            };
            match signer.sender(head) {
                Ok(sender) if sender == from => {}
                Ok(sender) => {
                    tracing::debug!(
                        key = %from,
                        %sender,
                        "dropping transactions filed under the wrong sender"
                    );
                    continue;
                }
                Err(err) => {
                    tracing::debug!(
                        key = %from,
                        error = %err,
                        "dropping transactions with unverifiable sender"
                    );
                    continue;
                }
            }
            debug_assert!(account_txs.windows(2).all(|w| w[0].nonce() < w[1].nonce()));

            let slot = set.queues.len();
            set.queues.push(account_txs.into());
            set.senders.push(from);
            set.push_head(slot);
        }
        set
    }

    fn push_head(&mut self, slot: usize) {
        if let Some(tx) = self.queues[slot].front() {
            let entry = HeadEntry {
                fee: tx.fee(),
                nonce: tx.nonce(),
                seq: self.next_seq,
                slot,
            };
            self.next_seq += 1;
            self.heads.push(entry);
        }
    }

    /// The best ready transaction, without consuming it.
    pub fn peek(&self) -> Option<&Transaction> {
        self.heads.peek().and_then(|entry| self.queues[entry.slot].front())
    }

    /// Sender of the transaction returned by `peek`.
    pub fn peek_sender(&self) -> Option<Address> {
        self.heads.peek().map(|entry| self.senders[entry.slot])
    }

    /// Consumes the best transaction and promotes its account's next one.
    pub fn shift(&mut self) {
        if let Some(entry) = self.heads.pop() {
            self.queues[entry.slot].pop_front();
            self.push_head(entry.slot);
        }
    }

    /// Consumes the best transaction and drops the rest of its account's queue.
    pub fn pop(&mut self) {
        if let Some(entry) = self.heads.pop() {
            self.queues[entry.slot].clear();
        }
    }

    /// Number of accounts with a ready transaction.
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
