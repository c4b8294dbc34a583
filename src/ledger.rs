//! State transition engine.
//!
//! Applying a message:
//!
//! 1. nonce check
//! 2. fee prepayment (irrevocable)
//! 3. nonce increment
//! 4. value transfer, creating the recipient if needed
//! 5. fee credit to the block beneficiary
//!
//! Only an insufficient balance for the value makes a transfer fault fatal at
//! the consensus level; every other transfer fault leaves the transaction
//! included but failed.

use primitive_types::U256;
use thiserror::Error;

use crate::signer::Signer;
use crate::state::{StateError, StateStore};
use crate::types::{Address, CryptoError, Header, Message, Transaction};

/// Multiplier applied to the declared fee to get the prepayment.
pub const FEE_MULTIPLIER: u64 = 1;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Nonce too high for {address}: state has {state}, message has {message}")]
    NonceTooHigh { address: Address, state: u64, message: u64 },
    #[error("Nonce too low for {address}: state has {state}, message has {message}")]
    NonceTooLow { address: Address, state: u64, message: u64 },
    #[error("Nonce overflow for {0}")]
    NonceOverflow(Address),
    #[error("Insufficient balance to pay the fee from {address}: have {balance}, need {required}")]
    InsufficientBalanceForFee { address: Address, balance: U256, required: U256 },
    #[error("Insufficient balance for transfer from {address}: have {balance}, need {value}")]
    InsufficientBalanceForTransfer { address: Address, balance: U256, value: U256 },
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] CryptoError),
    #[error("State error: {0}")]
    StateError(#[from] StateError),
}

impl LedgerError {
    /// Rejected before execution with no state touched; safe to retry with a
    /// corrected transaction.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::NonceTooHigh { .. }
                | LedgerError::NonceTooLow { .. }
                | LedgerError::NonceOverflow(_)
                | LedgerError::InsufficientBalanceForFee { .. }
                | LedgerError::InvalidTransaction(_)
        )
    }

    /// The fee was already taken when the transfer failed; the caller must
    /// discard the transaction's state changes.
    pub fn is_consensus_fatal(&self) -> bool {
        matches!(self, LedgerError::InsufficientBalanceForTransfer { .. })
    }
}

/// Faults raised by the value transfer.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Insufficient balance for transfer: have {balance}")]
    InsufficientBalance { balance: U256 },
    #[error("Value transfer without a recipient")]
    MissingRecipient,
    #[error("Recipient balance would overflow")]
    RecipientOverflow,
    #[error("State error: {0}")]
    StateError(#[from] StateError),
}

/// Outcome of an applied message.
#[derive(Debug)]
pub struct ExecutionResult {
    pub return_data: Vec<u8>,
    /// Fee credited to the beneficiary
    pub fee: U256,
    /// Soft fault: the transaction is included and its fee charged, but the
    /// transfer did not happen.
    pub failure: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Block-level environment for applying messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockContext {
    pub coinbase: Address,
    pub number: u64,
}

impl BlockContext {
    pub fn new(coinbase: Address, number: u64) -> Self {
        BlockContext { coinbase, number }
    }
}

impl From<&Header> for BlockContext {
    fn from(header: &Header) -> Self {
        BlockContext::new(header.coinbase, header.number)
    }
}

fn pre_check<S: StateStore + ?Sized>(state: &S, msg: &Message) -> Result<U256, LedgerError> {
    let nonce = state.nonce(&msg.from)?;
    if msg.check_nonce {
        if nonce < msg.nonce {
            return Err(LedgerError::NonceTooHigh {
                address: msg.from,
                state: nonce,
                message: msg.nonce,
            });
        } else if nonce > msg.nonce {
            return Err(LedgerError::NonceTooLow {
                address: msg.from,
                state: nonce,
                message: msg.nonce,
            });
        }
    }
    if nonce == u64::MAX {
        return Err(LedgerError::NonceOverflow(msg.from));
    }

    let prepayment = msg.fee.saturating_mul(U256::from(FEE_MULTIPLIER));
    let balance = state.balance(&msg.from)?;
    if balance < prepayment {
        return Err(LedgerError::InsufficientBalanceForFee {
            address: msg.from,
            balance,
            required: prepayment,
        });
    }
    Ok(prepayment)
}

fn transfer<S: StateStore + ?Sized>(
    state: &mut S,
    from: &Address,
    to: Option<Address>,
    value: U256,
) -> Result<Vec<u8>, ExecutionError> {
    let balance = state.balance(from)?;
    if balance < value {
        return Err(ExecutionError::InsufficientBalance { balance });
    }
    let Some(to) = to else {
        if value.is_zero() {
            return Ok(Vec::new());
        }
        return Err(ExecutionError::MissingRecipient);
    };

    if !state.exists(&to)? {
        state.create_account(&to)?;
    }
    if to != *from && state.balance(&to)?.checked_add(value).is_none() {
        return Err(ExecutionError::RecipientOverflow);
    }
    state.sub_balance(from, value)?;
    state.add_balance(&to, value)?;
    Ok(Vec::new())
}

/// Applies `msg` to `state`.
///
/// # Errors
///
/// Validation failures (`NonceTooHigh`, `NonceTooLow`,
/// `InsufficientBalanceForFee`) leave the state untouched.
/// `InsufficientBalanceForTransfer` is returned after the fee was deducted
/// and the nonce incremented, and without crediting the beneficiary.
pub fn apply_message<S: StateStore + ?Sized>(
    state: &mut S,
    ctx: &BlockContext,
    msg: &Message,
) -> Result<ExecutionResult, LedgerError> {
    let prepayment = pre_check(state, msg)?;
    state.sub_balance(&msg.from, prepayment)?;

    let nonce = state.nonce(&msg.from)?;
    state.set_nonce(&msg.from, nonce + 1)?;

    let (return_data, failure) = match transfer(state, &msg.from, msg.to, msg.value) {
        Ok(data) => (data, None),
        Err(ExecutionError::InsufficientBalance { balance }) => {
            return Err(LedgerError::InsufficientBalanceForTransfer {
                address: msg.from,
                balance,
                value: msg.value,
            });
        }
        Err(ExecutionError::StateError(e)) => return Err(e.into()),
        Err(soft) => {
            tracing::debug!(from = %msg.from, nonce = msg.nonce, error = %soft, "transfer failed");
            (Vec::new(), Some(soft))
        }
    };

    state.add_balance(&ctx.coinbase, msg.fee)?;

    Ok(ExecutionResult {
        return_data,
        fee: msg.fee,
        failure,
    })
}

/// Resolves the sender of `tx` through `signer` and applies it.
pub fn apply_transaction<S: StateStore + ?Sized, G: Signer + ?Sized>(
    state: &mut S,
    signer: &G,
    ctx: &BlockContext,
    tx: &Transaction,
) -> Result<ExecutionResult, LedgerError> {
    let msg = tx.as_message(signer)?;
    apply_message(state, ctx, &msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{sign_transaction, Ed25519Signer};
    use crate::state::StateDb;
    use crate::storage::MemoryStorage;
    use crate::types::{PublicKey, TxCommon, ADDRESS_LENGTH};
    use ed25519_dalek::SigningKey;
    use std::sync::Arc;

    const ALICE: Address = Address([0xa1; ADDRESS_LENGTH]);
    const BOB: Address = Address([0xb0; ADDRESS_LENGTH]);
    const MINER: Address = Address([0xc0; ADDRESS_LENGTH]);

    fn state_with(balances: &[(Address, u64)]) -> StateDb<MemoryStorage> {
        let mut state = StateDb::new(Arc::new(MemoryStorage::new()));
        for (address, balance) in balances {
            state.set_balance(address, U256::from(*balance)).unwrap();
        }
        state
    }

    fn ctx() -> BlockContext {
        BlockContext::new(MINER, 1)
    }

    fn send(nonce: u64, to: Option<Address>, value: u64, fee: u64) -> Message {
        Message::new(ALICE, to, nonce, U256::from(value), U256::from(fee), true)
    }

    fn balance(state: &StateDb<MemoryStorage>, address: &Address) -> u64 {
        state.balance(address).unwrap().as_u64()
    }

    #[test]
    fn test_transfer_round_trip() {
        let mut state = state_with(&[(ALICE, 100)]);
        let result = apply_message(&mut state, &ctx(), &send(0, Some(BOB), 30, 5)).unwrap();

        assert!(!result.failed());
        assert_eq!(result.fee, U256::from(5));
        assert_eq!(balance(&state, &ALICE), 65);
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
        assert_eq!(balance(&state, &BOB), 30);
        assert_eq!(balance(&state, &MINER), 5);
    }

    #[test]
    fn test_nonce_increases_by_one_per_message() {
        let mut state = state_with(&[(ALICE, 100)]);
        for nonce in 0..5 {
            apply_message(&mut state, &ctx(), &send(nonce, Some(BOB), 1, 1)).unwrap();
            assert_eq!(state.nonce(&ALICE).unwrap(), nonce + 1);
        }
        assert_eq!(balance(&state, &ALICE), 90);
    }

    #[test]
    fn test_nonce_mismatch_leaves_state_untouched() {
        let mut state = state_with(&[(ALICE, 100)]);
        state.set_nonce(&ALICE, 3).unwrap();

        let err = apply_message(&mut state, &ctx(), &send(4, Some(BOB), 1, 1)).unwrap_err();
        assert!(matches!(err, LedgerError::NonceTooHigh { state: 3, message: 4, .. }));
        assert!(err.is_validation());

        let err = apply_message(&mut state, &ctx(), &send(2, Some(BOB), 1, 1)).unwrap_err();
        assert!(matches!(err, LedgerError::NonceTooLow { state: 3, message: 2, .. }));

        assert_eq!(balance(&state, &ALICE), 100);
        assert_eq!(state.nonce(&ALICE).unwrap(), 3);
        assert!(!state.exists(&BOB).unwrap());
        assert!(!state.exists(&MINER).unwrap());
    }

    #[test]
    fn test_unchecked_nonce_is_accepted() {
        let mut state = state_with(&[(ALICE, 100)]);
        let mut msg = send(9, Some(BOB), 1, 1);
        msg.check_nonce = false;
        apply_message(&mut state, &ctx(), &msg).unwrap();
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
    }

    #[test]
    fn test_insufficient_fee_balance() {
        let mut state = state_with(&[(ALICE, 4)]);
        let err = apply_message(&mut state, &ctx(), &send(0, Some(BOB), 0, 5)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalanceForFee { .. }));
        assert!(err.is_validation());
        assert_eq!(balance(&state, &ALICE), 4);
        assert_eq!(state.nonce(&ALICE).unwrap(), 0);
    }

    #[test]
    fn test_fee_taken_before_failed_transfer() {
        let mut state = state_with(&[(ALICE, 10)]);
        let err = apply_message(&mut state, &ctx(), &send(0, Some(BOB), 20, 5)).unwrap_err();

        assert!(err.is_consensus_fatal());
        assert!(matches!(
            err,
            LedgerError::InsufficientBalanceForTransfer { balance, value, .. }
                if balance == U256::from(5) && value == U256::from(20)
        ));
        assert_eq!(balance(&state, &ALICE), 5);
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
        assert_eq!(balance(&state, &MINER), 0);
        assert_eq!(balance(&state, &BOB), 0);
    }

    #[test]
    fn test_exact_fee_plus_value_is_accepted() {
        let mut state = state_with(&[(ALICE, 35)]);
        let result = apply_message(&mut state, &ctx(), &send(0, Some(BOB), 30, 5)).unwrap();

        assert!(!result.failed());
        assert_eq!(balance(&state, &ALICE), 0);
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
        assert_eq!(balance(&state, &BOB), 30);
        assert_eq!(balance(&state, &MINER), 5);
    }

    #[test]
    fn test_balance_equal_to_fee_only() {
        let mut state = state_with(&[(ALICE, 5)]);
        let err = apply_message(&mut state, &ctx(), &send(0, Some(BOB), 1, 5)).unwrap_err();

        assert!(matches!(
            err,
            LedgerError::InsufficientBalanceForTransfer { balance, value, .. }
                if balance.is_zero() && value == U256::one()
        ));
        assert_eq!(balance(&state, &ALICE), 0);
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
        assert_eq!(balance(&state, &MINER), 0);
    }

    #[test]
    fn test_failed_transfer_can_be_reverted() {
        let mut state = state_with(&[(ALICE, 10)]);
        let snapshot = state.snapshot();
        assert!(apply_message(&mut state, &ctx(), &send(0, Some(BOB), 20, 5)).is_err());
        state.revert_to_snapshot(snapshot).unwrap();
        assert_eq!(balance(&state, &ALICE), 10);
        assert_eq!(state.nonce(&ALICE).unwrap(), 0);
    }

    #[test]
    fn test_value_without_recipient_is_a_soft_failure() {
        let mut state = state_with(&[(ALICE, 100)]);
        let result = apply_message(&mut state, &ctx(), &send(0, None, 10, 5)).unwrap();

        assert!(result.failed());
        assert!(matches!(result.failure, Some(ExecutionError::MissingRecipient)));
        assert_eq!(balance(&state, &ALICE), 95);
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
        assert_eq!(balance(&state, &MINER), 5);
    }

    #[test]
    fn test_data_message_pays_fee_only() {
        let mut state = state_with(&[(ALICE, 100)]);
        let result = apply_message(&mut state, &ctx(), &send(0, None, 0, 7)).unwrap();
        assert!(!result.failed());
        assert_eq!(balance(&state, &ALICE), 93);
        assert_eq!(balance(&state, &MINER), 7);
    }

    #[test]
    fn test_recipient_overflow_is_a_soft_failure() {
        let mut state = state_with(&[(ALICE, 100)]);
        state.set_balance(&BOB, U256::MAX).unwrap();
        let result = apply_message(&mut state, &ctx(), &send(0, Some(BOB), 1, 5)).unwrap();
        assert!(matches!(result.failure, Some(ExecutionError::RecipientOverflow)));
        assert_eq!(balance(&state, &ALICE), 95);
        assert_eq!(state.balance(&BOB).unwrap(), U256::MAX);
    }

    #[test]
    fn test_self_transfer_and_self_coinbase() {
        let mut state = state_with(&[(ALICE, 100)]);
        let own_block = BlockContext::new(ALICE, 1);
        apply_message(&mut state, &own_block, &send(0, Some(ALICE), 50, 5)).unwrap();
        assert_eq!(balance(&state, &ALICE), 100);
        assert_eq!(state.nonce(&ALICE).unwrap(), 1);
    }

    #[test]
    fn test_apply_signed_transaction() {
        let signer = Ed25519Signer::new(1);
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let sender = PublicKey::from(key.verifying_key());
        let from = Address::from_public_key(&sender);

        let common = TxCommon::new(1, sender, 0, U256::from(5));
        let tx = Transaction::transfer(common, BOB, U256::from(30));
        let mut state = state_with(&[(from, 100)]);

        let err = apply_transaction(&mut state, &signer, &ctx(), &tx).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransaction(CryptoError::Unsigned)));

        let signed = sign_transaction(&signer, &tx, &key).unwrap();
        apply_transaction(&mut state, &signer, &ctx(), &signed).unwrap();
        assert_eq!(balance(&state, &from), 65);
        assert_eq!(balance(&state, &BOB), 30);
        assert_eq!(balance(&state, &MINER), 5);
    }
}
