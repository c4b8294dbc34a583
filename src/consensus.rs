//! Proof-of-work consensus: seal search and verification.
//!
//! A header is sealed when `pow(seal_hash, nonce)` yields a result that,
//! read as a big-endian integer, is at most `2^256 / difficulty`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::{U256, U512};
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::types::{format_hex, Hash, Header};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Failed to seed the nonce generator: {0}")]
    EntropyUnavailable(#[from] rand::Error),
    #[error("Difficulty must be non-zero")]
    ZeroDifficulty,
    #[error("Invalid mix digest")]
    InvalidMixDigest,
    #[error("Invalid proof-of-work")]
    InvalidProofOfWork,
    #[error("Sealing worker failed: {0}")]
    WorkerFailed(String),
}

/// The proof-of-work function: deterministic, side-effect free.
pub trait PowFunction: Send + Sync + 'static {
    /// Returns `(mix_digest, result)` for `nonce` over the header's seal hash.
    fn compute(&self, seal_hash: &Hash, nonce: u64) -> (Hash, Hash);
}

/// Double SHA-256 proof-of-work.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Pow;

impl PowFunction for Sha256Pow {
    fn compute(&self, seal_hash: &Hash, nonce: u64) -> (Hash, Hash) {
        let mut hasher = Sha256::new();
        hasher.update(seal_hash);
        hasher.update(nonce.to_le_bytes());
        let mix: Hash = hasher.finalize().into();

        let mut hasher = Sha256::new();
        hasher.update(seal_hash);
        hasher.update(mix);
        (mix, hasher.finalize().into())
    }
}

/// `floor(2^256 / difficulty)`.
pub fn target(difficulty: U256) -> Result<U512, ConsensusError> {
    if difficulty.is_zero() {
        return Err(ConsensusError::ZeroDifficulty);
    }
    Ok((U512::one() << 256) / U512::from(difficulty))
}

fn meets_target(result: &Hash, target: &U512) -> bool {
    U512::from_big_endian(result) <= *target
}

/// Checks the sealed `nonce` and `mix_digest` of `header`.
pub fn verify_seal<P: PowFunction + ?Sized>(
    pow: &P,
    header: &Header,
) -> Result<(), ConsensusError> {
    let target = target(header.difficulty)?;
    let (mix, result) = pow.compute(&header.seal_hash(), header.nonce);
    if mix != header.mix_digest {
        return Err(ConsensusError::InvalidMixDigest);
    }
    if !meets_target(&result, &target) {
        return Err(ConsensusError::InvalidProofOfWork);
    }
    Ok(())
}

/// Sealer settings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealerConfig {
    /// Search threads. `None` uses every available core; zero or less
    /// disables local search.
    #[serde(default)]
    pub threads: Option<i64>,
    /// Fixed seed for the start-nonce generator. `None` seeds from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SealerConfig {
    fn worker_count(&self) -> usize {
        match self.threads {
            None => std::thread::available_parallelism().map_or(1, |n| n.get()),
            Some(n) if n <= 0 => 0,
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        }
    }
}

struct SealerState {
    config: SealerConfig,
    rng: Option<StdRng>,
}

enum Outcome {
    Found(Header),
    Stopped,
    Restart,
}

/// Parallel nonce search.
///
/// `seal` must not be called again until the previous call has returned.
pub struct Sealer<P: PowFunction> {
    pow: Arc<P>,
    state: Mutex<SealerState>,
    update: watch::Sender<u64>,
}

impl<P: PowFunction> Sealer<P> {
    pub fn new(pow: P, config: SealerConfig) -> Self {
        let (update, _) = watch::channel(0);
        Sealer {
            pow: Arc::new(pow),
            state: Mutex::new(SealerState { config, rng: None }),
            update,
        }
    }

    pub fn pow(&self) -> &P {
        &self.pow
    }

    pub fn threads(&self) -> Option<i64> {
        self.state.lock().config.threads
    }

    /// Changes the thread count. A running `seal` restarts with the new count.
    pub fn set_threads(&self, threads: Option<i64>) {
        self.state.lock().config.threads = threads;
        self.update.send_modify(|generation| *generation += 1);
    }

    fn prepare(&self) -> Result<Vec<u64>, ConsensusError> {
        let mut state = self.state.lock();
        if state.rng.is_none() {
            let rng = match state.config.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_rng(OsRng)?,
            };
            state.rng = Some(rng);
        }
        let workers = state.config.worker_count();
        let Some(rng) = state.rng.as_mut() else {
            return Ok(Vec::new());
        };
        Ok((0..workers).map(|_| rng.gen::<u64>()).collect())
    }

    /// Searches for a nonce that seals `header`.
    ///
    /// Returns the sealed header, or `None` once `stop` is set. A found
    /// header is also offered to `results` without blocking; if nobody is
    /// reading it is dropped with a warning. All workers have exited when
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns `ConsensusError::EntropyUnavailable` if the start-nonce
    /// generator cannot be seeded, and `ZeroDifficulty` for a header that
    /// has no target.
    pub async fn seal(
        &self,
        header: &Header,
        results: &mpsc::Sender<Header>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<Header>, ConsensusError> {
        let target = target(header.difficulty)?;
        let header = Arc::new(header.clone());
        let seal_hash = header.seal_hash();

        loop {
            let mut updates = self.update.subscribe();

            let seeds = self.prepare()?;
            let abort = Arc::new(AtomicBool::new(false));
            let (found_tx, mut found_rx) = mpsc::channel(seeds.len().max(1));

            let mut workers = Vec::with_capacity(seeds.len());
            for (id, seed) in seeds.into_iter().enumerate() {
                let pow = Arc::clone(&self.pow);
                let header = Arc::clone(&header);
                let abort = Arc::clone(&abort);
                let found = found_tx.clone();
                workers.push(tokio::task::spawn_blocking(move || {
                    mine(pow.as_ref(), &header, target, id, seed, &abort, &found)
                }));
            }
            drop(found_tx);

            let outcome = tokio::select! {
                _ = wait_for_stop(stop) => Outcome::Stopped,
                Some(sealed) = found_rx.recv() => {
                    if results.try_send(sealed.clone()).is_err() {
                        tracing::warn!(
                            sealhash = %format_hex(&seal_hash),
                            "sealing result is not read by miner"
                        );
                    }
                    Outcome::Found(sealed)
                }
                _ = updates.changed() => Outcome::Restart,
            };

            abort.store(true, Ordering::Release);
            let mut failure = None;
            for worker in workers {
                if let Err(err) = worker.await {
                    failure = Some(ConsensusError::WorkerFailed(err.to_string()));
                }
            }

            match (outcome, failure) {
                (Outcome::Found(sealed), _) => return Ok(Some(sealed)),
                (_, Some(err)) => return Err(err),
                (Outcome::Stopped, None) => return Ok(None),
                (Outcome::Restart, None) => {
                    tracing::info!(
                        threads = ?self.threads(),
                        "sealer settings changed, restarting search"
                    );
                }
            }
        }
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Nobody can stop us any more.
            std::future::pending::<()>().await;
        }
    }
}

fn mine<P: PowFunction + ?Sized>(
    pow: &P,
    header: &Header,
    target: U512,
    id: usize,
    seed: u64,
    abort: &AtomicBool,
    found: &mpsc::Sender<Header>,
) {
    let seal_hash = header.seal_hash();
    let mut nonce = seed;
    let mut attempts: u64 = 0;
    tracing::trace!(miner = id, seed, "started nonce search");

    loop {
        if abort.load(Ordering::Acquire) {
            tracing::trace!(miner = id, attempts, "nonce search aborted");
            return;
        }
        let (mix, result) = pow.compute(&seal_hash, nonce);
        if meets_target(&result, &target) {
            let mut sealed = header.clone();
            sealed.nonce = nonce;
            sealed.mix_digest = mix;
            match found.try_send(sealed) {
                Ok(()) => tracing::trace!(miner = id, attempts, nonce, "nonce found and reported"),
                Err(_) => tracing::trace!(miner = id, attempts, nonce, "nonce found but discarded"),
            }
            return;
        }
        nonce = nonce.wrapping_add(1);
        attempts += 1;
    }
}
