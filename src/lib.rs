// src/lib.rs

pub mod types;
pub mod signer;
pub mod storage;
pub mod state;
pub mod ledger;
pub mod ordering;
pub mod consensus;
pub mod runtime;
pub mod config;
