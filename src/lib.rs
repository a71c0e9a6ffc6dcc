//! # Consensus-Core
//!
//! Validation core of a hybrid proof-of-work / proof-of-stake node.
//!
//! The crate decides which blocks and transactions are valid, keeps the
//! unspent coin set consistent with the best chain, stores blocks and undo
//! data in flat files, and maintains the memory pool of unconfirmed
//! transactions.
//!
//! ## Architecture
//!
//! - Pure rules: [`transaction`], [`script`], [`locktime`], [`pow`],
//!   [`economic`], [`policy`], [`merkle`]
//! - Block rules and connection: [`block`], [`undo`]
//! - State: [`chain`] (block index and active chain), [`coins`] (layered
//!   coin views), [`mempool`], [`blockfile`], [`storage`]
//! - Orchestration: [`chainstate`] (best-chain activation, reorganization,
//!   flushing) and [`admission`] (memory pool acceptance)
//!
//! ## Design Principles
//!
//! 1. **Rules are functions**: consensus and policy checks take their
//!    inputs explicitly and return a [`Rejection`] on failure
//! 2. **State behind three locks**: chain, then mempool, then files
//! 3. **Exact Version Pinning**: consensus-critical cryptography is pinned
//! 4. **Collaborators as traits**: storage, clock, script verification,
//!    service transactions and notifications are injected
//!
//! ## Usage
//!
//! ```rust
//! use consensus_core::transaction::check_transaction;
//! use consensus_core::types::*;
//!
//! let tx = Transaction {
//!     version: 1,
//!     time: 0,
//!     inputs: vec![TransactionInput {
//!         prevout: OutPoint::new([1; 32], 0),
//!         script_sig: vec![],
//!         sequence: 0xffff_ffff,
//!     }],
//!     outputs: vec![TransactionOutput { value: 1000, script_pubkey: vec![0x51] }],
//!     lock_time: 0,
//!     service_reference_hash: None,
//! };
//! assert!(check_transaction(&tx).is_ok());
//! ```

pub mod admission;
pub mod block;
pub mod blockfile;
pub mod chain;
pub mod chainstate;
pub mod clock;
pub mod coins;
pub mod config;
pub mod constants;
pub mod economic;
pub mod encoding;
pub mod error;
pub mod flush;
pub mod locktime;
pub mod mempool;
pub mod merkle;
pub mod notify;
pub mod policy;
pub mod pow;
pub mod script;
pub mod service;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod undo;

// Re-export commonly used types
pub use admission::{AdmissionOptions, AdmissionOutcome};
pub use chain::{BlockId, BlockIndex};
pub use chainstate::ChainstateManager;
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ChainParams, ValidationConfig};
pub use constants::*;
pub use error::{ConsensusError, Rejection, RejectionKind, Result, ValidationResult};
pub use flush::FlushMode;
pub use types::*;
