//! Reward vault for gamified language lessons.
//!
//! The crate models the on-chain side of a lesson app: learners report
//! completed lessons and modules together with a one-shot proof id, the
//! vault converts experience into a capped token credit, and learners
//! withdraw that credit against the vault's own reserve.
//!
//! * [`ledger`] — the accrual state machine: learners, proof registry,
//!   reserve, wallets, event log and state root.
//! * [`policy`] — reward constants and the capped XP conversion.
//! * [`calls`] — signed call envelopes, per-sender nonces and dispatch.
//! * [`proof`] — 32-byte proof ids and their client-side derivation.
//! * [`account`] — 20-byte addresses derived from Ed25519 keys.
//! * [`store`] — versioned JSON persistence of a vault.

pub mod account;
pub mod calls;
pub mod ledger;
pub mod policy;
pub mod proof;
pub mod store;

pub use account::Address;
pub use calls::{CallError, CallOutcome, SignedCall, Vault, VaultCall};
pub use ledger::{LearnerView, LedgerError, RewardLedger};
pub use policy::RewardPolicy;
pub use proof::ProofId;
