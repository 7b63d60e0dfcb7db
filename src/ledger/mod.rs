use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::account::Address;
use crate::policy::{PolicyError, RewardPolicy};
use crate::proof::ProofId;

pub type Amount = u128;
pub type Xp = u128;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("proof {proof_id} was already consumed")]
    Replay { proof_id: ProofId },
    #[error("amount must be > 0")]
    InvalidAmount,
    #[error("learner {learner} has {available} claimable, requested {requested}")]
    InsufficientClaimable {
        learner: Address,
        requested: Amount,
        available: Amount,
    },
    #[error("reserve holds {available}, requested {requested}")]
    InsufficientReserve { requested: Amount, available: Amount },
    #[error("insufficient funds in wallet {account}")]
    InsufficientFunds { account: Address },
    #[error("arithmetic overflow")]
    Overflow,
    #[error("invalid reward policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("snapshot state root does not match its contents")]
    RootMismatch,
}

/// Per-learner accrual record. Created zero-valued on first accrual.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LearnerRecord {
    pub xp: Xp,
    pub claimable: Amount,
    pub accrued: Amount,
    pub withdrawn: Amount,
}

/// What `learners(address)` returns.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LearnerView {
    pub xp: Xp,
    pub claimable: Amount,
}

impl From<&LearnerRecord> for LearnerView {
    fn from(record: &LearnerRecord) -> Self {
        Self {
            xp: record.xp,
            claimable: record.claimable,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: u64,
    pub last_proof: Option<ProofId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    LessonSubmitted {
        learner: Address,
        xp: Xp,
        reward: Amount,
    },
    ModuleSubmitted {
        learner: Address,
        reward: Amount,
    },
    RewardClaimed {
        learner: Address,
        amount: Amount,
    },
    ReserveFunded {
        from: Address,
        amount: Amount,
    },
}

impl LedgerEvent {
    pub fn concerns(&self, account: &Address) -> bool {
        match self {
            LedgerEvent::LessonSubmitted { learner, .. }
            | LedgerEvent::ModuleSubmitted { learner, .. }
            | LedgerEvent::RewardClaimed { learner, .. } => learner == account,
            LedgerEvent::ReserveFunded { from, .. } => from == account,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub height: u64,
    pub timestamp: u64,
    pub event: LedgerEvent,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub policy: RewardPolicy,
    pub operator: Address,
    pub reserve: Amount,
    pub learners: BTreeMap<Address, LearnerRecord>,
    pub wallets: BTreeMap<Address, Amount>,
    pub proofs: BTreeSet<ProofId>,
    pub events: Vec<LedgerEntry>,
    #[serde(with = "hex::serde")]
    pub state_root: [u8; 32],
}

/// Append-only accrual ledger.
///
/// Every mutating method checks all of its preconditions before touching
/// state, so an `Err` leaves the ledger exactly as it was.
#[derive(Clone, Debug)]
pub struct RewardLedger {
    policy: RewardPolicy,
    operator: Address,
    meta: SnapshotMetadata,
    reserve: Amount,
    learners: BTreeMap<Address, LearnerRecord>,
    wallets: BTreeMap<Address, Amount>,
    proofs: BTreeSet<ProofId>,
    events: Vec<LedgerEntry>,
}

impl RewardLedger {
    pub fn new(policy: RewardPolicy, operator: Address) -> Result<Self, LedgerError> {
        policy.validate()?;
        Ok(Self {
            policy,
            operator,
            meta: SnapshotMetadata::default(),
            reserve: 0,
            learners: BTreeMap::new(),
            wallets: BTreeMap::new(),
            proofs: BTreeSet::new(),
            events: Vec::new(),
        })
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    pub fn operator(&self) -> Address {
        self.operator
    }

    pub fn meta(&self) -> &SnapshotMetadata {
        &self.meta
    }

    pub fn reserve(&self) -> Amount {
        self.reserve
    }

    pub fn events(&self) -> &[LedgerEntry] {
        &self.events
    }

    pub fn proof_consumed(&self, proof_id: &ProofId) -> bool {
        self.proofs.contains(proof_id)
    }

    pub fn wallet_balance(&self, account: &Address) -> Amount {
        self.wallets.get(account).copied().unwrap_or_default()
    }

    pub fn learner(&self, account: &Address) -> LearnerView {
        self.learners
            .get(account)
            .map(LearnerView::from)
            .unwrap_or_default()
    }

    pub fn learner_record(&self, account: &Address) -> LearnerRecord {
        self.learners.get(account).cloned().unwrap_or_default()
    }

    /// Credit a lesson: consumes `proof_id`, adds `xp_gained` to the learner's
    /// XP and the capped lesson reward to their claimable balance.
    pub fn submit_lesson(
        &mut self,
        learner: Address,
        xp_gained: Xp,
        proof_id: ProofId,
        timestamp: u64,
    ) -> Result<Amount, LedgerError> {
        self.ensure_fresh(&proof_id)?;
        if xp_gained == 0 {
            debug!("lesson from {learner} rejected: zero xp");
            return Err(LedgerError::InvalidAmount);
        }
        let reward = self.policy.lesson_reward(xp_gained);
        let mut record = self.learner_record(&learner);
        record.xp = record.xp.checked_add(xp_gained).ok_or(LedgerError::Overflow)?;
        accrue(&mut record, reward)?;

        self.learners.insert(learner, record);
        self.commit(
            Some(proof_id),
            timestamp,
            LedgerEvent::LessonSubmitted {
                learner,
                xp: xp_gained,
                reward,
            },
        );
        info!("lesson {proof_id} credited to {learner}: xp={xp_gained} reward={reward}");
        Ok(reward)
    }

    /// Credit a module completion bonus. Shares the proof registry with
    /// lessons.
    pub fn submit_module(
        &mut self,
        learner: Address,
        proof_id: ProofId,
        timestamp: u64,
    ) -> Result<Amount, LedgerError> {
        self.ensure_fresh(&proof_id)?;
        let reward = self.policy.module_bonus;
        let mut record = self.learner_record(&learner);
        accrue(&mut record, reward)?;

        self.learners.insert(learner, record);
        self.commit(
            Some(proof_id),
            timestamp,
            LedgerEvent::ModuleSubmitted { learner, reward },
        );
        info!("module {proof_id} credited to {learner}: reward={reward}");
        Ok(reward)
    }

    /// Partial withdrawal of `amount` from the learner's claimable balance
    /// into their wallet, paid out of the reserve.
    pub fn claim(
        &mut self,
        learner: Address,
        amount: Amount,
        timestamp: u64,
    ) -> Result<Amount, LedgerError> {
        if amount == 0 {
            debug!("claim from {learner} rejected: zero amount");
            return Err(LedgerError::InvalidAmount);
        }
        let mut record = self.learner_record(&learner);
        if amount > record.claimable {
            debug!(
                "claim from {learner} rejected: {amount} > claimable {}",
                record.claimable
            );
            return Err(LedgerError::InsufficientClaimable {
                learner,
                requested: amount,
                available: record.claimable,
            });
        }
        if amount > self.reserve {
            debug!(
                "claim from {learner} rejected: {amount} > reserve {}",
                self.reserve
            );
            return Err(LedgerError::InsufficientReserve {
                requested: amount,
                available: self.reserve,
            });
        }
        let wallet = self
            .wallet_balance(&learner)
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        let withdrawn = record
            .withdrawn
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;

        record.claimable -= amount;
        record.withdrawn = withdrawn;
        self.learners.insert(learner, record);
        self.reserve -= amount;
        self.wallets.insert(learner, wallet);
        self.commit(
            None,
            timestamp,
            LedgerEvent::RewardClaimed { learner, amount },
        );
        info!("{learner} claimed {amount}, reserve now {}", self.reserve);
        Ok(amount)
    }

    /// Withdraw the whole claimable balance. All-or-nothing: a reserve that
    /// cannot cover the full balance fails the call instead of truncating.
    pub fn claim_all(&mut self, learner: Address, timestamp: u64) -> Result<Amount, LedgerError> {
        let claimable = self.learner(&learner).claimable;
        if claimable > self.reserve {
            debug!(
                "claim_all from {learner} rejected: claimable {claimable} > reserve {}",
                self.reserve
            );
            return Err(LedgerError::InsufficientReserve {
                requested: claimable,
                available: self.reserve,
            });
        }
        self.claim(learner, claimable, timestamp)
    }

    /// Deposit into the reserve. The operator mints; anyone else pays from
    /// their wallet.
    pub fn fund(
        &mut self,
        from: Address,
        amount: Amount,
        timestamp: u64,
    ) -> Result<Amount, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let reserve = self
            .reserve
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        if from != self.operator {
            let balance = self.wallet_balance(&from);
            if balance < amount {
                debug!("fund from {from} rejected: wallet holds {balance}");
                return Err(LedgerError::InsufficientFunds { account: from });
            }
            self.wallets.insert(from, balance - amount);
        }
        self.reserve = reserve;
        self.commit(None, timestamp, LedgerEvent::ReserveFunded { from, amount });
        info!("reserve funded by {from}: +{amount} -> {}", self.reserve);
        Ok(reserve)
    }

    pub fn state_root(&self) -> [u8; 32] {
        compute_state_root(
            &self.policy,
            self.operator,
            self.reserve,
            &self.learners,
            &self.wallets,
            &self.proofs,
        )
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            policy: self.policy.clone(),
            operator: self.operator,
            reserve: self.reserve,
            learners: self.learners.clone(),
            wallets: self.wallets.clone(),
            proofs: self.proofs.clone(),
            events: self.events.clone(),
            state_root: self.state_root(),
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        snapshot.policy.validate()?;
        let root = compute_state_root(
            &snapshot.policy,
            snapshot.operator,
            snapshot.reserve,
            &snapshot.learners,
            &snapshot.wallets,
            &snapshot.proofs,
        );
        if root != snapshot.state_root {
            return Err(LedgerError::RootMismatch);
        }
        Ok(Self {
            policy: snapshot.policy,
            operator: snapshot.operator,
            meta: snapshot.meta,
            reserve: snapshot.reserve,
            learners: snapshot.learners,
            wallets: snapshot.wallets,
            proofs: snapshot.proofs,
            events: snapshot.events,
        })
    }

    fn ensure_fresh(&self, proof_id: &ProofId) -> Result<(), LedgerError> {
        if self.proofs.contains(proof_id) {
            debug!("proof {proof_id} rejected: replay");
            return Err(LedgerError::Replay {
                proof_id: *proof_id,
            });
        }
        Ok(())
    }

    fn commit(&mut self, proof: Option<ProofId>, timestamp: u64, event: LedgerEvent) {
        if let Some(proof_id) = proof {
            self.proofs.insert(proof_id);
            self.meta.last_proof = Some(proof_id);
        }
        self.meta.height += 1;
        self.meta.timestamp = timestamp;
        self.events.push(LedgerEntry {
            height: self.meta.height,
            timestamp,
            event,
        });
    }
}

fn accrue(record: &mut LearnerRecord, reward: Amount) -> Result<(), LedgerError> {
    let claimable = record
        .claimable
        .checked_add(reward)
        .ok_or(LedgerError::Overflow)?;
    let accrued = record
        .accrued
        .checked_add(reward)
        .ok_or(LedgerError::Overflow)?;
    record.claimable = claimable;
    record.accrued = accrued;
    Ok(())
}

fn compute_state_root(
    policy: &RewardPolicy,
    operator: Address,
    reserve: Amount,
    learners: &BTreeMap<Address, LearnerRecord>,
    wallets: &BTreeMap<Address, Amount>,
    proofs: &BTreeSet<ProofId>,
) -> [u8; 32] {
    let mut leaves: Vec<[u8; 32]> = Vec::new();
    let mut hasher = Sha256::new();
    hasher.update(b"policy");
    hasher.update(policy.xp_divisor.to_le_bytes());
    hasher.update(policy.lesson_cap.to_le_bytes());
    hasher.update(policy.module_bonus.to_le_bytes());
    hasher.update(policy.unit.to_le_bytes());
    hasher.update(operator.as_bytes());
    leaves.push(hasher.finalize().into());
    let mut hasher = Sha256::new();
    hasher.update(b"reserve");
    hasher.update(reserve.to_le_bytes());
    leaves.push(hasher.finalize().into());
    for (account, record) in learners {
        let mut hasher = Sha256::new();
        hasher.update(b"learner");
        hasher.update(account.as_bytes());
        hasher.update(record.xp.to_le_bytes());
        hasher.update(record.claimable.to_le_bytes());
        hasher.update(record.accrued.to_le_bytes());
        hasher.update(record.withdrawn.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for (account, balance) in wallets {
        let mut hasher = Sha256::new();
        hasher.update(b"wallet");
        hasher.update(account.as_bytes());
        hasher.update(balance.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    for proof in proofs {
        let mut hasher = Sha256::new();
        hasher.update(b"proof");
        hasher.update(proof.as_bytes());
        leaves.push(hasher.finalize().into());
    }
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"lingo-vault-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}
