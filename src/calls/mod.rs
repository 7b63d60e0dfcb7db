use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::account::Address;
use crate::ledger::{Amount, LearnerView, LedgerError, LedgerSnapshot, RewardLedger, Xp};
use crate::policy::RewardPolicy;
use crate::proof::ProofId;

const CALL_DOMAIN: &[u8] = b"lingo-vault-call-v1";

/// Call surface of the vault. The learner is always the call's signer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VaultCall {
    SubmitLesson { xp_gained: Xp, proof_id: ProofId },
    SubmitModule { proof_id: ProofId },
    Claim { amount: Amount },
    ClaimAll,
    Deposit { amount: Amount },
}

impl VaultCall {
    pub fn commitment(&self) -> Result<Vec<u8>, CallError> {
        serde_json::to_vec(self).map_err(CallError::Encode)
    }
}

/// A call bound to its sender by an Ed25519 signature over
/// `SHA-256(domain || nonce || call)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedCall {
    pub call: VaultCall,
    pub nonce: u64,
    #[serde(with = "hex::serde")]
    pub signer_pubkey: [u8; 32],
    #[serde(with = "crate::calls::serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedCall {
    pub fn sign(signing_key: &SigningKey, call: VaultCall, nonce: u64) -> Result<Self, CallError> {
        let digest = call_digest(&call, nonce)?;
        let signature = signing_key.sign(&digest);
        Ok(Self {
            call,
            nonce,
            signer_pubkey: signing_key.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn digest(&self) -> Result<[u8; 32], CallError> {
        call_digest(&self.call, self.nonce)
    }

    pub fn sender(&self) -> Address {
        Address::from_public_key(&self.signer_pubkey)
    }

    /// Checks the signature and returns the sender address.
    pub fn verify(&self) -> Result<Address, CallError> {
        let key = VerifyingKey::from_bytes(&self.signer_pubkey)
            .map_err(|_| CallError::MalformedKey)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| CallError::MalformedSignature)?;
        let digest = self.digest()?;
        key.verify_strict(&digest, &signature)
            .map_err(|_| CallError::BadSignature)?;
        Ok(self.sender())
    }
}

fn call_digest(call: &VaultCall, nonce: u64) -> Result<[u8; 32], CallError> {
    let mut hasher = Sha256::new();
    hasher.update(CALL_DOMAIN);
    hasher.update(nonce.to_le_bytes());
    hasher.update(call.commitment()?);
    Ok(hasher.finalize().into())
}

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("malformed signer public key")]
    MalformedKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not match call")]
    BadSignature,
    #[error("nonce {got} from {sender}, expected {expected}")]
    NonceMismatch {
        sender: Address,
        expected: u64,
        got: u64,
    },
    #[error("call encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    LessonRecorded { reward: Amount },
    ModuleRecorded { reward: Amount },
    Claimed { amount: Amount },
    Deposited { reserve: Amount },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultSnapshot {
    pub ledger: LedgerSnapshot,
    pub nonces: BTreeMap<Address, u64>,
}

/// Ledger plus the per-sender call nonces. Calls run one at a time and
/// either fully apply or leave both the ledger and the nonce untouched.
#[derive(Clone, Debug)]
pub struct Vault {
    ledger: RewardLedger,
    nonces: BTreeMap<Address, u64>,
}

impl Vault {
    pub fn new(policy: RewardPolicy, operator: Address) -> Result<Self, CallError> {
        Ok(Self {
            ledger: RewardLedger::new(policy, operator)?,
            nonces: BTreeMap::new(),
        })
    }

    pub fn ledger(&self) -> &RewardLedger {
        &self.ledger
    }

    pub fn learners(&self, account: &Address) -> LearnerView {
        self.ledger.learner(account)
    }

    pub fn next_nonce(&self, account: &Address) -> u64 {
        self.nonces.get(account).copied().unwrap_or_default()
    }

    pub fn execute(
        &mut self,
        signed: &SignedCall,
        timestamp: u64,
    ) -> Result<CallOutcome, CallError> {
        let sender = signed.verify()?;
        let expected = self.next_nonce(&sender);
        if signed.nonce != expected {
            debug!("call from {sender} rejected: nonce {} != {expected}", signed.nonce);
            return Err(CallError::NonceMismatch {
                sender,
                expected,
                got: signed.nonce,
            });
        }
        let outcome = match &signed.call {
            VaultCall::SubmitLesson {
                xp_gained,
                proof_id,
            } => CallOutcome::LessonRecorded {
                reward: self
                    .ledger
                    .submit_lesson(sender, *xp_gained, *proof_id, timestamp)?,
            },
            VaultCall::SubmitModule { proof_id } => CallOutcome::ModuleRecorded {
                reward: self.ledger.submit_module(sender, *proof_id, timestamp)?,
            },
            VaultCall::Claim { amount } => CallOutcome::Claimed {
                amount: self.ledger.claim(sender, *amount, timestamp)?,
            },
            VaultCall::ClaimAll => CallOutcome::Claimed {
                amount: self.ledger.claim_all(sender, timestamp)?,
            },
            VaultCall::Deposit { amount } => CallOutcome::Deposited {
                reserve: self.ledger.fund(sender, *amount, timestamp)?,
            },
        };
        self.nonces.insert(sender, expected + 1);
        info!("call #{expected} from {sender} applied: {outcome:?}");
        Ok(outcome)
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            ledger: self.ledger.snapshot(),
            nonces: self.nonces.clone(),
        }
    }

    pub fn from_snapshot(snapshot: VaultSnapshot) -> Result<Self, CallError> {
        Ok(Self {
            ledger: RewardLedger::from_snapshot(snapshot.ledger)?,
            nonces: snapshot.nonces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;

    fn keys() -> (SigningKey, SigningKey) {
        let mut rng = OsRng;
        (SigningKey::generate(&mut rng), SigningKey::generate(&mut rng))
    }

    fn address(sk: &SigningKey) -> Address {
        Address::from_public_key(&sk.verifying_key().to_bytes())
    }

    fn vault_with_reserve(operator: &SigningKey, reserve: Amount) -> Vault {
        let mut vault = Vault::new(RewardPolicy::default(), address(operator)).unwrap();
        let deposit = SignedCall::sign(operator, VaultCall::Deposit { amount: reserve }, 0).unwrap();
        vault.execute(&deposit, 1).unwrap();
        vault
    }

    #[test]
    fn signed_calls_credit_the_signer() {
        let (operator, learner) = keys();
        let mut vault = vault_with_reserve(&operator, 100);
        let who = address(&learner);

        let lesson = SignedCall::sign(
            &learner,
            VaultCall::SubmitLesson {
                xp_gained: 250,
                proof_id: ProofId::derive("lesson-1", 5, b"r"),
            },
            0,
        )
        .unwrap();
        assert_eq!(
            vault.execute(&lesson, 5).unwrap(),
            CallOutcome::LessonRecorded { reward: 1 }
        );

        let module = SignedCall::sign(
            &learner,
            VaultCall::SubmitModule {
                proof_id: ProofId::derive("module-1", 6, b"r"),
            },
            1,
        )
        .unwrap();
        vault.execute(&module, 6).unwrap();
        assert_eq!(vault.learners(&who), LearnerView { xp: 250, claimable: 11 });

        let claim = SignedCall::sign(&learner, VaultCall::ClaimAll, 2).unwrap();
        assert_eq!(
            vault.execute(&claim, 7).unwrap(),
            CallOutcome::Claimed { amount: 11 }
        );
        assert_eq!(vault.learners(&who).claimable, 0);
        assert_eq!(vault.ledger().wallet_balance(&who), 11);
        assert_eq!(vault.next_nonce(&who), 3);
    }

    #[test]
    fn replayed_envelope_is_rejected_by_nonce() {
        let (operator, learner) = keys();
        let mut vault = vault_with_reserve(&operator, 100);
        let module = SignedCall::sign(
            &learner,
            VaultCall::SubmitModule {
                proof_id: ProofId::from_bytes([3u8; 32]),
            },
            0,
        )
        .unwrap();
        vault.execute(&module, 2).unwrap();
        match vault.execute(&module, 3).unwrap_err() {
            CallError::NonceMismatch { expected, got, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(got, 0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn rejected_call_keeps_nonce() {
        let (operator, learner) = keys();
        let mut vault = vault_with_reserve(&operator, 100);
        let who = address(&learner);
        let claim = SignedCall::sign(&learner, VaultCall::Claim { amount: 5 }, 0).unwrap();
        assert!(matches!(
            vault.execute(&claim, 2),
            Err(CallError::Ledger(LedgerError::InsufficientClaimable { .. }))
        ));
        assert_eq!(vault.next_nonce(&who), 0);
    }

    #[test]
    fn tampered_call_fails_verification() {
        let (_, learner) = keys();
        let mut signed = SignedCall::sign(&learner, VaultCall::Claim { amount: 1 }, 0).unwrap();
        signed.call = VaultCall::Claim { amount: 1_000 };
        assert!(matches!(signed.verify(), Err(CallError::BadSignature)));

        let mut truncated = SignedCall::sign(&learner, VaultCall::ClaimAll, 0).unwrap();
        truncated.signature.pop();
        assert!(matches!(
            truncated.verify(),
            Err(CallError::MalformedSignature)
        ));
    }

    #[test]
    fn envelope_survives_json() {
        let (_, learner) = keys();
        let signed = SignedCall::sign(
            &learner,
            VaultCall::SubmitLesson {
                xp_gained: 42,
                proof_id: ProofId::from_bytes([9u8; 32]),
            },
            4,
        )
        .unwrap();
        let json = serde_json::to_string(&signed).unwrap();
        assert!(json.contains(r#""call":{"submit_lesson":{"#));
        let back: SignedCall = serde_json::from_str(&json).unwrap();
        assert_eq!(back.verify().unwrap(), address(&learner));
    }

    #[test]
    fn snapshot_round_trip_keeps_nonces() {
        let (operator, _) = keys();
        let vault = vault_with_reserve(&operator, 9);
        let restored = Vault::from_snapshot(vault.snapshot()).unwrap();
        assert_eq!(restored.next_nonce(&address(&operator)), 1);
        assert_eq!(restored.ledger().reserve(), 9);
    }
}

pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}
