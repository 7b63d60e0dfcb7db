use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::{rngs::OsRng, RngCore};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

const PROOF_DOMAIN: &[u8] = b"lingo-vault-proof-v1";

/// Opaque one-shot identifier binding a completion event to a single credit.
///
/// The vault only checks uniqueness. Unpredictability is the caller's job,
/// which is why [`ProofId::random`] mixes fresh OS randomness into the hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProofId([u8; 32]);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProofIdError {
    #[error("proof id is not valid hex")]
    InvalidHex,
    #[error("proof id must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

impl ProofId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Deterministic derivation from a lesson/module label, a millisecond
    /// timestamp and caller-supplied entropy.
    pub fn derive(label: &str, timestamp_ms: u64, entropy: &[u8]) -> Self {
        let mut h = Sha256::new();
        h.update(PROOF_DOMAIN);
        h.update((label.len() as u64).to_le_bytes());
        h.update(label.as_bytes());
        h.update(timestamp_ms.to_le_bytes());
        h.update(entropy);
        Self(h.finalize().into())
    }

    pub fn random(label: &str) -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);
        Self::derive(label, now_ms, &entropy)
    }
}

impl FromStr for ProofId {
    type Err = ProofIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| ProofIdError::InvalidHex)?;
        if bytes.len() != 32 {
            return Err(ProofIdError::InvalidLength(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Display for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ProofId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProofId({self})")
    }
}

impl Serialize for ProofId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProofId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}
