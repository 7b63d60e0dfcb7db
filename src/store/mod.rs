//! Vault persistence.
//!
//! A vault lives in one JSON file:
//! ```json
//! {
//!     "version": 1,
//!     "vault": { "ledger": { ... }, "nonces": { ... } }
//! }
//! ```
//! The ledger snapshot carries its state root; loading recomputes it and
//! refuses files whose balances were edited by hand.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::calls::{CallError, Vault, VaultSnapshot};

const VAULT_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    vault: VaultSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("vault file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported vault file version {0}")]
    UnsupportedVersion(u32),
    #[error("vault file rejected: {0}")]
    Restore(#[from] CallError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes the vault next to `path` and renames it into place, so a crash
/// never leaves a half-written file behind.
pub fn save(path: &Path, vault: &Vault) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let file = VaultFile {
        version: VAULT_FILE_VERSION,
        vault: vault.snapshot(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).map_err(io_err(&tmp))?;
    fs::rename(&tmp, path).map_err(io_err(path))?;
    debug!("vault saved to {}", path.display());
    Ok(())
}

pub fn load(path: &Path) -> Result<Vault, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    let file: VaultFile = serde_json::from_slice(&bytes)?;
    if file.version != VAULT_FILE_VERSION {
        return Err(StoreError::UnsupportedVersion(file.version));
    }
    let vault = Vault::from_snapshot(file.vault)?;
    debug!(
        "vault loaded from {} at height {}",
        path.display(),
        vault.ledger().meta().height
    );
    Ok(vault)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::account::Address;
    use crate::ledger::LedgerError;
    use crate::policy::RewardPolicy;

    const OPERATOR: Address = Address::from_bytes([0xAB; 20]);

    #[test]
    fn save_then_load_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("vault.json");
        let vault = Vault::new(RewardPolicy::default(), OPERATOR).unwrap();
        save(&path, &vault).unwrap();
        assert!(!path.with_extension("tmp").exists());

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.ledger().operator(), OPERATOR);
        assert_eq!(loaded.ledger().state_root(), vault.ledger().state_root());
    }

    #[test]
    fn edited_balance_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let vault = Vault::new(RewardPolicy::default(), OPERATOR).unwrap();
        save(&path, &vault).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        json["vault"]["ledger"]["reserve"] = serde_json::json!(1_000_000);
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        match load(&path).unwrap_err() {
            StoreError::Restore(CallError::Ledger(LedgerError::RootMismatch)) => {}
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn edited_operator_or_constants_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let vault = Vault::new(RewardPolicy::default(), OPERATOR).unwrap();
        save(&path, &vault).unwrap();
        let saved: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();

        let edits: [(&str, serde_json::Value); 5] = [
            ("operator", serde_json::json!(Address::from_bytes([0x01; 20]))),
            ("lesson_cap", serde_json::json!(1_000)),
            ("module_bonus", serde_json::json!(1_000_000)),
            ("xp_divisor", serde_json::json!(1)),
            ("unit", serde_json::json!(2)),
        ];
        for (field, value) in edits {
            let mut json = saved.clone();
            if field == "operator" {
                json["vault"]["ledger"]["operator"] = value;
            } else {
                json["vault"]["ledger"]["policy"][field] = value;
            }
            fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

            match load(&path).unwrap_err() {
                StoreError::Restore(CallError::Ledger(LedgerError::RootMismatch)) => {}
                other => panic!("edit of {field} gave unexpected error {other}"),
            }
        }
    }

    #[test]
    fn unknown_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let vault = Vault::new(RewardPolicy::default(), OPERATOR).unwrap();
        save(&path, &vault).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        json["version"] = serde_json::json!(7);
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        assert!(matches!(
            load(&path),
            Err(StoreError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn wei_scale_amounts_survive_reload() {
        use crate::calls::{SignedCall, VaultCall};
        use crate::policy::WEI_PER_TOKEN;
        use ed25519_dalek::SigningKey;

        let operator = SigningKey::from_bytes(&[5u8; 32]);
        let operator_addr = Address::from_public_key(&operator.verifying_key().to_bytes());
        let mut vault = Vault::new(RewardPolicy::scaled(WEI_PER_TOKEN), operator_addr).unwrap();
        let amount = 1_000 * WEI_PER_TOKEN;
        assert!(amount > u64::MAX as u128);
        let deposit = SignedCall::sign(&operator, VaultCall::Deposit { amount }, 0).unwrap();
        vault.execute(&deposit, 1).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        save(&path, &vault).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.ledger().reserve(), amount);
        assert_eq!(loaded.ledger().events(), vault.ledger().events());
        assert_eq!(loaded.next_nonce(&operator_addr), 1);
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        match load(&path) {
            Err(StoreError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
