//! Known installations and how far each one has been imported.
//!
//! The registry is kept in memory and mirrored to a JSON file. Every change is
//! written to disk (temp file + rename) before the in-memory copy is swapped,
//! so a failed write leaves both unchanged.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use consumption_client::domain::Installation;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;

use crate::gap;
use crate::provider::Contract;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("registry io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registry file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown installation {0}")]
    NotFound(String),
    /// Registry and statistics store disagree. Reported, never fatal.
    #[error("registry and statistics store disagree for {installation_id}: {detail}")]
    Inconsistent {
        installation_id: String,
        detail: String,
    },
}

/// Result of [`InstallationRegistry::advance_last_import`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Advanced,
    Unchanged,
}

#[derive(Serialize, Deserialize, Default)]
struct RegistryFile {
    installations: Vec<Installation>,
}

type Installations = BTreeMap<String, Installation>;

pub struct InstallationRegistry {
    path: Option<PathBuf>,
    installations: Mutex<Installations>,
}

impl InstallationRegistry {
    /// Registry without a backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            installations: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the registry from `path`; a missing file is an empty registry.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let installations = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let file: RegistryFile = serde_json::from_str(&contents)?;
                file.installations
                    .into_iter()
                    .map(|i| (i.id.clone(), i))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "registry file not found, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(path = %path.display(), count = installations.len(), "loaded installation registry");

        Ok(Self {
            path: Some(path),
            installations: Mutex::new(installations),
        })
    }

    /// Keep the loaded state but stop writing changes to disk.
    pub fn into_in_memory(self) -> Self {
        Self { path: None, ..self }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, id: &str) -> Option<Installation> {
        self.installations.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Installation> {
        self.installations.lock().await.values().cloned().collect()
    }

    /// Whether `id` has been imported up to its move-out date. `None` if unknown.
    pub async fn is_caught_up(&self, id: &str) -> Option<bool> {
        self.installations.lock().await.get(id).map(gap::is_caught_up)
    }

    /// Create an installation or update its move-out date.
    ///
    /// The contract start of an existing installation is never changed.
    pub async fn upsert(
        &self,
        id: &str,
        contract_start: Date,
        move_out_date: Option<Date>,
    ) -> Result<Installation, RegistryError> {
        let mut guard = self.installations.lock().await;
        let mut next = guard.clone();
        let changed = upsert_into(&mut next, id, contract_start, move_out_date);
        let inst = next
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        if changed {
            self.persist(&next).await?;
            *guard = next;
        }
        Ok(inst)
    }

    /// Move `last_import_end` forward to `new_end`.
    ///
    /// Moving backwards, or before the contract start, is a no-op. The value
    /// never passes the move-out date.
    pub async fn advance_last_import(
        &self,
        id: &str,
        new_end: Date,
        at: OffsetDateTime,
    ) -> Result<Advance, RegistryError> {
        let mut guard = self.installations.lock().await;
        let current = guard
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let new_end = match current.move_out_date {
            Some(move_out) => new_end.min(move_out),
            None => new_end,
        };
        if new_end < current.contract_start || current.last_import_end.is_some_and(|end| new_end <= end) {
            return Ok(Advance::Unchanged);
        }

        let mut next = guard.clone();
        if let Some(inst) = next.get_mut(id) {
            inst.last_import_end = Some(new_end);
            inst.last_success_at = Some(at);
        }
        self.persist(&next).await?;
        *guard = next;
        Ok(Advance::Advanced)
    }

    pub async fn remove(&self, id: &str) -> Result<Option<Installation>, RegistryError> {
        let mut guard = self.installations.lock().await;
        if !guard.contains_key(id) {
            return Ok(None);
        }
        let mut next = guard.clone();
        let removed = next.remove(id);
        self.persist(&next).await?;
        *guard = next;
        Ok(removed)
    }

    /// Upsert every discovered contract in one write. Installations the
    /// portal no longer lists are kept. Returns how many were added.
    pub async fn sync_from_discovery(&self, contracts: &[Contract]) -> Result<usize, RegistryError> {
        let mut guard = self.installations.lock().await;
        let mut next = guard.clone();
        let before = next.len();
        let mut changed = false;
        for c in contracts {
            changed |= upsert_into(&mut next, &c.installation_id, c.move_in, c.move_out);
        }
        let added = next.len() - before;
        if changed {
            self.persist(&next).await?;
            *guard = next;
        }
        tracing::info!(discovered = contracts.len(), added, "synced installations from provider");
        Ok(added)
    }

    async fn persist(&self, installations: &Installations) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = RegistryFile {
            installations: installations.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

/// Returns whether anything changed.
fn upsert_into(
    installations: &mut Installations,
    id: &str,
    contract_start: Date,
    move_out_date: Option<Date>,
) -> bool {
    match installations.get_mut(id) {
        Some(existing) => {
            if existing.contract_start != contract_start {
                tracing::warn!(
                    installation_id = id,
                    stored = %existing.contract_start,
                    offered = %contract_start,
                    "ignoring contract start change for known installation"
                );
            }
            if existing.move_out_date == move_out_date {
                return false;
            }
            existing.move_out_date = move_out_date;
            true
        }
        None => {
            installations.insert(
                id.to_string(),
                Installation::new(id, contract_start, move_out_date),
            );
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    const AT: OffsetDateTime = datetime!(2023-01-10 08:00 UTC);

    #[tokio::test]
    async fn upsert_creates_then_keeps_contract_start() {
        let reg = InstallationRegistry::in_memory();
        reg.upsert("1", date!(2023 - 01 - 01), None).await.unwrap();
        let inst = reg
            .upsert("1", date!(2022 - 01 - 01), Some(date!(2023 - 06 - 01)))
            .await
            .unwrap();

        assert_eq!(inst.contract_start, date!(2023 - 01 - 01));
        assert_eq!(inst.move_out_date, Some(date!(2023 - 06 - 01)));
        assert_eq!(reg.list().await.len(), 1);
    }

    #[tokio::test]
    async fn advance_is_monotonic() {
        let reg = InstallationRegistry::in_memory();
        reg.upsert("1", date!(2023 - 01 - 01), None).await.unwrap();

        let a = reg.advance_last_import("1", date!(2023 - 01 - 05), AT).await.unwrap();
        let b = reg.advance_last_import("1", date!(2023 - 01 - 03), AT).await.unwrap();
        let c = reg.advance_last_import("1", date!(2023 - 01 - 05), AT).await.unwrap();

        assert_eq!((a, b, c), (Advance::Advanced, Advance::Unchanged, Advance::Unchanged));
        let inst = reg.get("1").await.unwrap();
        assert_eq!(inst.last_import_end, Some(date!(2023 - 01 - 05)));
        assert_eq!(inst.last_success_at, Some(AT));
    }

    #[tokio::test]
    async fn advance_before_contract_start_is_ignored() {
        let reg = InstallationRegistry::in_memory();
        reg.upsert("1", date!(2023 - 01 - 01), None).await.unwrap();
        let res = reg.advance_last_import("1", date!(2022 - 12 - 31), AT).await.unwrap();
        assert_eq!(res, Advance::Unchanged);
        assert_eq!(reg.get("1").await.unwrap().last_import_end, None);
    }

    #[tokio::test]
    async fn advance_never_passes_move_out() {
        let reg = InstallationRegistry::in_memory();
        reg.upsert("1", date!(2023 - 01 - 01), Some(date!(2023 - 06 - 01)))
            .await
            .unwrap();
        reg.advance_last_import("1", date!(2023 - 07 - 01), AT).await.unwrap();
        assert_eq!(reg.get("1").await.unwrap().last_import_end, Some(date!(2023 - 06 - 01)));
        assert_eq!(reg.is_caught_up("1").await, Some(true));
    }

    #[tokio::test]
    async fn advance_unknown_installation_fails() {
        let reg = InstallationRegistry::in_memory();
        let res = reg.advance_last_import("nope", date!(2023 - 01 - 01), AT).await;
        assert!(matches!(res, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("registry.json");

        let reg = InstallationRegistry::open(&path).await.unwrap();
        reg.upsert("1", date!(2023 - 01 - 01), None).await.unwrap();
        reg.upsert("2", date!(2023 - 02 - 01), None).await.unwrap();
        reg.advance_last_import("1", date!(2023 - 01 - 09), AT).await.unwrap();
        reg.remove("2").await.unwrap();
        drop(reg);

        let reopened = InstallationRegistry::open(&path).await.unwrap();
        let all = reopened.list().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_import_end, Some(date!(2023 - 01 - 09)));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, "{not json").unwrap();

        let res = InstallationRegistry::open(&path).await;
        assert!(matches!(res, Err(RegistryError::Json(_))));
    }

    #[tokio::test]
    async fn discovery_adds_new_and_keeps_unlisted() {
        let reg = InstallationRegistry::in_memory();
        reg.upsert("old", date!(2020 - 01 - 01), None).await.unwrap();

        let contracts = vec![
            Contract {
                installation_id: "old".to_string(),
                move_in: date!(2020 - 01 - 01),
                move_out: Some(date!(2023 - 01 - 01)),
            },
            Contract {
                installation_id: "new".to_string(),
                move_in: date!(2023 - 01 - 01),
                move_out: None,
            },
        ];
        let added = reg.sync_from_discovery(&contracts).await.unwrap();

        assert_eq!(added, 1);
        assert_eq!(reg.list().await.len(), 2);
        assert_eq!(reg.get("old").await.unwrap().move_out_date, Some(date!(2023 - 01 - 01)));
    }
}
