// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Durable association records for hosts that do not issue their own ids.

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One stored association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationRecord {
    pub id: u32,
    pub address: String,
    pub observing_presence: bool,
    pub associated_at: DateTime<Local>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: u32,
    associations: BTreeMap<u32, AssociationRecord>,
}

/// JSON-backed association table with monotonically issued ids.
pub struct AssociationStore {
    path: PathBuf,
    file: StoreFile,
}

impl AssociationStore {
    /// Create or open the store.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("associations.json");
        let file = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            StoreFile {
                next_id: 1,
                ..Default::default()
            }
        };

        Ok(Self { path, file })
    }

    /// Associate `address`, reusing the existing id if already present.
    pub fn insert(&mut self, address: &str) -> Result<u32> {
        if let Some(existing) = self.get_by_address(address) {
            return Ok(existing.id);
        }

        let id = self.file.next_id.max(1);
        self.file.next_id = id + 1;
        self.file.associations.insert(
            id,
            AssociationRecord {
                id,
                address: address.to_uppercase(),
                observing_presence: false,
                associated_at: Local::now(),
            },
        );
        self.save()?;
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&AssociationRecord> {
        self.file.associations.get(&id)
    }

    pub fn get_by_address(&self, address: &str) -> Option<&AssociationRecord> {
        self.file
            .associations
            .values()
            .find(|a| a.address.eq_ignore_ascii_case(address))
    }

    /// Remove an association. Returns false if the id was not present.
    pub fn remove(&mut self, id: u32) -> Result<bool> {
        let removed = self.file.associations.remove(&id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Record whether presence is observed for `address`.
    pub fn set_observing(&mut self, address: &str, observing: bool) -> Result<()> {
        let record = self
            .file
            .associations
            .values_mut()
            .find(|a| a.address.eq_ignore_ascii_case(address));
        if let Some(record) = record {
            record.observing_presence = observing;
            self.save()?;
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<AssociationRecord> {
        self.file.associations.values().cloned().collect()
    }

    /// Save to disk.
    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ids_are_unique_and_stable() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = AssociationStore::new(temp_dir.path())?;

        let first = store.insert("AA:BB:CC:DD:EE:FF")?;
        let second = store.insert("11:22:33:44:55:66")?;
        assert_ne!(first, second);
        assert_eq!(store.insert("aa:bb:cc:dd:ee:ff")?, first);

        Ok(())
    }

    #[test]
    fn test_removed_id_is_not_reissued() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let mut store = AssociationStore::new(temp_dir.path())?;

        let first = store.insert("AA:BB:CC:DD:EE:FF")?;
        assert!(store.remove(first)?);
        assert!(!store.remove(first)?);

        let next = store.insert("AA:BB:CC:DD:EE:FF")?;
        assert_ne!(first, next);

        Ok(())
    }

    #[test]
    fn test_reopen_keeps_observation_flag() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let id = {
            let mut store = AssociationStore::new(temp_dir.path())?;
            let id = store.insert("AA:BB:CC:DD:EE:FF")?;
            store.set_observing("aa:bb:cc:dd:ee:ff", true)?;
            id
        };

        let store = AssociationStore::new(temp_dir.path())?;
        let record = store.get(id).unwrap();
        assert_eq!(record.address, "AA:BB:CC:DD:EE:FF");
        assert!(record.observing_presence);
        assert_eq!(store.all().len(), 1);

        Ok(())
    }
}
