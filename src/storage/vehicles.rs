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

//! Registry of known vehicles.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Storage key of the serialized vehicle list.
pub const VEHICLES_KEY: &str = "vehicles";

/// Optional vehicle features that gate commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    TrunkUnlock,
    EngineStart,
}

/// A known vehicle, keyed by hardware address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub name: String,
    pub mac_address: String,
    pub association_id: u32,
    /// Shared secret for higher-level commands. Opaque here.
    pub pin: String,
    #[serde(default)]
    pub has_trunk_unlock: bool,
    #[serde(default)]
    pub has_engine_start: bool,
}

impl Vehicle {
    pub fn matches_address(&self, address: &str) -> bool {
        self.mac_address.eq_ignore_ascii_case(address)
    }
}

/// Persisted vehicle list, at most one entry per address.
pub struct VehicleRegistry {
    path: PathBuf,
    vehicles: Mutex<Vec<Vehicle>>,
}

impl VehicleRegistry {
    /// Open the registry stored in `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("{}.json", VEHICLES_KEY));
        let vehicles = Self::read(&path);
        info!("Vehicle registry loaded: {} vehicle(s)", vehicles.len());

        Ok(Self {
            path,
            vehicles: Mutex::new(vehicles),
        })
    }

    /// Missing or unparseable data reads as an empty list.
    fn read(path: &Path) -> Vec<Vehicle> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str(&content) {
            Ok(vehicles) => vehicles,
            Err(e) => {
                warn!("Ignoring corrupt vehicle registry {:?}: {}", path, e);
                Vec::new()
            }
        }
    }

    /// All known vehicles.
    pub fn list(&self) -> Vec<Vehicle> {
        self.vehicles.lock().clone()
    }

    /// Case-insensitive lookup by hardware address.
    pub fn find_by_address(&self, address: &str) -> Option<Vehicle> {
        self.vehicles
            .lock()
            .iter()
            .find(|v| v.matches_address(address))
            .cloned()
    }

    /// Insert a vehicle, replacing any entry with the same address.
    pub fn upsert(&self, vehicle: Vehicle) -> Result<()> {
        let mut vehicles = self.vehicles.lock();
        match vehicles.iter_mut().find(|v| v.matches_address(&vehicle.mac_address)) {
            Some(existing) => *existing = vehicle,
            None => vehicles.push(vehicle),
        }
        self.save(&vehicles)
    }

    /// Update capability flags. Returns false if the address is unknown.
    pub fn update_capabilities(
        &self,
        address: &str,
        has_trunk_unlock: bool,
        has_engine_start: bool,
    ) -> Result<bool> {
        let mut vehicles = self.vehicles.lock();
        let Some(vehicle) = vehicles.iter_mut().find(|v| v.matches_address(address)) else {
            return Ok(false);
        };
        vehicle.has_trunk_unlock = has_trunk_unlock;
        vehicle.has_engine_start = has_engine_start;
        self.save(&vehicles)?;
        Ok(true)
    }

    /// Toggle one capability, keeping the other as stored.
    /// Returns false if the address is unknown.
    pub fn set_capability(&self, address: &str, capability: Capability, enabled: bool) -> Result<bool> {
        let Some(vehicle) = self.find_by_address(address) else {
            return Ok(false);
        };
        let (trunk, engine) = match capability {
            Capability::TrunkUnlock => (enabled, vehicle.has_engine_start),
            Capability::EngineStart => (vehicle.has_trunk_unlock, enabled),
        };
        self.update_capabilities(address, trunk, engine)
    }

    /// The vehicle an action applies to: the connected one, or the only
    /// registered vehicle when nothing is connected.
    pub fn target(&self, connected: Option<&str>) -> Option<Vehicle> {
        if let Some(address) = connected {
            return self.find_by_address(address);
        }
        let vehicles = self.vehicles.lock();
        match vehicles.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    /// Remove a vehicle. Returns the removed record, if any.
    pub fn remove(&self, address: &str) -> Result<Option<Vehicle>> {
        let mut vehicles = self.vehicles.lock();
        let Some(pos) = vehicles.iter().position(|v| v.matches_address(address)) else {
            return Ok(None);
        };
        let removed = vehicles.remove(pos);
        self.save(&vehicles)?;
        Ok(Some(removed))
    }

    /// Save to disk.
    fn save(&self, vehicles: &[Vehicle]) -> Result<()> {
        let content = serde_json::to_string_pretty(vehicles)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vehicle(name: &str, mac: &str) -> Vehicle {
        Vehicle {
            name: name.to_string(),
            mac_address: mac.to_string(),
            association_id: 1,
            pin: "abc123".to_string(),
            has_trunk_unlock: false,
            has_engine_start: false,
        }
    }

    #[test]
    fn test_empty_when_missing() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        assert!(registry.list().is_empty());
        Ok(())
    }

    #[test]
    fn test_corrupt_data_reads_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(temp_dir.path().join("vehicles.json"), "{not json")?;

        let registry = VehicleRegistry::open(temp_dir.path())?;
        assert!(registry.list().is_empty());
        assert!(registry.find_by_address("AA:BB:CC:DD:EE:FF").is_none());
        Ok(())
    }

    #[test]
    fn test_find_is_case_insensitive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        registry.upsert(vehicle("Golf", "AA:BB:CC:DD:EE:FF"))?;

        let found = registry.find_by_address("aa:bb:cc:dd:ee:ff");
        assert_eq!(found.map(|v| v.name), Some("Golf".to_string()));
        Ok(())
    }

    #[test]
    fn test_upsert_keeps_one_per_address() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        registry.upsert(vehicle("Golf", "AA:BB:CC:DD:EE:FF"))?;
        registry.upsert(vehicle("Polo", "aa:bb:cc:dd:ee:ff"))?;

        let vehicles = registry.list();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].name, "Polo");
        Ok(())
    }

    #[test]
    fn test_persists_camel_case_list() -> Result<()> {
        let temp_dir = TempDir::new()?;
        {
            let registry = VehicleRegistry::open(temp_dir.path())?;
            registry.upsert(vehicle("Golf", "AA:BB:CC:DD:EE:FF"))?;
            assert!(registry.update_capabilities("AA:BB:CC:DD:EE:FF", true, false)?);
        }

        let raw = std::fs::read_to_string(temp_dir.path().join("vehicles.json"))?;
        assert!(raw.contains("\"macAddress\""));
        assert!(raw.contains("\"hasTrunkUnlock\": true"));

        let registry = VehicleRegistry::open(temp_dir.path())?;
        let golf = registry.find_by_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(golf.has_trunk_unlock);
        assert!(!golf.has_engine_start);
        Ok(())
    }

    #[test]
    fn test_remove_and_unknown_updates() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        registry.upsert(vehicle("Golf", "AA:BB:CC:DD:EE:FF"))?;

        assert!(!registry.update_capabilities("11:22:33:44:55:66", true, true)?);
        assert!(registry.remove("11:22:33:44:55:66")?.is_none());
        assert_eq!(
            registry.remove("aa:bb:cc:dd:ee:ff")?.map(|v| v.name),
            Some("Golf".to_string())
        );
        assert!(registry.list().is_empty());
        Ok(())
    }

    #[test]
    fn test_set_capability_keeps_other_flag() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        registry.upsert(vehicle("Golf", "AA:BB:CC:DD:EE:FF"))?;

        assert!(registry.set_capability("aa:bb:cc:dd:ee:ff", Capability::EngineStart, true)?);
        assert!(registry.set_capability("AA:BB:CC:DD:EE:FF", Capability::TrunkUnlock, true)?);
        assert!(registry.set_capability("AA:BB:CC:DD:EE:FF", Capability::EngineStart, false)?);
        assert!(!registry.set_capability("11:22:33:44:55:66", Capability::TrunkUnlock, true)?);

        let golf = VehicleRegistry::open(temp_dir.path())?
            .find_by_address("AA:BB:CC:DD:EE:FF")
            .unwrap();
        assert!(golf.has_trunk_unlock);
        assert!(!golf.has_engine_start);
        Ok(())
    }

    #[test]
    fn test_target_prefers_connected_then_sole_vehicle() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        assert!(registry.target(None).is_none());

        registry.upsert(vehicle("Golf", "AA:BB:CC:DD:EE:FF"))?;
        assert_eq!(registry.target(None).map(|v| v.name), Some("Golf".to_string()));

        registry.upsert(vehicle("Polo", "11:22:33:44:55:66"))?;
        assert!(registry.target(None).is_none());
        assert_eq!(
            registry.target(Some("11:22:33:44:55:66")).map(|v| v.name),
            Some("Polo".to_string())
        );
        assert!(registry.target(Some("00:00:00:00:00:01")).is_none());
        Ok(())
    }
}
