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

//! Association management: pairing a vehicle and observing its presence.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bluetooth::SERVICE_UUID;
use crate::error::LinkError;
use crate::storage::{Vehicle, VehicleRegistry};

/// Reachability change of an associated peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Appeared { address: String },
    Disappeared { address: String },
}

/// Host-issued binding of an address to an association id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub id: u32,
    pub address: String,
    pub observing_presence: bool,
}

/// Result of a pairing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationOutcome {
    Created(Association),
    Failed { reason: String },
}

/// Which peripherals the discovery flow offers.
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub service: Uuid,
    pub name_prefix: Option<String>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            name_prefix: None,
        }
    }
}

impl DeviceFilter {
    pub fn accepts(&self, name: Option<&str>) -> bool {
        match (&self.name_prefix, name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// A device offered to the user during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: String,
    pub name: Option<String>,
}

/// What the user picked, with the details stored for the vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub address: String,
    pub vehicle_name: String,
    pub pin: String,
}

/// Host pairing subsystem.
#[async_trait]
pub trait PairingHost: Send + Sync {
    /// Collect candidates matching `filter`.
    async fn discover(&self, filter: &DeviceFilter) -> Result<Vec<Candidate>, LinkError>;

    async fn create_association(&self, address: &str) -> Result<Association, LinkError>;

    /// Fails with [`LinkError::AssociationNotFound`] for an unknown id.
    async fn remove_association(&self, id: u32) -> Result<(), LinkError>;

    async fn start_observing_presence(&self, address: &str) -> Result<(), LinkError>;

    async fn stop_observing_presence(&self, address: &str) -> Result<(), LinkError>;

    async fn associations(&self) -> Result<Vec<Association>, LinkError>;
}

/// User consent step between discovery and association.
#[async_trait]
pub trait SelectionPrompt: Send + Sync {
    /// `None` when the user cancels.
    async fn select(&self, candidates: &[Candidate]) -> Option<Selection>;
}

/// Turns a pairing action into a durable association plus presence
/// observation, and keeps the vehicle registry in step.
pub struct AssociationManager {
    host: Arc<dyn PairingHost>,
    registry: Arc<VehicleRegistry>,
    filter: DeviceFilter,
}

impl AssociationManager {
    pub fn new(
        host: Arc<dyn PairingHost>,
        registry: Arc<VehicleRegistry>,
        filter: DeviceFilter,
    ) -> Self {
        Self {
            host,
            registry,
            filter,
        }
    }

    /// Run the pairing flow. Failures are returned as
    /// [`AssociationOutcome::Failed`], never as errors.
    pub async fn associate(&self, prompt: &dyn SelectionPrompt) -> AssociationOutcome {
        info!("Starting association for service {}", self.filter.service);

        let candidates = match self.host.discover(&self.filter).await {
            Ok(candidates) => candidates,
            Err(e) => return Self::failed(e.to_string()),
        };
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| self.filter.accepts(c.name.as_deref()))
            .collect();
        if candidates.is_empty() {
            return Self::failed("No matching devices found".to_string());
        }

        let Some(selection) = prompt.select(&candidates).await else {
            return Self::failed("Cancelled".to_string());
        };

        let mut association = match self.host.create_association(&selection.address).await {
            Ok(association) => association,
            Err(e) => return Self::failed(e.to_string()),
        };
        info!(
            "Associated {} with id {}",
            association.address, association.id
        );

        match self
            .host
            .start_observing_presence(&association.address)
            .await
        {
            Ok(()) => association.observing_presence = true,
            Err(e) => warn!(
                "Failed to observe presence of {}: {}",
                association.address, e
            ),
        }

        let vehicle = Vehicle {
            name: selection.vehicle_name,
            mac_address: association.address.clone(),
            association_id: association.id,
            pin: selection.pin,
            has_trunk_unlock: false,
            has_engine_start: false,
        };
        if let Err(e) = self.registry.upsert(vehicle) {
            error!("Failed to store vehicle {}: {}", association.address, e);
        }

        AssociationOutcome::Created(association)
    }

    fn failed(reason: String) -> AssociationOutcome {
        warn!("Association failed: {}", reason);
        AssociationOutcome::Failed { reason }
    }

    /// Stop observing `address` and drop association `id`. Removing an
    /// association that is already gone succeeds.
    pub async fn disassociate(&self, id: u32, address: &str) -> Result<()> {
        if let Err(e) = self.host.stop_observing_presence(address).await {
            debug!("Stop observing {}: {}", address, e);
        }

        match self.host.remove_association(id).await {
            Ok(()) => info!("Removed association {}", id),
            Err(LinkError::AssociationNotFound(_)) => {
                debug!("Association {} already removed", id)
            }
            Err(e) => return Err(e.into()),
        }

        if self.registry.remove(address)?.is_some() {
            info!("Removed vehicle {}", address);
        }
        Ok(())
    }

    pub async fn associations(&self) -> Result<Vec<Association>> {
        Ok(self.host.associations().await?)
    }

    /// Re-arm presence observation for every known association.
    pub async fn resume_presence(&self) -> Result<usize> {
        let mut resumed = 0;
        for association in self.host.associations().await? {
            match self
                .host
                .start_observing_presence(&association.address)
                .await
            {
                Ok(()) => resumed += 1,
                Err(e) => warn!(
                    "Failed to resume presence for {}: {}",
                    association.address, e
                ),
            }
        }
        info!("Observing presence of {} vehicle(s)", resumed);
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeHost {
        candidates: Vec<Candidate>,
        fail_pairing: bool,
        next_id: Mutex<u32>,
        associations: Mutex<BTreeMap<u32, Association>>,
        observing: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PairingHost for FakeHost {
        async fn discover(&self, _filter: &DeviceFilter) -> Result<Vec<Candidate>, LinkError> {
            Ok(self.candidates.clone())
        }

        async fn create_association(&self, address: &str) -> Result<Association, LinkError> {
            if self.fail_pairing {
                return Err(LinkError::Host("Authentication Failed".to_string()));
            }
            let mut next_id = self.next_id.lock();
            *next_id += 1;
            let association = Association {
                id: *next_id,
                address: address.to_string(),
                observing_presence: false,
            };
            self.associations
                .lock()
                .insert(association.id, association.clone());
            Ok(association)
        }

        async fn remove_association(&self, id: u32) -> Result<(), LinkError> {
            self.associations
                .lock()
                .remove(&id)
                .map(|_| ())
                .ok_or(LinkError::AssociationNotFound(id))
        }

        async fn start_observing_presence(&self, address: &str) -> Result<(), LinkError> {
            self.observing.lock().push(address.to_string());
            Ok(())
        }

        async fn stop_observing_presence(&self, address: &str) -> Result<(), LinkError> {
            self.observing.lock().retain(|a| a != address);
            Ok(())
        }

        async fn associations(&self) -> Result<Vec<Association>, LinkError> {
            Ok(self.associations.lock().values().cloned().collect())
        }
    }

    struct FirstCandidate;

    #[async_trait]
    impl SelectionPrompt for FirstCandidate {
        async fn select(&self, candidates: &[Candidate]) -> Option<Selection> {
            candidates.first().map(|c| Selection {
                address: c.address.clone(),
                vehicle_name: "Golf".to_string(),
                pin: "1234".to_string(),
            })
        }
    }

    struct Cancel;

    #[async_trait]
    impl SelectionPrompt for Cancel {
        async fn select(&self, _candidates: &[Candidate]) -> Option<Selection> {
            None
        }
    }

    fn candidate(address: &str, name: &str) -> Candidate {
        Candidate {
            address: address.to_string(),
            name: Some(name.to_string()),
        }
    }

    fn manager(host: Arc<FakeHost>, dir: &TempDir, filter: DeviceFilter) -> Result<AssociationManager> {
        let registry = Arc::new(VehicleRegistry::open(dir.path())?);
        Ok(AssociationManager::new(host, registry, filter))
    }

    #[tokio::test]
    async fn test_associate_creates_vehicle_and_observes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let host = Arc::new(FakeHost {
            candidates: vec![candidate("AA:BB:CC:DD:EE:FF", "CarKey")],
            ..Default::default()
        });
        let manager = manager(host.clone(), &temp_dir, DeviceFilter::default())?;

        let outcome = manager.associate(&FirstCandidate).await;
        let AssociationOutcome::Created(association) = outcome else {
            panic!("expected association, got {:?}", outcome);
        };
        assert_eq!(association.address, "AA:BB:CC:DD:EE:FF");
        assert!(association.observing_presence);
        assert_eq!(*host.observing.lock(), vec!["AA:BB:CC:DD:EE:FF".to_string()]);

        let vehicle = manager
            .registry
            .find_by_address("aa:bb:cc:dd:ee:ff")
            .expect("vehicle stored");
        assert_eq!(vehicle.name, "Golf");
        assert_eq!(vehicle.association_id, association.id);
        assert_eq!(vehicle.pin, "1234");

        Ok(())
    }

    #[tokio::test]
    async fn test_associate_failures_are_values() -> Result<()> {
        let temp_dir = TempDir::new()?;

        let empty = manager(Arc::new(FakeHost::default()), &temp_dir, DeviceFilter::default())?;
        assert!(matches!(
            empty.associate(&FirstCandidate).await,
            AssociationOutcome::Failed { .. }
        ));

        let host = Arc::new(FakeHost {
            candidates: vec![candidate("AA:BB:CC:DD:EE:FF", "CarKey")],
            ..Default::default()
        });
        let cancelled = manager(host.clone(), &temp_dir, DeviceFilter::default())?;
        assert_eq!(
            cancelled.associate(&Cancel).await,
            AssociationOutcome::Failed {
                reason: "Cancelled".to_string()
            }
        );
        assert!(host.associations.lock().is_empty());

        let rejecting = manager(
            Arc::new(FakeHost {
                candidates: vec![candidate("AA:BB:CC:DD:EE:FF", "CarKey")],
                fail_pairing: true,
                ..Default::default()
            }),
            &temp_dir,
            DeviceFilter::default(),
        )?;
        assert_eq!(
            rejecting.associate(&FirstCandidate).await,
            AssociationOutcome::Failed {
                reason: "Bluetooth error: Authentication Failed".to_string()
            }
        );
        assert!(rejecting.registry.list().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_name_prefix_filters_candidates() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let host = Arc::new(FakeHost {
            candidates: vec![
                candidate("11:11:11:11:11:11", "Headphones"),
                candidate("22:22:22:22:22:22", "CarKey-2"),
            ],
            ..Default::default()
        });
        let filter = DeviceFilter {
            name_prefix: Some("CarKey".to_string()),
            ..Default::default()
        };
        let manager = manager(host, &temp_dir, filter)?;

        match manager.associate(&FirstCandidate).await {
            AssociationOutcome::Created(a) => assert_eq!(a.address, "22:22:22:22:22:22"),
            other => panic!("unexpected outcome {:?}", other),
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_disassociate_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let host = Arc::new(FakeHost {
            candidates: vec![candidate("AA:BB:CC:DD:EE:FF", "CarKey")],
            ..Default::default()
        });
        let manager = manager(host.clone(), &temp_dir, DeviceFilter::default())?;
        let AssociationOutcome::Created(association) = manager.associate(&FirstCandidate).await
        else {
            panic!("association failed");
        };

        manager
            .disassociate(association.id, &association.address)
            .await?;
        assert!(host.observing.lock().is_empty());
        assert!(manager.associations().await?.is_empty());
        assert!(manager.registry.list().is_empty());

        manager
            .disassociate(association.id, &association.address)
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_resume_presence_rearms_all() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let host = Arc::new(FakeHost::default());
        host.create_association("AA:AA:AA:AA:AA:AA").await?;
        host.create_association("BB:BB:BB:BB:BB:BB").await?;
        let manager = manager(host.clone(), &temp_dir, DeviceFilter::default())?;

        assert_eq!(manager.resume_presence().await?, 2);
        assert_eq!(host.observing.lock().len(), 2);

        Ok(())
    }
}
