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

//! Pairing and presence observation on BlueZ.

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, Device, DiscoveryFilter, DiscoveryTransport};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::association::{Association, Candidate, DeviceFilter, PairingHost, PresenceEvent};
use crate::error::LinkError;
use crate::storage::{AssociationRecord, AssociationStore};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Delay before a failed presence loop is started again.
const PRESENCE_RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Run `task` until it finishes cleanly, starting it again after `backoff`
/// each time it fails. Returns the number of restarts.
async fn supervise<F, Fut>(name: &str, backoff: Duration, mut task: F) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), LinkError>>,
{
    let mut restarts = 0;
    loop {
        match task().await {
            Ok(()) => return restarts,
            Err(e) => {
                warn!("{} failed: {}; restarting in {:?}", name, e, backoff);
                restarts += 1;
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

struct HostInner {
    adapter: Adapter,
    store: Mutex<AssociationStore>,
    /// Observed address -> present at last poll.
    observed: Mutex<HashMap<String, bool>>,
    presence: mpsc::Sender<PresenceEvent>,
    discovery_timeout: Duration,
}

/// [`PairingHost`] backed by BlueZ pairing and a presence poller.
///
/// BlueZ has no association ids of its own, so ids come from the
/// [`AssociationStore`].
pub struct BluezPairingHost {
    inner: Arc<HostInner>,
}

impl BluezPairingHost {
    pub fn new(
        adapter: Adapter,
        store: AssociationStore,
        presence: mpsc::Sender<PresenceEvent>,
        discovery_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let inner = Arc::new(HostInner {
            adapter,
            store: Mutex::new(store),
            observed: Mutex::new(HashMap::new()),
            presence,
            discovery_timeout,
        });

        let poller = inner.clone();
        let poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        tokio::spawn(async move {
            supervise("Presence observation", PRESENCE_RESTART_BACKOFF, || {
                Self::presence_loop(poller.clone(), poll_interval)
            })
            .await;
            info!("Presence observation stopped");
        });

        Self { inner }
    }

    fn parse_address(address: &str) -> Result<Address, LinkError> {
        address
            .parse()
            .map_err(|_| LinkError::InvalidAddress(address.to_string()))
    }

    fn to_association(record: &AssociationRecord) -> Association {
        Association {
            id: record.id,
            address: record.address.clone(),
            observing_presence: record.observing_presence,
        }
    }

    async fn is_present(device: &Device) -> Result<bool, LinkError> {
        Ok(device.is_connected().await? || device.rssi().await?.is_some())
    }

    /// Poll observed devices. A background discovery session keeps RSSI
    /// values current while the loop runs.
    async fn presence_loop(inner: Arc<HostInner>, poll_interval: Duration) -> Result<(), LinkError> {
        inner
            .adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::Le,
                ..Default::default()
            })
            .await?;
        let discovery = inner.adapter.discover_devices().await?;
        pin_mut!(discovery);
        let mut ticker = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                event = discovery.next() => match event {
                    Some(AdapterEvent::DeviceAdded(addr)) => debug!("Seen {}", addr),
                    Some(_) => {}
                    None => {
                        return Err(LinkError::Host("discovery session ended".to_string()));
                    }
                },
                _ = ticker.tick() => {
                    if inner.presence.is_closed() {
                        info!("Presence receiver closed");
                        return Ok(());
                    }
                    Self::poll_once(&inner).await;
                }
            }
        }
    }

    async fn poll_once(inner: &HostInner) {
        let addresses: Vec<String> = inner.observed.lock().keys().cloned().collect();
        for address in addresses {
            let device = match Self::parse_address(&address)
                .and_then(|addr| inner.adapter.device(addr).map_err(LinkError::from))
            {
                Ok(device) => device,
                Err(e) => {
                    warn!("Cannot observe {}: {}", address, e);
                    continue;
                }
            };
            let present = Self::is_present(&device).await.unwrap_or(false);
            let connected = device.is_connected().await.unwrap_or(false);

            let was_present = match inner.observed.lock().get_mut(&address) {
                Some(last) => std::mem::replace(last, present),
                // Stopped observing during the poll.
                None => continue,
            };

            let event = if present && !connected {
                Some(PresenceEvent::Appeared {
                    address: address.clone(),
                })
            } else if was_present && !present {
                Some(PresenceEvent::Disappeared {
                    address: address.clone(),
                })
            } else {
                None
            };
            if let Some(event) = event {
                if inner.presence.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl PairingHost for BluezPairingHost {
    async fn discover(&self, filter: &DeviceFilter) -> Result<Vec<Candidate>, LinkError> {
        let adapter = &self.inner.adapter;
        adapter
            .set_discovery_filter(DiscoveryFilter {
                uuids: HashSet::from([filter.service]),
                transport: DiscoveryTransport::Le,
                ..Default::default()
            })
            .await?;

        info!(
            "Discovering devices for {:?}",
            self.inner.discovery_timeout
        );
        let events = adapter.discover_devices().await?;
        pin_mut!(events);

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let deadline = tokio::time::sleep(self.inner.discovery_timeout);
        pin_mut!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.next() => {
                    let Some(event) = event else { break };
                    let AdapterEvent::DeviceAdded(addr) = event else { continue };
                    if !seen.insert(addr) {
                        continue;
                    }
                    let device = adapter.device(addr)?;
                    let name = device.name().await.ok().flatten();
                    debug!("Candidate {} ({:?})", addr, name);
                    candidates.push(Candidate {
                        address: addr.to_string(),
                        name,
                    });
                }
            }
        }

        info!("Discovery found {} candidate(s)", candidates.len());
        Ok(candidates)
    }

    async fn create_association(&self, address: &str) -> Result<Association, LinkError> {
        let device = self.inner.adapter.device(Self::parse_address(address)?)?;

        if !device.is_paired().await? {
            info!("Pairing with {}", address);
            device.pair().await?;
        }
        device.set_trusted(true).await?;

        let mut store = self.inner.store.lock();
        let id = store
            .insert(address)
            .map_err(|e| LinkError::Host(e.to_string()))?;
        store
            .get(id)
            .map(Self::to_association)
            .ok_or(LinkError::AssociationNotFound(id))
    }

    async fn remove_association(&self, id: u32) -> Result<(), LinkError> {
        let address = self
            .inner
            .store
            .lock()
            .get(id)
            .map(|record| record.address.clone())
            .ok_or(LinkError::AssociationNotFound(id))?;

        if let Err(e) = self
            .inner
            .adapter
            .remove_device(Self::parse_address(&address)?)
            .await
        {
            warn!("Failed to unpair {}: {}", address, e);
        }

        self.inner
            .store
            .lock()
            .remove(id)
            .map_err(|e| LinkError::Host(e.to_string()))?;
        Ok(())
    }

    async fn start_observing_presence(&self, address: &str) -> Result<(), LinkError> {
        Self::parse_address(address)?;
        self.inner
            .store
            .lock()
            .set_observing(address, true)
            .map_err(|e| LinkError::Host(e.to_string()))?;
        self.inner
            .observed
            .lock()
            .entry(address.to_uppercase())
            .or_insert(false);
        info!("Observing presence of {}", address);
        Ok(())
    }

    async fn stop_observing_presence(&self, address: &str) -> Result<(), LinkError> {
        self.inner.observed.lock().remove(&address.to_uppercase());
        self.inner
            .store
            .lock()
            .set_observing(address, false)
            .map_err(|e| LinkError::Host(e.to_string()))?;
        info!("Stopped observing {}", address);
        Ok(())
    }

    async fn associations(&self) -> Result<Vec<Association>, LinkError> {
        Ok(self
            .inner
            .store
            .lock()
            .all()
            .iter()
            .map(Self::to_association)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_failed_loop_is_restarted_after_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let started = tokio::time::Instant::now();

        let restarts = supervise("test loop", Duration::from_secs(5), || {
            let attempts = attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LinkError::Host("discovery session ended".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(restarts, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_is_not_restarted() {
        let restarts = supervise("test loop", Duration::from_secs(5), || async { Ok(()) }).await;
        assert_eq!(restarts, 0);
    }
}
