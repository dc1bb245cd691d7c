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

//! GATT client transport on BlueZ.

use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ble_constants::CHARACTERISTIC_UUID;
use super::transport::{
    CharacteristicHandle, DiscoveredService, LinkState, Transport, TransportEvent,
};
use crate::error::LinkError;

/// How long to wait for BlueZ to resolve services after connecting.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

/// Per-peer link resources.
struct Link {
    device: Device,
    characteristic: Option<Characteristic>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
}

impl Link {
    fn new(device: Device) -> Self {
        Self {
            device,
            characteristic: None,
            writer: None,
            tasks: Vec::new(),
            notify_task: None,
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
    }
}

/// Links keyed by address. Every insert gets a new generation, so a task
/// belonging to a replaced link cannot remove its successor.
struct LinkTable<L> {
    next_generation: u64,
    links: HashMap<String, (u64, L)>,
}

impl<L> Default for LinkTable<L> {
    fn default() -> Self {
        Self {
            next_generation: 1,
            links: HashMap::new(),
        }
    }
}

impl<L> LinkTable<L> {
    /// Insert `link`, replacing any previous one. Returns its generation.
    fn insert(&mut self, address: &str, link: L) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.links.insert(address.to_string(), (generation, link));
        generation
    }

    fn get(&self, address: &str) -> Option<&L> {
        self.links.get(address).map(|(_, link)| link)
    }

    fn get_mut(&mut self, address: &str, generation: u64) -> Option<&mut L> {
        self.links
            .get_mut(address)
            .filter(|(g, _)| *g == generation)
            .map(|(_, link)| link)
    }

    fn get_current_mut(&mut self, address: &str) -> Option<&mut L> {
        self.links.get_mut(address).map(|(_, link)| link)
    }

    /// Remove the link only if it is still the one of `generation`.
    fn remove(&mut self, address: &str, generation: u64) -> Option<L> {
        match self.links.get(address) {
            Some((g, _)) if *g == generation => self.links.remove(address).map(|(_, link)| link),
            _ => None,
        }
    }
}

/// Decide whether a freshly connected device can be watched for drops.
///
/// The subscription must exist and the device must still be connected once
/// it does; a drop before that point would never be reported otherwise.
fn watchable<S>(
    events: Result<S, LinkError>,
    connected: Result<bool, LinkError>,
) -> Result<S, String> {
    match (events, connected) {
        (Ok(events), Ok(true)) => Ok(events),
        (Ok(_), Ok(false)) => Err("dropped before it was watched".to_string()),
        (Err(e), _) | (_, Err(e)) => Err(e.to_string()),
    }
}

struct Inner {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    runtime: Handle,
    powered: AtomicBool,
    links: Mutex<LinkTable<Link>>,
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event dropped: session loop stopped");
        }
    }

    fn device(&self, address: &str) -> Result<Device, LinkError> {
        self.links
            .lock()
            .get(address)
            .map(|link| link.device.clone())
            .ok_or_else(|| LinkError::TransportDisconnect(address.to_string()))
    }

    /// Release the link of `generation` first, then report the drop.
    fn link_lost(&self, address: &str, generation: u64) {
        let link = self.links.lock().remove(address, generation);
        let Some(mut link) = link else {
            debug!("Link {} generation {} already replaced", address, generation);
            return;
        };
        // Detach rather than abort: the calling task may be one of these.
        link.tasks.clear();
        drop(link);

        self.emit(TransportEvent::ConnectionStateChanged {
            address: address.to_string(),
            state: LinkState::Disconnected,
        });
    }
}

/// [`Transport`] backed by a bluer adapter.
///
/// Submissions spawn tasks on the runtime the transport was created on;
/// results come back on the event channel.
#[derive(Clone)]
pub struct BluezTransport {
    inner: Arc<Inner>,
}

impl BluezTransport {
    pub async fn new(
        adapter: Adapter,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, LinkError> {
        let powered = adapter.is_powered().await?;
        info!(
            "Using Bluetooth adapter {} (powered: {})",
            adapter.name(),
            powered
        );

        let inner = Arc::new(Inner {
            adapter,
            events,
            runtime: Handle::current(),
            powered: AtomicBool::new(powered),
            links: Mutex::new(LinkTable::default()),
        });

        let watcher = inner.clone();
        let adapter_events = inner.adapter.events().await?;
        inner.runtime.spawn(async move {
            pin_mut!(adapter_events);
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    info!("Adapter powered: {}", powered);
                    watcher.powered.store(powered, Ordering::SeqCst);
                }
            }
        });

        Ok(Self { inner })
    }

    fn parse_address(address: &str) -> Result<Address, LinkError> {
        address
            .parse()
            .map_err(|_| LinkError::InvalidAddress(address.to_string()))
    }

    /// Report `Disconnected` once the device drops, or at once if it cannot
    /// be watched.
    fn watch_device(
        inner: Arc<Inner>,
        device: Device,
        address: String,
        generation: u64,
    ) -> JoinHandle<()> {
        inner.runtime.clone().spawn(async move {
            let events = device.events().await.map_err(LinkError::from);
            let connected = device.is_connected().await.map_err(LinkError::from);
            match watchable(events, connected) {
                Ok(events) => {
                    pin_mut!(events);
                    while let Some(event) = events.next().await {
                        if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) =
                            event
                        {
                            info!("Device {} disconnected", address);
                            break;
                        }
                    }
                }
                Err(reason) => warn!("Cannot watch {}: {}", address, reason),
            }
            inner.link_lost(&address, generation);
        })
    }

    async fn wait_services_resolved(device: &Device) -> Result<(), LinkError> {
        let deadline = tokio::time::Instant::now() + SERVICES_RESOLVE_TIMEOUT;
        while !device.is_services_resolved().await? {
            if tokio::time::Instant::now() >= deadline {
                return Err(LinkError::Host("Service resolution timed out".to_string()));
            }
            tokio::time::sleep(SERVICES_RESOLVE_POLL).await;
        }
        Ok(())
    }

    async fn collect_services(
        device: &Device,
    ) -> Result<(Vec<DiscoveredService>, Option<Characteristic>), LinkError> {
        Self::wait_services_resolved(device).await?;

        let mut services = Vec::new();
        let mut serial = None;
        for service in device.services().await? {
            let uuid = service.uuid().await?;
            let mut characteristics = Vec::new();
            for characteristic in service.characteristics().await? {
                let char_uuid = characteristic.uuid().await?;
                if char_uuid == CHARACTERISTIC_UUID {
                    serial = Some(characteristic);
                }
                characteristics.push(char_uuid);
            }
            debug!("Service {} with {} characteristic(s)", uuid, characteristics.len());
            services.push(DiscoveredService {
                uuid,
                characteristics,
            });
        }
        Ok((services, serial))
    }

    /// Serialize writes on one characteristic.
    fn spawn_writer(
        runtime: &Handle,
        address: String,
        characteristic: Characteristic,
    ) -> (mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let task = runtime.spawn(async move {
            while let Some(value) = rx.recv().await {
                if let Err(e) = characteristic.write(&value).await {
                    error!("GATT write to {} failed: {}", address, e);
                }
            }
        });
        (tx, task)
    }
}

impl Transport for BluezTransport {
    fn has_permission(&self) -> bool {
        self.inner.powered.load(Ordering::SeqCst)
    }

    fn connect(&self, address: &str) -> Result<(), LinkError> {
        let device = self.inner.adapter.device(Self::parse_address(address)?)?;
        let generation = self
            .inner
            .links
            .lock()
            .insert(address, Link::new(device.clone()));

        let inner = self.inner.clone();
        let address = address.to_string();
        self.inner.runtime.spawn(async move {
            info!("Connecting to {}", address);
            match device.connect().await {
                Ok(()) => {
                    let watcher =
                        Self::watch_device(inner.clone(), device, address.clone(), generation);
                    match inner.links.lock().get_mut(&address, generation) {
                        Some(link) => link.tasks.push(watcher),
                        None => watcher.abort(),
                    }
                    inner.emit(TransportEvent::ConnectionStateChanged {
                        address,
                        state: LinkState::Connected,
                    });
                }
                Err(e) => {
                    inner.links.lock().remove(&address, generation);
                    inner.emit(TransportEvent::ConnectFailed {
                        address,
                        error: e.into(),
                    });
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self, address: &str) -> Result<(), LinkError> {
        let device = self.inner.device(address)?;
        let address = address.to_string();
        self.inner.runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                warn!("Disconnect from {} failed: {}", address, e);
            }
        });
        Ok(())
    }

    fn discover_services(&self, address: &str) -> Result<(), LinkError> {
        let device = self.inner.device(address)?;
        let inner = self.inner.clone();
        let address = address.to_string();
        self.inner.runtime.spawn(async move {
            let result = match Self::collect_services(&device).await {
                Ok((services, serial)) => {
                    if let Some(characteristic) = serial {
                        let (writer, task) = Self::spawn_writer(
                            &inner.runtime,
                            address.clone(),
                            characteristic.clone(),
                        );
                        if let Some(link) = inner.links.lock().get_current_mut(&address) {
                            link.characteristic = Some(characteristic);
                            link.writer = Some(writer);
                            link.tasks.push(task);
                        }
                    }
                    Ok(services)
                }
                Err(e) => Err(e),
            };
            inner.emit(TransportEvent::ServicesDiscovered { address, result });
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), LinkError> {
        let links = self.inner.links.lock();
        let writer = links
            .get(&handle.address)
            .and_then(|link| link.writer.as_ref())
            .ok_or_else(|| {
                LinkError::LocalSubmissionFailure("characteristic not bound".to_string())
            })?;
        writer
            .send(value.to_vec())
            .map_err(|_| LinkError::LocalSubmissionFailure("write queue closed".to_string()))
    }

    fn set_notify(&self, handle: &CharacteristicHandle, enabled: bool) -> Result<(), LinkError> {
        let mut links = self.inner.links.lock();
        let link = links
            .get_current_mut(&handle.address)
            .ok_or_else(|| LinkError::TransportDisconnect(handle.address.clone()))?;

        if let Some(task) = link.notify_task.take() {
            task.abort();
        }
        if !enabled {
            return Ok(());
        }

        let characteristic = link.characteristic.clone().ok_or_else(|| {
            LinkError::LocalSubmissionFailure("characteristic not bound".to_string())
        })?;
        let inner = self.inner.clone();
        let address = handle.address.clone();
        link.notify_task = Some(self.inner.runtime.spawn(async move {
            // BlueZ writes the CCCD when the notify session starts.
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to enable notifications on {}: {}", address, e);
                    inner.emit(TransportEvent::NotifyFailed {
                        address,
                        error: e.into(),
                    });
                    return;
                }
            };
            info!("Notifications enabled on {}", address);
            pin_mut!(stream);
            while let Some(value) = stream.next().await {
                inner.emit(TransportEvent::CharacteristicChanged {
                    address: address.clone(),
                    value,
                });
            }
            debug!("Notification stream from {} ended", address);
        }));
        Ok(())
    }
}
