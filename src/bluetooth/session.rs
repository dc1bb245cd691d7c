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

//! Connection session for the single active vehicle link.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::ble_constants::{VehicleCommand, AUTO_LOCK_REQUEST_DELAYS, CHARACTERISTIC_UUID, SERVICE_UUID};
use super::channel::CommandChannel;
use super::transport::{
    CharacteristicHandle, DiscoveredService, LinkState, Transport, TransportEvent,
};
use crate::association::PresenceEvent;
use crate::bus::{EventBus, ListenerId};
use crate::config::Preferences;
use crate::error::LinkError;
use crate::events::Event;
use crate::state::SessionState;

/// One connection attempt. Built on appearance, dropped on disconnect.
#[derive(Debug)]
struct Session {
    state: SessionState,
    peer_address: String,
    bound_characteristic: Option<CharacteristicHandle>,
}

impl Session {
    fn new(peer_address: &str) -> Self {
        Self {
            state: SessionState::Idle,
            peer_address: peer_address.to_string(),
            bound_characteristic: None,
        }
    }

    fn is_peer(&self, address: &str) -> bool {
        self.peer_address.eq_ignore_ascii_case(address)
    }

    fn transition(&mut self, next: SessionState) -> Result<(), LinkError> {
        if !self.state.can_transition_to(next) {
            return Err(LinkError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        info!(
            "Session {}: {} -> {}",
            self.peer_address,
            self.state.as_str(),
            next.as_str()
        );
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SessionSlot {
    session: Option<Session>,
    /// Gates `send`. Set on connect, cleared on disconnect.
    connected: bool,
}

/// Read-only view of the session for collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub peer_address: Option<String>,
    pub is_connected: bool,
}

struct SessionCore {
    transport: Arc<dyn Transport>,
    channel: CommandChannel,
    preferences: Arc<dyn Preferences>,
    bus: EventBus,
    slot: Mutex<SessionSlot>,
    listener: Mutex<Option<ListenerId>>,
}

/// Owns the session state machine and drives the transport.
///
/// Events are always published after the slot lock is released, so bus
/// listeners may call back into [`ConnectionSession::send`].
#[derive(Clone)]
pub struct ConnectionSession {
    core: Arc<SessionCore>,
}

impl ConnectionSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        bus: EventBus,
        preferences: Arc<dyn Preferences>,
    ) -> Self {
        let channel = CommandChannel::new(transport.clone(), bus.clone());
        Self {
            core: Arc::new(SessionCore {
                transport,
                channel,
                preferences,
                bus,
                slot: Mutex::new(SessionSlot::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to `SEND_MESSAGE` requests on the bus.
    pub fn attach(&self) {
        let mut listener = self.core.listener.lock();
        if listener.is_some() {
            return;
        }
        let weak: Weak<SessionCore> = Arc::downgrade(&self.core);
        *listener = Some(self.core.bus.subscribe(move |event| {
            if let Event::SendMessage { text } = event {
                if let Some(core) = weak.upgrade() {
                    ConnectionSession { core }.send(text);
                }
            }
        }));
    }

    pub fn detach(&self) {
        if let Some(id) = self.core.listener.lock().take() {
            self.core.bus.unsubscribe(id);
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let slot = self.core.slot.lock();
        SessionSnapshot {
            state: slot
                .session
                .as_ref()
                .map(|s| s.state)
                .unwrap_or(SessionState::Idle),
            peer_address: slot.session.as_ref().map(|s| s.peer_address.clone()),
            is_connected: slot.connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.core.slot.lock().connected
    }

    /// Process presence and transport events until both sources close.
    pub async fn run(
        self,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut presence_rx: mpsc::Receiver<PresenceEvent>,
    ) {
        info!("Session loop started");
        loop {
            tokio::select! {
                Some(event) = transport_rx.recv() => self.handle_transport_event(event),
                Some(event) = presence_rx.recv() => self.handle_presence(event),
                else => break,
            }
        }
        info!("Session loop stopped");
    }

    pub fn handle_presence(&self, event: PresenceEvent) {
        match event {
            PresenceEvent::Appeared { address } => self.on_device_appeared(&address),
            PresenceEvent::Disappeared { address } => {
                info!("Device disappeared: {}", address);
            }
        }
    }

    /// Start a connection attempt unless one is already active.
    pub fn on_device_appeared(&self, address: &str) {
        let mut events = Vec::new();
        {
            let mut slot = self.core.slot.lock();
            if slot.session.is_some() || slot.connected {
                debug!("Ignoring appearance of {}: session already active", address);
                return;
            }
            events.push(Event::DeviceAppeared {
                address: address.to_string(),
            });

            if !self.core.transport.has_permission() {
                events.push(Event::ConnectFailed {
                    reason: LinkError::PermissionDenied.to_string(),
                });
            } else {
                let mut session = Session::new(address);
                match session
                    .transition(SessionState::Connecting)
                    .and_then(|_| self.core.transport.connect(address))
                {
                    Ok(()) => slot.session = Some(session),
                    Err(e) => {
                        warn!("Connect to {} failed: {}", address, e);
                        events.push(Event::ConnectFailed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
        self.publish_all(events);
    }

    pub fn handle_transport_event(&self, event: TransportEvent) {
        debug!("Transport event from {}", event.address());
        match event {
            TransportEvent::ConnectionStateChanged {
                address,
                state: LinkState::Connected,
            } => self.on_connected(&address),
            TransportEvent::ConnectionStateChanged {
                address,
                state: LinkState::Disconnected,
            } => self.on_disconnected(&address),
            TransportEvent::ConnectFailed { address, error } => {
                self.on_connect_failed(&address, error)
            }
            TransportEvent::ServicesDiscovered { address, result } => {
                self.on_services_discovered(&address, result)
            }
            TransportEvent::CharacteristicChanged { address, value } => {
                self.on_notification(&address, &value)
            }
            TransportEvent::NotifyFailed { address, error } => {
                self.on_notify_failed(&address, error)
            }
        }
    }

    /// Notifications died after the link was reported ready. Unbind, report,
    /// and drop the link; the disconnect callback finishes the teardown.
    fn on_notify_failed(&self, address: &str, error: LinkError) {
        {
            let mut slot = self.core.slot.lock();
            let Some(session) = slot.session.as_mut().filter(|s| s.is_peer(address)) else {
                debug!("Notify failure for unknown peer {}: {}", address, error);
                return;
            };
            error!("Notifications on {} failed: {}", address, error);
            session.bound_characteristic = None;
            if let Err(e) = self.core.transport.disconnect(address) {
                warn!("Failed to drop link to {}: {}", address, e);
            }
        }
        self.core.channel.publish(Event::ConnectFailed {
            reason: error.to_string(),
        });
    }

    fn on_connected(&self, address: &str) {
        let mut events = Vec::new();
        {
            let mut slot = self.core.slot.lock();
            let SessionSlot { session, connected } = &mut *slot;
            let Some(session) = session.as_mut().filter(|s| s.is_peer(address)) else {
                debug!("Connected callback for unknown peer {}", address);
                return;
            };

            if !self.core.transport.has_permission() {
                events.push(Event::ConnectFailed {
                    reason: LinkError::PermissionDenied.to_string(),
                });
                // The disconnect callback tears the session down.
                if let Err(e) = self.core.transport.disconnect(address) {
                    warn!("Failed to drop unpermitted link to {}: {}", address, e);
                }
            } else if let Err(e) = session.transition(SessionState::Connected) {
                warn!("{}", e);
            } else {
                *connected = true;
                events.push(Event::DeviceConnected {
                    address: address.to_string(),
                });

                let discovery = session
                    .transition(SessionState::DiscoveringServices)
                    .and_then(|_| self.core.transport.discover_services(address));
                if let Err(e) = discovery {
                    error!("Service discovery on {} failed: {}", address, e);
                    events.push(Event::ConnectFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.publish_all(events);
    }

    fn on_connect_failed(&self, address: &str, error: LinkError) {
        {
            let mut slot = self.core.slot.lock();
            let is_peer = slot.session.as_ref().is_some_and(|s| s.is_peer(address));
            if !is_peer {
                debug!("Connect failure for unknown peer {}: {}", address, error);
                return;
            }
            warn!("Connect to {} failed: {}", address, error);
            slot.session = None;
            slot.connected = false;
        }
        self.core.channel.publish(Event::ConnectFailed {
            reason: error.to_string(),
        });
    }

    fn on_services_discovered(
        &self,
        address: &str,
        result: Result<Vec<DiscoveredService>, LinkError>,
    ) {
        let mut events = Vec::new();
        let mut ready = false;
        {
            let mut slot = self.core.slot.lock();
            let Some(session) = slot.session.as_mut().filter(|s| s.is_peer(address)) else {
                debug!("Discovery result for unknown peer {}", address);
                return;
            };
            if session.state != SessionState::DiscoveringServices {
                warn!("Discovery result for {} in state {:?}", address, session.state);
                return;
            }

            match result.and_then(|services| Self::resolve_characteristic(address, &services)) {
                Err(e) => {
                    // Fatal to this attempt; presence will retrigger later.
                    error!("Cannot bind {}: {}", address, e);
                    events.push(Event::ConnectFailed {
                        reason: e.to_string(),
                    });
                }
                Ok(handle) => {
                    let notify = if self.core.transport.has_permission() {
                        self.core.transport.set_notify(&handle, true)
                    } else {
                        Err(LinkError::PermissionDenied)
                    };
                    match notify.and_then(|_| session.transition(SessionState::Ready)) {
                        Ok(()) => {
                            session.bound_characteristic = Some(handle);
                            events.push(Event::DeviceReady {
                                address: address.to_string(),
                            });
                            ready = true;
                        }
                        Err(e) => {
                            error!("Enabling notifications on {} failed: {}", address, e);
                            events.push(Event::ConnectFailed {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
        self.publish_all(events);
        if ready {
            self.schedule_auto_lock_requests();
        }
    }

    fn resolve_characteristic(
        address: &str,
        services: &[DiscoveredService],
    ) -> Result<CharacteristicHandle, LinkError> {
        services
            .iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .filter(|s| s.characteristics.contains(&CHARACTERISTIC_UUID))
            .map(|_| CharacteristicHandle {
                address: address.to_string(),
                service: SERVICE_UUID,
                characteristic: CHARACTERISTIC_UUID,
            })
            .ok_or(LinkError::ProtocolMismatch {
                service: SERVICE_UUID,
                characteristic: CHARACTERISTIC_UUID,
            })
    }

    fn on_notification(&self, address: &str, value: &[u8]) {
        {
            let slot = self.core.slot.lock();
            let ready = slot
                .session
                .as_ref()
                .is_some_and(|s| s.is_peer(address) && s.state == SessionState::Ready);
            if !ready {
                debug!("Dropping notification from {} outside Ready", address);
                return;
            }
        }
        if let Some(event) = CommandChannel::decode(address, value) {
            self.core.channel.publish(event);
        }
    }

    fn on_disconnected(&self, address: &str) {
        {
            let mut slot = self.core.slot.lock();
            let Some(mut session) = slot.session.take_if(|s| s.is_peer(address)) else {
                debug!("Disconnect callback for unknown peer {}", address);
                return;
            };
            if let Err(e) = session.transition(SessionState::Disconnected) {
                warn!("{}", e);
            }
            slot.connected = false;
            info!("Session {}: {} -> {}", address, session.state.as_str(), SessionState::Idle.as_str());
        }
        self.core.channel.publish(Event::DeviceDisconnected {
            address: address.to_string(),
        });
    }

    /// Send a text command. Silently ignored unless connected and bound.
    pub fn send(&self, message: &str) {
        let outcome = {
            let slot = self.core.slot.lock();
            if !slot.connected {
                debug!("Not connected, dropping {:?}", message);
                return;
            }
            let handle = slot
                .session
                .as_ref()
                .filter(|s| s.state == SessionState::Ready)
                .and_then(|s| s.bound_characteristic.as_ref());
            let Some(handle) = handle else {
                debug!("No bound characteristic, dropping {:?}", message);
                return;
            };
            self.core.channel.write(handle, message)
        };
        self.core.channel.publish(outcome);
    }

    /// Two independent fire-once requests. Each checks the preference when it
    /// fires; a request firing after disconnect is a no-op send.
    fn schedule_auto_lock_requests(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, auto-lock requests not scheduled");
            return;
        };
        for delay in AUTO_LOCK_REQUEST_DELAYS {
            let session = self.clone();
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                if session.core.preferences.auto_lock_enabled() {
                    debug!("Auto-lock request after {:?}", delay);
                    session.send(VehicleCommand::AutoLock.wire());
                } else {
                    debug!("Auto-lock disabled, request after {:?} skipped", delay);
                }
            });
        }
    }

    fn publish_all(&self, events: Vec<Event>) {
        for event in events {
            self.core.channel.publish(event);
        }
    }
}
