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

//! Session state machine and application state.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bus::{EventBus, ListenerId};
use crate::events::Event;

/// State of the live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting...",
            SessionState::Connected => "Connected",
            SessionState::DiscoveringServices => "Discovering services...",
            SessionState::Ready => "Ready",
            SessionState::Disconnected => "Disconnected",
        }
    }

    /// Whether the forward path allows moving from `self` to `next`.
    ///
    /// Forward steps cannot be skipped. Any state after `Idle` may drop to
    /// `Disconnected`, which only leads back to `Idle`.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connected, DiscoveringServices)
                | (DiscoveringServices, Ready)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (DiscoveringServices, Disconnected)
                | (Ready, Disconnected)
                | (Disconnected, Idle)
        )
    }
}

/// Coarse link status as seen by UI consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Disconnected => "Disconnected",
            LinkStatus::Connecting => "Connecting...",
            LinkStatus::Connected => "Connected",
            LinkStatus::Ready => "Ready",
            LinkStatus::Error => "Error",
        }
    }
}

/// Lock state last reported by the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

/// Shared application state, fed only from the bus.
#[derive(Debug)]
pub struct AppState {
    pub status: RwLock<LinkStatus>,

    /// Address of the connected vehicle.
    pub connected_device: RwLock<Option<String>>,

    /// Last text received from the vehicle.
    pub last_message: RwLock<Option<String>>,

    pub lock_state: RwLock<Option<LockState>>,

    /// Reason of the last failed attempt.
    pub last_error: RwLock<Option<String>>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            status: RwLock::new(LinkStatus::Disconnected),
            connected_device: RwLock::new(None),
            last_message: RwLock::new(None),
            lock_state: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mirror bus events into this state.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> ListenerId {
        let state = self.clone();
        bus.subscribe(move |event| state.apply(event))
    }

    pub fn apply(&self, event: &Event) {
        match event {
            Event::DeviceAppeared { .. } => {
                *self.status.write() = LinkStatus::Connecting;
            }
            Event::ConnectFailed { reason } => {
                *self.status.write() = LinkStatus::Error;
                *self.last_error.write() = Some(reason.clone());
            }
            Event::DeviceConnected { address } => {
                *self.status.write() = LinkStatus::Connected;
                *self.connected_device.write() = Some(address.clone());
                *self.last_error.write() = None;
            }
            Event::DeviceReady { address } => {
                *self.status.write() = LinkStatus::Ready;
                *self.connected_device.write() = Some(address.clone());
            }
            Event::DeviceDisconnected { .. } => {
                *self.status.write() = LinkStatus::Disconnected;
                *self.connected_device.write() = None;
            }
            Event::MessageReceived { text, .. } => {
                match text.as_str() {
                    "locked" => *self.lock_state.write() = Some(LockState::Locked),
                    "unlocked" => *self.lock_state.write() = Some(LockState::Unlocked),
                    _ => {}
                }
                *self.last_message.write() = Some(text.clone());
            }
            Event::SuccessfullySent { .. } | Event::FailedToSend { .. } | Event::SendMessage { .. } => {}
        }
    }

    pub fn get_status(&self) -> LinkStatus {
        *self.status.read()
    }

    pub fn get_device(&self) -> Option<String> {
        self.connected_device.read().clone()
    }

    pub fn get_last_message(&self) -> Option<String> {
        self.last_message.read().clone()
    }

    pub fn get_lock_state(&self) -> Option<LockState> {
        *self.lock_state.read()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path_cannot_skip() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(DiscoveringServices));
        assert!(DiscoveringServices.can_transition_to(Ready));

        assert!(!Idle.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(Ready));
        assert!(!Connected.can_transition_to(Ready));
        assert!(!Connecting.can_transition_to(DiscoveringServices));
    }

    #[test]
    fn test_disconnected_only_returns_to_idle() {
        use SessionState::*;
        assert!(Ready.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Idle));
        assert!(!Disconnected.can_transition_to(Connecting));
        assert!(!Idle.can_transition_to(Disconnected));
    }

    #[test]
    fn test_state_follows_bus() {
        let bus = EventBus::new();
        let state = AppState::new();
        state.attach(&bus);

        let address = "AA:BB:CC:DD:EE:FF".to_string();
        bus.post(Event::DeviceAppeared { address: address.clone() });
        assert_eq!(state.get_status(), LinkStatus::Connecting);

        bus.post(Event::DeviceConnected { address: address.clone() });
        bus.post(Event::DeviceReady { address: address.clone() });
        assert_eq!(state.get_status(), LinkStatus::Ready);
        assert_eq!(state.get_device(), Some(address.clone()));

        bus.post(Event::MessageReceived {
            text: "unlocked".to_string(),
            address: address.clone(),
        });
        assert_eq!(state.get_lock_state(), Some(LockState::Unlocked));
        assert_eq!(state.get_last_message().as_deref(), Some("unlocked"));

        bus.post(Event::DeviceDisconnected { address });
        assert_eq!(state.get_status(), LinkStatus::Disconnected);
        assert_eq!(state.get_device(), None);
        // Lock state is the last known value and survives the link.
        assert_eq!(state.get_lock_state(), Some(LockState::Unlocked));
    }

    #[test]
    fn test_connect_failure_sets_error() {
        let state = AppState::new();
        state.apply(&Event::ConnectFailed {
            reason: "No permission".to_string(),
        });
        assert_eq!(state.get_status(), LinkStatus::Error);
        assert_eq!(state.get_last_error().as_deref(), Some("No permission"));
    }
}
