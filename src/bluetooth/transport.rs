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

//! Transport capability the session drives.
//!
//! Every method only submits work and returns at once. Outcomes arrive later
//! as [`TransportEvent`]s on the channel the implementation was built with.

use uuid::Uuid;

use crate::error::LinkError;

/// Physical link state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// A service found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Opaque reference to a resolved characteristic on one peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub address: String,
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// Callbacks delivered by the transport on its own context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged { address: String, state: LinkState },
    /// The connect attempt never reached a connected state.
    ConnectFailed { address: String, error: LinkError },
    ServicesDiscovered {
        address: String,
        result: Result<Vec<DiscoveredService>, LinkError>,
    },
    CharacteristicChanged { address: String, value: Vec<u8> },
    /// Notifications could not be enabled after `set_notify` was accepted.
    NotifyFailed { address: String, error: LinkError },
}

impl TransportEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::ConnectionStateChanged { address, .. }
            | Self::ConnectFailed { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::CharacteristicChanged { address, .. }
            | Self::NotifyFailed { address, .. } => address,
        }
    }
}

/// Platform GATT client.
pub trait Transport: Send + Sync {
    /// Whether the radio capability is currently granted.
    fn has_permission(&self) -> bool;

    fn connect(&self, address: &str) -> Result<(), LinkError>;

    fn disconnect(&self, address: &str) -> Result<(), LinkError>;

    fn discover_services(&self, address: &str) -> Result<(), LinkError>;

    /// Queue `value` for writing. `Ok` means the write was accepted locally.
    fn write_characteristic(
        &self,
        handle: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), LinkError>;

    /// Enable or disable remote notifications (writes the CCCD).
    fn set_notify(&self, handle: &CharacteristicHandle, enabled: bool) -> Result<(), LinkError>;
}
