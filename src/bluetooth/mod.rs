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

//! Bluetooth communication module.
//!
//! GATT client link to the vehicle lock controller, and its BlueZ backends.

mod ble_constants;
mod bluez_host;
mod bluez_transport;
mod channel;
mod session;
mod transport;

pub use ble_constants::{
    VehicleCommand, AUTO_LOCK_REQUEST_DELAYS, CCCD_UUID, CHARACTERISTIC_UUID, SERVICE_UUID,
};
pub use bluez_host::BluezPairingHost;
pub use bluez_transport::BluezTransport;
pub use channel::CommandChannel;
pub use session::{ConnectionSession, SessionSnapshot};
pub use transport::{
    CharacteristicHandle, DiscoveredService, LinkState, Transport, TransportEvent,
};
