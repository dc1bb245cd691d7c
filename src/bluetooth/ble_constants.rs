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

//! BLE service and characteristic UUIDs of the lock controller.

use std::time::Duration;
use uuid::Uuid;

/// Lock controller serial service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Serial characteristic UUID.
/// Properties: Write, Notify (commands out, events in)
pub const CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration descriptor. BlueZ writes it when a
/// notify session starts.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Delays of the two auto-lock requests after the link becomes ready.
/// Both fire; the peripheral may miss the first while still booting.
pub const AUTO_LOCK_REQUEST_DELAYS: [Duration; 2] =
    [Duration::from_millis(300), Duration::from_millis(1000)];

/// Text commands understood by the lock controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleCommand {
    /// Lock doors.
    Lock,
    /// Unlock doors.
    Unlock,
    /// Open trunk.
    OpenTrunk,
    /// Auto-lock request.
    AutoLock,
}

impl VehicleCommand {
    /// Newline-terminated wire form.
    pub fn wire(&self) -> &'static str {
        match self {
            Self::Lock => "ld\n",
            Self::Unlock => "ud\n",
            Self::OpenTrunk => "ut\n",
            Self::AutoLock => "al\n",
        }
    }
}
