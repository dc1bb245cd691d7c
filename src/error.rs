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

//! Link error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use crate::state::SessionState;

/// Errors raised at the transport, session and pairing seams.
///
/// None of these cross the session boundary: the session turns them into
/// bus events with the `Display` text as the reason.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The radio capability is not currently granted.
    #[error("No permission")]
    PermissionDenied,

    /// The peer does not expose the expected service/characteristic.
    #[error("Service {service} with characteristic {characteristic} not found")]
    ProtocolMismatch { service: Uuid, characteristic: Uuid },

    /// The peer or the radio dropped the link.
    #[error("Device {0} disconnected")]
    TransportDisconnect(String),

    /// A write was rejected before it reached the radio.
    #[error("Write rejected: {0}")]
    LocalSubmissionFailure(String),

    /// Not a valid hardware address.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Association {0} not found")]
    AssociationNotFound(u32),

    /// Anything else the host Bluetooth stack reported.
    #[error("Bluetooth error: {0}")]
    Host(String),
}

impl From<bluer::Error> for LinkError {
    fn from(e: bluer::Error) -> Self {
        match e.kind {
            bluer::ErrorKind::NotAuthorized | bluer::ErrorKind::NotPermitted => {
                Self::PermissionDenied
            }
            _ => Self::Host(e.to_string()),
        }
    }
}
