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

//! Command and notification channel on the bound characteristic.

use std::sync::Arc;
use tracing::{debug, info, warn};

use super::transport::{CharacteristicHandle, Transport};
use crate::bus::EventBus;
use crate::error::LinkError;
use crate::events::Event;

/// Writes text commands and turns notifications into bus events.
#[derive(Clone)]
pub struct CommandChannel {
    transport: Arc<dyn Transport>,
    bus: EventBus,
}

impl CommandChannel {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus) -> Self {
        Self { transport, bus }
    }

    /// Submit `message` to `handle` and return the outcome event.
    ///
    /// Only local submission is reported; the radio's write confirmation is
    /// not tracked.
    pub fn write(&self, handle: &CharacteristicHandle, message: &str) -> Event {
        let result = if self.transport.has_permission() {
            self.transport
                .write_characteristic(handle, message.as_bytes())
        } else {
            Err(LinkError::PermissionDenied)
        };

        match result {
            Ok(()) => {
                info!("Sent message: {:?}", message);
                Event::SuccessfullySent {
                    text: message.to_string(),
                }
            }
            Err(e) => {
                warn!("Failed to send {:?}: {}", message, e);
                Event::FailedToSend {
                    text: message.to_string(),
                }
            }
        }
    }

    /// Decode a notification payload into a message event.
    ///
    /// Only text payloads are defined; anything else is dropped.
    pub fn decode(address: &str, value: &[u8]) -> Option<Event> {
        match std::str::from_utf8(value) {
            Ok(text) => {
                let text = text.trim();
                debug!("Received message: {}", text);
                Some(Event::MessageReceived {
                    text: text.to_string(),
                    address: address.to_string(),
                })
            }
            Err(e) => {
                warn!("Dropping non-text notification from {}: {}", address, e);
                None
            }
        }
    }

    pub fn publish(&self, event: Event) {
        self.bus.post(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trims_whitespace() {
        let event = CommandChannel::decode("AA:BB:CC:DD:EE:FF", b"unlocked\n");
        assert_eq!(
            event,
            Some(Event::MessageReceived {
                text: "unlocked".to_string(),
                address: "AA:BB:CC:DD:EE:FF".to_string(),
            })
        );

        let event = CommandChannel::decode("AA", b"  locked \r\n");
        assert!(matches!(event, Some(Event::MessageReceived { text, .. }) if text == "locked"));
    }

    #[test]
    fn test_decode_drops_binary() {
        assert_eq!(CommandChannel::decode("AA", &[0xff, 0xfe, 0x04]), None);
    }
}
