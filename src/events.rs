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

//! Session events and their `TAG:data` string encoding.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A previously associated peripheral became reachable.
    DeviceAppeared { address: String },
    /// A connection attempt was aborted.
    ConnectFailed { reason: String },
    DeviceConnected { address: String },
    DeviceDisconnected { address: String },
    /// Service and characteristic are bound, notifications enabled.
    DeviceReady { address: String },
    /// A trimmed text notification from the peripheral.
    MessageReceived { text: String, address: String },
    SuccessfullySent { text: String },
    FailedToSend { text: String },
    /// Request to write `text` to the peripheral.
    SendMessage { text: String },
}

/// Error returned when a raw event string cannot be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("Event has no tag separator: {0}")]
    MissingSeparator(String),
    #[error("Unknown event tag: {0}")]
    UnknownTag(String),
    #[error("MESSAGE_RECEIVED payload has no address: {0}")]
    MissingAddress(String),
}

impl Event {
    pub const DEVICE_APPEARED: &'static str = "DEVICE_APPEARED";
    pub const CONNECT_FAILED: &'static str = "CONNECT_FAILED";
    pub const DEVICE_CONNECTED: &'static str = "DEVICE_CONNECTED";
    pub const DEVICE_DISCONNECTED: &'static str = "DEVICE_DISCONNECTED";
    pub const DEVICE_READY: &'static str = "DEVICE_READY";
    pub const MESSAGE_RECEIVED: &'static str = "MESSAGE_RECEIVED";
    pub const SUCCESSFULLY_SENT: &'static str = "SUCCESSFULLY_SENT";
    pub const FAILED_TO_SEND: &'static str = "FAILED_TO_SEND";
    pub const SEND_MESSAGE: &'static str = "SEND_MESSAGE";

    /// Tag part of the encoding.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::DeviceAppeared { .. } => Self::DEVICE_APPEARED,
            Self::ConnectFailed { .. } => Self::CONNECT_FAILED,
            Self::DeviceConnected { .. } => Self::DEVICE_CONNECTED,
            Self::DeviceDisconnected { .. } => Self::DEVICE_DISCONNECTED,
            Self::DeviceReady { .. } => Self::DEVICE_READY,
            Self::MessageReceived { .. } => Self::MESSAGE_RECEIVED,
            Self::SuccessfullySent { .. } => Self::SUCCESSFULLY_SENT,
            Self::FailedToSend { .. } => Self::FAILED_TO_SEND,
            Self::SendMessage { .. } => Self::SEND_MESSAGE,
        }
    }

    /// Address of the peripheral the event refers to, if it names one.
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::DeviceAppeared { address }
            | Self::DeviceConnected { address }
            | Self::DeviceDisconnected { address }
            | Self::DeviceReady { address }
            | Self::MessageReceived { address, .. } => Some(address),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        match self {
            Self::DeviceAppeared { address }
            | Self::DeviceConnected { address }
            | Self::DeviceDisconnected { address }
            | Self::DeviceReady { address } => write!(f, "{}:{}", tag, address),
            Self::ConnectFailed { reason } => write!(f, "{}:{}", tag, reason),
            Self::MessageReceived { text, address } => write!(f, "{}:{};{}", tag, text, address),
            Self::SuccessfullySent { text }
            | Self::FailedToSend { text }
            | Self::SendMessage { text } => write!(f, "{}:{}", tag, text),
        }
    }
}

impl FromStr for Event {
    type Err = EventParseError;

    /// Splits on the first `:`; addresses and message text keep any later colons.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, data) = s
            .split_once(':')
            .ok_or_else(|| EventParseError::MissingSeparator(s.to_string()))?;
        let data = data.to_string();

        let event = match tag {
            Self::DEVICE_APPEARED => Self::DeviceAppeared { address: data },
            Self::CONNECT_FAILED => Self::ConnectFailed { reason: data },
            Self::DEVICE_CONNECTED => Self::DeviceConnected { address: data },
            Self::DEVICE_DISCONNECTED => Self::DeviceDisconnected { address: data },
            Self::DEVICE_READY => Self::DeviceReady { address: data },
            Self::MESSAGE_RECEIVED => {
                // The address never contains ';', the text may.
                let (text, address) = data
                    .rsplit_once(';')
                    .ok_or_else(|| EventParseError::MissingAddress(data.clone()))?;
                Self::MessageReceived {
                    text: text.to_string(),
                    address: address.to_string(),
                }
            }
            Self::SUCCESSFULLY_SENT => Self::SuccessfullySent { text: data },
            Self::FAILED_TO_SEND => Self::FailedToSend { text: data },
            Self::SEND_MESSAGE => Self::SendMessage { text: data },
            other => return Err(EventParseError::UnknownTag(other.to_string())),
        };
        Ok(event)
    }
}
