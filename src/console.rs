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

//! Line-oriented foreground UI on stdin.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::association::{Candidate, Selection, SelectionPrompt};
use crate::bluetooth::VehicleCommand;
use crate::storage::{Capability, Vehicle};

pub const HELP: &str = "Commands: lock, unlock, trunk, pair, unpair, status, autolock on|off, caps trunk|engine on|off, help, quit";

/// Actions that can be triggered from the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    Lock,
    Unlock,
    OpenTrunk,
    Pair,
    Unpair,
    Status,
    AutoLock(bool),
    SetCapability {
        capability: Capability,
        enabled: bool,
    },
    Help,
    Quit,
}

impl ConsoleAction {
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace().map(str::to_lowercase);
        let action = match words.next()?.as_str() {
            "lock" => Self::Lock,
            "unlock" => Self::Unlock,
            "trunk" => Self::OpenTrunk,
            "pair" => Self::Pair,
            "unpair" => Self::Unpair,
            "status" => Self::Status,
            "autolock" => Self::AutoLock(parse_switch(&words.next()?)?),
            "caps" => {
                let capability = match words.next()?.as_str() {
                    "trunk" => Capability::TrunkUnlock,
                    "engine" => Capability::EngineStart,
                    _ => return None,
                };
                Self::SetCapability {
                    capability,
                    enabled: parse_switch(&words.next()?)?,
                }
            }
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => return None,
        };
        Some(action)
    }

    /// The wire command for a vehicle action, honouring its capabilities.
    pub fn command_for(&self, vehicle: Option<&Vehicle>) -> Result<VehicleCommand, String> {
        match self {
            Self::Lock => Ok(VehicleCommand::Lock),
            Self::Unlock => Ok(VehicleCommand::Unlock),
            Self::OpenTrunk => match vehicle {
                Some(v) if v.has_trunk_unlock => Ok(VehicleCommand::OpenTrunk),
                Some(v) => Err(format!("{} has no trunk unlock", v.name)),
                None => Err("No vehicle connected".to_string()),
            },
            other => Err(format!("{:?} is not a vehicle command", other)),
        }
    }
}

fn parse_switch(word: &str) -> Option<bool> {
    match word {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// Shared stdin line source for actions and prompts.
pub struct Console {
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Console {
    /// Start reading stdin on a background task.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
        });
        Self::from_lines(rx)
    }

    pub fn from_lines(lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            lines: Mutex::new(lines),
        }
    }

    /// Next line, or `None` once input is closed.
    pub async fn read_line(&self) -> Option<String> {
        self.lines.lock().await.recv().await.map(|l| l.trim().to_string())
    }

    /// Next recognised action. Unknown input prints the help text.
    /// Closed input reads as [`ConsoleAction::Quit`].
    pub async fn next_action(&self) -> ConsoleAction {
        loop {
            let Some(line) = self.read_line().await else {
                return ConsoleAction::Quit;
            };
            if line.is_empty() {
                continue;
            }
            match ConsoleAction::parse(&line) {
                Some(action) => return action,
                None => println!("Unknown command '{}'. {}", line, HELP),
            }
        }
    }

    async fn ask(&self, question: &str) -> Option<String> {
        println!("{}", question);
        self.read_line().await
    }
}

#[async_trait]
impl SelectionPrompt for Console {
    async fn select(&self, candidates: &[Candidate]) -> Option<Selection> {
        println!("Select a vehicle to pair:");
        for (i, candidate) in candidates.iter().enumerate() {
            println!(
                "  {}) {} {}",
                i + 1,
                candidate.address,
                candidate.name.as_deref().unwrap_or("(unnamed)")
            );
        }

        let answer = self.ask("Number (empty to cancel):").await?;
        let index: usize = answer.parse().ok()?;
        let candidate = candidates.get(index.checked_sub(1)?)?;

        let default_name = candidate.name.clone().unwrap_or_else(|| "Vehicle".to_string());
        let name = self
            .ask(&format!("Vehicle name [{}]:", default_name))
            .await?;
        let pin = self.ask("PIN:").await?;

        Some(Selection {
            address: candidate.address.clone(),
            vehicle_name: if name.is_empty() { default_name } else { name },
            pin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::VehicleRegistry;

    fn vehicle(has_trunk_unlock: bool) -> Vehicle {
        Vehicle {
            name: "Golf".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
            association_id: 1,
            pin: "1234".to_string(),
            has_trunk_unlock,
            has_engine_start: false,
        }
    }

    fn scripted(lines: &[&str]) -> Console {
        let (tx, rx) = mpsc::unbounded_channel();
        for line in lines {
            tx.send(line.to_string()).unwrap();
        }
        Console::from_lines(rx)
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(ConsoleAction::parse("lock"), Some(ConsoleAction::Lock));
        assert_eq!(ConsoleAction::parse("  UNLOCK "), Some(ConsoleAction::Unlock));
        assert_eq!(
            ConsoleAction::parse("autolock on"),
            Some(ConsoleAction::AutoLock(true))
        );
        assert_eq!(
            ConsoleAction::parse("autolock off"),
            Some(ConsoleAction::AutoLock(false))
        );
        assert_eq!(ConsoleAction::parse("autolock"), None);
        assert_eq!(ConsoleAction::parse("exit"), Some(ConsoleAction::Quit));
        assert_eq!(ConsoleAction::parse("start engine"), None);
    }

    #[test]
    fn test_parse_capability_toggles() {
        assert_eq!(
            ConsoleAction::parse("caps trunk on"),
            Some(ConsoleAction::SetCapability {
                capability: Capability::TrunkUnlock,
                enabled: true,
            })
        );
        assert_eq!(
            ConsoleAction::parse("CAPS Engine off"),
            Some(ConsoleAction::SetCapability {
                capability: Capability::EngineStart,
                enabled: false,
            })
        );
        assert_eq!(ConsoleAction::parse("caps trunk"), None);
        assert_eq!(ConsoleAction::parse("caps doors on"), None);
        assert_eq!(ConsoleAction::parse("caps trunk maybe"), None);
    }

    #[test]
    fn test_enabled_trunk_capability_allows_trunk_command() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let registry = VehicleRegistry::open(temp_dir.path())?;
        registry.upsert(vehicle(false))?;

        let target = registry.target(None).unwrap();
        assert!(ConsoleAction::OpenTrunk.command_for(Some(&target)).is_err());

        let Some(ConsoleAction::SetCapability { capability, enabled }) =
            ConsoleAction::parse("caps trunk on")
        else {
            panic!("caps action not parsed");
        };
        assert!(registry.set_capability(&target.mac_address, capability, enabled)?);

        let target = registry.target(None).unwrap();
        assert_eq!(
            ConsoleAction::OpenTrunk.command_for(Some(&target)),
            Ok(VehicleCommand::OpenTrunk)
        );
        Ok(())
    }

    #[test]
    fn test_trunk_requires_capability() {
        let action = ConsoleAction::OpenTrunk;
        assert_eq!(
            action.command_for(Some(&vehicle(true))),
            Ok(VehicleCommand::OpenTrunk)
        );
        assert!(action.command_for(Some(&vehicle(false))).is_err());
        assert!(action.command_for(None).is_err());

        assert_eq!(
            ConsoleAction::Lock.command_for(None),
            Ok(VehicleCommand::Lock)
        );
        assert!(ConsoleAction::Status.command_for(None).is_err());
    }

    #[tokio::test]
    async fn test_next_action_skips_noise() {
        let console = scripted(&["", "bogus", "status"]);
        assert_eq!(console.next_action().await, ConsoleAction::Status);
        assert_eq!(console.next_action().await, ConsoleAction::Quit);
    }

    #[tokio::test]
    async fn test_prompt_selection() {
        let candidates = vec![
            Candidate {
                address: "11:11:11:11:11:11".to_string(),
                name: None,
            },
            Candidate {
                address: "22:22:22:22:22:22".to_string(),
                name: Some("CarKey".to_string()),
            },
        ];

        let console = scripted(&["2", "", "0000"]);
        assert_eq!(
            console.select(&candidates).await,
            Some(Selection {
                address: "22:22:22:22:22:22".to_string(),
                vehicle_name: "CarKey".to_string(),
                pin: "0000".to_string(),
            })
        );

        let console = scripted(&[""]);
        assert_eq!(console.select(&candidates).await, None);

        let console = scripted(&["0"]);
        assert_eq!(console.select(&candidates).await, None);
    }
}
