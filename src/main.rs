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

//! Open Car Key Desktop Application

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use open_car_key_desktop::association::{AssociationManager, AssociationOutcome, DeviceFilter};
use open_car_key_desktop::bluetooth::{
    BluezPairingHost, BluezTransport, ConnectionSession, SERVICE_UUID,
};
use open_car_key_desktop::bus::EventBus;
use open_car_key_desktop::config::{Config, SharedConfig};
use open_car_key_desktop::console::{Console, ConsoleAction, HELP};
use open_car_key_desktop::events::Event;
use open_car_key_desktop::state::AppState;
use open_car_key_desktop::storage::{AssociationStore, VehicleRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_car_key_desktop=info".parse()?),
        )
        .init();

    info!(
        "Starting Open Car Key Desktop v{}...",
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded from {:?}", config.path);
    let shared_config = SharedConfig::new(config.clone());

    // Event bus and state mirror
    let bus = EventBus::new();
    let state = AppState::new();
    state.attach(&bus);
    bus.subscribe(|event| debug!("Event: {}", event));

    // Initialize storage
    let registry = Arc::new(VehicleRegistry::open(&config.data_dir)?);
    let store = AssociationStore::new(&config.data_dir)?;
    info!("Storage initialized in {:?}", config.data_dir);

    // Bluetooth
    let session = bluer::Session::new().await?;
    let adapter = match &config.bluetooth.adapter {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    if !adapter.is_powered().await? {
        info!("Powering on Bluetooth adapter...");
        if let Err(e) = adapter.set_powered(true).await {
            warn!("Could not power on adapter: {}", e);
        }
    }

    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (presence_tx, presence_rx) = mpsc::channel(16);
    let transport = Arc::new(BluezTransport::new(adapter.clone(), transport_tx).await?);
    let host = Arc::new(BluezPairingHost::new(
        adapter,
        store,
        presence_tx,
        Duration::from_secs(config.bluetooth.discovery_timeout_secs),
        Duration::from_secs(config.bluetooth.presence_poll_secs),
    ));

    let associations = AssociationManager::new(
        host,
        registry.clone(),
        DeviceFilter {
            service: SERVICE_UUID,
            name_prefix: config.bluetooth.name_prefix.clone(),
        },
    );

    let link = ConnectionSession::new(transport, bus.clone(), Arc::new(shared_config.clone()));
    link.attach();
    tokio::spawn(link.clone().run(transport_rx, presence_rx));
    info!("Event bus has {} listener(s)", bus.listener_count());

    let console = Console::spawn();

    associations.resume_presence().await?;
    if registry.list().is_empty() {
        println!("No vehicle paired yet.");
        report_association(associations.associate(&console).await);
    }

    info!("Ready.");
    println!("{}", HELP);

    // Handle console actions
    loop {
        tokio::select! {
            action = console.next_action() => {
                match action {
                    ConsoleAction::Lock | ConsoleAction::Unlock | ConsoleAction::OpenTrunk => {
                        let vehicle = state
                            .get_device()
                            .and_then(|address| registry.find_by_address(&address));
                        match action.command_for(vehicle.as_ref()) {
                            Ok(command) => bus.post(Event::SendMessage {
                                text: command.wire().to_string(),
                            }),
                            Err(reason) => println!("{}", reason),
                        }
                    }
                    ConsoleAction::Pair => {
                        report_association(associations.associate(&console).await);
                    }
                    ConsoleAction::Unpair => {
                        for vehicle in registry.list() {
                            if let Err(e) = associations
                                .disassociate(vehicle.association_id, &vehicle.mac_address)
                                .await
                            {
                                error!("Failed to unpair {}: {}", vehicle.mac_address, e);
                            } else {
                                println!("Unpaired {} ({})", vehicle.name, vehicle.mac_address);
                            }
                        }
                    }
                    ConsoleAction::Status => {
                        let snapshot = link.snapshot();
                        println!(
                            "Status: {} | Session: {} | Device: {}",
                            state.get_status().as_str(),
                            snapshot.state.as_str(),
                            snapshot.peer_address.as_deref().unwrap_or("-")
                        );
                        if let Some(lock) = state.get_lock_state() {
                            println!("Vehicle reports: {:?}", lock);
                        }
                        if let Some(reason) = state.get_last_error() {
                            println!("Last error: {}", reason);
                        }
                        let auto_lock = shared_config.snapshot().session.auto_lock_enabled;
                        println!("Auto-lock: {}", if auto_lock { "on" } else { "off" });
                        for vehicle in registry.list() {
                            println!(
                                "  {} {} trunk:{} engine:{}",
                                vehicle.name,
                                vehicle.mac_address,
                                vehicle.has_trunk_unlock,
                                vehicle.has_engine_start
                            );
                        }
                        match associations.associations().await {
                            Ok(list) => println!("{} association(s)", list.len()),
                            Err(e) => warn!("Cannot list associations: {}", e),
                        }
                    }
                    ConsoleAction::AutoLock(enabled) => {
                        if let Err(e) = shared_config.set_auto_lock_enabled(enabled) {
                            error!("Failed to save auto-lock preference: {}", e);
                        }
                    }
                    ConsoleAction::SetCapability { capability, enabled } => {
                        let connected = state.get_device();
                        match registry.target(connected.as_deref()) {
                            Some(vehicle) => match registry.set_capability(
                                &vehicle.mac_address,
                                capability,
                                enabled,
                            ) {
                                Ok(_) => println!(
                                    "{:?} {} for {}",
                                    capability,
                                    if enabled { "enabled" } else { "disabled" },
                                    vehicle.name
                                ),
                                Err(e) => error!("Failed to save capabilities: {}", e),
                            },
                            None => println!("Connect a vehicle or pair exactly one"),
                        }
                    }
                    ConsoleAction::Help => println!("{}", HELP),
                    ConsoleAction::Quit => {
                        info!("Quit requested");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    link.detach();
    info!("Open Car Key Desktop stopped");
    Ok(())
}

fn report_association(outcome: AssociationOutcome) {
    match outcome {
        AssociationOutcome::Created(association) => {
            println!(
                "Paired {} (association {})",
                association.address, association.id
            );
        }
        AssociationOutcome::Failed { reason } => println!("Pairing failed: {}", reason),
    }
}
