// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer CLI - Headless operator console

mod commands;

use commands::{CliCommand, ParseError};
use smart_transfer_core::{CoreBridge, CoreService, CoreSettings, SettingsStore};
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging; stdout is reserved for command output and events
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smart_transfer_cli=info".parse().unwrap())
                .add_directive("smart_transfer_core=info".parse().unwrap()),
        )
        .init();

    tracing::info!("Starting Smart Transfer v{}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(std::env::args().nth(1));
    let service = match CoreService::new(settings) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!("Failed to start core: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = service.start_sampling() {
        tracing::error!("Failed to start device sampling: {}", e);
        return ExitCode::FAILURE;
    }

    let bridge = match CoreBridge::new(service) {
        Ok(bridge) => bridge,
        Err(e) => {
            tracing::error!("Failed to start core bridge: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let events = bridge.event_receiver();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("event: {}", json),
                Err(e) => tracing::warn!("Failed to render event: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Failed to read input: {}", e);
                break;
            }
        };

        let command = match CliCommand::parse(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(e) => {
                println!("error: {}", e);
                continue;
            }
        };
        let quitting = command == CliCommand::Quit;

        match commands::execute(&bridge, command).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("error: {}", e),
        }
        if quitting {
            return ExitCode::SUCCESS;
        }
    }

    if let Err(e) = bridge.shutdown().await {
        tracing::debug!("Core already stopped: {}", e);
    }
    ExitCode::SUCCESS
}

/// Settings from an explicit file, the platform store, or defaults
fn load_settings(path: Option<String>) -> CoreSettings {
    let store = match path {
        Some(path) => SettingsStore::open(path),
        None => SettingsStore::new(),
    };
    match store {
        Ok(store) => {
            tracing::info!("Using settings from {}", store.path().display());
            store.get()
        }
        Err(e) => {
            tracing::warn!("Settings unavailable, using defaults: {}", e);
            CoreSettings::default()
        }
    }
}
