// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Shared engines for all frontends
//
// This crate provides:
// - TransferEngine for the upload lifecycle and progress ticks
// - DeviceMonitor for device connectivity and aggregate network status
// - IntegrityVerifier with its bounded verification log
// - CoreService wiring the engines together, and CoreBridge to drive it over channels
// - CoreSettings, CoreError and SettingsStore for persistent settings
//
// Frontend-specific code lives in separate crates.

pub mod audit;
pub mod bridge;
pub mod devices;
pub mod events;
pub mod integrity;
pub mod sampling;
pub mod scheduler;
pub mod service;
pub mod settings;
pub mod transfers;
pub mod types;

// Re-export commonly used items
pub use audit::{VerificationLog, VerificationLogEntry};
pub use bridge::{CoreBridge, CoreCommand};
pub use devices::{Device, DeviceMonitor, LatencyGrade, PingReport};
pub use events::{CoreEvent, EventPublisher};
pub use integrity::{ContentHash, FileRecord, IntegrityVerifier, VerificationStats, VerifyBatch};
pub use sampling::{IntegrityCheck, LinkQualitySource, LinkReading, Strategies, TransferTransport};
pub use scheduler::{Clock, SystemClock, TaskRegistry};
pub use service::{CoreService, CoreSnapshot};
pub use settings::SettingsStore;
pub use transfers::{TickOutcome, TransferEngine, TransferJob};
pub use types::{
    ConnectivityState, CoreError, CoreResult, CoreSettings, DeviceSeed, TransferAction,
    TransferState, VerificationState,
};
