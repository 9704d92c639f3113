// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Type definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reachability classification of a receiver device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityState {
    Connected,
    Unstable,
    Disconnected,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Unstable => write!(f, "Unstable"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// Upload lifecycle of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Pending,
    Uploading,
    Paused,
    Completed,
    Cancelled,
}

impl TransferState {
    /// Completed and Cancelled accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Uploading => write!(f, "Uploading"),
            Self::Paused => write!(f, "Paused"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Operator commands that move a transfer job between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferAction {
    Start,
    Pause,
    Resume,
    Cancel,
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Outcome of the most recent integrity check on a delivered file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationState {
    Pending,
    Verified,
    Corrupted,
}

impl VerificationState {
    /// Parse a case-insensitive filter name as typed by an operator
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "verified" => Some(Self::Verified),
            "corrupted" => Some(Self::Corrupted),
            _ => None,
        }
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Verified => write!(f, "Verified"),
            Self::Corrupted => write!(f, "Corrupted"),
        }
    }
}

/// Initial entry of the device registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSeed {
    pub id: String,
    pub name: String,
    pub connectivity_state: ConnectivityState,
    pub signal_strength: u8,
}

impl DeviceSeed {
    pub fn new(
        id: &str,
        name: &str,
        connectivity_state: ConnectivityState,
        signal_strength: u8,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            connectivity_state,
            signal_strength,
        }
    }
}

fn default_devices() -> Vec<DeviceSeed> {
    vec![
        DeviceSeed::new("D001", "Receiver 1", ConnectivityState::Connected, 92),
        DeviceSeed::new("D002", "Receiver 2", ConnectivityState::Disconnected, 0),
        DeviceSeed::new("D003", "Receiver 3", ConnectivityState::Connected, 76),
    ]
}

/// Tunables consumed by the core engines (GUI-agnostic)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreSettings {
    /// Period of the device link sampling tick in milliseconds
    pub sample_interval_ms: u64,
    /// Chance per sampling tick that a device flips Connected <-> Disconnected
    pub link_flip_probability: f64,
    /// Signal assigned by an explicit reconnect
    pub reconnect_signal: u8,
    /// Lower bound of the signal drawn when sampling brings a device back
    pub reconnected_signal_min: u8,
    /// Upper bound of the signal drawn when sampling brings a device back
    pub reconnected_signal_max: u8,
    /// Lower bound of a simulated ping round trip
    pub ping_latency_min_ms: u32,
    /// Upper bound of a simulated ping round trip
    pub ping_latency_max_ms: u32,
    /// Period of the per-job progress tick in milliseconds
    pub progress_tick_ms: u64,
    /// Smallest progress gained by an uploading job per tick, in percentage points
    pub min_progress_increment_pct: f64,
    /// Largest progress gained by an uploading job per tick, in percentage points
    pub max_progress_increment_pct: f64,
    /// Probability that a simulated integrity check passes
    pub verification_success_bias: f64,
    /// Number of verification log entries retained (oldest dropped first)
    pub log_retention: usize,
    /// Upper bound of the random delay before each verify-all attempt
    pub verify_all_jitter_ms: u64,
    /// Treat Unstable devices as unavailable for start/resume
    pub block_transfers_on_unstable: bool,
    /// Largest file accepted by enqueue. None means unlimited.
    pub max_file_size_bytes: Option<u64>,
    /// Re-run verification automatically after a Corrupted outcome
    pub auto_retry_corrupted: bool,
    /// Attempt count after which automatic retries stop
    pub max_verify_attempts: u32,
    /// Delay before an automatic retry in milliseconds
    pub retry_delay_ms: u64,
    /// Seed for the simulated strategies. None draws from entropy.
    pub rng_seed: Option<u64>,
    /// Devices loaded into the registry at startup
    pub devices: Vec<DeviceSeed>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 7000,
            link_flip_probability: 0.3,
            reconnect_signal: 85,
            reconnected_signal_min: 60,
            reconnected_signal_max: 99,
            ping_latency_min_ms: 20,
            ping_latency_max_ms: 140,
            progress_tick_ms: 500,
            min_progress_increment_pct: 0.5,
            max_progress_increment_pct: 8.0,
            verification_success_bias: 0.7,
            log_retention: 50,
            verify_all_jitter_ms: 1000,
            block_transfers_on_unstable: false,
            max_file_size_bytes: Some(50 * 1024 * 1024),
            auto_retry_corrupted: false,
            max_verify_attempts: 3,
            retry_delay_ms: 1000,
            rng_seed: None,
            devices: default_devices(),
        }
    }
}

impl CoreSettings {
    /// Reject values the engines cannot honour
    pub fn validate(&self) -> CoreResult<()> {
        fn probability(name: &str, value: f64) -> CoreResult<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(CoreError::InvalidConfig(format!(
                    "{} must be within 0.0..=1.0, got {}",
                    name, value
                )))
            }
        }

        probability("linkFlipProbability", self.link_flip_probability)?;
        probability("verificationSuccessBias", self.verification_success_bias)?;

        if self.sample_interval_ms == 0 || self.progress_tick_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "tick intervals must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_signal == 0 || self.reconnect_signal > 100 {
            return Err(CoreError::InvalidConfig(format!(
                "reconnectSignal must be within 1..=100, got {}",
                self.reconnect_signal
            )));
        }
        if self.reconnected_signal_min == 0
            || self.reconnected_signal_min > self.reconnected_signal_max
            || self.reconnected_signal_max > 100
        {
            return Err(CoreError::InvalidConfig(format!(
                "reconnected signal range {}..={} must lie within 1..=100",
                self.reconnected_signal_min, self.reconnected_signal_max
            )));
        }
        if self.ping_latency_min_ms > self.ping_latency_max_ms {
            return Err(CoreError::InvalidConfig(format!(
                "ping latency range {}..={} is empty",
                self.ping_latency_min_ms, self.ping_latency_max_ms
            )));
        }
        if !(self.min_progress_increment_pct > 0.0
            && self.min_progress_increment_pct <= self.max_progress_increment_pct
            && self.max_progress_increment_pct <= 100.0)
        {
            return Err(CoreError::InvalidConfig(format!(
                "progress increment bounds {}..={} must be positive and at most 100",
                self.min_progress_increment_pct, self.max_progress_increment_pct
            )));
        }
        if self.log_retention == 0 {
            return Err(CoreError::InvalidConfig(
                "logRetention must keep at least one entry".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate device id: {}",
                    device.id
                )));
            }
            if device.signal_strength > 100 {
                return Err(CoreError::InvalidConfig(format!(
                    "device {} signal {} exceeds 100",
                    device.id, device.signal_strength
                )));
            }
        }

        Ok(())
    }
}

/// Error types for the core engines
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown transfer job: {0}")]
    UnknownJob(String),

    #[error("Unknown file: {0}")]
    UnknownFile(String),

    #[error("Cannot {action} transfer {job_id} while it is {state}")]
    InvalidState {
        job_id: String,
        state: TransferState,
        action: TransferAction,
    },

    #[error("Device {device_id} is unavailable ({state})")]
    DeviceUnavailable {
        device_id: String,
        state: ConnectivityState,
    },

    #[error("File {name} is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    FileTooLarge {
        name: String,
        size_bytes: u64,
        limit_bytes: u64,
    },

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Core is not running")]
    CoreStopped,

    #[error("No tokio runtime available to schedule background work")]
    RuntimeUnavailable,
}

impl CoreError {
    /// Whether the caller may retry the same command once conditions change
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceUnavailable { .. })
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::FileIo(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
