// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Sampling strategies
//
// The engines never move bytes or touch radios themselves. Link quality,
// delivered progress and digest checks come from these traits, so a real
// driver can replace the simulated ones and tests can script outcomes.

use crate::devices::Device;
use crate::integrity::FileRecord;
use crate::transfers::TransferJob;
use crate::types::{ConnectivityState, CoreSettings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};

/// A fresh observation of a device link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReading {
    pub state: ConnectivityState,
    pub signal_strength: u8,
}

impl LinkReading {
    pub fn connected(signal_strength: u8) -> Self {
        Self {
            state: ConnectivityState::Connected,
            signal_strength,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            state: ConnectivityState::Disconnected,
            signal_strength: 0,
        }
    }
}

/// Source of device link quality
pub trait LinkQualitySource: Send + Sync {
    /// Observe `device` on a sampling tick. `None` leaves it unchanged.
    fn sample(&self, device: &Device) -> Option<LinkReading>;

    /// Measure a round trip to `device` in milliseconds
    fn ping(&self, device: &Device) -> u32;
}

/// Moves a job's payload to its target device
pub trait TransferTransport: Send + Sync {
    /// Percentage points of the payload delivered since the previous tick
    fn advance(&self, job: &TransferJob, device: &Device) -> f64;
}

/// Compares a delivered file against its stored digest
pub trait IntegrityCheck: Send + Sync {
    fn check(&self, record: &FileRecord) -> bool;
}

/// Deterministic per-stream generator when a seed is configured
pub fn seeded_rng(seed: Option<u64>, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(stream)),
        None => StdRng::from_entropy(),
    }
}

/// Unreliable link model: devices flap between Connected and Disconnected
pub struct SimulatedLink {
    flip_probability: f64,
    signal_range: (u8, u8),
    latency_range: (u32, u32),
    rng: Mutex<StdRng>,
}

impl SimulatedLink {
    pub fn new(settings: &CoreSettings) -> Self {
        Self {
            flip_probability: settings.link_flip_probability,
            signal_range: (
                settings.reconnected_signal_min,
                settings.reconnected_signal_max,
            ),
            latency_range: (settings.ping_latency_min_ms, settings.ping_latency_max_ms),
            rng: Mutex::new(seeded_rng(settings.rng_seed, 1)),
        }
    }
}

impl LinkQualitySource for SimulatedLink {
    fn sample(&self, device: &Device) -> Option<LinkReading> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if !rng.gen_bool(self.flip_probability) {
            return None;
        }

        let reading = match device.connectivity_state {
            ConnectivityState::Disconnected => {
                LinkReading::connected(rng.gen_range(self.signal_range.0..=self.signal_range.1))
            }
            ConnectivityState::Connected | ConnectivityState::Unstable => {
                LinkReading::disconnected()
            }
        };
        Some(reading)
    }

    fn ping(&self, _device: &Device) -> u32 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(self.latency_range.0..=self.latency_range.1)
    }
}

/// Transport stand-in that delivers a random slice of the payload per tick
pub struct SimulatedTransport {
    min_increment: f64,
    max_increment: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedTransport {
    pub fn new(settings: &CoreSettings) -> Self {
        Self {
            min_increment: settings.min_progress_increment_pct,
            max_increment: settings.max_progress_increment_pct,
            rng: Mutex::new(seeded_rng(settings.rng_seed, 2)),
        }
    }
}

impl TransferTransport for SimulatedTransport {
    fn advance(&self, _job: &TransferJob, _device: &Device) -> f64 {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(self.min_increment..=self.max_increment)
    }
}

/// Digest check that passes with a fixed probability
pub struct BiasedIntegrityCheck {
    success_bias: f64,
    rng: Mutex<StdRng>,
}

impl BiasedIntegrityCheck {
    pub fn new(settings: &CoreSettings) -> Self {
        Self {
            success_bias: settings.verification_success_bias,
            rng: Mutex::new(seeded_rng(settings.rng_seed, 3)),
        }
    }
}

impl IntegrityCheck for BiasedIntegrityCheck {
    fn check(&self, _record: &FileRecord) -> bool {
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_bool(self.success_bias)
    }
}

/// The pluggable capabilities the engines are built around
#[derive(Clone)]
pub struct Strategies {
    pub link: Arc<dyn LinkQualitySource>,
    pub transport: Arc<dyn TransferTransport>,
    pub integrity: Arc<dyn IntegrityCheck>,
}

impl Strategies {
    /// Simulated link, transport and integrity check driven by `settings`
    pub fn simulated(settings: &CoreSettings) -> Self {
        Self {
            link: Arc::new(SimulatedLink::new(settings)),
            transport: Arc::new(SimulatedTransport::new(settings)),
            integrity: Arc::new(BiasedIntegrityCheck::new(settings)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(state: ConnectivityState, signal: u8) -> Device {
        Device::new("D900", "Bench", state, signal)
    }

    #[test]
    fn test_link_never_flips_at_zero_probability() {
        let settings = CoreSettings {
            link_flip_probability: 0.0,
            rng_seed: Some(7),
            ..CoreSettings::default()
        };
        let link = SimulatedLink::new(&settings);
        let online = device(ConnectivityState::Connected, 90);
        assert!((0..100).all(|_| link.sample(&online).is_none()));
    }

    #[test]
    fn test_link_always_flips_at_full_probability() {
        let settings = CoreSettings {
            link_flip_probability: 1.0,
            rng_seed: Some(7),
            ..CoreSettings::default()
        };
        let link = SimulatedLink::new(&settings);

        let reading = link
            .sample(&device(ConnectivityState::Connected, 90))
            .unwrap();
        assert_eq!(reading, LinkReading::disconnected());

        let reading = link
            .sample(&device(ConnectivityState::Disconnected, 0))
            .unwrap();
        assert_eq!(reading.state, ConnectivityState::Connected);
        assert!((60..=99).contains(&reading.signal_strength));
    }

    #[test]
    fn test_ping_latency_within_bounds() {
        let settings = CoreSettings {
            rng_seed: Some(11),
            ..CoreSettings::default()
        };
        let link = SimulatedLink::new(&settings);
        let target = device(ConnectivityState::Connected, 80);
        for _ in 0..200 {
            let latency = link.ping(&target);
            assert!((20..=140).contains(&latency));
        }
    }

    #[test]
    fn test_seeded_streams_are_reproducible() {
        let a: Vec<u32> = (0..5)
            .map(|_| seeded_rng(Some(42), 1).gen_range(0..1000))
            .collect();
        let b: Vec<u32> = (0..5)
            .map(|_| seeded_rng(Some(42), 1).gen_range(0..1000))
            .collect();
        assert_eq!(a, b);
    }
}
