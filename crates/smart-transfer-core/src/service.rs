// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Service wiring
//
// Builds the three engines over one event publisher and one clock, and owns
// the background device sampler.

use crate::devices::{Device, DeviceMonitor};
use crate::events::{CoreEvent, EventPublisher};
use crate::integrity::{FileRecord, IntegrityVerifier, VerificationStats, VerifyPolicy};
use crate::sampling::Strategies;
use crate::scheduler::{Clock, SystemClock, TaskRegistry};
use crate::transfers::{TransferEngine, TransferJob, TransferPolicy};
use crate::types::{ConnectivityState, CoreResult, CoreSettings};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SAMPLER_TASK: &str = "device-sampler";

/// Point-in-time view of everything the core owns
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreSnapshot {
    pub devices: Vec<Device>,
    pub network_status: ConnectivityState,
    pub transfers: Vec<TransferJob>,
    pub files: Vec<FileRecord>,
    pub verification: VerificationStats,
}

/// The transfer engine, device monitor and integrity verifier wired together
pub struct CoreService {
    settings: CoreSettings,
    events: EventPublisher,
    devices: DeviceMonitor,
    transfers: TransferEngine,
    verifier: IntegrityVerifier,
    background: TaskRegistry,
}

impl CoreService {
    /// Build the core with simulated link, transport and integrity check
    pub fn new(settings: CoreSettings) -> CoreResult<Self> {
        let strategies = Strategies::simulated(&settings);
        Self::with_strategies(settings, strategies, Arc::new(SystemClock))
    }

    pub fn with_strategies(
        settings: CoreSettings,
        strategies: Strategies,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        settings.validate()?;

        let events = EventPublisher::default();
        let devices = DeviceMonitor::new(
            &settings.devices,
            settings.reconnect_signal,
            strategies.link,
            events.clone(),
        );
        let verifier = IntegrityVerifier::new(
            VerifyPolicy::from_settings(&settings),
            strategies.integrity,
            clock.clone(),
            events.clone(),
            settings.rng_seed,
        );
        let transfers = TransferEngine::new(
            TransferPolicy::from_settings(&settings),
            devices.clone(),
            verifier.clone(),
            strategies.transport,
            clock,
            events.clone(),
        );

        Ok(Self {
            settings,
            events,
            devices,
            transfers,
            verifier,
            background: TaskRegistry::new(),
        })
    }

    /// Begin periodic link sampling. Calling again restarts the schedule.
    pub fn start_sampling(&self) -> CoreResult<()> {
        let period = Duration::from_millis(self.settings.sample_interval_ms);
        let devices = self.devices.clone();

        self.background.spawn_periodic(SAMPLER_TASK, period, move || {
            let changed = devices.sample_tick();
            if changed > 0 {
                tracing::debug!("Sampling tick changed {} devices", changed);
            }
            ControlFlow::Continue(())
        })?;
        tracing::info!("Sampling device links every {:?}", period);
        Ok(())
    }

    pub fn stop_sampling(&self) {
        if self.background.cancel(SAMPLER_TASK) {
            tracing::info!("Device sampling stopped");
        }
    }

    pub fn is_sampling(&self) -> bool {
        self.background.is_active(SAMPLER_TASK)
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn devices(&self) -> &DeviceMonitor {
        &self.devices
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn verifier(&self) -> &IntegrityVerifier {
        &self.verifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            devices: self.devices.list_devices(None),
            network_status: self.devices.aggregate_network_status(),
            transfers: self.transfers.list_transfers(),
            files: self.verifier.list_file_records(None, None),
            verification: self.verifier.stats(),
        }
    }
}

impl Drop for CoreService {
    fn drop(&mut self) {
        self.background.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoreError;

    fn flapping_settings() -> CoreSettings {
        CoreSettings {
            link_flip_probability: 1.0,
            rng_seed: Some(3),
            ..CoreSettings::default()
        }
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let settings = CoreSettings {
            log_retention: 0,
            ..CoreSettings::default()
        };
        assert!(matches!(
            CoreService::new(settings),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_snapshot_reflects_seed_registry() {
        let service = CoreService::new(CoreSettings::default()).unwrap();
        let snapshot = service.snapshot();
        assert_eq!(snapshot.devices.len(), 3);
        assert_eq!(snapshot.network_status, ConnectivityState::Unstable);
        assert!(snapshot.transfers.is_empty());
        assert_eq!(snapshot.verification.total, 0);
    }

    #[test]
    fn test_sampling_needs_a_runtime() {
        let service = CoreService::new(CoreSettings::default()).unwrap();
        assert_eq!(service.start_sampling(), Err(CoreError::RuntimeUnavailable));
        assert!(!service.is_sampling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_flips_devices_on_schedule() {
        let service = CoreService::new(flapping_settings()).unwrap();
        service.start_sampling().unwrap();
        assert!(service.is_sampling());

        // Every device flips once per 7s tick at probability 1.0
        tokio::time::sleep(Duration::from_millis(7_100)).await;
        let d002 = service.devices().get("D002").unwrap();
        assert_eq!(d002.connectivity_state, ConnectivityState::Connected);
        assert!(d002.signal_strength >= 60);
        assert_eq!(
            service.devices().get("D001").unwrap().connectivity_state,
            ConnectivityState::Disconnected
        );

        service.stop_sampling();
        assert!(!service.is_sampling());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            service.devices().get("D002").unwrap().connectivity_state,
            ConnectivityState::Connected
        );
    }
}
