// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Device session monitor
//
// Owns the device registry. Other engines only ever see cloned snapshots
// taken under the registry lock.

use crate::events::{CoreEvent, EventPublisher};
use crate::sampling::{LinkQualitySource, LinkReading};
use crate::types::{ConnectivityState, CoreError, CoreResult, DeviceSeed};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Mean signal above which the network counts as Connected
pub const CONNECTED_SIGNAL_THRESHOLD: f64 = 70.0;
/// Mean signal above which the network counts as Unstable
pub const UNSTABLE_SIGNAL_THRESHOLD: f64 = 40.0;

/// A receiver device and its current link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub connectivity_state: ConnectivityState,
    pub signal_strength: u8,
}

impl Device {
    pub fn new(id: &str, name: &str, state: ConnectivityState, signal_strength: u8) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            connectivity_state: state,
            signal_strength: normalized_signal(state, signal_strength),
        }
    }

    /// Apply a link reading, keeping signal 0 exclusive to Disconnected.
    /// Returns whether anything changed.
    fn apply(&mut self, reading: LinkReading) -> bool {
        let signal = normalized_signal(reading.state, reading.signal_strength);
        if self.connectivity_state == reading.state && self.signal_strength == signal {
            return false;
        }
        self.connectivity_state = reading.state;
        self.signal_strength = signal;
        true
    }

    fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.name.to_lowercase().contains(&query) || self.id.to_lowercase().contains(&query)
    }
}

impl From<&DeviceSeed> for Device {
    fn from(seed: &DeviceSeed) -> Self {
        Device::new(
            &seed.id,
            &seed.name,
            seed.connectivity_state,
            seed.signal_strength,
        )
    }
}

fn normalized_signal(state: ConnectivityState, signal: u8) -> u8 {
    match state {
        ConnectivityState::Disconnected => 0,
        ConnectivityState::Connected | ConnectivityState::Unstable => signal.clamp(1, 100),
    }
}

/// Coarse quality of a ping round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyGrade {
    Good,
    Fair,
    Poor,
}

impl LatencyGrade {
    pub fn from_latency(latency_ms: u32) -> Self {
        if latency_ms < 50 {
            Self::Good
        } else if latency_ms < 100 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

/// Result of a ping command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReport {
    pub device_id: String,
    pub latency_ms: u32,
    pub grade: LatencyGrade,
}

/// Connectivity truth for every registered device
#[derive(Clone)]
pub struct DeviceMonitor {
    registry: Arc<RwLock<BTreeMap<String, Device>>>,
    link: Arc<dyn LinkQualitySource>,
    events: EventPublisher,
    reconnect_signal: u8,
}

impl DeviceMonitor {
    pub fn new(
        seeds: &[DeviceSeed],
        reconnect_signal: u8,
        link: Arc<dyn LinkQualitySource>,
        events: EventPublisher,
    ) -> Self {
        let registry = seeds
            .iter()
            .map(|seed| (seed.id.clone(), Device::from(seed)))
            .collect::<BTreeMap<_, _>>();
        tracing::info!("Device registry loaded with {} devices", registry.len());

        Self {
            registry: Arc::new(RwLock::new(registry)),
            link,
            events,
            reconnect_signal,
        }
    }

    /// Consistent snapshot of one device
    pub fn get(&self, device_id: &str) -> CoreResult<Device> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))
    }

    /// Devices ordered by id, optionally filtered by a name or id substring
    pub fn list_devices(&self, query: Option<&str>) -> Vec<Device> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .values()
            .filter(|device| query.map_or(true, |q| device.matches(q)))
            .cloned()
            .collect()
    }

    pub fn ping(&self, device_id: &str) -> CoreResult<PingReport> {
        let device = self.get(device_id)?;
        let latency_ms = self.link.ping(&device);
        tracing::debug!("Ping {} answered in {}ms", device_id, latency_ms);

        Ok(PingReport {
            device_id: device.id,
            latency_ms,
            grade: LatencyGrade::from_latency(latency_ms),
        })
    }

    pub fn reconnect(&self, device_id: &str) -> CoreResult<Device> {
        tracing::info!("Reconnecting device {}", device_id);
        self.set_link(device_id, LinkReading::connected(self.reconnect_signal))
    }

    pub fn disconnect(&self, device_id: &str) -> CoreResult<Device> {
        tracing::info!("Disconnecting device {}", device_id);
        self.set_link(device_id, LinkReading::disconnected())
    }

    /// Record an externally observed link state for one device
    pub fn set_link(&self, device_id: &str, reading: LinkReading) -> CoreResult<Device> {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let device = registry
            .get_mut(device_id)
            .ok_or_else(|| CoreError::UnknownDevice(device_id.to_string()))?;

        if device.apply(reading) {
            self.events.publish(CoreEvent::DeviceChanged {
                device: device.clone(),
            });
        }
        Ok(device.clone())
    }

    /// One pass of the link sampler over every device. Returns how many changed.
    pub fn sample_tick(&self) -> usize {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;

        for device in registry.values_mut() {
            let Some(reading) = self.link.sample(device) else {
                continue;
            };
            let previous = device.connectivity_state;
            if device.apply(reading) {
                changed += 1;
                if previous != device.connectivity_state {
                    tracing::info!(
                        "Device {} went {} -> {}",
                        device.id,
                        previous,
                        device.connectivity_state
                    );
                }
                self.events.publish(CoreEvent::DeviceChanged {
                    device: device.clone(),
                });
            }
        }

        changed
    }

    /// Network health derived from the mean signal of all devices
    pub fn aggregate_network_status(&self) -> ConnectivityState {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        if registry.is_empty() {
            return ConnectivityState::Disconnected;
        }

        let total: u32 = registry.values().map(|d| u32::from(d.signal_strength)).sum();
        let mean = f64::from(total) / registry.len() as f64;

        if mean > CONNECTED_SIGNAL_THRESHOLD {
            ConnectivityState::Connected
        } else if mean > UNSTABLE_SIGNAL_THRESHOLD {
            ConnectivityState::Unstable
        } else {
            ConnectivityState::Disconnected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CoreSettings;
    use std::sync::Mutex;

    /// Replays queued readings, then reports no change
    struct ScriptedLink {
        readings: Mutex<Vec<Option<LinkReading>>>,
    }

    impl ScriptedLink {
        fn new(readings: Vec<Option<LinkReading>>) -> Self {
            Self {
                readings: Mutex::new(readings),
            }
        }
    }

    impl LinkQualitySource for ScriptedLink {
        fn sample(&self, _device: &Device) -> Option<LinkReading> {
            let mut readings = self.readings.lock().unwrap();
            if readings.is_empty() {
                None
            } else {
                readings.remove(0)
            }
        }

        fn ping(&self, _device: &Device) -> u32 {
            120
        }
    }

    fn monitor_with(link: ScriptedLink) -> (DeviceMonitor, EventPublisher) {
        let events = EventPublisher::default();
        let monitor = DeviceMonitor::new(
            &CoreSettings::default().devices,
            85,
            Arc::new(link),
            events.clone(),
        );
        (monitor, events)
    }

    fn assert_signal_invariant(monitor: &DeviceMonitor) {
        for device in monitor.list_devices(None) {
            assert_eq!(
                device.signal_strength == 0,
                device.connectivity_state == ConnectivityState::Disconnected,
                "invariant broken for {:?}",
                device
            );
        }
    }

    #[test]
    fn test_reconnect_sets_nominal_signal() {
        let (monitor, _) = monitor_with(ScriptedLink::new(vec![]));
        let device = monitor.reconnect("D002").unwrap();
        assert_eq!(device.connectivity_state, ConnectivityState::Connected);
        assert_eq!(device.signal_strength, 85);

        let again = monitor.reconnect("D002").unwrap();
        assert_eq!(again, device);
        assert_signal_invariant(&monitor);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (monitor, events) = monitor_with(ScriptedLink::new(vec![]));
        let mut rx = events.subscribe();

        monitor.disconnect("D001").unwrap();
        let device = monitor.disconnect("D001").unwrap();
        assert_eq!(device.connectivity_state, ConnectivityState::Disconnected);
        assert_eq!(device.signal_strength, 0);

        assert!(matches!(rx.try_recv(), Ok(CoreEvent::DeviceChanged { .. })));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_device_errors() {
        let (monitor, _) = monitor_with(ScriptedLink::new(vec![]));
        assert_eq!(
            monitor.ping("D404"),
            Err(CoreError::UnknownDevice("D404".to_string()))
        );
        assert!(monitor.reconnect("D404").is_err());
        assert!(monitor.disconnect("D404").is_err());
    }

    #[test]
    fn test_ping_grades_latency() {
        let (monitor, _) = monitor_with(ScriptedLink::new(vec![]));
        let report = monitor.ping("D001").unwrap();
        assert_eq!(report.latency_ms, 120);
        assert_eq!(report.grade, LatencyGrade::Poor);
        assert_eq!(LatencyGrade::from_latency(20), LatencyGrade::Good);
        assert_eq!(LatencyGrade::from_latency(99), LatencyGrade::Fair);
    }

    #[test]
    fn test_sample_tick_applies_readings() {
        // Registry order is D001, D002, D003
        let (monitor, events) = monitor_with(ScriptedLink::new(vec![
            Some(LinkReading::disconnected()),
            Some(LinkReading::connected(64)),
            None,
        ]));
        let mut rx = events.subscribe();

        assert_eq!(monitor.sample_tick(), 2);

        let mut changed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CoreEvent::DeviceChanged { device } => changed.push(device),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(changed.len(), 2);
        assert_eq!(changed[0].id, "D001");
        assert_eq!(changed[0].connectivity_state, ConnectivityState::Disconnected);
        assert_eq!(changed[1].id, "D002");
        assert_eq!(changed[1].signal_strength, 64);

        assert_eq!(
            monitor.get("D001").unwrap().connectivity_state,
            ConnectivityState::Disconnected
        );
        assert_eq!(monitor.get("D002").unwrap().signal_strength, 64);
        assert_eq!(monitor.get("D003").unwrap().signal_strength, 76);
        assert_signal_invariant(&monitor);
    }

    #[test]
    fn test_readings_cannot_break_signal_invariant() {
        let (monitor, _) = monitor_with(ScriptedLink::new(vec![]));
        let device = monitor
            .set_link(
                "D001",
                LinkReading {
                    state: ConnectivityState::Unstable,
                    signal_strength: 0,
                },
            )
            .unwrap();
        assert_eq!(device.signal_strength, 1);

        let device = monitor
            .set_link(
                "D003",
                LinkReading {
                    state: ConnectivityState::Disconnected,
                    signal_strength: 55,
                },
            )
            .unwrap();
        assert_eq!(device.signal_strength, 0);
        assert_signal_invariant(&monitor);
    }

    #[test]
    fn test_aggregate_network_status_thresholds() {
        let (monitor, _) = monitor_with(ScriptedLink::new(vec![]));
        // (92 + 0 + 76) / 3 = 56
        assert_eq!(
            monitor.aggregate_network_status(),
            ConnectivityState::Unstable
        );

        monitor.reconnect("D002").unwrap();
        // (92 + 85 + 76) / 3 = 84.3
        assert_eq!(
            monitor.aggregate_network_status(),
            ConnectivityState::Connected
        );

        monitor.disconnect("D001").unwrap();
        monitor.disconnect("D003").unwrap();
        // 85 / 3 = 28.3
        assert_eq!(
            monitor.aggregate_network_status(),
            ConnectivityState::Disconnected
        );
    }

    #[test]
    fn test_aggregate_of_empty_registry() {
        let monitor = DeviceMonitor::new(
            &[],
            85,
            Arc::new(ScriptedLink::new(vec![])),
            EventPublisher::default(),
        );
        assert_eq!(
            monitor.aggregate_network_status(),
            ConnectivityState::Disconnected
        );
    }

    #[test]
    fn test_list_devices_filters_by_name_or_id() {
        let (monitor, _) = monitor_with(ScriptedLink::new(vec![]));
        assert_eq!(monitor.list_devices(None).len(), 3);
        assert_eq!(monitor.list_devices(Some("receiver")).len(), 3);
        let hits = monitor.list_devices(Some("d003"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "Receiver 3");
        assert!(monitor.list_devices(Some("printer")).is_empty());
    }
}
