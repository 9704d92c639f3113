// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Core Bridge
//
// Runs the CoreService inside one task and exposes it to front ends over
// channels. Commands carry their own reply sender; events are forwarded
// from the broadcast publisher onto a bounded async channel. Only progress
// ticks are ever dropped for a slow reader; every other event waits for room.

use crate::audit::VerificationLogEntry;
use crate::devices::{Device, PingReport};
use crate::events::CoreEvent;
use crate::integrity::{FileRecord, VerificationStats};
use crate::scheduler::current_runtime;
use crate::service::{CoreService, CoreSnapshot};
use crate::transfers::TransferJob;
use crate::types::{ConnectivityState, CoreError, CoreResult, VerificationState};
use async_channel::{Receiver, Sender, TrySendError};
use tokio::sync::broadcast;

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

/// Commands that can be sent to the core
#[derive(Debug)]
pub enum CoreCommand {
    EnqueueTransfer {
        file_name: String,
        size_bytes: u64,
        reply: Sender<CoreResult<String>>,
    },
    StartTransfer {
        job_id: String,
        device_id: String,
        reply: Sender<CoreResult<TransferJob>>,
    },
    PauseTransfer {
        job_id: String,
        reply: Sender<CoreResult<TransferJob>>,
    },
    ResumeTransfer {
        job_id: String,
        reply: Sender<CoreResult<TransferJob>>,
    },
    CancelTransfer {
        job_id: String,
        reply: Sender<CoreResult<TransferJob>>,
    },
    ListTransfers {
        reply: Sender<CoreResult<Vec<TransferJob>>>,
    },
    PingDevice {
        device_id: String,
        reply: Sender<CoreResult<PingReport>>,
    },
    ReconnectDevice {
        device_id: String,
        reply: Sender<CoreResult<Device>>,
    },
    DisconnectDevice {
        device_id: String,
        reply: Sender<CoreResult<Device>>,
    },
    ListDevices {
        query: Option<String>,
        reply: Sender<CoreResult<Vec<Device>>>,
    },
    GetNetworkStatus {
        reply: Sender<CoreResult<ConnectivityState>>,
    },
    VerifyFile {
        file_id: String,
        reply: Sender<CoreResult<FileRecord>>,
    },
    VerifyAllPending {
        reply: Sender<CoreResult<Vec<String>>>,
    },
    ListFileRecords {
        filter: Option<VerificationState>,
        query: Option<String>,
        reply: Sender<CoreResult<Vec<FileRecord>>>,
    },
    ListLogEntries {
        limit: usize,
        reply: Sender<CoreResult<Vec<VerificationLogEntry>>>,
    },
    GetVerificationStats {
        reply: Sender<CoreResult<VerificationStats>>,
    },
    GetSnapshot {
        reply: Sender<CoreResult<CoreSnapshot>>,
    },
    Shutdown {
        reply: Sender<CoreResult<()>>,
    },
}

/// Bridge between a front end and the core engines
pub struct CoreBridge {
    command_tx: Sender<CoreCommand>,
    event_rx: Receiver<CoreEvent>,
}

impl CoreBridge {
    /// Move `service` into a background task on the current tokio runtime
    pub fn new(service: CoreService) -> CoreResult<Self> {
        let runtime = current_runtime()?;
        let (command_tx, command_rx) = async_channel::bounded::<CoreCommand>(COMMAND_BUFFER);
        let (event_tx, event_rx) = async_channel::bounded::<CoreEvent>(EVENT_BUFFER);

        runtime.spawn(Self::run_core(service, command_rx, event_tx));

        Ok(Self {
            command_tx,
            event_rx,
        })
    }

    async fn run_core(
        service: CoreService,
        command_rx: Receiver<CoreCommand>,
        event_tx: Sender<CoreEvent>,
    ) {
        let mut core_events = service.subscribe();
        let mut forwarding = true;
        let mut shutdown_reply = None;

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Ok(CoreCommand::Shutdown { reply }) => {
                            shutdown_reply = Some(reply);
                            break;
                        }
                        Ok(cmd) => Self::handle(&service, cmd).await,
                        Err(_) => break, // All bridge handles dropped
                    }
                }
                event = core_events.recv(), if forwarding => {
                    match event {
                        Ok(event) => forwarding = Self::forward(&event_tx, event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Core bridge lagged, skipped {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => forwarding = false,
                    }
                }
            }
        }

        tracing::info!("Core bridge shutting down");
        command_rx.close();
        // Stops the sampler and every scheduled tick before acknowledging
        drop(service);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(Ok(())).await;
        }
    }

    /// Hand one event to the front end. Returns false once the receiver is gone.
    async fn forward(event_tx: &Sender<CoreEvent>, event: CoreEvent) -> bool {
        if let CoreEvent::TransferProgress { job_id, .. } = &event {
            // A later tick or the job's state change supersedes a dropped one
            let job_id = job_id.clone();
            return match event_tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Event receiver is full, dropping progress of {}", job_id);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            };
        }
        event_tx.send(event).await.is_ok()
    }

    async fn handle(service: &CoreService, cmd: CoreCommand) {
        match cmd {
            CoreCommand::EnqueueTransfer {
                file_name,
                size_bytes,
                reply,
            } => {
                let _ = reply
                    .send(service.transfers().enqueue(&file_name, size_bytes))
                    .await;
            }
            CoreCommand::StartTransfer {
                job_id,
                device_id,
                reply,
            } => {
                let _ = reply
                    .send(service.transfers().start(&job_id, &device_id))
                    .await;
            }
            CoreCommand::PauseTransfer { job_id, reply } => {
                let _ = reply.send(service.transfers().pause(&job_id)).await;
            }
            CoreCommand::ResumeTransfer { job_id, reply } => {
                let _ = reply.send(service.transfers().resume(&job_id)).await;
            }
            CoreCommand::CancelTransfer { job_id, reply } => {
                let _ = reply.send(service.transfers().cancel(&job_id)).await;
            }
            CoreCommand::ListTransfers { reply } => {
                let _ = reply.send(Ok(service.transfers().list_transfers())).await;
            }
            CoreCommand::PingDevice { device_id, reply } => {
                let _ = reply.send(service.devices().ping(&device_id)).await;
            }
            CoreCommand::ReconnectDevice { device_id, reply } => {
                let _ = reply.send(service.devices().reconnect(&device_id)).await;
            }
            CoreCommand::DisconnectDevice { device_id, reply } => {
                let _ = reply.send(service.devices().disconnect(&device_id)).await;
            }
            CoreCommand::ListDevices { query, reply } => {
                let devices = service.devices().list_devices(query.as_deref());
                let _ = reply.send(Ok(devices)).await;
            }
            CoreCommand::GetNetworkStatus { reply } => {
                let status = service.devices().aggregate_network_status();
                let _ = reply.send(Ok(status)).await;
            }
            CoreCommand::VerifyFile { file_id, reply } => {
                let _ = reply.send(service.verifier().verify(&file_id)).await;
            }
            CoreCommand::VerifyAllPending { reply } => {
                // The batch keeps running after the reply; its results arrive as events
                let file_ids = service
                    .verifier()
                    .verify_all()
                    .map(|batch| batch.file_ids().to_vec());
                let _ = reply.send(file_ids).await;
            }
            CoreCommand::ListFileRecords {
                filter,
                query,
                reply,
            } => {
                let records = service
                    .verifier()
                    .list_file_records(filter, query.as_deref());
                let _ = reply.send(Ok(records)).await;
            }
            CoreCommand::ListLogEntries { limit, reply } => {
                let entries = service.verifier().recent_log_entries(limit);
                let _ = reply.send(Ok(entries)).await;
            }
            CoreCommand::GetVerificationStats { reply } => {
                let _ = reply.send(Ok(service.verifier().stats())).await;
            }
            CoreCommand::GetSnapshot { reply } => {
                let _ = reply.send(Ok(service.snapshot())).await;
            }
            // Handled by the run loop
            CoreCommand::Shutdown { .. } => {}
        }
    }

    /// Send a command and wait for its reply
    async fn request<T>(
        &self,
        build: impl FnOnce(Sender<CoreResult<T>>) -> CoreCommand,
    ) -> CoreResult<T> {
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| CoreError::CoreStopped)?;
        reply_rx.recv().await.map_err(|_| CoreError::CoreStopped)?
    }

    pub async fn enqueue_transfer(&self, file_name: String, size_bytes: u64) -> CoreResult<String> {
        self.request(|reply| CoreCommand::EnqueueTransfer {
            file_name,
            size_bytes,
            reply,
        })
        .await
    }

    pub async fn start_transfer(&self, job_id: String, device_id: String) -> CoreResult<TransferJob> {
        self.request(|reply| CoreCommand::StartTransfer {
            job_id,
            device_id,
            reply,
        })
        .await
    }

    pub async fn pause_transfer(&self, job_id: String) -> CoreResult<TransferJob> {
        self.request(|reply| CoreCommand::PauseTransfer { job_id, reply })
            .await
    }

    pub async fn resume_transfer(&self, job_id: String) -> CoreResult<TransferJob> {
        self.request(|reply| CoreCommand::ResumeTransfer { job_id, reply })
            .await
    }

    pub async fn cancel_transfer(&self, job_id: String) -> CoreResult<TransferJob> {
        self.request(|reply| CoreCommand::CancelTransfer { job_id, reply })
            .await
    }

    pub async fn list_transfers(&self) -> CoreResult<Vec<TransferJob>> {
        self.request(|reply| CoreCommand::ListTransfers { reply })
            .await
    }

    pub async fn ping_device(&self, device_id: String) -> CoreResult<PingReport> {
        self.request(|reply| CoreCommand::PingDevice { device_id, reply })
            .await
    }

    pub async fn reconnect_device(&self, device_id: String) -> CoreResult<Device> {
        self.request(|reply| CoreCommand::ReconnectDevice { device_id, reply })
            .await
    }

    pub async fn disconnect_device(&self, device_id: String) -> CoreResult<Device> {
        self.request(|reply| CoreCommand::DisconnectDevice { device_id, reply })
            .await
    }

    pub async fn list_devices(&self, query: Option<String>) -> CoreResult<Vec<Device>> {
        self.request(|reply| CoreCommand::ListDevices { query, reply })
            .await
    }

    pub async fn get_aggregate_network_status(&self) -> CoreResult<ConnectivityState> {
        self.request(|reply| CoreCommand::GetNetworkStatus { reply })
            .await
    }

    pub async fn verify_file(&self, file_id: String) -> CoreResult<FileRecord> {
        self.request(|reply| CoreCommand::VerifyFile { file_id, reply })
            .await
    }

    /// Schedule verification of every Pending file. Returns the scheduled ids.
    pub async fn verify_all_pending(&self) -> CoreResult<Vec<String>> {
        self.request(|reply| CoreCommand::VerifyAllPending { reply })
            .await
    }

    /// File records, optionally by state and by a name or id substring
    pub async fn list_file_records(
        &self,
        filter: Option<VerificationState>,
        query: Option<String>,
    ) -> CoreResult<Vec<FileRecord>> {
        self.request(|reply| CoreCommand::ListFileRecords {
            filter,
            query,
            reply,
        })
        .await
    }

    pub async fn list_recent_log_entries(&self, limit: usize) -> CoreResult<Vec<VerificationLogEntry>> {
        self.request(|reply| CoreCommand::ListLogEntries { limit, reply })
            .await
    }

    pub async fn verification_stats(&self) -> CoreResult<VerificationStats> {
        self.request(|reply| CoreCommand::GetVerificationStats { reply })
            .await
    }

    pub async fn snapshot(&self) -> CoreResult<CoreSnapshot> {
        self.request(|reply| CoreCommand::GetSnapshot { reply })
            .await
    }

    /// Stop the core task. Later requests fail with `CoreStopped`.
    pub async fn shutdown(&self) -> CoreResult<()> {
        self.request(|reply| CoreCommand::Shutdown { reply })
            .await
    }

    /// Get a receiver for core events
    pub fn event_receiver(&self) -> Receiver<CoreEvent> {
        self.event_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{
        IntegrityCheck, LinkQualitySource, LinkReading, Strategies, TransferTransport,
    };
    use crate::scheduler::SystemClock;
    use crate::types::{CoreSettings, TransferState};
    use std::sync::Arc;
    use std::time::Duration;

    struct QuietLink;

    impl LinkQualitySource for QuietLink {
        fn sample(&self, _device: &Device) -> Option<LinkReading> {
            None
        }

        fn ping(&self, _device: &Device) -> u32 {
            25
        }
    }

    struct SteadyTransport(f64);

    impl TransferTransport for SteadyTransport {
        fn advance(&self, _job: &TransferJob, _device: &Device) -> f64 {
            self.0
        }
    }

    struct AlwaysIntact;

    impl IntegrityCheck for AlwaysIntact {
        fn check(&self, _record: &FileRecord) -> bool {
            true
        }
    }

    fn bridge() -> CoreBridge {
        let settings = CoreSettings {
            rng_seed: Some(11),
            ..CoreSettings::default()
        };
        CoreBridge::new(CoreService::new(settings).unwrap()).unwrap()
    }

    fn steady_bridge(increment: f64) -> CoreBridge {
        let strategies = Strategies {
            link: Arc::new(QuietLink),
            transport: Arc::new(SteadyTransport(increment)),
            integrity: Arc::new(AlwaysIntact),
        };
        let service = CoreService::with_strategies(
            CoreSettings::default(),
            strategies,
            Arc::new(SystemClock),
        )
        .unwrap();
        CoreBridge::new(service).unwrap()
    }

    #[test]
    fn test_bridge_needs_a_runtime() {
        let service = CoreService::new(CoreSettings::default()).unwrap();
        assert!(matches!(
            CoreBridge::new(service),
            Err(CoreError::RuntimeUnavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_reader_still_receives_lifecycle_events() {
        let bridge = steady_bridge(1.0);
        let events = bridge.event_receiver();

        let job_id = bridge
            .enqueue_transfer("dataset.tar".to_string(), 4096)
            .await
            .unwrap();
        bridge
            .start_transfer(job_id.clone(), "D001".to_string())
            .await
            .unwrap();

        // A hundred ticks overflow the event buffer while nobody reads
        tokio::time::sleep(Duration::from_secs(120)).await;

        let mut earlier = Vec::new();
        let completed = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event stream stalled")
                .unwrap();
            match event {
                CoreEvent::TransferStateChanged { job, .. }
                    if job.state == TransferState::Completed =>
                {
                    break job
                }
                other => earlier.push(other),
            }
        };

        assert_eq!(completed.id, job_id);
        assert!(earlier.len() >= EVENT_BUFFER);
        assert!(matches!(earlier[0], CoreEvent::TransferEnqueued { .. }));
        assert!(earlier
            .iter()
            .any(|e| matches!(e, CoreEvent::FileRegistered { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lists_file_records_by_query() {
        let bridge = steady_bridge(50.0);
        let events = bridge.event_receiver();
        let job_id = bridge
            .enqueue_transfer("Quarterly.xlsx".to_string(), 1024)
            .await
            .unwrap();
        bridge
            .start_transfer(job_id, "D003".to_string())
            .await
            .unwrap();
        while !matches!(
            events.recv().await.unwrap(),
            CoreEvent::TransferStateChanged { job, .. } if job.state == TransferState::Completed
        ) {}

        let found = bridge
            .list_file_records(None, Some("quarterly".to_string()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(bridge
            .list_file_records(Some(VerificationState::Verified), Some("quarterly".to_string()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_round_trips_commands() {
        let bridge = bridge();

        let devices = bridge.list_devices(None).await.unwrap();
        assert_eq!(devices.len(), 3);

        let job_id = bridge
            .enqueue_transfer("report.pdf".to_string(), 2048)
            .await
            .unwrap();
        let job = bridge
            .start_transfer(job_id.clone(), "D001".to_string())
            .await
            .unwrap();
        assert_eq!(job.state, TransferState::Uploading);

        let paused = bridge.pause_transfer(job_id).await.unwrap();
        assert_eq!(paused.state, TransferState::Paused);
    }

    #[tokio::test]
    async fn test_errors_cross_the_bridge() {
        let bridge = bridge();
        assert_eq!(
            bridge.ping_device("D999".to_string()).await.unwrap_err(),
            CoreError::UnknownDevice("D999".to_string())
        );
        assert!(matches!(
            bridge.resume_transfer("missing".to_string()).await,
            Err(CoreError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_forwards_events() {
        let bridge = bridge();
        let events = bridge.event_receiver();

        bridge.reconnect_device("D002".to_string()).await.unwrap();
        match events.recv().await.unwrap() {
            CoreEvent::DeviceChanged { device } => {
                assert_eq!(device.id, "D002");
                assert_eq!(device.signal_strength, 85);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_fail_after_shutdown() {
        let bridge = bridge();
        bridge.shutdown().await.unwrap();
        assert_eq!(
            bridge.list_transfers().await.unwrap_err(),
            CoreError::CoreStopped
        );
    }
}
