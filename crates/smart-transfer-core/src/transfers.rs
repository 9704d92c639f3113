// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Transfer engine
//
// Drives each job through Pending -> Uploading <-> Paused -> Completed, with
// Cancelled reachable from any non-terminal state. Every uploading job owns
// exactly one periodic task in the ticker registry, tagged with an epoch so a
// tick that was already waiting on the job table when the job paused can
// never advance it again.

use crate::devices::{Device, DeviceMonitor};
use crate::events::{CoreEvent, EventPublisher};
use crate::integrity::IntegrityVerifier;
use crate::sampling::TransferTransport;
use crate::scheduler::{Clock, TaskRegistry};
use crate::types::{
    ConnectivityState, CoreError, CoreResult, CoreSettings, TransferAction, TransferState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// One file upload to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJob {
    pub id: String,
    pub file_name: String,
    pub size_bytes: u64,
    /// Device chosen at start. Lookup key into the device registry.
    pub target_device_id: Option<String>,
    pub state: TransferState,
    pub progress_pct: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// File record handed to the verifier on completion
    pub file_record_id: Option<String>,
}

/// Result of a single progress tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Progress moved to the contained percentage
    Advanced(f64),
    /// The target device is unavailable or delivered nothing this tick
    Stalled,
    /// The job reached 100% and produced a file record
    Completed { file_record_id: String },
    /// The job is not uploading
    Idle,
}

/// Timing and admission rules of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPolicy {
    pub tick_period: Duration,
    pub max_increment_pct: f64,
    pub block_on_unstable: bool,
    pub max_file_size_bytes: Option<u64>,
}

impl TransferPolicy {
    pub fn from_settings(settings: &CoreSettings) -> Self {
        Self {
            tick_period: Duration::from_millis(settings.progress_tick_ms),
            max_increment_pct: settings.max_progress_increment_pct,
            block_on_unstable: settings.block_transfers_on_unstable,
            max_file_size_bytes: settings.max_file_size_bytes,
        }
    }
}

struct JobEntry {
    job: TransferJob,
    epoch: u64,
}

#[derive(Default)]
struct JobTable {
    entries: HashMap<String, JobEntry>,
    order: Vec<String>,
    next_epoch: u64,
}

struct EngineInner {
    jobs: Mutex<JobTable>,
    devices: DeviceMonitor,
    verifier: IntegrityVerifier,
    transport: Arc<dyn TransferTransport>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    tickers: TaskRegistry,
    policy: TransferPolicy,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.tickers.cancel_all();
    }
}

/// Owner of every transfer job
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        policy: TransferPolicy,
        devices: DeviceMonitor,
        verifier: IntegrityVerifier,
        transport: Arc<dyn TransferTransport>,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                jobs: Mutex::new(JobTable::default()),
                devices,
                verifier,
                transport,
                clock,
                events,
                tickers: TaskRegistry::new(),
                policy,
            }),
        }
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a file for transfer. Returns the new job id.
    pub fn enqueue(&self, file_name: &str, size_bytes: u64) -> CoreResult<String> {
        if let Some(limit_bytes) = self.inner.policy.max_file_size_bytes {
            if size_bytes > limit_bytes {
                return Err(CoreError::FileTooLarge {
                    name: file_name.to_string(),
                    size_bytes,
                    limit_bytes,
                });
            }
        }

        let job = TransferJob {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.to_string(),
            size_bytes,
            target_device_id: None,
            state: TransferState::Pending,
            progress_pct: 0.0,
            created_at: self.inner.clock.now(),
            started_at: None,
            completed_at: None,
            file_record_id: None,
        };
        let id = job.id.clone();

        let mut table = self.table();
        table.order.push(id.clone());
        table.entries.insert(
            id.clone(),
            JobEntry {
                job: job.clone(),
                epoch: 0,
            },
        );
        tracing::info!("Queued {} ({} bytes) as {}", file_name, size_bytes, id);
        self.inner.events.publish(CoreEvent::TransferEnqueued { job });

        Ok(id)
    }

    pub fn start(&self, job_id: &str, target_device_id: &str) -> CoreResult<TransferJob> {
        let mut table = self.table();
        let JobTable {
            entries,
            next_epoch,
            ..
        } = &mut *table;

        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
        let device = self.inner.devices.get(target_device_id)?;
        if entry.job.state != TransferState::Pending {
            return Err(invalid_state(&entry.job, TransferAction::Start));
        }
        self.ensure_available(&device)?;

        self.schedule(entry, next_epoch)?;
        entry.job.target_device_id = Some(device.id.clone());
        entry.job.started_at = Some(self.inner.clock.now());
        self.transition(entry, TransferState::Uploading);

        Ok(entry.job.clone())
    }

    pub fn pause(&self, job_id: &str) -> CoreResult<TransferJob> {
        let mut table = self.table();
        let entry = table
            .entries
            .get_mut(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
        if entry.job.state != TransferState::Uploading {
            return Err(invalid_state(&entry.job, TransferAction::Pause));
        }

        self.inner.tickers.cancel(job_id);
        self.transition(entry, TransferState::Paused);

        Ok(entry.job.clone())
    }

    pub fn resume(&self, job_id: &str) -> CoreResult<TransferJob> {
        let mut table = self.table();
        let JobTable {
            entries,
            next_epoch,
            ..
        } = &mut *table;

        let entry = entries
            .get_mut(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
        if entry.job.state != TransferState::Paused {
            return Err(invalid_state(&entry.job, TransferAction::Resume));
        }
        let device_id = entry
            .job
            .target_device_id
            .clone()
            .ok_or_else(|| CoreError::UnknownDevice(String::new()))?;
        let device = self.inner.devices.get(&device_id)?;
        self.ensure_available(&device)?;

        self.schedule(entry, next_epoch)?;
        self.transition(entry, TransferState::Uploading);

        Ok(entry.job.clone())
    }

    pub fn cancel(&self, job_id: &str) -> CoreResult<TransferJob> {
        let mut table = self.table();
        let entry = table
            .entries
            .get_mut(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
        if entry.job.state.is_terminal() {
            return Err(invalid_state(&entry.job, TransferAction::Cancel));
        }

        self.inner.tickers.cancel(job_id);
        self.transition(entry, TransferState::Cancelled);

        Ok(entry.job.clone())
    }

    /// Run one progress tick for `job_id` outside the periodic schedule
    pub fn advance(&self, job_id: &str) -> CoreResult<TickOutcome> {
        self.step(job_id, None)
    }

    pub fn get(&self, job_id: &str) -> CoreResult<TransferJob> {
        self.table()
            .entries
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))
    }

    /// Every job in enqueue order
    pub fn list_transfers(&self) -> Vec<TransferJob> {
        let table = self.table();
        table
            .order
            .iter()
            .filter_map(|id| table.entries.get(id))
            .map(|entry| entry.job.clone())
            .collect()
    }

    /// Whether a periodic task is currently advancing `job_id`
    pub fn is_advancing(&self, job_id: &str) -> bool {
        self.inner.tickers.is_active(job_id)
    }

    pub fn active_tickers(&self) -> usize {
        self.inner.tickers.active_count()
    }

    fn is_available(&self, device: &Device) -> bool {
        match device.connectivity_state {
            ConnectivityState::Connected => true,
            ConnectivityState::Unstable => !self.inner.policy.block_on_unstable,
            ConnectivityState::Disconnected => false,
        }
    }

    fn ensure_available(&self, device: &Device) -> CoreResult<()> {
        if self.is_available(device) {
            Ok(())
        } else {
            Err(CoreError::DeviceUnavailable {
                device_id: device.id.clone(),
                state: device.connectivity_state,
            })
        }
    }

    fn transition(&self, entry: &mut JobEntry, to: TransferState) {
        let from = entry.job.state;
        entry.job.state = to;
        tracing::info!("Transfer {} {} -> {}", entry.job.id, from, to);
        self.inner.events.publish(CoreEvent::TransferStateChanged {
            from,
            job: entry.job.clone(),
        });
    }

    /// Register the job's ticker under a fresh epoch. The job lock is held,
    /// so the first tick cannot observe the state before the caller's transition.
    fn schedule(&self, entry: &mut JobEntry, next_epoch: &mut u64) -> CoreResult<()> {
        let epoch = *next_epoch + 1;

        let weak = Arc::downgrade(&self.inner);
        let job_id = entry.job.id.clone();
        self.inner.tickers.spawn_periodic(
            job_id.clone(),
            self.inner.policy.tick_period,
            move || match weak.upgrade() {
                Some(inner) => TransferEngine { inner }.tick(&job_id, epoch),
                None => ControlFlow::Break(()),
            },
        )?;

        *next_epoch = epoch;
        entry.epoch = epoch;
        Ok(())
    }

    fn tick(&self, job_id: &str, epoch: u64) -> ControlFlow<()> {
        match self.step(job_id, Some(epoch)) {
            Ok(TickOutcome::Advanced(_)) | Ok(TickOutcome::Stalled) => ControlFlow::Continue(()),
            Ok(TickOutcome::Completed { .. }) | Ok(TickOutcome::Idle) | Err(_) => {
                ControlFlow::Break(())
            }
        }
    }

    fn step(&self, job_id: &str, epoch: Option<u64>) -> CoreResult<TickOutcome> {
        let mut table = self.table();
        let entry = table
            .entries
            .get_mut(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;

        if entry.job.state != TransferState::Uploading {
            return Ok(TickOutcome::Idle);
        }
        if epoch.is_some_and(|epoch| epoch != entry.epoch) {
            return Ok(TickOutcome::Idle);
        }

        let Some(device) = entry
            .job
            .target_device_id
            .as_deref()
            .and_then(|id| self.inner.devices.get(id).ok())
        else {
            return Ok(TickOutcome::Stalled);
        };
        if !self.is_available(&device) {
            tracing::debug!(
                "Transfer {} stalled, {} is {}",
                job_id,
                device.id,
                device.connectivity_state
            );
            return Ok(TickOutcome::Stalled);
        }

        let increment = self.inner.transport.advance(&entry.job, &device);
        if !(increment > 0.0) {
            return Ok(TickOutcome::Stalled);
        }
        let progress = entry.job.progress_pct + increment.min(self.inner.policy.max_increment_pct);

        if progress < 100.0 {
            entry.job.progress_pct = progress;
            self.inner.events.publish(CoreEvent::TransferProgress {
                job_id: job_id.to_string(),
                progress_pct: progress,
            });
            return Ok(TickOutcome::Advanced(progress));
        }

        entry.job.progress_pct = 100.0;
        entry.job.completed_at = Some(self.inner.clock.now());
        entry.job.state = TransferState::Completed;
        let record = self.inner.verifier.register_completed(&entry.job);
        entry.job.file_record_id = Some(record.id.clone());
        self.inner.tickers.cancel(job_id);

        tracing::info!(
            "Transfer {} completed, handed off as file {}",
            job_id,
            record.id
        );
        self.inner.events.publish(CoreEvent::TransferProgress {
            job_id: job_id.to_string(),
            progress_pct: 100.0,
        });
        self.inner.events.publish(CoreEvent::TransferStateChanged {
            from: TransferState::Uploading,
            job: entry.job.clone(),
        });

        Ok(TickOutcome::Completed {
            file_record_id: record.id,
        })
    }
}

fn invalid_state(job: &TransferJob, action: TransferAction) -> CoreError {
    CoreError::InvalidState {
        job_id: job.id.clone(),
        state: job.state,
        action,
    }
}
