// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Integrity verifier
//
// Owns the registry of delivered files and the verification audit log.
// A Corrupted outcome is an observation about the file, never an error.

use crate::audit::{VerificationLog, VerificationLogEntry};
use crate::events::{CoreEvent, EventPublisher};
use crate::sampling::{seeded_rng, IntegrityCheck};
use crate::scheduler::{current_runtime, Clock, TaskRegistry};
use crate::transfers::TransferJob;
use crate::types::{CoreError, CoreResult, CoreSettings, VerificationState};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// SHA-256 digest recorded when a file is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest describing a completed transfer
    pub fn of_delivery(job: &TransferJob, delivered_at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(job.id.as_bytes());
        hasher.update(job.file_name.as_bytes());
        hasher.update(job.size_bytes.to_le_bytes());
        hasher.update(delivered_at.timestamp_micros().to_le_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_string()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&value).map_err(|e| format!("invalid hex digest: {}", e))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "digest must be 32 bytes".to_string())?;
        Ok(Self(bytes))
    }
}

/// A delivered file under verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    /// Transfer job that produced this file, if it came from the engine
    pub job_id: Option<String>,
    pub name: String,
    pub size_bytes: u64,
    pub content_hash: ContentHash,
    pub verification_state: VerificationState,
    pub retry_count: u32,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl FileRecord {
    fn matches(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.name.to_lowercase().contains(&query) || self.id.to_lowercase().contains(&query)
    }
}

/// Counts of records per verification state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationStats {
    pub total: usize,
    pub verified: usize,
    pub corrupted: usize,
    pub pending: usize,
}

/// Retention and retry behaviour of the verifier
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyPolicy {
    pub log_retention: usize,
    pub verify_all_jitter: Duration,
    pub auto_retry_corrupted: bool,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl VerifyPolicy {
    pub fn from_settings(settings: &CoreSettings) -> Self {
        Self {
            log_retention: settings.log_retention,
            verify_all_jitter: Duration::from_millis(settings.verify_all_jitter_ms),
            auto_retry_corrupted: settings.auto_retry_corrupted,
            max_attempts: settings.max_verify_attempts,
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }
}

struct VerifierState {
    records: Vec<FileRecord>,
    log: VerificationLog,
}

struct VerifierInner {
    state: Mutex<VerifierState>,
    check: Arc<dyn IntegrityCheck>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    retries: TaskRegistry,
    jitter_rng: Mutex<StdRng>,
    policy: VerifyPolicy,
}

impl Drop for VerifierInner {
    fn drop(&mut self) {
        self.retries.cancel_all();
    }
}

/// Registry of delivered files with an auditable verification history
#[derive(Clone)]
pub struct IntegrityVerifier {
    inner: Arc<VerifierInner>,
}

impl IntegrityVerifier {
    pub fn new(
        policy: VerifyPolicy,
        check: Arc<dyn IntegrityCheck>,
        clock: Arc<dyn Clock>,
        events: EventPublisher,
        rng_seed: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(VerifierInner {
                state: Mutex::new(VerifierState {
                    records: Vec::new(),
                    log: VerificationLog::new(policy.log_retention),
                }),
                check,
                clock,
                events,
                retries: TaskRegistry::new(),
                jitter_rng: Mutex::new(seeded_rng(rng_seed, 4)),
                policy,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, VerifierState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the Pending record for a job that just completed
    pub(crate) fn register_completed(&self, job: &TransferJob) -> FileRecord {
        let delivered_at = job.completed_at.unwrap_or_else(|| self.inner.clock.now());
        let hash = ContentHash::of_delivery(job, delivered_at);
        self.insert(Some(job.id.clone()), &job.file_name, job.size_bytes, hash)
    }

    /// Import an already delivered file for verification
    pub fn register_file(&self, name: &str, size_bytes: u64, content_hash: ContentHash) -> FileRecord {
        self.insert(None, name, size_bytes, content_hash)
    }

    fn insert(
        &self,
        job_id: Option<String>,
        name: &str,
        size_bytes: u64,
        content_hash: ContentHash,
    ) -> FileRecord {
        let record = FileRecord {
            id: Uuid::new_v4().to_string(),
            job_id,
            name: name.to_string(),
            size_bytes,
            content_hash,
            verification_state: VerificationState::Pending,
            retry_count: 0,
            last_verified_at: None,
            registered_at: self.inner.clock.now(),
        };

        let mut state = self.state();
        state.records.push(record.clone());
        tracing::info!("Registered file {} ({}) for verification", record.name, record.id);
        self.inner.events.publish(CoreEvent::FileRegistered {
            record: record.clone(),
        });
        record
    }

    /// One verification attempt against the stored digest
    pub fn verify(&self, file_id: &str) -> CoreResult<FileRecord> {
        let record = {
            let mut state = self.state();
            let index = state
                .records
                .iter()
                .position(|r| r.id == file_id)
                .ok_or_else(|| CoreError::UnknownFile(file_id.to_string()))?;

            let passed = self.inner.check.check(&state.records[index]);
            let now = self.inner.clock.now();

            let record = &mut state.records[index];
            record.verification_state = if passed {
                VerificationState::Verified
            } else {
                VerificationState::Corrupted
            };
            record.retry_count += 1;
            record.last_verified_at = Some(now);
            let record = record.clone();

            let entry = VerificationLogEntry {
                file_id: record.id.clone(),
                name: record.name.clone(),
                verification_state: record.verification_state,
                retry_count: record.retry_count,
                timestamp: now,
            };
            state.log.push(entry.clone());
            self.inner.events.publish(CoreEvent::FileVerified {
                record: record.clone(),
                entry,
            });
            record
        };

        match record.verification_state {
            VerificationState::Verified => {
                tracing::info!("{} verified on attempt {}", record.name, record.retry_count);
                self.inner.retries.cancel(&record.id);
            }
            _ => {
                tracing::warn!(
                    "{} detected as corrupted on attempt {}",
                    record.name,
                    record.retry_count
                );
                self.schedule_retry(&record);
            }
        }

        Ok(record)
    }

    fn schedule_retry(&self, record: &FileRecord) {
        let policy = &self.inner.policy;
        if !policy.auto_retry_corrupted || record.retry_count >= policy.max_attempts {
            return;
        }
        let weak: Weak<VerifierInner> = Arc::downgrade(&self.inner);
        let file_id = record.id.clone();
        let scheduled = self
            .inner
            .retries
            .spawn_delayed(record.id.clone(), policy.retry_delay, async move {
                if let Some(inner) = weak.upgrade() {
                    let verifier = IntegrityVerifier { inner };
                    if let Err(e) = verifier.verify(&file_id) {
                        tracing::error!("Automatic retry failed: {}", e);
                    }
                }
            });
        match scheduled {
            Ok(()) => tracing::debug!("Retrying {} in {:?}", record.id, policy.retry_delay),
            Err(e) => tracing::warn!("Automatic retry of {} not scheduled: {}", record.id, e),
        }
    }

    /// Whether an automatic retry is waiting for this file
    pub fn retry_pending(&self, file_id: &str) -> bool {
        self.inner.retries.is_active(file_id)
    }

    /// Schedule an independent attempt for every Pending record.
    /// Fails with `RuntimeUnavailable` outside a tokio runtime.
    pub fn verify_all(&self) -> CoreResult<VerifyBatch> {
        let runtime = current_runtime()?;
        let file_ids: Vec<String> = self
            .state()
            .records
            .iter()
            .filter(|r| r.verification_state == VerificationState::Pending)
            .map(|r| r.id.clone())
            .collect();
        tracing::info!("Verifying {} pending files", file_ids.len());

        let handles = file_ids
            .iter()
            .map(|file_id| {
                let delay = self.jitter();
                let verifier = self.clone();
                let file_id = file_id.clone();
                runtime.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    verifier.verify(&file_id)
                })
            })
            .collect();

        Ok(VerifyBatch { file_ids, handles })
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.inner.policy.verify_all_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let ms = self
            .inner
            .jitter_rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0..=max_ms);
        Duration::from_millis(ms)
    }

    pub fn get(&self, file_id: &str) -> CoreResult<FileRecord> {
        self.state()
            .records
            .iter()
            .find(|r| r.id == file_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownFile(file_id.to_string()))
    }

    /// Records in registration order, optionally restricted to one state and
    /// to names or ids containing `query` (case-insensitive)
    pub fn list_file_records(
        &self,
        filter: Option<VerificationState>,
        query: Option<&str>,
    ) -> Vec<FileRecord> {
        self.state()
            .records
            .iter()
            .filter(|r| filter.map_or(true, |state| r.verification_state == state))
            .filter(|r| query.map_or(true, |q| r.matches(q)))
            .cloned()
            .collect()
    }

    /// Up to `limit` log entries, most recent first
    pub fn recent_log_entries(&self, limit: usize) -> Vec<VerificationLogEntry> {
        self.state().log.recent(limit)
    }

    /// Number of attempts ever logged, including evicted entries
    pub fn total_attempts(&self) -> u64 {
        self.state().log.total_appended()
    }

    pub fn stats(&self) -> VerificationStats {
        let state = self.state();
        let mut stats = VerificationStats {
            total: state.records.len(),
            ..VerificationStats::default()
        };
        for record in &state.records {
            match record.verification_state {
                VerificationState::Pending => stats.pending += 1,
                VerificationState::Verified => stats.verified += 1,
                VerificationState::Corrupted => stats.corrupted += 1,
            }
        }
        stats
    }
}

/// Attempts scheduled by a verify-all. Dropping the batch lets them run on.
pub struct VerifyBatch {
    file_ids: Vec<String>,
    handles: Vec<JoinHandle<CoreResult<FileRecord>>>,
}

impl VerifyBatch {
    pub fn file_ids(&self) -> &[String] {
        &self.file_ids
    }

    pub fn len(&self) -> usize {
        self.file_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }

    /// Stop attempts that have not run yet
    pub fn abort(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }

    /// Wait for every attempt and collect the records they produced
    pub async fn join(self) -> Vec<FileRecord> {
        let mut records = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            match handle.await {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => tracing::warn!("Batch verification failed: {}", e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::error!("Batch verification task panicked: {}", e),
            }
        }
        records
    }
}
