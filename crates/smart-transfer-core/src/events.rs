// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Event publisher
//
// Engines publish while holding the lock of the entity that changed, so
// events for one entity reach subscribers in the order the changes happened.

use crate::audit::VerificationLogEntry;
use crate::devices::Device;
use crate::integrity::FileRecord;
use crate::transfers::TransferJob;
use crate::types::TransferState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the broadcast buffer per subscriber
pub const EVENT_BUFFER: usize = 256;

/// State-change notifications pushed to observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreEvent {
    /// A device's connectivity or signal changed
    DeviceChanged { device: Device },
    /// A new job was queued in the Pending state
    TransferEnqueued { job: TransferJob },
    /// An uploading job gained progress
    TransferProgress {
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "progressPct")]
        progress_pct: f64,
    },
    /// A job moved between lifecycle states
    TransferStateChanged {
        from: TransferState,
        job: TransferJob,
    },
    /// A delivered file entered the verification registry
    FileRegistered { record: FileRecord },
    /// One verification attempt finished
    FileVerified {
        record: FileRecord,
        entry: VerificationLogEntry,
    },
}

/// Fan-out of core events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}
