// SPDX-License-Identifier: AGPL-3.0
// Smart Transfer Core - Clock and scheduled tasks
//
// Every periodic activity (device sampling, per-job progress, delayed
// verification) is a tokio task registered under the id of the entity it
// drives. Registering a key again replaces the previous task.

use crate::types::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Wall-clock source for timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cancellable tasks keyed by entity id
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until it breaks or the key is cancelled.
    ///
    /// The first call happens one full period after scheduling. Fails with
    /// `RuntimeUnavailable` when called outside a tokio runtime.
    pub fn spawn_periodic<F>(
        &self,
        key: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> CoreResult<()>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let runtime = current_runtime()?;
        self.insert(
            key.into(),
            runtime.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if tick().is_break() {
                        break;
                    }
                }
            }),
        );
        Ok(())
    }

    /// Run `task` once after `delay` unless the key is cancelled first
    pub fn spawn_delayed<Fut>(
        &self,
        key: impl Into<String>,
        delay: Duration,
        task: Fut,
    ) -> CoreResult<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runtime = current_runtime()?;
        self.insert(
            key.into(),
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                task.await;
            }),
        );
        Ok(())
    }

    fn insert(&self, key: String, handle: JoinHandle<()>) {
        let previous = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            // Tasks that ended on their own are forgotten here
            tasks.retain(|_, handle| !handle.is_finished());
            tasks.insert(key, handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Handles currently held, finished or not
    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Abort the task registered under `key`. Returns whether one was running.
    pub fn cancel(&self, key: &str) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        match handle {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                was_running
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    pub fn cancel_all(&self) {
        let drained: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, handle) in drained {
            handle.abort();
        }
    }
}

/// The runtime background tasks are spawned on
pub fn current_runtime() -> CoreResult<Handle> {
    Handle::try_current().map_err(|_| CoreError::RuntimeUnavailable)
}
