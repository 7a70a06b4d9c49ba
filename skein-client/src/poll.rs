//! Periodic re-reads for monitors.

use crate::lock;
use skein_core::MonitorId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Shortest period a poll task runs at.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Why a monitor is being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    /// The monitor asked to poll regardless of push health.
    Forced,
    /// Push is unhealthy; stops once push is restored.
    PushFallback,
}

struct PollTask {
    reason: PollReason,
    interval: Duration,
    handle: JoinHandle<()>,
}

/// One polling task per monitor.
pub struct PollScheduler {
    tasks: Mutex<HashMap<MonitorId, PollTask>>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling `id` every `period`, replacing any existing task.
    ///
    /// The first tick fires one period from now. The task ends when `tick`
    /// returns false. A zero period is raised to [`MIN_PERIOD`].
    pub fn start<F, Fut>(&self, id: MonitorId, period: Duration, reason: PollReason, tick: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if !tick().await {
                    tracing::debug!(monitor_id = id, "Poll task finished");
                    break;
                }
            }
        });

        let previous = lock(&self.tasks).insert(
            id,
            PollTask {
                reason,
                interval: period,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        tracing::debug!(
            monitor_id = id,
            interval_ms = period.as_millis() as u64,
            ?reason,
            "Polling started"
        );
    }

    /// Returns false when `id` was not polling.
    pub fn stop(&self, id: MonitorId) -> bool {
        match lock(&self.tasks).remove(&id) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every task started for `reason`; returns the affected monitors.
    pub fn stop_reason(&self, reason: PollReason) -> Vec<MonitorId> {
        let mut tasks = lock(&self.tasks);
        let ids: Vec<MonitorId> = tasks
            .iter()
            .filter(|(_, task)| task.reason == reason)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(task) = tasks.remove(id) {
                task.handle.abort();
            }
        }
        ids
    }

    pub fn stop_all(&self) {
        for (_, task) in lock(&self.tasks).drain() {
            task.handle.abort();
        }
    }

    pub fn is_polling(&self, id: MonitorId) -> bool {
        lock(&self.tasks).contains_key(&id)
    }

    pub fn reason(&self, id: MonitorId) -> Option<PollReason> {
        lock(&self.tasks).get(&id).map(|task| task.reason)
    }

    pub fn interval(&self, id: MonitorId) -> Option<Duration> {
        lock(&self.tasks).get(&id).map(|task| task.interval)
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
