//! Per-component one-shot and periodic timers, delivered as `TimerTick`
//! signals on the owning component's signal side-channel.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use signal::SideSignal;
use tokio::task::JoinHandle;

type OwnerId = String;

struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Registry of named, per-component timers. One instance is shared
/// process-wide via [`crate::RuntimeServices`].
#[derive(Default)]
pub struct TimerService {
    timers: Mutex<HashMap<(OwnerId, String), TimerHandle>>,
}

impl TimerService {
    /// Creates an empty timer registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a timer for `owner`, firing after `delay_ms` and, if
    /// `interval_ms` is set, rescheduling from the last firing time every
    /// `interval_ms` thereafter. Re-registering the same `(owner, timer_id)`
    /// pair cancels the previous registration.
    pub fn add_timer(
        &self,
        owner: impl Into<String>,
        side_channel: flume::Sender<SideSignal>,
        delay_ms: u64,
        timer_id: impl Into<String>,
        interval_ms: Option<u64>,
        payload: Option<serde_yaml::Value>,
    ) {
        let owner = owner.into();
        let timer_id = timer_id.into();
        let cancelled = Arc::new(AtomicBool::new(false));
        let cancelled_task = cancelled.clone();
        let task_timer_id = timer_id.clone();

        let join = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            loop {
                if cancelled_task.load(Ordering::Acquire) {
                    return;
                }
                if side_channel
                    .send_async(SideSignal::Timer {
                        timer_id: task_timer_id.clone(),
                        payload: payload.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                match interval_ms {
                    Some(interval) => tokio::time::sleep(Duration::from_millis(interval)).await,
                    None => return,
                }
            }
        });

        let mut timers = self.timers.lock().expect("timer registry lock poisoned");
        if let Some(previous) = timers.insert((owner, timer_id), TimerHandle { cancelled, join }) {
            previous.cancelled.store(true, Ordering::Release);
            previous.join.abort();
        }
    }

    /// Cancels a previously registered timer. Race-safe: an
    /// already-enqueued-but-unconsumed tick may still be delivered and must
    /// be tolerated by the handler.
    pub fn cancel_timer(&self, owner: &str, timer_id: &str) {
        let mut timers = self.timers.lock().expect("timer registry lock poisoned");
        if let Some(handle) = timers.remove(&(owner.to_string(), timer_id.to_string())) {
            handle.cancelled.store(true, Ordering::Release);
            handle.join.abort();
        }
    }

    /// Purges every timer registered by `owner`, called when the owning
    /// component stops.
    pub fn purge(&self, owner: &str) {
        let mut timers = self.timers.lock().expect("timer registry lock poisoned");
        let keys: Vec<(OwnerId, String)> = timers.keys().filter(|(o, _)| o == owner).cloned().collect();
        for key in keys {
            if let Some(handle) = timers.remove(&key) {
                handle.cancelled.store(true, Ordering::Release);
                handle.join.abort();
            }
        }
    }
}
