//! Test doubles shared by the engine and service tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{Notifier, SendReport};
use nudge_core::types::SendingNotification;
use uuid::Uuid;

/// Notifier that records what it was handed.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    batches: Mutex<Vec<Vec<SendingNotification>>>,
    cancelled: Mutex<Vec<Uuid>>,
    rejected: Mutex<HashSet<Uuid>>,
    fail_all: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl RecordingNotifier {
    pub fn batches(&self) -> Vec<Vec<SendingNotification>> {
        self.batches.lock().unwrap().clone()
    }

    /// Every notification accepted so far, in send order.
    pub fn sent(&self) -> Vec<SendingNotification> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn cancelled(&self) -> Vec<Uuid> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Refuse this source id on every send.
    pub fn reject(&self, source_id: Uuid) {
        self.rejected.lock().unwrap().insert(source_id);
    }

    /// Fail whole batches while set.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Make every send take this long before it reports.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Sends started, including ones still in flight.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, batch: &[SendingNotification]) -> Result<SendReport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(NudgeError::Channel("sink offline".into()));
        }

        let rejected = self.rejected.lock().unwrap().clone();
        let mut report = SendReport::default();
        let mut accepted = Vec::new();
        for notification in batch {
            if rejected.contains(&notification.source_id) {
                report.reject(notification.source_id, "refused");
            } else {
                accepted.push(notification.clone());
            }
        }
        if !accepted.is_empty() {
            self.batches.lock().unwrap().push(accepted);
        }
        Ok(report)
    }

    async fn cancel(&self, source_id: Uuid) -> Result<()> {
        self.cancelled.lock().unwrap().push(source_id);
        Ok(())
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub(crate) async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
