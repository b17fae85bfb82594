//! Notifier sink trait.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::SendingNotification;

/// Outcome of a batch send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Source ids the sink refused, with the reason.
    pub rejected: Vec<(Uuid, String)>,
}

impl SendReport {
    pub fn reject(&mut self, source_id: Uuid, reason: impl Into<String>) {
        self.rejected.push((source_id, reason.into()));
    }

    pub fn is_rejected(&self, source_id: Uuid) -> bool {
        self.rejected.iter().any(|(id, _)| *id == source_id)
    }
}

/// Delivers notifications to the user.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Hand over a batch. `Err` means nothing in the batch was delivered;
    /// per-item refusals go into the report.
    async fn send(&self, batch: &[SendingNotification]) -> Result<SendReport>;

    /// Retract anything already queued for `source_id`, if the sink can.
    async fn cancel(&self, source_id: Uuid) -> Result<()>;
}
