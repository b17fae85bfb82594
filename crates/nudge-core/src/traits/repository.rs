//! Persistence façade.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    DueOccurrence, NotificationParams, OneShotItem, PendingOccurrence, RecurringDefinition, UserId,
};

/// Queries the notification engine runs.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Earliest send time among one-shot items not yet notified (and not done).
    async fn nearest_one_shot_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.nearest_one_shot_time_skipping(&[]).await
    }

    /// Earliest send time among undispatched occurrences.
    async fn nearest_occurrence_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.nearest_occurrence_time_skipping(&[]).await
    }

    /// Like [`nearest_one_shot_time`](Self::nearest_one_shot_time), ignoring
    /// the items whose id is in `skip`.
    async fn nearest_one_shot_time_skipping(
        &self,
        skip: &[Uuid],
    ) -> Result<Option<DateTime<Utc>>>;

    /// Like [`nearest_occurrence_time`](Self::nearest_occurrence_time),
    /// ignoring the occurrences whose id is in `skip`.
    async fn nearest_occurrence_time_skipping(
        &self,
        skip: &[Uuid],
    ) -> Result<Option<DateTime<Utc>>>;

    /// One-shot items with `send_time <= till`, not notified, not done.
    async fn due_one_shot_items(&self, till: DateTime<Utc>) -> Result<Vec<OneShotItem>>;

    /// Undispatched occurrences with `send_time <= till`, joined with their definition.
    async fn due_occurrences(&self, till: DateTime<Utc>) -> Result<Vec<DueOccurrence>>;

    async fn mark_one_shot_notified(&self, ids: &[Uuid]) -> Result<()>;

    /// Atomically: mark `occurrence_id` dispatched, retire it, and persist `next`.
    async fn mark_occurrence_dispatched_and_regenerate(
        &self,
        occurrence_id: Uuid,
        next: PendingOccurrence,
    ) -> Result<()>;

    /// Fails with `NotFound` if the user never set defaults.
    async fn default_notification_params(&self, user_id: UserId) -> Result<NotificationParams>;
}

/// Writes the CRUD flows need on top of the engine queries.
#[async_trait]
pub trait EventStore: Repository {
    async fn create_one_shot(&self, item: &OneShotItem) -> Result<()>;
    async fn get_one_shot(&self, id: Uuid) -> Result<OneShotItem>;
    /// Overwrites every mutable field of an existing item.
    async fn update_one_shot(&self, item: &OneShotItem) -> Result<()>;
    async fn delete_one_shot(&self, id: Uuid) -> Result<()>;
    async fn list_one_shots(&self, user_id: UserId) -> Result<Vec<OneShotItem>>;

    /// Insert the definition together with its first occurrence.
    async fn create_definition(
        &self,
        definition: &RecurringDefinition,
        first: &PendingOccurrence,
    ) -> Result<()>;
    async fn get_definition(&self, id: Uuid) -> Result<RecurringDefinition>;
    /// Update the definition; when `replacement` is given, the pending
    /// occurrence is swapped for it in the same transaction.
    async fn update_definition(
        &self,
        definition: &RecurringDefinition,
        replacement: Option<&PendingOccurrence>,
    ) -> Result<()>;
    /// Delete the definition and its pending occurrence.
    async fn delete_definition(&self, id: Uuid) -> Result<()>;
    async fn list_definitions(&self, user_id: UserId) -> Result<Vec<RecurringDefinition>>;
    async fn pending_occurrence(&self, definition_id: Uuid) -> Result<PendingOccurrence>;

    async fn set_default_notification_params(
        &self,
        user_id: UserId,
        params: &NotificationParams,
    ) -> Result<()>;
}
