//! Reminder CRUD flows. Every write that can create or advance a due time
//! hints the notifier job so it never oversleeps a fresh reminder.

use std::sync::Arc;

use chrono::Utc;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{EventStore, Notifier};
use nudge_core::types::{
    NotificationParams, OneShotItem, PendingOccurrence, RecurringDefinition, UserId,
};
use uuid::Uuid;

use crate::job::NotifierJob;
use crate::occurrence::{OccurrenceGenerator, needs_regeneration};

/// Owns reminder writes and keeps the engine informed.
pub struct ReminderService<S: EventStore + 'static> {
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    job: Arc<NotifierJob>,
    generator: OccurrenceGenerator,
}

impl<S: EventStore + 'static> ReminderService<S> {
    pub fn new(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        job: Arc<NotifierJob>,
        generator: OccurrenceGenerator,
    ) -> Self {
        Self {
            store,
            notifier,
            job,
            generator,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ── One-shot events ────────────────────────────────────

    pub async fn create_event(&self, item: OneShotItem) -> Result<OneShotItem> {
        check_text(&item.text)?;
        self.store.create_one_shot(&item).await?;
        tracing::info!("📅 Event added: '{}' at {} ({})", item.text, item.send_time, item.id);
        if !item.done {
            self.job.update_with_time(item.send_time).await;
        }
        Ok(item)
    }

    /// Overwrite an event. Moving its send time makes it due again.
    pub async fn update_event(&self, mut item: OneShotItem) -> Result<OneShotItem> {
        check_text(&item.text)?;
        let old = self.store.get_one_shot(item.id).await?;
        if item.send_time != old.send_time {
            item.notified = false;
        }
        self.store.update_one_shot(&item).await?;
        tracing::info!("✏️ Event updated: '{}' ({})", item.text, item.id);
        self.job.release(item.id);
        if !item.notified && !item.done {
            self.job.update_with_time(item.send_time).await;
        }
        Ok(item)
    }

    pub async fn mark_event_done(&self, id: Uuid) -> Result<()> {
        let mut item = self.store.get_one_shot(id).await?;
        item.done = true;
        self.store.update_one_shot(&item).await?;
        tracing::info!("✅ Event done: '{}' ({id})", item.text);
        self.cancel(id).await;
        Ok(())
    }

    pub async fn delete_event(&self, id: Uuid) -> Result<()> {
        self.store.delete_one_shot(id).await?;
        tracing::info!("🗑️ Event deleted: {id}");
        self.cancel(id).await;
        Ok(())
    }

    pub async fn list_events(&self, user_id: UserId) -> Result<Vec<OneShotItem>> {
        self.store.list_one_shots(user_id).await
    }

    // ── Periodic events ────────────────────────────────────

    /// Store a definition together with its first occurrence.
    pub async fn create_periodic(
        &self,
        definition: RecurringDefinition,
    ) -> Result<(RecurringDefinition, PendingOccurrence)> {
        definition.validate()?;
        let first = self.generator.next_occurrence(&definition, Utc::now())?;
        self.store.create_definition(&definition, &first).await?;
        tracing::info!(
            "🔁 Periodic event added: '{}', first at {} ({})",
            definition.text,
            first.send_time,
            definition.id
        );
        self.job.update_with_time(first.send_time).await;
        Ok((definition, first))
    }

    /// Update a definition. Schedule edits replace the pending occurrence;
    /// text edits keep it. Returns the occurrence now pending, if any.
    pub async fn update_periodic(
        &self,
        definition: RecurringDefinition,
    ) -> Result<Option<PendingOccurrence>> {
        definition.validate()?;
        let old = self.store.get_definition(definition.id).await?;

        if needs_regeneration(&old, &definition) {
            let next = self.generator.next_occurrence(&definition, Utc::now())?;
            self.store.update_definition(&definition, Some(&next)).await?;
            tracing::info!(
                "🔁 Periodic event rescheduled: '{}' now at {} ({})",
                definition.text,
                next.send_time,
                definition.id
            );
            self.job.update_with_time(next.send_time).await;
            Ok(Some(next))
        } else {
            self.store.update_definition(&definition, None).await?;
            tracing::info!(
                "✏️ Periodic event updated: '{}' ({})",
                definition.text,
                definition.id
            );
            match self.store.pending_occurrence(definition.id).await {
                Ok(pending) => Ok(Some(pending)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        }
    }

    pub async fn delete_periodic(&self, id: Uuid) -> Result<()> {
        self.store.delete_definition(id).await?;
        tracing::info!("🗑️ Periodic event deleted: {id}");
        self.cancel(id).await;
        Ok(())
    }

    pub async fn list_periodic(&self, user_id: UserId) -> Result<Vec<RecurringDefinition>> {
        self.store.list_definitions(user_id).await
    }

    pub async fn pending_occurrence(&self, definition_id: Uuid) -> Result<PendingOccurrence> {
        self.store.pending_occurrence(definition_id).await
    }

    // ── Settings ───────────────────────────────────────────

    /// Items held back for lack of params become deliverable right away.
    pub async fn set_default_params(
        &self,
        user_id: UserId,
        params: NotificationParams,
    ) -> Result<()> {
        self.store
            .set_default_notification_params(user_id, &params)
            .await?;
        tracing::info!("⚙️ Default channel of user {user_id}: {}", params.channel);
        self.job.release_held();
        self.job.update_with_time(Utc::now()).await;
        Ok(())
    }

    async fn cancel(&self, source_id: Uuid) {
        if let Err(e) = self.notifier.cancel(source_id).await {
            tracing::warn!("⚠️ Cancel of {source_id} failed: {e}");
        }
    }
}

fn check_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(NudgeError::BusinessLogic("text must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use crate::persistence::SqliteRepository;
    use crate::testing::{RecordingNotifier, wait_for};
    use chrono::TimeDelta;
    use nudge_core::traits::{Repository, SeededRandom};
    use nudge_core::types::{ChannelSelector, DAY};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        repo: Arc<SqliteRepository>,
        notifier: Arc<RecordingNotifier>,
        job: Arc<NotifierJob>,
        service: ReminderService<SqliteRepository>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let generator = OccurrenceGenerator::new(Arc::new(SeededRandom::new(7)));
        let job = Arc::new(NotifierJob::new(
            repo.clone(),
            notifier.clone(),
            generator.clone(),
            JobConfig::default(),
        ));
        let service = ReminderService::new(repo.clone(), notifier.clone(), job.clone(), generator);
        Fixture {
            repo,
            notifier,
            job,
            service,
        }
    }

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    #[tokio::test]
    async fn test_create_event_pulls_wake_earlier() {
        let f = fixture();
        let at = Utc::now() + TimeDelta::minutes(10);
        let item = f.service.create_event(OneShotItem::new(1, "dentist", at)).await.unwrap();

        assert!(f.job.next_wake_time() <= at);
        let listed = f.service.list_events(1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, item.id);
        assert_eq!(listed[0].text, "dentist");
    }

    #[tokio::test]
    async fn test_create_event_rejects_empty_text() {
        let f = fixture();
        let err = f
            .service
            .create_event(OneShotItem::new(1, "  ", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, NudgeError::BusinessLogic(_)));
        assert!(f.service.list_events(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_moving_notified_event_makes_it_due_again() {
        let f = fixture();
        let item = f
            .service
            .create_event(OneShotItem::new(1, "pay rent", Utc::now() - TimeDelta::minutes(1)))
            .await
            .unwrap();
        f.repo.mark_one_shot_notified(&[item.id]).await.unwrap();

        let mut renamed = f.repo.get_one_shot(item.id).await.unwrap();
        renamed.text = "pay rent now".into();
        let renamed = f.service.update_event(renamed).await.unwrap();
        assert!(renamed.notified);

        let mut moved = renamed.clone();
        moved.send_time = Utc::now() + TimeDelta::hours(1);
        let moved = f.service.update_event(moved).await.unwrap();
        assert!(!moved.notified);
        assert!(!f.repo.get_one_shot(item.id).await.unwrap().notified);
    }

    #[tokio::test]
    async fn test_update_missing_event_is_not_found() {
        let f = fixture();
        let err = f
            .service
            .update_event(OneShotItem::new(1, "ghost", Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_done_and_delete_cancel_at_the_sink() {
        let f = fixture();
        let past = Utc::now() - TimeDelta::minutes(1);
        let done = f.service.create_event(OneShotItem::new(1, "done", past)).await.unwrap();
        let gone = f.service.create_event(OneShotItem::new(1, "gone", past)).await.unwrap();

        f.service.mark_event_done(done.id).await.unwrap();
        f.service.delete_event(gone.id).await.unwrap();

        assert_eq!(f.notifier.cancelled(), vec![done.id, gone.id]);
        assert!(f.repo.due_one_shot_items(Utc::now()).await.unwrap().is_empty());
        assert!(f.repo.get_one_shot(gone.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_periodic_generates_first_occurrence() {
        let f = fixture();
        let def = RecurringDefinition::new(3, "stretch", hours(8), DAY, DAY);
        let (def, first) = f.service.create_periodic(def).await.unwrap();

        let expected =
            crate::occurrence::day_beginning(Utc::now() + TimeDelta::days(1)) + TimeDelta::hours(8);
        assert!((first.send_time - expected).num_days().abs() <= 1);
        assert_eq!(f.service.pending_occurrence(def.id).await.unwrap(), first);
        assert!(f.job.next_wake_time() <= first.send_time);
    }

    #[tokio::test]
    async fn test_invalid_periods_are_rejected() {
        let f = fixture();
        let inverted = RecurringDefinition::new(3, "broken", hours(8), DAY * 3, DAY);
        let err = f.service.create_periodic(inverted).await.unwrap_err();
        assert!(matches!(err, NudgeError::BusinessLogic(_)));
        assert!(f.service.list_periodic(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_edit_keeps_occurrence() {
        let f = fixture();
        let def = RecurringDefinition::new(3, "read", hours(21), DAY * 2, DAY * 5);
        let (def, first) = f.service.create_periodic(def).await.unwrap();

        let mut edited = def.clone();
        edited.text = "read a chapter".into();
        edited.description = "fiction".into();
        let pending = f.service.update_periodic(edited).await.unwrap();

        assert_eq!(pending, Some(first));
        assert_eq!(f.repo.get_definition(def.id).await.unwrap().text, "read a chapter");
    }

    #[tokio::test]
    async fn test_schedule_edit_regenerates_occurrence() {
        let f = fixture();
        let def = RecurringDefinition::new(3, "read", hours(21), DAY * 2, DAY * 5);
        let (def, first) = f.service.create_periodic(def).await.unwrap();

        let mut edited = def.clone();
        edited.day_offset = hours(6);
        let pending = f.service.update_periodic(edited).await.unwrap().unwrap();

        assert_ne!(pending.id, first.id);
        assert_eq!(
            pending.send_time - crate::occurrence::day_beginning(pending.send_time),
            TimeDelta::hours(6)
        );
        assert_eq!(f.service.pending_occurrence(def.id).await.unwrap(), pending);
    }

    #[tokio::test]
    async fn test_text_edit_without_outstanding_occurrence() {
        let f = fixture();
        let def = RecurringDefinition::new(3, "journal", hours(22), DAY, DAY);
        let (def, _) = f.service.create_periodic(def).await.unwrap();
        f.repo.discard_occurrence(def.id).unwrap();

        let mut edited = def.clone();
        edited.text = "journal, briefly".into();
        let pending = f.service.update_periodic(edited).await.unwrap();

        assert_eq!(pending, None);
        assert_eq!(f.repo.get_definition(def.id).await.unwrap().text, "journal, briefly");
    }

    #[tokio::test]
    async fn test_delete_periodic_drops_occurrence() {
        let f = fixture();
        let def = RecurringDefinition::new(3, "floss", hours(22), DAY, DAY);
        let (def, _) = f.service.create_periodic(def).await.unwrap();

        f.service.delete_periodic(def.id).await.unwrap();
        assert!(f.service.pending_occurrence(def.id).await.unwrap_err().is_not_found());
        assert_eq!(f.repo.nearest_occurrence_time().await.unwrap(), None);
        assert_eq!(f.notifier.cancelled(), vec![def.id]);
    }

    #[tokio::test]
    async fn test_set_default_params() {
        let f = fixture();
        let params = NotificationParams {
            period: hours(1),
            channel: ChannelSelector::Webhook {
                url: "https://hooks.example.com/nudge".into(),
            },
        };
        f.service.set_default_params(4, params.clone()).await.unwrap();
        assert_eq!(f.repo.default_notification_params(4).await.unwrap(), params);
    }

    #[tokio::test]
    async fn test_new_defaults_release_held_items() {
        let f = fixture();
        let item = f
            .service
            .create_event(OneShotItem::new(5, "call mum", Utc::now() - TimeDelta::seconds(1)))
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let handle = f.job.clone().spawn(shutdown.clone());

        // No defaults yet: the item is tried once, then held back.
        let held = wait_for(Duration::from_secs(2), || {
            f.job.next_wake_time() > Utc::now() + TimeDelta::seconds(5)
        });
        assert!(held.await);
        assert!(f.notifier.sent().is_empty());

        let params = NotificationParams {
            period: hours(1),
            channel: ChannelSelector::Telegram { chat_id: 5 },
        };
        f.service.set_default_params(5, params).await.unwrap();
        assert!(wait_for(Duration::from_secs(2), || f.notifier.sent().len() == 1).await);
        assert_eq!(f.notifier.sent()[0].source_id, item.id);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
