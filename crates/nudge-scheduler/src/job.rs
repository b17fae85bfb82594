//! Notifier job — the engine loop that wakes exactly when something is due.
//!
//! One timer, re-armed from source truth after every wake. Writers call
//! [`NotifierJob::update_with_time`] to pull the wake earlier; nothing but the
//! job's own re-query can push it later.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nudge_core::config::SchedulerConfig;
use nudge_core::error::Result;
use nudge_core::traits::{Notifier, Repository};
use nudge_core::types::{
    DueItem, NotificationParams, RecurringDefinition, SendingNotification, UserId,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::occurrence::OccurrenceGenerator;

/// Longest single sleep; keeps instant arithmetic finite.
const MAX_SLEEP: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Engine timing.
#[derive(Debug, Clone, Copy)]
pub struct JobConfig {
    /// Fallback wake cadence, also the longest the job ever sleeps.
    pub check_period: Duration,
    /// How long an undelivered item is held back, and the floor after a
    /// failed due fetch.
    pub retry_delay: Duration,
}

impl From<&SchedulerConfig> for JobConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            check_period: config.check_period(),
            retry_delay: config.retry_delay(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

struct WakeState {
    next_wake: DateTime<Utc>,
    /// Re-arm tickets handed out so far.
    issued: u64,
    /// Ticket of the re-arm that last set `next_wake`.
    committed: u64,
    /// Earliest accepted hint and the last ticket issued before it. Re-arms
    /// holding such a ticket may have queried before the hinted write.
    earliest_hint: Option<(DateTime<Utc>, u64)>,
}

/// What one wake cycle achieved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Items delivered and marked processed.
    pub processed: usize,
    /// Items tried this cycle but left due (no params, sink refusal, failed
    /// commit). Each is held back for `retry_delay`.
    pub left_due: usize,
    /// Due items skipped because an earlier attempt still holds them back.
    pub held: usize,
    /// A due fetch failed, so the whole next wake backs off.
    pub fetch_failed: bool,
}

impl DispatchOutcome {
    pub fn needs_backoff(&self) -> bool {
        self.fetch_failed
    }
}

/// The notification scheduling engine.
pub struct NotifierJob {
    repo: Arc<dyn Repository>,
    notifier: Arc<dyn Notifier>,
    generator: OccurrenceGenerator,
    config: JobConfig,
    state: RwLock<WakeState>,
    /// The armed deadline. Written only under the state write lock.
    timer: watch::Sender<DateTime<Utc>>,
    /// Undelivered items (event or occurrence id) and when they may be retried.
    held: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl NotifierJob {
    pub fn new(
        repo: Arc<dyn Repository>,
        notifier: Arc<dyn Notifier>,
        generator: OccurrenceGenerator,
        config: JobConfig,
    ) -> Self {
        let (timer, _) = watch::channel(DateTime::<Utc>::MAX_UTC);
        Self {
            repo,
            notifier,
            generator,
            config,
            state: RwLock::new(WakeState {
                next_wake: DateTime::<Utc>::MAX_UTC,
                issued: 0,
                committed: 0,
                earliest_hint: None,
            }),
            timer,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Currently armed wake time.
    pub fn next_wake_time(&self) -> DateTime<Utc> {
        self.read_state().next_wake
    }

    /// Spawn [`run`](Self::run) as a background tokio task.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Blocking loop until `shutdown` fires. Run one loop per job.
    ///
    /// A dispatch already under way finishes before shutdown is noticed.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            "⏰ Notifier job started (fallback check every {}s)",
            self.config.check_period.as_secs()
        );

        let mut wake_rx = self.timer.subscribe();
        self.arm_next_wake(false).await;
        let sleep = tokio::time::sleep_until(instant_for(*wake_rx.borrow_and_update()));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    tracing::info!("⏹️ Notifier job stopped");
                    return;
                }
                changed = wake_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let at = *wake_rx.borrow_and_update();
                    sleep.as_mut().reset(instant_for(at));
                }
                () = &mut sleep => {
                    let outcome = self.dispatch_due().await;
                    self.arm_next_wake(outcome.needs_backoff()).await;
                }
            }
        }
    }

    /// Hint from a writer that something may now be due at `candidate`.
    ///
    /// Later than the armed time: no effect. Earlier: the timer is pulled to
    /// `candidate` at once and then re-armed from a fresh query.
    pub async fn update_with_time(&self, candidate: DateTime<Utc>) {
        if candidate >= self.read_state().next_wake {
            tracing::debug!("Hint {candidate} is not before the armed wake, ignored");
            return;
        }

        {
            let mut state = self.write_state();
            let earliest = state
                .earliest_hint
                .map_or(candidate, |(hint, _)| hint.min(candidate));
            state.earliest_hint = Some((earliest, state.issued));
            if candidate < state.next_wake {
                state.next_wake = candidate;
                self.timer.send_replace(candidate);
            }
        }

        tracing::debug!("⏩ Wake pulled to {candidate}");
        self.arm_next_wake(false).await;
    }

    /// Make every held-back item eligible on the next wake.
    pub fn release_held(&self) {
        self.held().clear();
    }

    /// Make one held-back event or occurrence eligible on the next wake.
    pub fn release(&self, id: Uuid) {
        self.held().remove(&id);
    }

    /// Re-query both sources and arm the timer for the nearest deadline.
    ///
    /// Held items are left out of the query; their earliest release time
    /// competes as a deadline of its own.
    async fn arm_next_wake(&self, back_off: bool) {
        let ticket = {
            let mut state = self.write_state();
            state.issued += 1;
            state.issued
        };
        let now = Utc::now();
        let (skip, release) = self.held_window(now);

        let (one_shot, occurrence) = tokio::join!(
            self.repo.nearest_one_shot_time_skipping(&skip),
            self.repo.nearest_occurrence_time_skipping(&skip)
        );

        let fallback = later(now, self.config.check_period);
        let mut candidate = [
            candidate_of("one-shot", one_shot),
            candidate_of("occurrence", occurrence),
            release,
        ]
        .into_iter()
        .flatten()
        .min()
        .map_or(fallback, |nearest| nearest.min(fallback));

        if back_off {
            candidate = candidate.max(later(now, self.config.retry_delay));
        }

        {
            let mut state = self.write_state();
            if ticket < state.committed {
                tracing::debug!("Re-arm {ticket} superseded by {}", state.committed);
                return;
            }
            if let Some((hint, issued_before)) = state.earliest_hint {
                if ticket <= issued_before {
                    // Our query may predate the hinted write.
                    candidate = candidate.min(hint);
                } else {
                    state.earliest_hint = None;
                }
            }
            state.committed = ticket;
            state.next_wake = candidate;
            self.timer.send_replace(candidate);
        }

        tracing::debug!(
            "⏰ Next wake at {candidate} (in {}s)",
            (candidate - now).num_seconds().max(0)
        );
    }

    /// Fetch everything due, send it as one batch, and mark what went out.
    async fn dispatch_due(&self) -> DispatchOutcome {
        let now = Utc::now();
        let (one_shots, occurrences) = tokio::join!(
            self.repo.due_one_shot_items(now),
            self.repo.due_occurrences(now)
        );

        let mut outcome = DispatchOutcome::default();
        let mut due = Vec::new();
        match one_shots {
            Ok(items) => due.extend(items.into_iter().map(DueItem::OneShot)),
            Err(e) => {
                tracing::warn!("⚠️ Failed to fetch due events: {e}");
                outcome.fetch_failed = true;
            }
        }
        match occurrences {
            Ok(items) => due.extend(items.into_iter().map(DueItem::Recurring)),
            Err(e) => {
                tracing::warn!("⚠️ Failed to fetch due occurrences: {e}");
                outcome.fetch_failed = true;
            }
        }

        if !outcome.fetch_failed {
            // Holds on items that are no longer due are dropped.
            let still_due: HashSet<Uuid> = due.iter().map(hold_key).collect();
            self.held().retain(|id, _| still_due.contains(id));
        }
        let total = due.len();
        let due = self.without_held(due, now);
        outcome.held = total - due.len();
        if due.is_empty() {
            tracing::debug!("Woke with nothing to send ({} held back)", outcome.held);
            return outcome;
        }

        let (ready, skipped) = self.resolve_params(due).await;
        let mut left: Vec<Uuid> = skipped.iter().map(hold_key).collect();

        if !ready.is_empty() {
            let batch: Vec<SendingNotification> =
                ready.iter().map(|(_, n)| n.clone()).collect();
            match self.notifier.send(&batch).await {
                Ok(report) => {
                    let (delivered, rejected): (Vec<DueItem>, Vec<DueItem>) = ready
                        .into_iter()
                        .map(|(item, _)| item)
                        .partition(|item| !report.is_rejected(item.source_id()));
                    left.extend(rejected.iter().map(hold_key));

                    let sent = delivered.len();
                    let failed = self.mark_processed(delivered, now).await;
                    outcome.processed = sent - failed.len();
                    left.extend(failed);
                }
                Err(e) => {
                    tracing::error!("❌ Notifier rejected a batch of {}: {e}", batch.len());
                    left.extend(ready.iter().map(|(item, _)| hold_key(item)));
                }
            }
        }

        outcome.left_due = left.len();
        self.hold(&left, now);
        tracing::info!(
            "📣 Dispatched {} reminder(s), {} held back for retry",
            outcome.processed,
            outcome.left_due
        );
        outcome
    }

    /// Pair each due item with its notification. Items without params come
    /// back in the second list.
    async fn resolve_params(
        &self,
        due: Vec<DueItem>,
    ) -> (Vec<(DueItem, SendingNotification)>, Vec<DueItem>) {
        let mut defaults: HashMap<UserId, Option<NotificationParams>> = HashMap::new();
        let mut ready = Vec::with_capacity(due.len());
        let mut skipped = Vec::new();

        for item in due {
            let params = match item.params_override() {
                Some(params) => Some(params.clone()),
                None => {
                    let user_id = item.user_id();
                    if !defaults.contains_key(&user_id) {
                        let fetched = self.default_params(user_id).await;
                        defaults.insert(user_id, fetched);
                    }
                    defaults.get(&user_id).cloned().flatten()
                }
            };

            match params {
                Some(params) => {
                    let notification = item.to_notification(params);
                    ready.push((item, notification));
                }
                None => {
                    tracing::warn!(
                        "⚠️ Skipping {} reminder {}: user {} has no notification params",
                        item.kind(),
                        item.source_id(),
                        item.user_id()
                    );
                    skipped.push(item);
                }
            }
        }
        (ready, skipped)
    }

    async fn default_params(&self, user_id: UserId) -> Option<NotificationParams> {
        match self.repo.default_notification_params(user_id).await {
            Ok(params) => Some(params),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                tracing::warn!("⚠️ Failed to load default params of user {user_id}: {e}");
                None
            }
        }
    }

    /// Mark delivered items processed. Returns the ids whose commit failed.
    async fn mark_processed(&self, delivered: Vec<DueItem>, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut failed = Vec::new();
        let mut one_shot_ids: Vec<Uuid> = Vec::new();

        for item in delivered {
            match item {
                DueItem::OneShot(event) => one_shot_ids.push(event.id),
                DueItem::Recurring(due) => {
                    let occurrence_id = due.occurrence.id;
                    if let Err(e) = self.regenerate(&due.definition, occurrence_id, now).await {
                        tracing::error!(
                            "❌ Failed to reschedule '{}' ({}): {e}",
                            due.definition.text,
                            due.definition.id
                        );
                        failed.push(occurrence_id);
                    }
                }
            }
        }

        if !one_shot_ids.is_empty() {
            if let Err(e) = self.repo.mark_one_shot_notified(&one_shot_ids).await {
                tracing::error!("❌ Failed to mark {} event(s) notified: {e}", one_shot_ids.len());
                failed.extend(one_shot_ids);
            }
        }
        failed
    }

    async fn regenerate(
        &self,
        definition: &RecurringDefinition,
        occurrence_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let next = self.generator.next_occurrence(definition, now)?;
        let send_time = next.send_time;
        self.repo
            .mark_occurrence_dispatched_and_regenerate(occurrence_id, next)
            .await?;
        tracing::info!("🔁 '{}' rescheduled for {send_time}", definition.text);
        Ok(())
    }

    /// Hold `ids` back until `now + retry_delay`.
    fn hold(&self, ids: &[Uuid], now: DateTime<Utc>) {
        if ids.is_empty() {
            return;
        }
        let retry_at = later(now, self.config.retry_delay);
        let mut held = self.held();
        for id in ids {
            held.insert(*id, retry_at);
        }
        tracing::debug!("⏳ {} item(s) held back until {retry_at}", ids.len());
    }

    /// Drops expired holds; returns the ids still held and the earliest release.
    fn held_window(&self, now: DateTime<Utc>) -> (Vec<Uuid>, Option<DateTime<Utc>>) {
        let mut held = self.held();
        held.retain(|_, retry_at| *retry_at > now);
        (held.keys().copied().collect(), held.values().min().copied())
    }

    fn without_held(&self, due: Vec<DueItem>, now: DateTime<Utc>) -> Vec<DueItem> {
        let held = self.held();
        due.into_iter()
            .filter(|item| held.get(&hold_key(item)).is_none_or(|at| *at <= now))
            .collect()
    }

    fn held(&self) -> MutexGuard<'_, HashMap<Uuid, DateTime<Utc>>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, WakeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, WakeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Key an undelivered item is held under: the event id, or the occurrence id
/// so a regenerated successor starts unheld.
fn hold_key(item: &DueItem) -> Uuid {
    match item {
        DueItem::OneShot(event) => event.id,
        DueItem::Recurring(due) => due.occurrence.id,
    }
}

fn candidate_of(
    source: &str,
    result: Result<Option<DateTime<Utc>>>,
) -> Option<DateTime<Utc>> {
    result.unwrap_or_else(|e| {
        tracing::warn!("⚠️ Nearest {source} lookup failed: {e}");
        None
    })
}

/// `now + d`, saturating at the last representable time.
fn later(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Tokio deadline for a wall-clock time; past times fire immediately.
fn instant_for(at: DateTime<Utc>) -> tokio::time::Instant {
    let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::Instant::now() + wait.min(MAX_SLEEP)
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}
