//! Randomized occurrence generation for periodic definitions.
//!
//! The next send time is `days` whole days after `now`, truncated to UTC
//! midnight, plus the definition's time of day. `days` is drawn uniformly
//! from `[min_days, max_days)`, or is exactly `min_days` when both agree.

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{RandomSource, ThreadRandom};
use nudge_core::types::{DAY, PendingOccurrence, RecurringDefinition};
use uuid::Uuid;

/// Computes the next pending occurrence of a definition.
#[derive(Clone)]
pub struct OccurrenceGenerator {
    random: Arc<dyn RandomSource>,
}

impl OccurrenceGenerator {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        Self { random }
    }

    pub fn next_occurrence(
        &self,
        definition: &RecurringDefinition,
        now: DateTime<Utc>,
    ) -> Result<PendingOccurrence> {
        let min_days = whole_days(definition.smallest_period);
        let max_days = whole_days(definition.biggest_period);
        if max_days < min_days {
            return Err(NudgeError::BusinessLogic(format!(
                "invalid period for '{}': {max_days} days is below {min_days} days",
                definition.id
            )));
        }

        let days = if min_days == max_days {
            min_days
        } else {
            min_days + self.random.uniform_int(0, max_days - min_days)
        };

        let offset = TimeDelta::from_std(definition.day_offset)
            .map_err(|e| NudgeError::BusinessLogic(format!("day offset out of range: {e}")))?;
        let send_time = now
            .checked_add_signed(TimeDelta::days(days))
            .map(day_beginning)
            .and_then(|day| day.checked_add_signed(offset))
            .ok_or_else(|| {
                NudgeError::BusinessLogic(format!("{days} days from {now} is out of range"))
            })?;

        tracing::debug!(
            "🎲 Next occurrence of '{}' in {days} day(s): {send_time}",
            definition.text
        );

        Ok(PendingOccurrence {
            id: Uuid::new_v4(),
            definition_id: definition.id,
            send_time,
            dispatched: false,
        })
    }
}

impl Default for OccurrenceGenerator {
    fn default() -> Self {
        Self::new(Arc::new(ThreadRandom))
    }
}

/// Midnight UTC of the day containing `t`.
pub fn day_beginning(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Whether an edit moves the schedule. Text and description edits do not.
pub fn needs_regeneration(old: &RecurringDefinition, updated: &RecurringDefinition) -> bool {
    old.day_offset != updated.day_offset
        || old.smallest_period != updated.smallest_period
        || old.biggest_period != updated.biggest_period
}

fn whole_days(period: std::time::Duration) -> i64 {
    (period.as_secs() / DAY.as_secs()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nudge_core::traits::SeededRandom;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Always picks the top of the range.
    struct HighestPick;

    impl RandomSource for HighestPick {
        fn uniform_int(&self, _lo: i64, hi: i64) -> i64 {
            hi - 1
        }
    }

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    fn days(n: i64) -> TimeDelta {
        TimeDelta::days(n)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 15, 30, 12).unwrap()
    }

    #[test]
    fn test_day_beginning() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(day_beginning(now()), expected);
        assert_eq!(day_beginning(expected), expected);
    }

    #[test]
    fn test_equal_periods_are_deterministic() {
        let generator = OccurrenceGenerator::new(Arc::new(SeededRandom::new(1)));
        let def = RecurringDefinition::new(1, "water plants", hours(9), DAY, DAY);
        let expected = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();

        for _ in 0..50 {
            let occ = generator.next_occurrence(&def, now()).unwrap();
            assert_eq!(occ.send_time, expected);
            assert_eq!(occ.definition_id, def.id);
            assert!(!occ.dispatched);
        }
    }

    #[test]
    fn test_inverted_periods_fail() {
        let generator = OccurrenceGenerator::default();
        let def = RecurringDefinition::new(1, "call mom", hours(18), DAY * 5, DAY * 2);
        let err = generator.next_occurrence(&def, now()).unwrap_err();
        assert!(matches!(err, NudgeError::BusinessLogic(_)));
    }

    #[test]
    fn test_random_send_time_stays_in_window() {
        let generator = OccurrenceGenerator::new(Arc::new(SeededRandom::new(2026)));
        let def = RecurringDefinition::new(1, "run", hours(7), DAY * 2, DAY * 7);
        let lower = day_beginning(now() + days(2));
        let upper = day_beginning(now() + days(7)) + TimeDelta::hours(7);

        let mut seen_days = HashSet::new();
        for _ in 0..1000 {
            let occ = generator.next_occurrence(&def, now()).unwrap();
            assert!(occ.send_time >= lower, "{} < {lower}", occ.send_time);
            assert!(occ.send_time <= upper, "{} > {upper}", occ.send_time);
            assert_eq!(occ.send_time - day_beginning(occ.send_time), TimeDelta::hours(7));
            seen_days.insert((day_beginning(occ.send_time) - day_beginning(now())).num_days());
        }
        // [2, 7) days, all drawn at least once
        assert_eq!(seen_days, (2..7).collect::<HashSet<i64>>());
    }

    #[test]
    fn test_random_pick_is_offset_from_smallest() {
        let generator = OccurrenceGenerator::new(Arc::new(HighestPick));
        let def = RecurringDefinition::new(1, "run", hours(7), DAY * 3, DAY * 10);
        let occ = generator.next_occurrence(&def, now()).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 10, 7, 0, 0).unwrap();
        assert_eq!(occ.send_time, expected);
    }

    #[test]
    fn test_partial_days_are_floored() {
        let generator = OccurrenceGenerator::new(Arc::new(HighestPick));
        let def = RecurringDefinition::new(1, "run", hours(6), DAY + hours(20), DAY + hours(23));
        let occ = generator.next_occurrence(&def, now()).unwrap();
        let expected = Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap();
        assert_eq!(occ.send_time, expected);
    }

    #[test]
    fn test_needs_regeneration() {
        let old = RecurringDefinition::new(1, "stretch", hours(10), DAY, DAY * 2);

        let mut text_only = old.clone();
        text_only.text = "stretch properly".into();
        text_only.description = "10 minutes".into();
        assert!(!needs_regeneration(&old, &text_only));

        let mut offset = old.clone();
        offset.day_offset = hours(11);
        assert!(needs_regeneration(&old, &offset));

        let mut smallest = old.clone();
        smallest.smallest_period = DAY * 2;
        assert!(needs_regeneration(&old, &smallest));

        let mut biggest = old.clone();
        biggest.biggest_period = DAY * 4;
        assert!(needs_regeneration(&old, &biggest));
    }
}
