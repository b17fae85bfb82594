//! Domain model — one-shot events, periodic definitions and their pending occurrence.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NudgeError;

/// Owner of events. Matches the chat user id of the messaging front-ends.
pub type UserId = i64;

/// One whole day.
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Where a notification is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelSelector {
    /// Telegram chat, via the Bot API `sendMessage`.
    Telegram { chat_id: i64 },
    /// HTTP webhook, POST with a JSON body.
    Webhook { url: String },
    /// Local command; the message is appended as the last argument.
    Command { program: String, args: Vec<String> },
}

impl fmt::Display for ChannelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelSelector::Telegram { chat_id } => write!(f, "telegram:{chat_id}"),
            ChannelSelector::Webhook { url } => write!(f, "webhook:{url}"),
            ChannelSelector::Command { program, args } => {
                write!(f, "command:{program}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for ChannelSelector {
    type Err = NudgeError;

    /// Parse the compact `kind:target` form, e.g. `telegram:12345`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, target) = s.split_once(':').ok_or_else(|| {
            NudgeError::BusinessLogic(format!("channel '{s}' must look like kind:target"))
        })?;
        let target = target.trim();
        if target.is_empty() {
            return Err(NudgeError::BusinessLogic(format!(
                "channel '{s}' has an empty target"
            )));
        }
        match kind.trim().to_lowercase().as_str() {
            "telegram" => {
                let chat_id = target.parse().map_err(|e| {
                    NudgeError::BusinessLogic(format!("bad telegram chat id '{target}': {e}"))
                })?;
                Ok(ChannelSelector::Telegram { chat_id })
            }
            "webhook" => Ok(ChannelSelector::Webhook {
                url: target.to_string(),
            }),
            "command" => {
                let mut parts = target.split_whitespace().map(String::from);
                // target is non-empty after trim, so there is a first word
                let program = parts.next().unwrap_or_default();
                Ok(ChannelSelector::Command {
                    program,
                    args: parts.collect(),
                })
            }
            other => Err(NudgeError::BusinessLogic(format!(
                "unknown channel kind '{other}'"
            ))),
        }
    }
}

/// How a user wants to be notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationParams {
    /// Cadence hint for channels that repeat a reminder. Passed through to the sink.
    pub period: Duration,
    pub channel: ChannelSelector,
}

/// A one-shot reminder ("basic event").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShotItem {
    pub id: Uuid,
    pub user_id: UserId,
    pub text: String,
    pub description: String,
    /// When the reminder becomes due.
    pub send_time: DateTime<Utc>,
    /// Item-level override of the user's default params.
    pub params: Option<NotificationParams>,
    /// Set by the engine once the reminder was handed to the sink.
    pub notified: bool,
    /// Set by the user. Done items are never dispatched.
    pub done: bool,
}

impl OneShotItem {
    pub fn new(user_id: UserId, text: &str, send_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            text: text.to_string(),
            description: String::new(),
            send_time,
            params: None,
            notified: false,
            done: false,
        }
    }
}

/// A periodic reminder definition.
///
/// Each occurrence lands `smallest_period..biggest_period` days after the
/// previous dispatch, at `day_offset` past midnight UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurringDefinition {
    pub id: Uuid,
    pub user_id: UserId,
    pub text: String,
    pub description: String,
    /// Time of day, as a duration since midnight.
    pub day_offset: Duration,
    pub smallest_period: Duration,
    pub biggest_period: Duration,
    pub params: Option<NotificationParams>,
}

impl RecurringDefinition {
    pub fn new(
        user_id: UserId,
        text: &str,
        day_offset: Duration,
        smallest_period: Duration,
        biggest_period: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            text: text.to_string(),
            description: String::new(),
            day_offset,
            smallest_period,
            biggest_period,
            params: None,
        }
    }

    /// Reject definitions the generator cannot schedule.
    pub fn validate(&self) -> crate::Result<()> {
        if self.text.trim().is_empty() {
            return Err(NudgeError::BusinessLogic("text must not be empty".into()));
        }
        if self.smallest_period < DAY {
            return Err(NudgeError::BusinessLogic(format!(
                "smallest period ({}s) is shorter than one day",
                self.smallest_period.as_secs()
            )));
        }
        if self.biggest_period < self.smallest_period {
            return Err(NudgeError::BusinessLogic(format!(
                "biggest period ({}s) is below smallest period ({}s)",
                self.biggest_period.as_secs(),
                self.smallest_period.as_secs()
            )));
        }
        if self.day_offset >= DAY {
            return Err(NudgeError::BusinessLogic(format!(
                "day offset {}s is not within one day",
                self.day_offset.as_secs()
            )));
        }
        Ok(())
    }
}

/// The single outstanding occurrence of a [`RecurringDefinition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOccurrence {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub send_time: DateTime<Utc>,
    pub dispatched: bool,
}

/// A due occurrence together with the definition it belongs to.
#[derive(Debug, Clone)]
pub struct DueOccurrence {
    pub occurrence: PendingOccurrence,
    pub definition: RecurringDefinition,
}

/// Source of a due item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    OneShot,
    Recurring,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::OneShot => write!(f, "one-shot"),
            SourceKind::Recurring => write!(f, "recurring"),
        }
    }
}

/// Anything the engine can find due.
#[derive(Debug, Clone)]
pub enum DueItem {
    OneShot(OneShotItem),
    Recurring(DueOccurrence),
}

impl DueItem {
    pub fn kind(&self) -> SourceKind {
        match self {
            DueItem::OneShot(_) => SourceKind::OneShot,
            DueItem::Recurring(_) => SourceKind::Recurring,
        }
    }

    /// Id the sink sees. For recurring items this is the definition id, so a
    /// later `cancel` by definition reaches it.
    pub fn source_id(&self) -> Uuid {
        match self {
            DueItem::OneShot(item) => item.id,
            DueItem::Recurring(due) => due.definition.id,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            DueItem::OneShot(item) => item.user_id,
            DueItem::Recurring(due) => due.definition.user_id,
        }
    }

    pub fn send_time(&self) -> DateTime<Utc> {
        match self {
            DueItem::OneShot(item) => item.send_time,
            DueItem::Recurring(due) => due.occurrence.send_time,
        }
    }

    pub fn params_override(&self) -> Option<&NotificationParams> {
        match self {
            DueItem::OneShot(item) => item.params.as_ref(),
            DueItem::Recurring(due) => due.definition.params.as_ref(),
        }
    }

    /// Build the sink payload once params are resolved.
    pub fn to_notification(&self, params: NotificationParams) -> SendingNotification {
        let (message, description) = match self {
            DueItem::OneShot(item) => (item.text.clone(), item.description.clone()),
            DueItem::Recurring(due) => (
                due.definition.text.clone(),
                due.definition.description.clone(),
            ),
        };
        SendingNotification {
            source_id: self.source_id(),
            user_id: self.user_id(),
            message,
            description,
            params,
            send_time: self.send_time(),
        }
    }
}

/// What the notifier sink receives. Carries no trace of its source kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingNotification {
    pub source_id: Uuid,
    pub user_id: UserId,
    pub message: String,
    pub description: String,
    pub params: NotificationParams,
    pub send_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hours(h: u64) -> Duration {
        Duration::from_secs(h * 3600)
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(
            "telegram:12345".parse::<ChannelSelector>().unwrap(),
            ChannelSelector::Telegram { chat_id: 12345 }
        );
        assert_eq!(
            "webhook:https://example.com/hook".parse::<ChannelSelector>().unwrap(),
            ChannelSelector::Webhook {
                url: "https://example.com/hook".into()
            }
        );
        assert_eq!(
            "command:notify-send --urgency=low"
                .parse::<ChannelSelector>()
                .unwrap(),
            ChannelSelector::Command {
                program: "notify-send".into(),
                args: vec!["--urgency=low".into()],
            }
        );
    }

    #[test]
    fn test_channel_parse_errors() {
        assert!("telegram".parse::<ChannelSelector>().is_err());
        assert!("telegram:abc".parse::<ChannelSelector>().is_err());
        assert!("pigeon:home".parse::<ChannelSelector>().is_err());
        assert!("webhook:  ".parse::<ChannelSelector>().is_err());
    }

    #[test]
    fn test_channel_display_roundtrips_through_parse() {
        let channel = ChannelSelector::Command {
            program: "notify-send".into(),
            args: vec!["-u".into(), "low".into()],
        };
        let text = channel.to_string();
        assert_eq!(text, "command:notify-send -u low");
        assert_eq!(text.parse::<ChannelSelector>().unwrap(), channel);
    }

    #[test]
    fn test_validate_periods() {
        let ok = RecurringDefinition::new(1, "water plants", hours(9), DAY, DAY * 3);
        assert!(ok.validate().is_ok());

        let inverted = RecurringDefinition::new(1, "water plants", hours(9), DAY * 3, DAY);
        let err = inverted.validate().unwrap_err();
        assert!(matches!(err, NudgeError::BusinessLogic(_)));

        let late = RecurringDefinition::new(1, "water plants", hours(25), DAY, DAY);
        assert!(late.validate().is_err());

        let blank = RecurringDefinition::new(1, "  ", hours(9), DAY, DAY);
        assert!(blank.validate().is_err());

        let sub_day = RecurringDefinition::new(1, "water plants", hours(9), hours(6), DAY);
        assert!(sub_day.validate().is_err());
    }

    #[test]
    fn test_due_item_recurring_uses_definition_identity() {
        let def = RecurringDefinition::new(42, "stretch", hours(10), DAY, DAY);
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let due = DueItem::Recurring(DueOccurrence {
            occurrence: PendingOccurrence {
                id: Uuid::new_v4(),
                definition_id: def.id,
                send_time: at,
                dispatched: false,
            },
            definition: def.clone(),
        });

        assert_eq!(due.kind(), SourceKind::Recurring);
        assert_eq!(due.source_id(), def.id);
        assert_eq!(due.user_id(), 42);
        assert_eq!(due.send_time(), at);
        assert!(due.params_override().is_none());

        let params = NotificationParams {
            period: hours(1),
            channel: ChannelSelector::Telegram { chat_id: 42 },
        };
        let n = due.to_notification(params.clone());
        assert_eq!(n.message, "stretch");
        assert_eq!(n.params, params);
        assert_eq!(n.source_id, def.id);
    }
}
