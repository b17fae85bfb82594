//! # Nudge Core
//!
//! Shared vocabulary for the reminder engine: the domain model, the error
//! taxonomy, configuration, and the traits the engine is wired through.
//!
//! ```text
//! OneShotItem ─────────────┐
//! RecurringDefinition      ├─► DueItem ─► SendingNotification ─► Notifier
//!   └── PendingOccurrence ─┘
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NudgeConfig;
pub use error::{NudgeError, Result};
