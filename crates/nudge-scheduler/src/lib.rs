//! # Nudge Scheduler
//!
//! The notification engine: always knows the earliest moment something is
//! due, sleeps on one re-armable timer until then, dispatches everything due
//! in one batch, and lets writers pull the wake time earlier.
//!
//! ## Architecture
//! ```text
//! ReminderService (create/update/delete)
//!   └── update_with_time(t) ──► NotifierJob
//!                                 ├── nearest one-shot ─┐ joined
//!                                 ├── nearest occurrence┘ → arm timer
//!                                 └── on wake: due items → resolve params
//!                                       → Notifier::send → mark / regenerate
//! OccurrenceGenerator: randomized next send time for periodic definitions
//! ```

pub mod dispatch;
pub mod job;
pub mod occurrence;
pub mod persistence;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::ChannelNotifier;
pub use job::{JobConfig, NotifierJob};
pub use occurrence::{OccurrenceGenerator, day_beginning, needs_regeneration};
pub use persistence::SqliteRepository;
pub use service::ReminderService;
