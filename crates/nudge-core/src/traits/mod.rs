//! Seams between the engine and the outside world.

pub mod notifier;
pub mod random;
pub mod repository;

pub use notifier::{Notifier, SendReport};
pub use random::{RandomSource, SeededRandom, ThreadRandom};
pub use repository::{EventStore, Repository};
