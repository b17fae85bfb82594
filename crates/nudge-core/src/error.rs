//! Error taxonomy shared by every Nudge crate.

use thiserror::Error;

/// Nudge error type.
#[derive(Debug, Error)]
pub enum NudgeError {
    /// Lookup found nothing. Expected; callers usually treat it as "no value".
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request violates a domain rule (e.g. biggest period below smallest).
    #[error("Invalid request: {0}")]
    BusinessLogic(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NudgeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, NudgeError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, NudgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(NudgeError::NotFound("user 7".into()).is_not_found());
        assert!(!NudgeError::Storage("disk full".into()).is_not_found());
    }

    #[test]
    fn test_display() {
        let err = NudgeError::BusinessLogic("biggest period is below smallest".into());
        assert_eq!(
            err.to_string(),
            "Invalid request: biggest period is below smallest"
        );
    }
}
