//! Error taxonomy shared by the control core.
//!
//! Plumbing (config, database bootstrap) stays on `anyhow`; anything a
//! caller may need to tell apart is a `HubError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("actuator '{0}' not found")]
    ActuatorNotFound(String),

    #[error("rule {0} not found")]
    RuleNotFound(i64),

    #[error("invalid id '{0}'")]
    InvalidId(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("fertilizer pumps busy: {0}")]
    Busy(String),

    #[error("persistence failure: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

pub type Result<T, E = HubError> = std::result::Result<T, E>;

impl HubError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ActuatorNotFound(_) | Self::RuleNotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidId(_) | Self::Validation(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_distinguishable() {
        assert!(HubError::ActuatorNotFound("fan".into()).is_not_found());
        assert!(HubError::RuleNotFound(3).is_not_found());
        assert!(HubError::InvalidId("abc".into()).is_validation());
        assert!(HubError::validation("targetEC is required").is_validation());

        assert!(HubError::Busy("auto-dosing phase".into()).is_conflict());

        let p = HubError::from(anyhow::anyhow!("disk full"));
        assert!(!p.is_not_found());
        assert!(!p.is_validation());
        assert!(!p.is_conflict());
    }

    #[test]
    fn persistence_message_keeps_context_chain() {
        let inner = anyhow::anyhow!("locked").context("upsert_actuator failed");
        let msg = HubError::from(inner).to_string();
        assert!(msg.contains("upsert_actuator failed"), "{msg}");
        assert!(msg.contains("locked"), "{msg}");
    }
}
