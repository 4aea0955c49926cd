use crate::bus::SubscriptionHandle;
use crate::engine::EngineState;
use thiserror::Error;

/// Conditions the positioning engine reports to its callers.
///
/// None of these are fatal: the engine is always left in a well-defined
/// [`EngineState`] after returning one.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The permission collaborator did not grant every required capability.
    #[error("required capabilities (location, bluetooth scan, bluetooth connect) were not granted")]
    PermissionDenied,

    /// The scanner failed to start or stop; the engine is `Failed` until `reset()`.
    #[error("beacon scanner unavailable: {reason}")]
    ScannerUnavailable { reason: String },

    /// A single raw event could not be decoded; only that event is dropped.
    #[error("failed to decode beacon event: {reason}")]
    DecodeFailure { reason: String },

    /// A subscriber callback returned an error or panicked.
    #[error("subscriber {subscription} failed: {reason}")]
    SubscriberFault {
        subscription: SubscriptionHandle,
        reason: String,
    },

    #[error("cannot {operation} while engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("engine has been destroyed")]
    Destroyed,
}

impl EngineError {
    /// Whether the caller may retry the failed operation (possibly after
    /// prompting the user or backing off).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::PermissionDenied | EngineError::ScannerUnavailable { .. }
        )
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        EngineError::DecodeFailure {
            reason: reason.into(),
        }
    }

    pub(crate) fn scanner(err: anyhow::Error) -> Self {
        EngineError::ScannerUnavailable {
            reason: format!("{:#}", err),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::PermissionDenied.is_recoverable());
        assert!(EngineError::ScannerUnavailable {
            reason: "adapter off".to_string()
        }
        .is_recoverable());
        assert!(!EngineError::decode("bad").is_recoverable());
        assert!(!EngineError::Destroyed.is_recoverable());
    }

    #[test]
    fn test_scanner_error_keeps_context() {
        let err = anyhow::anyhow!("radio off").context("Failed to start scan");
        let err = EngineError::scanner(err);
        assert_eq!(
            err.to_string(),
            "beacon scanner unavailable: Failed to start scan: radio off"
        );
    }
}
