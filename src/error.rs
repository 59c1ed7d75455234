//! Cross-component error classification.
//!
//! Each component owns its own error enum; this module only provides the
//! shared taxonomy callers use to decide whether to retry.

use std::fmt;

/// Coarse failure class shared by every component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input rejected before any resource was touched.
    Validation,
    /// A session died inside its startup grace window.
    CreationFailure,
    /// Lock or deadline contention; the same call may succeed later.
    TransientContention,
    /// The target vanished; re-resolve it before trying again.
    DeadResource,
    /// A teardown step failed; the whole sequence is safe to re-run.
    PartialCleanup,
    /// A collaborator process failed or timed out.
    Collaborator,
    /// The caller asked us to stop.
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::TransientContention | ErrorClass::PartialCleanup | ErrorClass::Collaborator
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::CreationFailure => "creation-failure",
            ErrorClass::TransientContention => "contention",
            ErrorClass::DeadResource => "dead-resource",
            ErrorClass::PartialCleanup => "partial-cleanup",
            ErrorClass::Collaborator => "collaborator",
            ErrorClass::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(ErrorClass::TransientContention.is_retryable());
        assert!(ErrorClass::PartialCleanup.is_retryable());
        assert!(ErrorClass::Collaborator.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::DeadResource.is_retryable());
        assert!(!ErrorClass::CreationFailure.is_retryable());
        assert!(!ErrorClass::Cancelled.is_retryable());
    }

    #[test]
    fn labels_are_kebab_case() {
        assert_eq!(ErrorClass::TransientContention.to_string(), "contention");
        assert_eq!(ErrorClass::DeadResource.to_string(), "dead-resource");
    }
}
