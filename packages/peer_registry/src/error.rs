//! Error taxonomy for registry, orchestrator and router operations.

use crate::types::{ContactId, ProfileId};

/// Errors raised by the transport provider.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid identity material: {0}")]
    InvalidIdentity(String),

    #[error("invalid remote address: {0}")]
    InvalidAddress(String),

    #[error("failed to create endpoint: {0}")]
    Endpoint(String),

    #[error("failed to open stream: {0}")]
    Dial(String),

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the connection registry and message router.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Malformed input; never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("profile not found: {0}")]
    ProfileNotFound(ProfileId),

    #[error("{contact} not found for {profile}")]
    ContactNotFound {
        profile: ProfileId,
        contact: ContactId,
    },

    /// Endpoint creation or dial failure.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// Stream close/write failures reported back to the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::ProfileNotFound(_) => "profile_not_found",
            Self::ContactNotFound { .. } => "contact_not_found",
            Self::Transport(_) => "transport_failure",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ProfileNotFound(_) | Self::ContactNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(
            RegistryError::ProfileNotFound(ProfileId(1)).error_code(),
            "profile_not_found"
        );
        assert_eq!(
            RegistryError::BadRequest("x".into()).error_code(),
            "bad_request"
        );
        let err: RegistryError = TransportError::Dial("unreachable".into()).into();
        assert_eq!(err.error_code(), "transport_failure");
        assert_eq!(
            RegistryError::Internal("write failed".into()).error_code(),
            "internal_error"
        );
    }

    #[test]
    fn not_found_covers_both_levels() {
        assert!(RegistryError::ProfileNotFound(ProfileId(1)).is_not_found());
        assert!(
            RegistryError::ContactNotFound {
                profile: ProfileId(1),
                contact: ContactId(2),
            }
            .is_not_found()
        );
        assert!(!RegistryError::Internal("boom".into()).is_not_found());
    }

    #[test]
    fn display_names_both_ids() {
        let err = RegistryError::ContactNotFound {
            profile: ProfileId(1),
            contact: ContactId(9),
        };
        assert_eq!(err.to_string(), "contact-9 not found for profile-1");
    }
}
