use thiserror::Error;

/// Unified failure taxonomy for the sync core. Everything except `Mapping`
/// is deferrable: the failed write is parked on the sync queue and replayed
/// by a later drain. A missing portal mapping will not fix itself by
/// retrying, so it surfaces to the caller immediately.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),
    #[error("cannot establish portal session: {0}")]
    Auth(String),
    #[error("portal rejected request: {message}")]
    Portal {
        message: String,
        status_code: Option<u16>,
        description: Option<String>,
    },
    #[error("no record found")]
    NotFound,
    #[error("unexpected portal response (http {0})")]
    Unexpected(u16),
    #[error("missing portal mapping: {0}")]
    Mapping(String),
    #[error("local store error: {0}")]
    LocalStore(String),
}

impl SyncError {
    /// Wrap a local-store failure crossing the orchestration boundary.
    pub fn local(err: impl std::fmt::Display) -> Self {
        SyncError::LocalStore(err.to_string())
    }

    pub fn is_deferrable(&self) -> bool {
        !matches!(self, SyncError::Mapping(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_the_only_hard_failure() {
        assert!(!SyncError::Mapping("unit 3".into()).is_deferrable());
        assert!(SyncError::Network("refused".into()).is_deferrable());
        assert!(SyncError::Auth("no email".into()).is_deferrable());
        assert!(SyncError::NotFound.is_deferrable());
        assert!(SyncError::LocalStore("locked".into()).is_deferrable());
    }
}
