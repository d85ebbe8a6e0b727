use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a coordination backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The abort signal fired while waiting for the lock.
    #[error("lock acquisition aborted")]
    Aborted,

    #[error("lock already held")]
    LockHeld,

    #[error("lock not held")]
    LockNotHeld,

    #[error("lock in use")]
    LockInUse,

    /// The key exists but was not written by the lock recipe.
    #[error("existing key does not match lock use")]
    Conflict,

    #[error("session invalidated")]
    SessionInvalid,

    #[error("invalid lock options: {0}")]
    InvalidOptions(String),
}

/// Errors surfaced by the lock manager and the election engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend client could not be constructed.
    #[error("could not initialize backend client: {0}")]
    BackendUnavailable(#[source] BackendError),

    #[error("could not acquire lock {key}: {source}")]
    Acquisition {
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("lock {key} is already held")]
    AlreadyHeld { key: String },

    #[error("lock {key} not found")]
    NotFound { key: String },

    #[error("could not release lock {key}: {source}")]
    Release {
        key: String,
        #[source]
        source: BackendError,
    },

    #[error("election already started")]
    AlreadyStarted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn acquisition(key: &str, source: BackendError) -> Error {
        Error::Acquisition {
            key: key.to_owned(),
            source,
        }
    }

    pub(crate) fn release(key: &str, source: BackendError) -> Error {
        Error::Release {
            key: key.to_owned(),
            source,
        }
    }

    /// Whether trying the same operation again may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Acquisition { .. } | Error::AlreadyHeld { .. } | Error::Release { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::AlreadyHeld {
            key: "testlock".to_owned(),
        };
        assert_eq!(format!("{}", err), "lock testlock is already held");

        let err = Error::acquisition("testlock", BackendError::SessionInvalid);
        assert_eq!(
            format!("{}", err),
            "could not acquire lock testlock: session invalidated"
        );
    }

    #[test]
    fn test_error_source() {
        let err = Error::NotFound {
            key: "testlock".to_owned(),
        };
        assert!(err.source().is_none());

        let err = Error::release("testlock", BackendError::LockNotHeld);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::acquisition("k", BackendError::Aborted).is_recoverable());
        assert!(Error::AlreadyHeld { key: "k".into() }.is_recoverable());
        assert!(!Error::NotFound { key: "k".into() }.is_recoverable());
        assert!(!Error::BackendUnavailable(BackendError::InvalidOptions("x".into())).is_recoverable());
        assert!(!Error::AlreadyStarted.is_recoverable());
        assert!(!Error::InvalidConfig("wait time".into()).is_recoverable());
    }
}
