use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    /// HTTP 401. The API key is missing or wrong; retrying will not help.
    #[error("authentication failed (invalid or missing API key)")]
    Auth,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("command rejected by controller: {0}")]
    Rejected(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown zone: {0}")]
    UnknownZone(String),

    #[error("invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("no firmware update available")]
    NoUpdateAvailable,

    #[error("a firmware update is already being installed")]
    UpdateInProgress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth)
    }

    /// Transport-class failures: retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Timeout | Error::Status(_) | Error::Malformed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_not_transient() {
        assert!(Error::Auth.is_auth());
        assert!(!Error::Auth.is_transient());
    }

    #[test]
    fn transport_class_errors_are_transient() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::Status(500).is_transient());
        assert!(Error::Malformed("list".into()).is_transient());
        assert!(!Error::Rejected("busy".into()).is_transient());
    }

    #[test]
    fn display_includes_status() {
        assert_eq!(Error::Status(503).to_string(), "unexpected HTTP status 503");
    }
}
