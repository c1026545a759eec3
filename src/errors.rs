use thiserror::Error;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Session is not connected")]
    NotConnected,
    #[error("Host {0} is not directly reachable; a proxy is required")]
    ProxyRequired(String),
    #[error("Previous teardown did not finish within {0:?}")]
    TeardownStalled(std::time::Duration),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Session has been disposed")]
    Disposed,
}

impl WatchError {
    /// Whether the reconnection policy may retry after this error. Variants that
    /// carry free-form server text are further refined by the provider's
    /// classifier.
    pub fn is_retryable(&self) -> bool {
        match self {
            WatchError::Config(_)
            | WatchError::Auth(_)
            | WatchError::ProxyRequired(_)
            | WatchError::Unsupported(_)
            | WatchError::TeardownStalled(_)
            | WatchError::Disposed => false,
            WatchError::Network(_)
            | WatchError::Timeout(_)
            | WatchError::Protocol(_)
            | WatchError::NotConnected => true,
        }
    }
}

impl From<std::io::Error> for WatchError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            WatchError::Timeout(err.to_string())
        } else {
            WatchError::Network(err.to_string())
        }
    }
}
