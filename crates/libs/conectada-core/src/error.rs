use thiserror::Error;

/// Failures of the persistent local store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt value under {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("store lock poisoned")]
    Poisoned,
}

/// The request never produced an HTTP response.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    #[error("unreachable: {message}")]
    Unreachable { message: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl TransportError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }
}

/// Lifecycle and install failures of the background bridge.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("cannot {operation} while {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("install failed at {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a failed gateway call.
///
/// `Transport` means the server could not be reached and is the only variant
/// that may route a mutating call into the offline queue. `Status` means the
/// server answered and said no.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ApiError {
    #[error("could not reach server: {message}")]
    Transport { message: String },

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {message}")]
    Parse { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
        }
    }
}
