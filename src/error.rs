use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by flag stores, the synchronizer and configuration.
///
/// | Variant | Kind | Recovered by the synchronizer |
/// |---|---|---|
/// | `Configuration` | configuration | no, fatal at construction |
/// | `Unreachable` | transport | yes |
/// | `UnexpectedStatus` | transport | yes |
/// | `MalformedSnapshot` | data | yes |
/// | `InvalidGate` | caller | n/a |
/// | `Storage` | local storage | no, always propagated |
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The remote could not be reached, including client-side timeouts.
    #[error("remote unreachable ({operation}): {message}")]
    Unreachable { operation: String, message: String },

    /// The remote answered with a non-success status.
    #[error("remote returned status {status} ({operation})")]
    UnexpectedStatus { operation: String, status: u16 },

    /// A payload could not be decoded into features, or broke a snapshot invariant.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    /// A write carried a gate value that can never be stored.
    #[error("invalid gate value: {0}")]
    InvalidGate(String),

    /// The local store failed to read or write.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn unreachable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True for failures on the remote side: unreachable, non-success response or malformed
    /// payload.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::UnexpectedStatus { .. } | Self::MalformedSnapshot(_)
        )
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedSnapshot(e.to_string())
    }
}
