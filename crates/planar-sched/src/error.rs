//! Error handling for the dispatcher.

use thiserror::Error;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors that can occur while dispatching planes to a remote cluster.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The remote host rejected the supplied credentials.
    #[error("Authentication failed when connecting to {host}: {message}")]
    AuthenticationFailed { host: String, message: String },

    /// The host presented a key that differs from the one on record.
    #[error("Host key mismatch for {0}")]
    HostKeyMismatch(String),

    /// The host never became reachable within the retry budget.
    #[error("Could not connect to {host} after {attempts} attempts, giving up")]
    HostUnreachable { host: String, attempts: u32 },

    /// SSH or SFTP protocol error.
    #[error("SSH error: {0}")]
    Ssh(String),

    /// The remote path does not exist.
    #[error("Remote path not found: {0}")]
    RemoteNotFound(String),

    /// A remote shell command could not be executed.
    #[error("Remote command failed: {command} - {message}")]
    RemoteCommand { command: String, message: String },

    /// The batch scheduler refused the submission.
    #[error("Job submission failed for plane {plane}: {message}")]
    SubmitFailed { plane: u32, message: String },

    /// A plane folder name does not match `plane<digits>`.
    #[error("Invalid plane folder name: {0}")]
    InvalidPlaneFolder(String),

    /// Two plane folders name the same plane, e.g. `plane7` and `plane007`.
    #[error("Plane folders {first} and {second} both name plane {index}")]
    DuplicatePlaneIndex {
        index: u32,
        first: String,
        second: String,
    },

    /// A descriptor lacks a required key.
    #[error("Descriptor {path} is missing required key '{key}'")]
    MissingKey { path: String, key: String },

    /// A descriptor value has the wrong type for its key.
    #[error("Descriptor key '{key}' has an unexpected value: {message}")]
    InvalidValue { key: String, message: String },

    /// A local path is not below the root it is translated against.
    #[error("Path {path} is not below local root {root}")]
    PathOutsideRoot { path: String, root: String },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ssh2::Error> for DispatchError {
    fn from(e: ssh2::Error) -> Self {
        DispatchError::Ssh(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DispatchError {
    fn from(e: tokio::task::JoinError) -> Self {
        DispatchError::Internal(e.to_string())
    }
}
