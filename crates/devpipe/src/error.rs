//! Error taxonomy for launching and talking to the remote end.

use std::io;
use std::path::PathBuf;

/// Failure of a single call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CdpError {
    /// The transport was already closed when the call was made, or closed
    /// before a response arrived.
    #[error("{method}: transport has been already closed")]
    TransportClosed { method: String },

    /// The remote end answered with an error object.
    #[error("{method}: {message}")]
    Protocol {
        method: String,
        message: String,
        code: Option<i64>,
    },

    /// The request could not be encoded.
    #[error("{method}: failed to encode request: {reason}")]
    Encode { method: String, reason: String },

    /// The connection was torn down because the inbound stream stopped
    /// making sense.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("session {0:?} is already registered")]
    SessionExists(String),
}

impl CdpError {
    pub(crate) fn closed(method: &str) -> Self {
        Self::TransportClosed {
            method: method.to_string(),
        }
    }

    /// Method name of the call that failed, when the error belongs to one.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::TransportClosed { method }
            | Self::Protocol { method, .. }
            | Self::Encode { method, .. } => Some(method),
            Self::Dispatch(_) | Self::SessionExists(_) => None,
        }
    }
}

/// The inbound stream no longer matches what this client sent.
///
/// Ids are generated locally, so an unknown id means the two ends are out of
/// sync. Always fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("received response for unknown request id {id}")]
    UnmatchedResponse { id: u64 },

    #[error("received {} for unknown session {session_id:?}", .method.as_deref().unwrap_or("error"))]
    UnknownSession {
        session_id: String,
        method: Option<String>,
    },

    #[error("malformed message ({reason}): {frame}")]
    Malformed { reason: String, frame: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create debugging pipe: {0}")]
    Pipe(#[source] io::Error),

    #[error("{0} not captured")]
    MissingStdio(&'static str),

    #[error("failed to launch, exit code: {}", .exit_code.map_or_else(|| "none".to_string(), |code| code.to_string()))]
    EndpointNotFound { exit_code: Option<i32> },

    #[error("failed to open transport: {0}")]
    Transport(#[source] io::Error),
}
