//! Error types shared across the coordinator, clients and workers.
//!
//! Transport and routing failures are typed so callers can tell them apart;
//! the process edges wrap them in `anyhow`.

use thiserror::Error;

/// Failures of a [`crate::connection::ReconnectingConnection`].
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The server could not be reached or the handshake failed.
    #[error("cannot reach {url}: {reason}")]
    Unreachable { url: String, reason: String },

    /// The server refused the credential.
    #[error("server at {url} rejected the auth token")]
    Unauthorized { url: String },

    /// `send` was called while the transport is down.
    #[error("not connected")]
    NotConnected,

    /// The connection was closed with `disconnect` or failed for good.
    #[error("connection closed")]
    Closed,

    #[error("invalid server url {0}")]
    InvalidUrl(String),
}

/// Failures of [`crate::server::router::ToolRouter::execute_on_machine`].
///
/// None of these abort a turn: the orchestrator renders them into the tool
/// result text the model sees.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Machine \"{0}\" not connected")]
    MachineNotFound(String),

    #[error("Machine \"{machine}\" does not support tool \"{tool}\"")]
    CapabilityUnsupported { machine: String, tool: String },

    #[error("Daemon {0} is not connected")]
    WorkerUnavailable(String),

    #[error("Request to {0} timed out")]
    RequestTimeout(String),

    /// The worker ran the tool and reported a failure.
    #[error("{message}")]
    Remote { machine: String, message: String },
}

/// Failures of the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("machine name \"{0}\" is already registered")]
    NameTaken(String),

    #[error("session is already registered as \"{0}\"")]
    AlreadyRegistered(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("machine name must not be empty or \"local\"")]
    ReservedName,
}

/// Failures talking to the model endpoint.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to reach model endpoint: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model stream failed: {0}")]
    Stream(String),

    #[error("turn exceeded {0} model round-trips")]
    TooManyRounds(usize),
}
