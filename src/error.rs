//! Error types for the exporter.
//!
//! Failures are split by who has to react to them: [`ExporterError`] is fatal for
//! the process role that hits it, [`BusError`] comes from the system bus and says
//! whether the bus itself is gone, and [`RecordError`] only spoils one request
//! record inside an otherwise good snapshot.

use std::io;
use std::time::Duration;

use thiserror::Error;


/// Errors that end the current exchange or the current process.
#[derive(Debug, Error)]
pub enum ExporterError {
    /// The configured unprivileged user does not exist
    #[error("Unknown user '{user}'")]
    UnknownUser {
        /// Name that failed to resolve
        user: String,
    },

    /// Switching group/user failed, usually because we were not started as root
    #[error("Failed to drop privileges to user '{user}': {source}")]
    PrivilegeDrop {
        /// Target user
        user: String,
        /// The underlying errno
        source: nix::Error,
    },

    /// The peer sent something the framing does not allow
    #[error("Protocol violation: {details}")]
    Protocol {
        /// What was received instead
        details: String,
    },

    /// The stream closed in the middle of a frame
    #[error("Peer closed the channel after {received} of {expected} bytes")]
    PrematureClose {
        /// Bytes the frame announced
        expected: usize,
        /// Bytes actually read
        received: usize,
    },

    /// A snapshot payload does not fit the 4-byte length prefix
    #[error("Snapshot payload of {len} bytes is too large to frame")]
    PayloadTooLarge {
        /// Encoded size
        len: usize,
    },

    /// Reading or writing the IPC channel failed
    #[error("IPC transport error: {source}")]
    Transport {
        #[from]
        /// The underlying I/O error
        source: io::Error,
    },

    /// Snapshot (de)serialization failed
    #[error("Snapshot payload error: {source}")]
    Payload {
        #[from]
        /// The underlying serde error
        source: serde_json::Error,
    },

    /// Building or encoding metrics failed
    #[error("Metrics error: {source}")]
    Metrics {
        #[from]
        /// The underlying prometheus error
        source: prometheus::Error,
    },

    /// The worker process could not be started
    #[error("Failed to spawn worker: {source}")]
    Spawn {
        /// The underlying I/O error
        source: io::Error,
    },

    /// No snapshot arrived in time
    #[error("Timed out after {timeout:?} waiting for a snapshot")]
    ScrapeTimeout {
        /// How long we waited
        timeout: Duration,
    },

    /// The task owning the IPC channel has stopped
    #[error("IPC coordinator is not running")]
    CoordinatorGone,
}

/// Errors reported by the system bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The bus or the remote service could not be reached
    #[error("Bus transport failure: {details}")]
    Transport {
        /// Description from the bus library
        details: String,
    },

    /// The object path is not exported (e.g. the request went away)
    #[error("No such object: {path}")]
    NoSuchObject {
        /// Object path
        path: String,
    },

    /// The object has no such property
    #[error("Object {path} has no property '{property}'")]
    NoSuchProperty {
        /// Object path
        path: String,
        /// Property name
        property: String,
    },

    /// The peer answered the call with an error reply
    #[error("{path}: {name}: {message}")]
    MethodFailed {
        /// Object path
        path: String,
        /// D-Bus error name
        name: String,
        /// Error message from the peer, if any
        message: String,
    },

    /// The reply could not be decoded
    #[error("Invalid bus reply: {details}")]
    InvalidReply {
        /// What was wrong with it
        details: String,
    },
}

impl BusError {
    /// True when the error means the bus itself is unusable, rather than one object
    /// being malformed.
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::Transport { .. })
    }
}

/// Problems with a single request record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Bus(#[from] BusError),

    /// `cert-storage` is neither FILE nor NSSDB
    #[error("Request {path} has unrecognized storage type '{value}'")]
    UnknownStorageType {
        /// Request object path
        path: String,
        /// Reported storage type
        value: String,
    },

    /// A property had a different bus type than expected
    #[error("Property '{property}' is not a {expected}")]
    UnexpectedType {
        /// Property name
        property: String,
        /// Expected kind
        expected: &'static str,
    },

    /// A count came back negative
    #[error("Property '{property}' has out-of-range value {value}")]
    OutOfRange {
        /// Property name
        property: String,
        /// Reported value
        value: i64,
    },
}

impl RecordError {
    /// Transport failures abort the whole snapshot instead of skipping one record.
    pub fn is_transport(&self) -> bool {
        matches!(self, RecordError::Bus(e) if e.is_transport())
    }
}
