//! Error taxonomy of the engine

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Which timer failed a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Sent I-frames were not acknowledged within t1
    Acknowledge,
    /// TESTFR ACT was not confirmed within t1
    TestFrame,
    /// Transport establishment (secure handshake) exceeded t0
    Establish,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledge => write!(f, "t1 expired waiting for acknowledgment"),
            Self::TestFrame => write!(f, "t1 expired waiting for TESTFR CON"),
            Self::Establish => write!(f, "t0 expired establishing transport"),
        }
    }
}

/// Coarse class of an error, used to decide how far a failure reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket read/write failure or peer hang-up
    Transport,
    /// Bytes that do not form a valid APCI frame or ASDU
    Framing,
    /// N(S)/N(R) violations and timer failures
    Sequence,
    /// Bad state transitions requested by the peer
    Protocol,
    /// Invalid parameters or misuse of the management surface
    Configuration,
}

/// IEC 104 engine errors
#[derive(Error, Debug)]
pub enum IecError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Connection closed locally")]
    ClosedLocally,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Malformed ASDU: {0}")]
    MalformedAsdu(String),

    #[error("Sequence error: expected N(S)={expected}, received {received}")]
    SequenceMismatch { expected: u16, received: u16 },

    #[error("Invalid acknowledgment N(R)={received}, outstanding window {acked}..={sent}")]
    InvalidAcknowledgment { received: u16, acked: u16, sent: u16 },

    #[error("Timeout error: {0}")]
    TimeoutError(TimeoutKind),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,
}

impl IecError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::IoError(_) | Self::ConnectionClosed | Self::ClosedLocally => {
                ErrorCategory::Transport
            },
            Self::MalformedFrame(_) | Self::MalformedAsdu(_) => ErrorCategory::Framing,
            Self::SequenceMismatch { .. }
            | Self::InvalidAcknowledgment { .. }
            | Self::TimeoutError(_) => ErrorCategory::Sequence,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::ConfigError(_) | Self::AlreadyRunning | Self::NotRunning => {
                ErrorCategory::Configuration
            },
        }
    }

    /// Whether the error terminates the connection it occurred on
    pub fn is_fatal(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Configuration)
    }
}

/// Engine result type
pub type IecResult<T> = Result<T, IecError>;

/// Reasons a connection request is refused before any APCI exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejection {
    #[error("Connection limit reached ({limit} open)")]
    LimitReached { limit: usize },

    #[error("Connection request from {peer} declined")]
    Declined { peer: SocketAddr },

    #[error("Server is shutting down")]
    ShuttingDown,
}
