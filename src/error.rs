//! Error taxonomy for the connection and dispatch layers.
//!
//! - `ProtocolError`: the peer violated framing; fatal to the connection.
//! - `HandlerError`: a command failed while executing; answered with an
//!   error response and the connection stays open.
//! - `ConnectionError`: anything that ends a connection (protocol, transport,
//!   disposal, graceful quit).

use std::io;
use thiserror::Error;

/// Framing and command-decoding violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed {field} header: {value:?}")]
    MalformedHeader { field: &'static str, value: String },

    #[error("negative {field} header: {value}")]
    NegativeLength { field: &'static str, value: i64 },

    #[error("declared length {declared} exceeds maximum {max}")]
    LengthTooLarge { declared: usize, max: usize },

    #[error("sub-frame of {declared} bytes overruns request of {remaining} remaining bytes")]
    FrameOverrun { declared: usize, remaining: usize },

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

/// A failure raised while executing a single command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing argument '{0}'")]
    MissingArgument(&'static str),

    #[error("client has not completed the handshake")]
    NotInitialized,

    #[error("operation failed: {0}")]
    Engine(String),
}

/// Reasons a connection is torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("connection already disposed")]
    Disposed,

    #[error("client disconnected")]
    ClientQuit,
}

impl ConnectionError {
    /// Whether the peer simply went away (EOF, reset, explicit quit).
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::ClientQuit | ConnectionError::Disposed => true,
            ConnectionError::Transport(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            ConnectionError::Protocol(_) => false,
        }
    }
}
