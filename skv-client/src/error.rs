//! Error types for the sync client.

use std::io;

use thiserror::Error;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Hard failures surfaced by the client.
///
/// Server `-ERR` replies are not errors here; they arrive as
/// [`ReplyValue::Error`](crate::ReplyValue::Error).
#[derive(Debug, Error)]
pub enum ClientError {
    /// Session could not be established or authenticated.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Read/write failure on an established socket.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Bytes on the wire did not match a known reply form.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        ClientError::Connection {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        ClientError::Protocol(message.into())
    }

    pub(crate) fn not_connected() -> Self {
        ClientError::Transport(io::Error::new(
            io::ErrorKind::NotConnected,
            "connection is not ready",
        ))
    }

    /// Returns the underlying IO error kind for transport failures.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            ClientError::Transport(err) => Some(err.kind()),
            ClientError::Connection {
                source: Some(err), ..
            } => Some(err.kind()),
            _ => None,
        }
    }

    /// Rewraps any failure raised while opening a session as a connection error.
    pub(crate) fn into_connection(self, context: &str) -> Self {
        match self {
            ClientError::Connection { .. } => self,
            ClientError::Transport(err) => ClientError::Connection {
                message: format!("{context}: {err}"),
                source: Some(err),
            },
            ClientError::Protocol(message) => ClientError::Connection {
                message: format!("{context}: {message}"),
                source: None,
            },
        }
    }
}
