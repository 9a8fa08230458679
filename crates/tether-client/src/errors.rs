use std::io;
use std::sync::Arc;

use tether_wire::ProtocolError;

/// Error surfaced by hub connection operations.
///
/// The variants distinguish where a failure originated so callers can tell
/// a local state misuse from a transport loss or a server-reported error.
/// The type is `Clone` because one underlying failure fans out to every
/// pending invocation and lifecycle callback.
#[derive(Debug, Clone)]
pub enum HubError {
    /// An operation was invoked in a state that does not allow it.
    InvalidState(String),
    /// The handshake failed to parse or the server rejected it.
    Handshake(String),
    /// The underlying transport failed.
    Transport(Arc<io::Error>),
    /// The server closed the connection with an error.
    ServerClose(String),
    /// No message arrived from the server within the configured timeout.
    Timeout,
    /// An inbound Sequence message pointed past what we have received.
    SequenceViolation,
    /// The retry policy gave up before a reconnect attempt succeeded.
    RetryExhausted {
        /// Reconnect attempts made before giving up.
        attempts: u32,
    },
    /// A pending invocation failed because the connection closed.
    InvocationCanceled(String),
    /// The server completed an invocation with an error.
    Server(String),
    /// The server sent an invocation that expects a response.
    ServerExpectsResponse(String),
    /// The connection was stopped before an operation could complete.
    Aborted(String),
    /// The hub protocol codec failed.
    Protocol(ProtocolError),
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubError::InvalidState(msg) => write!(f, "{msg}"),
            HubError::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            HubError::Transport(e) => write!(f, "transport error: {e}"),
            HubError::ServerClose(msg) => {
                write!(f, "server closed the connection with error: {msg}")
            }
            HubError::Timeout => write!(
                f,
                "server timeout elapsed without receiving a message from the server"
            ),
            HubError::SequenceViolation => write!(
                f,
                "sequence ID greater than the number of messages we have received"
            ),
            HubError::RetryExhausted { attempts } => {
                write!(f, "reconnect retries exhausted after {attempts} attempts")
            }
            HubError::InvocationCanceled(msg) => write!(f, "invocation canceled: {msg}"),
            HubError::Server(msg) => write!(f, "server returned error: {msg}"),
            HubError::ServerExpectsResponse(target) => write!(
                f,
                "server requested a response for invocation of '{target}'; \
                 client-side invocations with results are not supported"
            ),
            HubError::Aborted(msg) => write!(f, "{msg}"),
            HubError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HubError::Transport(e) => Some(e.as_ref()),
            HubError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HubError {
    fn from(e: io::Error) -> Self {
        HubError::Transport(Arc::new(e))
    }
}

impl From<ProtocolError> for HubError {
    fn from(e: ProtocolError) -> Self {
        HubError::Protocol(e)
    }
}
