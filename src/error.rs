use crate::messages::DecodeError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, LoungeError>;

// ---------------------------------------------------------------------------
// Public error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum LoungeError {
    /// Pairing code rejected, or an operation needs a paired screen.
    NotPaired,
    /// Screen id unknown to the server or no valid token; re-pair or re-link.
    NotLinked,
    /// Operation requires an established channel.
    NotConnected,
    /// The screen runs a client this protocol cannot drive.
    NotSupported(String),
    /// Malformed wire payload.
    Decode(DecodeError),
    /// Retry budget exhausted.
    Connection { attempts: u32, last: String },
    /// Transport fault surfaced from a one-shot call (pairing, availability).
    Transport(TransportError),
    /// Unexpected response shape outside the taxonomy above.
    Protocol(String),
}

impl std::fmt::Display for LoungeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoungeError::NotPaired => write!(f, "lounge: not paired"),
            LoungeError::NotLinked => write!(f, "lounge: not linked"),
            LoungeError::NotConnected => write!(f, "lounge: not connected"),
            LoungeError::NotSupported(client) => {
                write!(f, "lounge: screen client {client:?} is not supported")
            }
            LoungeError::Decode(e) => write!(f, "lounge decode: {e}"),
            LoungeError::Connection { attempts, last } => {
                write!(f, "lounge: gave up after {attempts} attempts: {last}")
            }
            LoungeError::Transport(e) => write!(f, "lounge {e}"),
            LoungeError::Protocol(msg) => write!(f, "lounge protocol: {msg}"),
        }
    }
}

impl std::error::Error for LoungeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoungeError::Decode(e) => Some(e),
            LoungeError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for LoungeError {
    fn from(e: TransportError) -> Self {
        LoungeError::Transport(e)
    }
}

impl From<DecodeError> for LoungeError {
    fn from(e: DecodeError) -> Self {
        LoungeError::Decode(e)
    }
}

// ---------------------------------------------------------------------------
// Internal retryable failures
// ---------------------------------------------------------------------------

/// A failed bind-channel exchange, before classification.
#[derive(Debug, Clone)]
pub(crate) enum Failure {
    /// Non-success HTTP status. `body` is kept for the `Unknown SID` check.
    Status { status: u16, body: String },
    Transport(TransportError),
    Decode(DecodeError),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Status { status, body } => {
                let body: String = body.chars().take(200).collect();
                write!(f, "HTTP {status}: {body}")
            }
            Failure::Transport(e) => write!(f, "{e}"),
            Failure::Decode(e) => write!(f, "decode: {e}"),
        }
    }
}

impl From<TransportError> for Failure {
    fn from(e: TransportError) -> Self {
        Failure::Transport(e)
    }
}

impl From<DecodeError> for Failure {
    fn from(e: DecodeError) -> Self {
        Failure::Decode(e)
    }
}
