use std::fmt;

use tokio_tungstenite::tungstenite;

/// I/O failure from the REST or WebSocket layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("server is unavailable")]
    Unavailable,

    #[error("request to {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {detail}")]
    Status {
        path: String,
        status: u16,
        detail: String,
    },

    #[error("malformed response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl TransportError {
    pub fn from_reqwest(path: &str, err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Http {
                path: path.to_string(),
                source: err,
            }
        }
    }

    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::WebSocket(err)
        }
    }
}

/// Loading conversation metadata, history, or search results failed.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no conversation is open")]
    NotOpen,

    #[error("failed to load conversation {conversation_id}: {source}")]
    Metadata {
        conversation_id: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to load history for {conversation_id}: {source}")]
    History {
        conversation_id: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to load branches for {conversation_id}: {source}")]
    Branches {
        conversation_id: String,
        #[source]
        source: TransportError,
    },

    #[error("search failed: {0}")]
    Search(#[source] TransportError),
}

/// A message could not be delivered on any path tried.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no conversation is open")]
    NotOpen,

    #[error("message content is empty")]
    EmptyContent,

    #[error("failed to send message: {0}")]
    Rejected(#[source] TransportError),

    #[error("server returned an empty message {0}")]
    InvalidReply(String),
}

/// A fork request was invalid or refused. State is never mutated.
#[derive(Debug, thiserror::Error)]
pub enum BranchError {
    #[error("no conversation is open")]
    NotOpen,

    #[error("branch name is empty")]
    EmptyName,

    #[error("message {0} is not part of this conversation")]
    UnknownParentMessage(String),

    #[error("failed to create branch: {0}")]
    Rejected(#[source] TransportError),
}

/// Sending over the channel failed. `NotConnected` tells the engine to fall
/// back to REST and is never shown to the user.
#[derive(Debug, thiserror::Error)]
pub enum ChannelSendError {
    #[error("channel is not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Load,
    Send,
    Branch,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Load => write!(f, "load"),
            ErrorCategory::Send => write!(f, "send"),
            ErrorCategory::Branch => write!(f, "branch"),
        }
    }
}

/// The most recent user-visible failure held by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub category: ErrorCategory,
    pub message: String,
}

impl LastError {
    pub fn new(category: ErrorCategory, err: &dyn std::error::Error) -> Self {
        Self {
            category,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category, self.message)
    }
}
