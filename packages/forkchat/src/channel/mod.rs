//! Persistent push connection for one open conversation.
//!
//! - `policy`: reconnect delay schedule
//! - `connector`: connection primitive (`Connector`/`Connection`) and the
//!   tokio-tungstenite implementation
//! - `actor`: the task that owns the socket and runs the
//!   `Idle → Connecting → Open → Closed → ReconnectWait` state machine

mod actor;
mod connector;
mod policy;

pub use actor::TransportChannel;
pub use connector::{Connection, Connector, WsConnection, WsConnector};
pub use policy::ReconnectPolicy;

use std::fmt;

use crate::types::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not running. Initial state, and terminal after `disconnect()`.
    Idle,
    Connecting,
    Open,
    /// The connection dropped or could not be opened.
    Closed,
    /// Waiting out the reconnect delay.
    ReconnectWait,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
            ChannelState::ReconnectWait => "reconnect-wait",
        };
        f.write_str(s)
    }
}

/// Event delivered from the channel task to the engine, tagged with the
/// conversation the channel was bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub conversation_id: String,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    Message(Message),
    State(ChannelState),
}
