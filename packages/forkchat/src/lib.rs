//! # forkchat
//!
//! Client-side synchronization core for branching chat conversations.
//!
//! ## Overview
//!
//! A conversation is loaded over REST and then kept live through a WebSocket
//! push channel. Messages can fork into branches, which are conversations of
//! their own. This crate provides:
//! - A [`ConversationEngine`] that owns the message timeline, the branch
//!   graph, and the active view of the open conversation
//! - A [`TransportChannel`] that holds one push connection and reconnects on
//!   its own after drops
//! - A [`HistoryLoader`] for the backend's REST endpoints
//! - A [`BranchGraph`] for resolving and walking forks
//!
//! ## Message flow
//!
//! ```text
//!   HistoryLoader ──open/search/REST send──┐
//!                                          ▼
//!                                ConversationEngine ──subscribe()──▶ UI
//!                                          ▲
//!   TransportChannel ──ChannelEvent (mpsc)─┘
//! ```
//!
//! Both paths merge through one id-deduplicated append, so a message that
//! arrives over REST and again as a push is shown once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use forkchat::{
//!     ContentKind, ConversationEngine, EngineConfig, HistoryLoader, ServerConfig,
//!     ServerFileConfig, StaticCredentials, WsConnector,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = ServerConfig::from_file(&ServerFileConfig::default());
//! let credentials = Arc::new(StaticCredentials::new("token"));
//! let history = HistoryLoader::new(&server, credentials.clone())?;
//! let mut engine = ConversationEngine::new(
//!     history,
//!     Arc::new(WsConnector),
//!     credentials,
//!     server,
//!     EngineConfig::default(),
//! );
//!
//! engine.open("chat-id").await?;
//! engine.send_message("hello", ContentKind::Text).await?;
//!
//! // Drain pushes into the engine
//! while let Some(event) = engine.next_channel_event().await {
//!     engine.handle_channel_event(event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod branch_graph;
pub mod channel;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod history;
pub mod timeline;
pub mod types;

#[cfg(test)]
mod test_helpers;

pub use branch_graph::BranchGraph;
pub use channel::{
    ChannelEvent, ChannelEventKind, ChannelState, Connection, Connector, ReconnectPolicy,
    TransportChannel, WsConnector,
};
pub use config::{
    ChannelConfig, EngineConfig, FileConfig, ForkchatConfig, ServerConfig, ServerFileConfig,
    load_config,
};
pub use credentials::{CredentialStore, FileCredentials, StaticCredentials};
pub use engine::{ConversationEngine, SendOutcome, StateChange, View};
pub use error::{
    BranchError, ChannelSendError, ErrorCategory, LastError, LoadError, SendError, TransportError,
};
pub use history::{HistoryApi, HistoryLoader};
pub use timeline::Timeline;
pub use types::{Branch, BranchLink, ContentKind, Conversation, ConversationKind, Message};
