//! Canonical state of the open conversation.
//!
//! The engine is the only writer of the message timeline, the branch graph,
//! and the view. REST replies and push events go through the same
//! id-deduplicated append, so a message delivered by both paths lands
//! exactly once.
//!
//! Driving it: call [`ConversationEngine::open`], then loop on
//! [`ConversationEngine::next_channel_event`] and feed each event to
//! [`ConversationEngine::handle_channel_event`] alongside user commands. All
//! mutation happens on that one task.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::branch_graph::BranchGraph;
use crate::channel::{ChannelEvent, ChannelEventKind, ChannelState, Connector, TransportChannel};
use crate::config::{EngineConfig, ServerConfig};
use crate::credentials::CredentialStore;
use crate::error::{BranchError, ChannelSendError, ErrorCategory, LastError, LoadError, SendError};
use crate::history::HistoryApi;
use crate::timeline::Timeline;
use crate::types::{Branch, BranchLink, ContentKind, Conversation, Message, OutboundFrame};

/// Which messages the presentation layer should show.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum View {
    #[default]
    Live,
    Search {
        query: String,
        results: Vec<Message>,
    },
}

/// Notifications published to subscribers after each state change.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Opened { conversation_id: String },
    Closed { conversation_id: String },
    MessageAppended { message_id: String },
    /// A message's branch list changed.
    MessageUpdated { message_id: String },
    BranchRegistered { branch_id: String },
    ViewChanged,
    /// The push channel moved to a new state. Transitions that happen
    /// between two handled events are coalesced into the latest.
    ChannelStateChanged(ChannelState),
    ErrorChanged,
}

/// How a successful `send_message` was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent over the push channel; the message appears when the server
    /// broadcasts it back.
    AwaitingPush,
    /// Posted over REST and appended with this id.
    Appended(String),
}

struct Session<C: Connector> {
    conversation: Conversation,
    timeline: Timeline,
    branches: BranchGraph,
    view: View,
    channel: Option<TransportChannel<C>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    /// Last state published as `ChannelStateChanged`.
    reported_state: ChannelState,
}

pub struct ConversationEngine<H: HistoryApi, C: Connector> {
    history: H,
    connector: Arc<C>,
    credentials: Arc<dyn CredentialStore>,
    server: ServerConfig,
    config: EngineConfig,
    notify: broadcast::Sender<StateChange>,
    session: Option<Session<C>>,
    last_error: Option<LastError>,
}

impl<H: HistoryApi, C: Connector> ConversationEngine<H, C> {
    pub fn new(
        history: H,
        connector: Arc<C>,
        credentials: Arc<dyn CredentialStore>,
        server: ServerConfig,
        config: EngineConfig,
    ) -> Self {
        let (notify, _) = broadcast::channel(config.notify_capacity);
        Self {
            history,
            connector,
            credentials,
            server,
            config,
            notify,
            session: None,
            last_error: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.notify.subscribe()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.session.as_ref().map(|s| &s.conversation)
    }

    /// Canonical history in arrival order, regardless of the view.
    pub fn messages(&self) -> &[Message] {
        match &self.session {
            Some(session) => session.timeline.as_slice(),
            None => &[],
        }
    }

    /// Messages of the active view.
    pub fn visible_messages(&self) -> &[Message] {
        match &self.session {
            Some(Session {
                view: View::Search { results, .. },
                ..
            }) => results.as_slice(),
            Some(session) => session.timeline.as_slice(),
            None => &[],
        }
    }

    pub fn view(&self) -> Option<&View> {
        self.session.as_ref().map(|s| &s.view)
    }

    pub fn branches(&self) -> Option<&BranchGraph> {
        self.session.as_ref().map(|s| &s.branches)
    }

    /// Resolve the forks hanging off a message to display names.
    pub fn branch_links(&self, message_id: &str) -> Vec<BranchLink> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        session
            .timeline
            .get(message_id)
            .map(|m| session.branches.links_for(&m.branches))
            .unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.session
            .as_ref()
            .and_then(|s| s.channel.as_ref())
            .map(|c| c.state())
            .unwrap_or(ChannelState::Idle)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load a conversation and start its push channel.
    ///
    /// Any previously open conversation is closed first, including its
    /// channel. On error nothing is left open.
    pub async fn open(&mut self, conversation_id: &str) -> Result<(), LoadError> {
        self.close().await;
        info!(conversation_id, "opening conversation");

        let mut conversation = match self.history.fetch_conversation(conversation_id).await {
            Ok(conversation) => conversation,
            Err(source) => {
                return Err(self.load_failed(LoadError::Metadata {
                    conversation_id: conversation_id.to_string(),
                    source,
                }));
            }
        };

        if conversation.id != conversation_id {
            // Channel events are keyed by the id the caller opened
            debug!(conversation_id, returned = %conversation.id, "backend returned a different conversation id");
            conversation.id = conversation_id.to_string();
        }

        let history = match self.history.fetch_history(conversation_id).await {
            Ok(history) => history,
            Err(source) => {
                return Err(self.load_failed(LoadError::History {
                    conversation_id: conversation_id.to_string(),
                    source,
                }));
            }
        };

        let mut timeline = Timeline::new();
        for message in history {
            if !message.is_valid() {
                warn!(conversation_id, message_id = %message.id, "skipping empty message in history");
                continue;
            }
            let id = message.id.clone();
            if !timeline.append(message) {
                debug!(conversation_id, message_id = %id, "duplicate message in history");
            }
        }

        let mut branches = BranchGraph::new();
        let branch_error = match self.history.fetch_branches(conversation_id).await {
            Ok(records) => {
                for branch in records {
                    branches.register(branch);
                }
                None
            }
            Err(source) => {
                let err = LoadError::Branches {
                    conversation_id: conversation_id.to_string(),
                    source,
                };
                warn!(error = %err, "continuing without branches");
                Some(err)
            }
        };

        let (channel, events) = self.start_channel(conversation_id);
        info!(
            conversation_id,
            messages = timeline.len(),
            branches = branches.len(),
            push = channel.is_some(),
            "conversation open"
        );
        self.session = Some(Session {
            conversation,
            timeline,
            branches,
            view: View::Live,
            channel,
            events,
            reported_state: ChannelState::Idle,
        });

        match branch_error {
            Some(err) => self.set_error(LastError::new(ErrorCategory::Load, &err)),
            None => self.clear_error(ErrorCategory::Load),
        }
        self.emit(StateChange::Opened {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// Open a branch as the active conversation.
    pub async fn navigate_to_branch(&mut self, branch_id: &str) -> Result<(), LoadError> {
        if let Some(branch) = self.branches().and_then(|g| g.get(branch_id)) {
            debug!(branch_id, name = %branch.name, "navigating to branch");
        }
        self.open(branch_id).await
    }

    /// Disconnect the channel and drop all conversation state.
    pub async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(channel) = session.channel.as_mut() {
            channel.disconnect().await;
        }
        info!(conversation_id = %session.conversation.id, "conversation closed");
        self.emit(StateChange::Closed {
            conversation_id: session.conversation.id,
        });
    }

    fn start_channel(
        &self,
        conversation_id: &str,
    ) -> (Option<TransportChannel<C>>, Option<mpsc::Receiver<ChannelEvent>>) {
        let Some(token) = self.credentials.token() else {
            info!(conversation_id, "no credential, live updates disabled");
            return (None, None);
        };

        let url = match self.server.ws_url(conversation_id, &token) {
            Ok(url) => url,
            Err(e) => {
                warn!(conversation_id, error = %e, "live updates disabled");
                return (None, None);
            }
        };

        let (tx, rx) = mpsc::channel(self.config.channel.event_capacity);
        let mut channel = TransportChannel::new(
            self.connector.clone(),
            url,
            conversation_id,
            self.config.channel.clone(),
            tx,
        );
        channel.connect();
        (Some(channel), Some(rx))
    }

    // =========================================================================
    // Push path
    // =========================================================================

    /// Wait for the next event from the push channel. Pends forever while
    /// no channel is running, so it can sit in a `select!` unconditionally.
    pub async fn next_channel_event(&mut self) -> Option<ChannelEvent> {
        match self.session.as_mut().and_then(|s| s.events.as_mut()) {
            Some(events) => events.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Apply one channel event.
    ///
    /// State events only prompt a re-read of the channel's current state,
    /// which is published if it differs from the last one reported. The
    /// queue may drop state events, and quick transitions between two
    /// handled events are coalesced into the latest one.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        let current = self.session.as_ref().map(|s| s.conversation.id.as_str());
        if current != Some(event.conversation_id.as_str()) {
            debug!(
                conversation_id = %event.conversation_id,
                "discarding event for a conversation that is no longer open"
            );
            return;
        }

        match event.kind {
            ChannelEventKind::Message(message) => {
                self.receive_push(message);
            }
            ChannelEventKind::State(state) => {
                debug!(conversation_id = %event.conversation_id, %state, "channel state");
            }
        }
        self.report_state();
    }

    fn report_state(&mut self) {
        let state = self.channel_state();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.reported_state != state {
            session.reported_state = state;
            self.emit(StateChange::ChannelStateChanged(state));
        }
    }

    /// Merge a pushed message. Returns `true` if it was appended.
    pub fn receive_push(&mut self, message: Message) -> bool {
        if self.session.is_none() {
            debug!(message_id = %message.id, "push with no open conversation");
            return false;
        }
        if !message.is_valid() {
            warn!(message_id = %message.id, "ignoring empty pushed message");
            return false;
        }
        self.append(message)
    }

    fn append(&mut self, message: Message) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let id = message.id.clone();
        if !session.timeline.append(message) {
            debug!(message_id = %id, "duplicate message ignored");
            return false;
        }
        self.emit(StateChange::MessageAppended { message_id: id });
        true
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Deliver a message, over the push channel when it is open and over REST
    /// otherwise.
    pub async fn send_message(
        &mut self,
        content: &str,
        kind: ContentKind,
    ) -> Result<SendOutcome, SendError> {
        let result = self.deliver(content, kind).await;
        match &result {
            Ok(_) => self.clear_error(ErrorCategory::Send),
            Err(e) => self.set_error(LastError::new(ErrorCategory::Send, e)),
        }
        result
    }

    async fn deliver(&mut self, content: &str, kind: ContentKind) -> Result<SendOutcome, SendError> {
        let Some(session) = &self.session else {
            return Err(SendError::NotOpen);
        };
        if content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }
        let conversation_id = session.conversation.id.clone();

        if let Some(channel) = session.channel.as_ref().filter(|c| c.state() == ChannelState::Open) {
            match serde_json::to_string(&OutboundFrame::new(content, kind, Utc::now())) {
                Ok(frame) => match channel.send(frame).await {
                    Ok(()) => {
                        debug!(conversation_id = %conversation_id, "message sent over push channel");
                        return Ok(SendOutcome::AwaitingPush);
                    }
                    Err(ChannelSendError::NotConnected) => {
                        debug!(conversation_id = %conversation_id, "push channel closed before send, using REST");
                    }
                    Err(e) => {
                        warn!(conversation_id = %conversation_id, error = %e, "push channel send failed, using REST");
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to encode outbound frame, using REST");
                }
            }
        }

        let message = self
            .history
            .post_message(&conversation_id, content, kind)
            .await
            .map_err(SendError::Rejected)?;
        if !message.is_valid() {
            return Err(SendError::InvalidReply(message.id));
        }

        let id = message.id.clone();
        if !self.append(message) {
            debug!(message_id = %id, "posted message already arrived by push");
        }
        Ok(SendOutcome::Appended(id))
    }

    /// Fork the conversation at `parent_message_id`.
    pub async fn create_branch(
        &mut self,
        parent_message_id: &str,
        name: &str,
    ) -> Result<Branch, BranchError> {
        let result = self.fork(parent_message_id, name).await;
        match &result {
            Ok(_) => self.clear_error(ErrorCategory::Branch),
            Err(e) => self.set_error(LastError::new(ErrorCategory::Branch, e)),
        }
        result
    }

    async fn fork(&mut self, parent_message_id: &str, name: &str) -> Result<Branch, BranchError> {
        let session = self.session.as_ref().ok_or(BranchError::NotOpen)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(BranchError::EmptyName);
        }
        if !session.timeline.contains(parent_message_id) {
            return Err(BranchError::UnknownParentMessage(parent_message_id.to_string()));
        }
        let conversation_id = session.conversation.id.clone();

        let branch = self
            .history
            .create_branch(&conversation_id, parent_message_id, name)
            .await
            .map_err(BranchError::Rejected)?;

        let session = self.session.as_mut().ok_or(BranchError::NotOpen)?;
        let registered = session.branches.register(branch.clone());
        let marked = session.timeline.mark_branch(parent_message_id, &branch.id);
        info!(
            conversation_id = %conversation_id,
            branch_id = %branch.id,
            parent_message_id,
            "branch created"
        );

        if registered {
            self.emit(StateChange::BranchRegistered {
                branch_id: branch.id.clone(),
            });
        }
        if marked {
            self.emit(StateChange::MessageUpdated {
                message_id: parent_message_id.to_string(),
            });
        }
        Ok(branch)
    }

    /// Replace the view with search results. A blank query returns to the
    /// live view.
    pub async fn search(&mut self, query: &str) -> Result<(), LoadError> {
        let query = query.trim();
        if query.is_empty() {
            self.clear_search();
            return Ok(());
        }
        let Some(session) = &self.session else {
            return Err(LoadError::NotOpen);
        };
        let conversation_id = session.conversation.id.clone();

        let results = match self.history.search(&conversation_id, query).await {
            Ok(results) => results,
            Err(source) => return Err(self.load_failed(LoadError::Search(source))),
        };
        let results: Vec<Message> = results.into_iter().filter(Message::is_valid).collect();
        debug!(conversation_id = %conversation_id, query, hits = results.len(), "search complete");

        if let Some(session) = self.session.as_mut() {
            session.view = View::Search {
                query: query.to_string(),
                results,
            };
        }
        self.clear_error(ErrorCategory::Load);
        self.emit(StateChange::ViewChanged);
        Ok(())
    }

    pub fn clear_search(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.view == View::Live {
            return;
        }
        session.view = View::Live;
        self.emit(StateChange::ViewChanged);
    }

    // =========================================================================
    // Errors and notifications
    // =========================================================================

    fn load_failed(&mut self, err: LoadError) -> LoadError {
        warn!(error = %err, "load failed");
        self.set_error(LastError::new(ErrorCategory::Load, &err));
        err
    }

    fn set_error(&mut self, err: LastError) {
        self.last_error = Some(err);
        self.emit(StateChange::ErrorChanged);
    }

    fn clear_error(&mut self, category: ErrorCategory) {
        if self.last_error.as_ref().is_some_and(|e| e.category == category) {
            self.last_error = None;
            self.emit(StateChange::ErrorChanged);
        }
    }

    fn emit(&self, change: StateChange) {
        // No subscribers is fine
        let _ = self.notify.send(change);
    }
}
