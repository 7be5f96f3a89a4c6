//! Shared fakes for unit tests: an in-memory backend and a scripted
//! connection primitive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::json;
use tokio::sync::mpsc;

use crate::channel::{Connection, Connector};
use crate::error::TransportError;
use crate::history::HistoryApi;
use crate::types::{Branch, ContentKind, Conversation, ConversationKind, Message};

pub fn message(id: &str, question: &str) -> Message {
    Message {
        id: id.to_string(),
        question: Some(question.to_string()),
        response: Some(format!("answer to {question}")),
        kind: ContentKind::Text,
        timestamp: None,
        branches: Vec::new(),
    }
}

/// A `{"type": "message"}` push frame as the backend broadcasts it.
pub fn push_frame(id: &str, question: &str) -> String {
    json!({
        "type": "message",
        "data": {
            "question": question,
            "response": format!("answer to {question}"),
            "response_id": id,
            "timestamp": "2024-06-01T12:00:00.000001"
        }
    })
    .to_string()
}

// =============================================================================
// Connection primitive
// =============================================================================

#[derive(Clone)]
pub struct FakeConnector {
    inner: Arc<Mutex<ConnectorState>>,
    peers: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<FakePeer>>>,
}

struct ConnectorState {
    attempts: usize,
    refuse: usize,
    urls: Vec<String>,
    peers_tx: mpsc::UnboundedSender<FakePeer>,
}

impl FakeConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(ConnectorState {
                attempts: 0,
                refuse: 0,
                urls: Vec::new(),
                peers_tx,
            })),
            peers: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.inner.lock().unwrap().refuse = n;
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }

    pub fn urls(&self) -> Vec<String> {
        self.inner.lock().unwrap().urls.clone()
    }

    /// Server side of the next successful connection.
    pub async fn next_peer(&self) -> FakePeer {
        self.peers
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

impl Connector for FakeConnector {
    type Conn = FakeConnection;

    async fn connect(&self, url: &str) -> Result<FakeConnection, TransportError> {
        let mut state = self.inner.lock().unwrap();
        state.attempts += 1;
        state.urls.push(url.to_string());
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::Unavailable);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        let _ = state.peers_tx.send(FakePeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
            broken: broken.clone(),
        });
        Ok(FakeConnection {
            inbound: inbound_rx,
            outbound: outbound_tx,
            broken,
        })
    }
}

/// Test-held end of a fake connection. Dropping it drops the connection.
pub struct FakePeer {
    inbound: mpsc::UnboundedSender<String>,
    outbound: mpsc::UnboundedReceiver<String>,
    broken: Arc<AtomicBool>,
}

impl FakePeer {
    /// Deliver a frame to the client.
    pub fn push(&self, text: String) {
        let _ = self.inbound.send(text);
    }

    /// Next frame the client sent, or `None` once the client side is gone.
    pub async fn sent(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Make every later client write fail while reads keep working.
    pub fn fail_sends(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    broken: Arc<AtomicBool>,
}

fn connection_closed() -> TransportError {
    TransportError::WebSocket(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
}

impl Connection for FakeConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(connection_closed());
        }
        self.outbound.send(text).map_err(|_| connection_closed())
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

// =============================================================================
// Backend
// =============================================================================

#[derive(Clone, Default)]
pub struct FakeHistory {
    inner: Arc<Mutex<BackendState>>,
}

#[derive(Default)]
pub struct BackendState {
    pub conversations: HashMap<String, Conversation>,
    pub histories: HashMap<String, Vec<Message>>,
    pub branches: HashMap<String, Vec<Branch>>,
    pub fail_metadata: bool,
    pub fail_history: bool,
    pub fail_branches: bool,
    pub fail_search: bool,
    pub fail_post: bool,
    pub fail_create_branch: bool,
    /// Id the next REST-posted message gets, instead of a generated one.
    pub post_reply_id: Option<String>,
    pub posted: Vec<(String, String, ContentKind)>,
    pub searches: usize,
    pub next_id: usize,
}

fn refused(path: &str) -> TransportError {
    TransportError::Status {
        path: path.to_string(),
        status: 500,
        detail: "scripted failure".to_string(),
    }
}

impl FakeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversation(self, id: &str, messages: Vec<Message>) -> Self {
        self.add_conversation(id, messages);
        self
    }

    /// Add a conversation with the given history.
    pub fn add_conversation(&self, id: &str, messages: Vec<Message>) {
        let mut state = self.state();
        state.conversations.insert(
            id.to_string(),
            Conversation {
                id: id.to_string(),
                name: format!("{id} chat"),
                kind: ConversationKind::Direct,
                created_at: None,
            },
        );
        state.histories.insert(id.to_string(), messages);
    }

    pub fn state(&self) -> MutexGuard<'_, BackendState> {
        self.inner.lock().unwrap()
    }
}

impl HistoryApi for FakeHistory {
    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation, TransportError> {
        let state = self.state();
        if state.fail_metadata {
            return Err(refused("/chats/get-chat"));
        }
        state
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| TransportError::Status {
                path: "/chats/get-chat".into(),
                status: 404,
                detail: "Chat not found".into(),
            })
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError> {
        let state = self.state();
        if state.fail_history {
            return Err(refused("/chats/get-chat-content"));
        }
        Ok(state.histories.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn fetch_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, TransportError> {
        let state = self.state();
        if state.fail_branches {
            return Err(refused("/branches/get-branches"));
        }
        Ok(state.branches.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn search(&self, conversation_id: &str, query: &str) -> Result<Vec<Message>, TransportError> {
        let mut state = self.state();
        state.searches += 1;
        if state.fail_search {
            return Err(refused("/messages/search"));
        }
        let hits = |s: &Option<String>| s.as_deref().is_some_and(|s| s.contains(query));
        Ok(state
            .histories
            .get(conversation_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| hits(&m.question) || hits(&m.response))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_branch(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        name: &str,
    ) -> Result<Branch, TransportError> {
        let mut state = self.state();
        if state.fail_create_branch {
            return Err(TransportError::Status {
                path: "/branches/create-branch".into(),
                status: 404,
                detail: "Failed to create branch. Parent chat or message not found.".into(),
            });
        }
        state.next_id += 1;
        let branch = Branch {
            id: format!("branch-{}", state.next_id),
            name: name.to_string(),
            parent_conversation_id: conversation_id.to_string(),
            parent_message_id: parent_message_id.to_string(),
            created_at: None,
        };
        state
            .branches
            .entry(conversation_id.to_string())
            .or_default()
            .push(branch.clone());
        Ok(branch)
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: ContentKind,
    ) -> Result<Message, TransportError> {
        let mut state = self.state();
        state
            .posted
            .push((conversation_id.to_string(), content.to_string(), kind));
        if state.fail_post {
            return Err(refused("/messages/add-message"));
        }
        state.next_id += 1;
        let id = state
            .post_reply_id
            .take()
            .unwrap_or_else(|| format!("rest-{}", state.next_id));
        let mut reply = message(&id, content);
        reply.kind = kind;
        Ok(reply)
    }
}
