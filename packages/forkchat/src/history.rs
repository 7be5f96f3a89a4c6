//! Request/response access to the chat backend.
//!
//! Every call either returns the parsed result or a `TransportError`; retry
//! and fallback decisions belong to the engine.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ServerConfig;
use crate::credentials::CredentialStore;
use crate::error::TransportError;
use crate::types::{Branch, ContentKind, Conversation, ConversationKind, Message};

/// The backend operations the engine depends on.
pub trait HistoryApi: Send + Sync {
    fn fetch_conversation(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Conversation, TransportError>> + Send;

    fn fetch_history(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, TransportError>> + Send;

    fn fetch_branches(
        &self,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Vec<Branch>, TransportError>> + Send;

    fn search(
        &self,
        conversation_id: &str,
        query: &str,
    ) -> impl Future<Output = Result<Vec<Message>, TransportError>> + Send;

    fn create_branch(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        name: &str,
    ) -> impl Future<Output = Result<Branch, TransportError>> + Send;

    fn post_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: ContentKind,
    ) -> impl Future<Output = Result<Message, TransportError>> + Send;
}

/// reqwest-backed client for the `/api/v1` REST surface.
pub struct HistoryLoader {
    client: reqwest::Client,
    api_base: String,
    credentials: Arc<dyn CredentialStore>,
}

/// `get-chat-content` has returned both a bare list and a wrapped document.
#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    Pairs(Vec<Message>),
    Content { qa_pairs: Vec<Message> },
}

/// Branch listing entry. The listing omits the parent chat id.
#[derive(Deserialize)]
struct BranchRecord {
    chat_id: String,
    name: String,
    #[serde(default)]
    parent_chat_id: Option<String>,
    parent_message_id: String,
    #[serde(default, with = "crate::types::timestamp")]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct CreateBranchBody<'a> {
    parent_chat_id: &'a str,
    parent_message_id: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct AddMessageBody<'a> {
    chat_id: &'a str,
    content: &'a str,
    message_type: &'a str,
}

#[derive(Serialize)]
struct CreateChatBody<'a> {
    name: &'a str,
    chat_type: &'a str,
}

impl HistoryLoader {
    pub fn new(server: &ServerConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(server.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: server.api_base.clone(),
            credentials,
        })
    }

    /// All conversations visible to the current user.
    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, TransportError> {
        self.get("/chats/list-chats", &[]).await
    }

    pub async fn create_conversation(
        &self,
        name: &str,
        kind: ConversationKind,
    ) -> Result<Conversation, TransportError> {
        let body = CreateChatBody {
            name,
            chat_type: kind.as_str(),
        };
        self.post("/chats/create-chat", &body).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, TransportError> {
        debug!(path, "GET");
        let req = self.client.get(self.url(path)).query(query);
        self.execute(path, req).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        debug!(path, "POST");
        let req = self.client.post(self.url(path)).json(body);
        self.execute(path, req).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        path: &str,
        req: RequestBuilder,
    ) -> Result<T, TransportError> {
        let req = match self.credentials.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        };

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(path, e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(path, e))?;

        if !status.is_success() {
            return Err(TransportError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                detail: error_detail(&body),
            });
        }

        serde_json::from_str(&body).map_err(|source| TransportError::Decode {
            path: path.to_string(),
            source,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

/// FastAPI puts the reason in `{"detail": ...}`; fall back to the raw body.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

impl HistoryApi for HistoryLoader {
    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation, TransportError> {
        self.get("/chats/get-chat", &[("chat_id", conversation_id)])
            .await
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, TransportError> {
        let payload: Option<HistoryPayload> = self
            .get("/chats/get-chat-content", &[("chat_id", conversation_id)])
            .await?;
        Ok(match payload {
            Some(HistoryPayload::Pairs(messages)) => messages,
            Some(HistoryPayload::Content { qa_pairs }) => qa_pairs,
            None => Vec::new(),
        })
    }

    async fn fetch_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, TransportError> {
        let records: Vec<BranchRecord> = self
            .get("/branches/get-branches", &[("chat_id", conversation_id)])
            .await?;
        Ok(records
            .into_iter()
            .map(|r| Branch {
                id: r.chat_id,
                name: r.name,
                parent_conversation_id: r
                    .parent_chat_id
                    .unwrap_or_else(|| conversation_id.to_string()),
                parent_message_id: r.parent_message_id,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn search(&self, conversation_id: &str, query: &str) -> Result<Vec<Message>, TransportError> {
        self.get(
            "/messages/search",
            &[("chat_id", conversation_id), ("query", query)],
        )
        .await
    }

    async fn create_branch(
        &self,
        conversation_id: &str,
        parent_message_id: &str,
        name: &str,
    ) -> Result<Branch, TransportError> {
        let body = CreateBranchBody {
            parent_chat_id: conversation_id,
            parent_message_id,
            name,
        };
        // The backend answers with the new chat record only
        let chat: Conversation = self.post("/branches/create-branch", &body).await?;
        Ok(Branch {
            id: chat.id,
            name: chat.name,
            parent_conversation_id: conversation_id.to_string(),
            parent_message_id: parent_message_id.to_string(),
            created_at: chat.created_at,
        })
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        content: &str,
        kind: ContentKind,
    ) -> Result<Message, TransportError> {
        let body = AddMessageBody {
            chat_id: conversation_id,
            content,
            message_type: kind.as_str(),
        };
        self.post("/messages/add-message", &body).await
    }
}
