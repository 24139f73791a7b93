//! Persistence gateway contract and HTTP client.
//!
//! The gateway owns durable chat storage. The reconciler guarantees at most
//! one `append_turn` per stream session; the gateway is not required to
//! deduplicate.

pub mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ChatId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Model,
}

/// One stored history entry. An appended turn expands server-side to a user
/// entry (question, when present) followed by a model entry (answer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: TurnRole,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl HistoryEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            image_ref: None,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Model,
            text: text.into(),
            image_ref: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub owner_id: String,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: ChatId,
    pub title: String,
}

/// One committed question/answer exchange. Immutable once committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub answer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub committed_at: DateTime<Utc>,
}

/// Append payload. `question` is omitted when the question was already
/// persisted at chat creation (the first-turn replay).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendTurn {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    pub answer: String,
    #[serde(rename = "img", skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("gateway returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
}

impl GatewayError {
    pub fn is_auth(&self) -> bool {
        matches!(self, GatewayError::Auth(_))
    }
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Create a chat from its first question. The question becomes the first
    /// history entry and the chat lands on the owner's chat list.
    async fn create_chat(&self, question: &str) -> Result<ChatId, GatewayError>;

    /// Append one completed turn. Called at most once per stream session.
    async fn append_turn(&self, chat_id: &str, payload: AppendTurn) -> Result<(), GatewayError>;

    async fn get_chat(&self, chat_id: &str) -> Result<Chat, GatewayError>;

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, GatewayError>;
}

/// Chat-list title derived from the first question.
pub fn chat_title(question: &str) -> String {
    question.chars().take(40).collect()
}
