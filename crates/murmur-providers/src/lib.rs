//! Model session collaborators for murmur.
//!
//! A [`ModelProvider`] turns a seeded conversation plus one new input into a
//! lazy, finite stream of text fragments. The stream is non-restartable and
//! may yield a transport error at any point instead of terminating cleanly;
//! the consumer owns stall detection and retry.

pub mod gemini;
pub mod session;

pub use gemini::GeminiProvider;
pub use session::ChatSession;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Model,
}

/// One entry of the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub image_ref: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image_ref: None,
        }
    }

    pub fn with_image(role: MessageRole, content: impl Into<String>, image_ref: String) -> Self {
        Self {
            role,
            content: content.into(),
            image_ref: Some(image_ref),
        }
    }
}

/// An incremental chunk of generated text.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    pub text: String,
    /// Set on the chunk that carries the model's stop signal. The channel
    /// closing without it is also a clean end of stream.
    pub finished: bool,
}

pub type FragmentStream = ReceiverStream<anyhow::Result<Fragment>>;

/// Full conversation for one streaming request: prior history plus the new
/// user input as the final message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub messages: Vec<Message>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Open one streaming generation. Errors here are transport failures at
    /// stream open; errors inside the stream are mid-stream failures.
    async fn stream_turn(&self, request: TurnRequest) -> anyhow::Result<FragmentStream>;

    fn name(&self) -> &str;

    fn model(&self) -> &str;
}
