//! A chat session seeded with prior history. Construction does no I/O; the
//! request goes out only on `send_streaming`.

use std::sync::Arc;

use anyhow::Result;

use crate::{FragmentStream, Message, MessageRole, ModelProvider, TurnRequest};

pub struct ChatSession {
    provider: Arc<dyn ModelProvider>,
    history: Vec<Message>,
}

impl ChatSession {
    pub fn new(provider: Arc<dyn ModelProvider>, history: Vec<Message>) -> Self {
        Self { provider, history }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Submit the new input against the seeded history and return the
    /// fragment stream for this turn.
    pub async fn send_streaming(
        &self,
        input: &str,
        image_ref: Option<&str>,
    ) -> Result<FragmentStream> {
        let request = TurnRequest {
            messages: self.build_messages(input, image_ref),
        };
        self.provider.stream_turn(request).await
    }

    fn build_messages(&self, input: &str, image_ref: Option<&str>) -> Vec<Message> {
        let mut messages = self.history.clone();
        messages.push(Message {
            role: MessageRole::User,
            content: input.to_string(),
            image_ref: image_ref.map(str::to_string),
        });
        messages
    }
}
