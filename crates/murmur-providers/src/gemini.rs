use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::{Fragment, FragmentStream, Message, MessageRole, ModelProvider, TurnRequest};

/// Gemini provider speaking the `streamGenerateContent` SSE format.
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self> {
        // Normalize base URL - remove trailing slash if present
        let base_url = base_url.trim_end_matches('/').to_string();

        Ok(Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        })
    }

    fn create_request_body(&self, messages: &[Message]) -> serde_json::Value {
        let contents: Vec<serde_json::Value> = messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    MessageRole::User => "user",
                    MessageRole::Model => "model",
                };
                let mut parts = vec![json!({ "text": msg.content })];
                if let Some(ref image_ref) = msg.image_ref {
                    parts.push(json!({ "file_data": { "file_uri": image_ref } }));
                }
                json!({ "role": role, "parts": parts })
            })
            .collect();

        json!({ "contents": contents })
    }

    async fn parse_streaming_response(
        &self,
        mut stream: impl futures_util::Stream<Item = reqwest::Result<Bytes>> + Unpin,
        tx: mpsc::Sender<Result<Fragment>>,
    ) {
        let mut buffer = String::new();

        while let Some(chunk_result) = stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    let chunk_str = match std::str::from_utf8(&chunk) {
                        Ok(s) => s,
                        Err(e) => {
                            error!("Failed to parse chunk as UTF-8: {}", e);
                            continue;
                        }
                    };

                    buffer.push_str(chunk_str);

                    // Process complete lines (SSE format)
                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer.drain(..line_end + 1);

                        if line.is_empty() {
                            continue;
                        }

                        if let Some(data) = line.strip_prefix("data: ") {
                            if let Ok(event) = serde_json::from_str::<GeminiStreamEvent>(data) {
                                let (text, finished) = extract_fragment(&event);
                                if !text.is_empty() {
                                    let fragment = Fragment {
                                        text,
                                        finished: false,
                                    };
                                    if tx.send(Ok(fragment)).await.is_err() {
                                        debug!("Receiver dropped, stopping stream");
                                        return;
                                    }
                                }
                                if finished {
                                    debug!("Received stream completion marker");
                                    let _ = tx
                                        .send(Ok(Fragment {
                                            text: String::new(),
                                            finished: true,
                                        }))
                                        .await;
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Stream error: {}", e);
                    let _ = tx.send(Err(anyhow::anyhow!("Stream error: {}", e))).await;
                    return;
                }
            }
        }

        // Byte stream ended without an explicit finish reason; close cleanly.
        let _ = tx
            .send(Ok(Fragment {
                text: String::new(),
                finished: true,
            }))
            .await;
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn stream_turn(&self, request: TurnRequest) -> Result<FragmentStream> {
        debug!(
            "Processing Gemini streaming request with {} messages",
            request.messages.len()
        );

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, self.model
        );
        let body = self.create_request_body(&request.messages);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!("Gemini API error {}: {}", status, error_text));
        }

        let stream = response.bytes_stream();
        let (tx, rx) = mpsc::channel(100);

        // Spawn task to process the stream
        let provider = self.clone();
        tokio::spawn(async move {
            provider.parse_streaming_response(stream, tx).await;
        });

        Ok(ReceiverStream::new(rx))
    }

    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Pull the text delta and completion flag out of one SSE event.
fn extract_fragment(event: &GeminiStreamEvent) -> (String, bool) {
    let mut text = String::new();
    let mut finished = false;

    if let Some(ref candidates) = event.candidates {
        for candidate in candidates {
            if let Some(ref content) = candidate.content {
                if let Some(ref parts) = content.parts {
                    for part in parts {
                        if let Some(ref t) = part.text {
                            text.push_str(t);
                        }
                    }
                }
            }
            if candidate.finish_reason.is_some() {
                finished = true;
            }
        }
    }

    (text, finished)
}

// Gemini streaming response structures
#[derive(Debug, Deserialize)]
struct GeminiStreamEvent {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}
