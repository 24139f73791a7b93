//! HTTP implementation of the persistence gateway. All endpoints require an
//! authenticated principal; the bearer token identifies the owner.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::json;
use tracing::debug;

use crate::{AppendTurn, Chat, ChatId, ChatSummary, GatewayError, PersistenceGateway};

pub struct HttpGateway {
    client: Client,
    base_url: String,
    auth_token: String,
}

impl HttpGateway {
    pub fn new(base_url: String, auth_token: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(error_for_status(status, body))
    }
}

fn error_for_status(status: StatusCode, body: String) -> GatewayError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        GatewayError::Auth(body)
    } else {
        GatewayError::Http {
            status: status.as_u16(),
            body,
        }
    }
}

fn network(err: reqwest::Error) -> GatewayError {
    GatewayError::Network(err.to_string())
}

#[async_trait]
impl PersistenceGateway for HttpGateway {
    async fn create_chat(&self, question: &str) -> Result<ChatId, GatewayError> {
        debug!("Creating chat");
        let response = self
            .client
            .post(self.url("/api/chats"))
            .bearer_auth(&self.auth_token)
            .json(&json!({ "text": question }))
            .send()
            .await
            .map_err(network)?;
        let response = Self::check(response).await?;

        // The server replies with the new chat id as a bare string.
        let id = response.text().await.map_err(network)?;
        Ok(id.trim().trim_matches('"').to_string())
    }

    async fn append_turn(&self, chat_id: &str, payload: AppendTurn) -> Result<(), GatewayError> {
        debug!(chat_id, "Appending turn");
        let response = self
            .client
            .put(self.url(&format!("/api/chats/{}", chat_id)))
            .bearer_auth(&self.auth_token)
            .json(&payload)
            .send()
            .await
            .map_err(network)?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Chat, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/api/chats/{}", chat_id)))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(network)?;
        let response = Self::check(response).await?;
        response.json().await.map_err(network)
    }

    async fn list_chats(&self) -> Result<Vec<ChatSummary>, GatewayError> {
        let response = self
            .client
            .get(self.url("/api/userchats"))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(network)?;
        let response = Self::check(response).await?;
        response.json().await.map_err(network)
    }
}
