use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ChatRequest, ChatResponse, HistoryMessage, KnowledgeBase, StatusMessage};
use crate::transport::StreamTransport;
use reqwest::Client as HttpClient;
use tracing::debug;

/// Request/response wrappers around the backend REST API.
#[derive(Clone, Debug)]
pub struct ApiClient {
    config: ClientConfig,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let http = HttpClient::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// A fresh transport sharing this client's connection pool.
    pub fn transport(&self) -> StreamTransport {
        StreamTransport::new(self.http.clone())
    }

    pub fn chat_stream_url(&self, kb_id: &str) -> String {
        format!("{}/api/chat/{}/stream", self.config.base_url, kb_id)
    }

    pub fn chat_url(&self, kb_id: &str) -> String {
        format!("{}/api/chat/{}", self.config.base_url, kb_id)
    }

    pub fn history_url(&self, kb_id: &str) -> String {
        format!("{}/api/chat/{}/history", self.config.base_url, kb_id)
    }

    pub fn chat_request(&self, message: &str) -> ChatRequest {
        ChatRequest {
            message: message.to_string(),
            include_sources: self.config.include_sources,
        }
    }

    /// Non-streaming question/answer round trip.
    pub async fn chat(&self, kb_id: &str, request: &ChatRequest) -> ClientResult<ChatResponse> {
        let response = self.http.post(self.chat_url(kb_id)).json(request).send().await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to send message", response).await);
        }

        Ok(response.json().await?)
    }

    pub async fn history(&self, kb_id: &str) -> ClientResult<Vec<HistoryMessage>> {
        let response = self
            .http
            .get(format!(
                "{}?limit={}",
                self.history_url(kb_id),
                self.config.history_limit
            ))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to load history", response).await);
        }

        let messages: Vec<HistoryMessage> = response.json().await?;
        debug!(kb_id, count = messages.len(), "history loaded");
        Ok(messages)
    }

    pub async fn clear_history(&self, kb_id: &str) -> ClientResult<String> {
        let response = self.http.delete(self.history_url(kb_id)).send().await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Failed to clear history", response).await);
        }

        let body: StatusMessage = response.json().await?;
        debug!(kb_id, status = %body.message, "history cleared");
        Ok(body.message)
    }

    pub async fn knowledge_bases(&self) -> ClientResult<Vec<KnowledgeBase>> {
        let response = self
            .http
            .get(format!("{}/api/knowledge-bases", self.config.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(
                ClientError::from_response("Failed to list knowledge bases", response).await,
            );
        }

        Ok(response.json().await?)
    }

    pub async fn knowledge_base(&self, kb_id: &str) -> ClientResult<KnowledgeBase> {
        let response = self
            .http
            .get(format!("{}/api/knowledge-bases/{}", self.config.base_url, kb_id))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ClientError::from_response("Knowledge base unavailable", response).await);
        }

        Ok(response.json().await?)
    }
}
