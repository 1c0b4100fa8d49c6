use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub include_sources: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    #[serde(default)]
    pub sources: Option<Vec<SourceRef>>,
}

/// Excerpt of a document that grounded an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub content: String,
    pub document_id: String,
    /// Relevance in `[0, 1]`; the streaming endpoint omits it.
    #[serde(
        rename = "score",
        alias = "relevance_score",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relevance_score: Option<f32>,
}

/// One decoded event of the chat stream, carried as `data: <json>` lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    Sources(Vec<SourceRef>),
    Chunk(String),
    Done,
}

impl Frame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A message as persisted by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
}
