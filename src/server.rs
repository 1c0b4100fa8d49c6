//! Mock backend speaking the chat protocol, for local development and tests.
//!
//! Answers are canned: retrieval returns three fake excerpts and generation
//! echoes the question back word by word.

use crate::protocol::{
    ChatRequest, ChatResponse, Frame, HistoryMessage, KnowledgeBase, Role, SourceRef,
    StatusMessage,
};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_KB_ID: &str = "default";
const SOURCE_EXCERPT_LEN: usize = 200;
const MOCK_RESULTS: usize = 3;

pub struct ServerConfig {
    pub listen: String,
    /// Pause between streamed words.
    pub word_delay: Duration,
}

struct ServerState {
    knowledge_bases: Vec<KnowledgeBase>,
    history: Mutex<HashMap<String, Vec<HistoryMessage>>>,
    word_delay: Duration,
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: ServerConfig) -> ServerResult<()> {
    let app = router(config.word_delay);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, "mock backend listening");
    println!("kbchat mock backend listening on http://{}", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(word_delay: Duration) -> axum::Router {
    let now = timestamp();
    let state = Arc::new(ServerState {
        knowledge_bases: vec![KnowledgeBase {
            id: DEFAULT_KB_ID.to_string(),
            name: "Default".to_string(),
            description: Some("Seeded knowledge base of the mock backend".to_string()),
            created_at: now.clone(),
            updated_at: now,
        }],
        history: Mutex::new(HashMap::new()),
        word_delay,
    });

    axum::Router::new()
        .route("/api/knowledge-bases", get(list_knowledge_bases))
        .route("/api/knowledge-bases/:id", get(get_knowledge_base))
        .route("/api/chat/:kb_id", post(chat))
        .route("/api/chat/:kb_id/stream", post(chat_stream))
        .route(
            "/api/chat/:kb_id/history",
            get(get_history).delete(clear_history),
        )
        .with_state(state)
}

async fn list_knowledge_bases(State(state): State<Arc<ServerState>>) -> Json<Vec<KnowledgeBase>> {
    Json(state.knowledge_bases.clone())
}

async fn get_knowledge_base(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeBase>, Response> {
    state
        .knowledge_bases
        .iter()
        .find(|kb| kb.id == id)
        .cloned()
        .map(Json)
        .ok_or_else(not_found)
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Path(kb_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, Response> {
    state.require_kb(&kb_id)?;

    let context = search(&request.message);
    let message = format!("[Mock Response] Based on your question: {}", request.message);
    state.persist(&kb_id, &request.message, &message).await;

    let sources = request.include_sources.then(|| {
        context
            .into_iter()
            .map(|mut source| {
                source.content = excerpt(&source.content);
                source
            })
            .collect()
    });

    Ok(Json(ChatResponse { message, sources }))
}

async fn chat_stream(
    State(state): State<Arc<ServerState>>,
    Path(kb_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<impl IntoResponse, Response> {
    state.require_kb(&kb_id)?;

    let (events, rx) = mpsc::unbounded_channel::<Frame>();
    let context = search(&request.message);

    tokio::spawn(async move {
        if request.include_sources {
            let sources = context
                .into_iter()
                .map(|source| SourceRef {
                    content: excerpt(&source.content),
                    document_id: source.document_id,
                    relevance_score: None,
                })
                .collect();
            if events.send(Frame::Sources(sources)).is_err() {
                return;
            }
        }

        let answer = format!("[Mock Streaming Response] Based on your question: {}", request.message);
        let mut full_response = String::new();
        for word in answer.split_whitespace() {
            if !state.word_delay.is_zero() {
                tokio::time::sleep(state.word_delay).await;
            }
            let chunk = format!("{word} ");
            full_response.push_str(&chunk);
            if events.send(Frame::Chunk(chunk)).is_err() {
                debug!(kb_id = %kb_id, "client went away mid-stream");
                return;
            }
        }

        state.persist(&kb_id, &request.message, &full_response).await;
        let _ = events.send(Frame::Done);
    });

    let stream = UnboundedReceiverStream::new(rx).map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_default();
        Ok::<Event, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn get_history(
    State(state): State<Arc<ServerState>>,
    Path(kb_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryMessage>>, Response> {
    state.require_kb(&kb_id)?;

    let limit = query.limit.unwrap_or(50);
    let history = state.history.lock().await;
    let messages = history.get(&kb_id).map(Vec::as_slice).unwrap_or_default();
    let start = messages.len().saturating_sub(limit);
    Ok(Json(messages[start..].to_vec()))
}

async fn clear_history(
    State(state): State<Arc<ServerState>>,
    Path(kb_id): Path<String>,
) -> Result<Json<StatusMessage>, Response> {
    state.require_kb(&kb_id)?;

    let count = state
        .history
        .lock()
        .await
        .remove(&kb_id)
        .map_or(0, |messages| messages.len());
    Ok(Json(StatusMessage {
        message: format!("Cleared {count} messages"),
    }))
}

impl ServerState {
    fn require_kb(&self, kb_id: &str) -> Result<(), Response> {
        if self.knowledge_bases.iter().any(|kb| kb.id == kb_id) {
            Ok(())
        } else {
            Err(not_found())
        }
    }

    async fn persist(&self, kb_id: &str, question: &str, answer: &str) {
        let mut history = self.history.lock().await;
        let messages = history.entry(kb_id.to_string()).or_default();
        for (role, content) in [(Role::User, question), (Role::Assistant, answer)] {
            messages.push(HistoryMessage {
                id: Uuid::new_v4().to_string(),
                role,
                content: content.to_string(),
                created_at: timestamp(),
            });
        }
    }
}

fn search(query: &str) -> Vec<SourceRef> {
    (0..MOCK_RESULTS)
        .map(|i| SourceRef {
            content: format!("Mock result {} for query: {}", i + 1, query),
            document_id: format!("mock_doc_{i}"),
            relevance_score: Some(0.9 - i as f32 * 0.1),
        })
        .collect()
}

fn excerpt(content: &str) -> String {
    content.chars().take(SOURCE_EXCERPT_LEN).collect()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"detail": "Knowledge base not found"})),
    )
        .into_response()
}

fn timestamp() -> String {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", elapsed.as_secs(), elapsed.subsec_micros())
}

/// Serves `app` on an ephemeral local port and returns its base URL.
#[cfg(test)]
pub(crate) async fn serve_router(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Event-stream response replaying raw body chunks, optionally never ending.
#[cfg(test)]
pub(crate) fn event_stream_response(chunks: Vec<Vec<u8>>, hang: bool) -> Response {
    use axum::body::Body;
    use axum::http::header::CONTENT_TYPE;

    let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
    let body = if hang {
        Body::from_stream(body.chain(futures::stream::pending()))
    } else {
        Body::from_stream(body)
    };
    ([(CONTENT_TYPE, "text/event-stream")], body).into_response()
}

#[cfg(test)]
pub(crate) async fn spawn_test_server() -> String {
    serve_router(router(Duration::ZERO)).await
}
