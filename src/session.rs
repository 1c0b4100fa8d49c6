//! Chat state for one knowledge base.
//!
//! [`ChatSession`] owns the ordered message list and at most one outstanding
//! reply. Every asynchronous result (stream events, history loads, clears,
//! non-streaming replies) comes back through one channel, tagged with the
//! session generation that was current when the operation started. Switching
//! knowledge base or clearing history bumps the generation, which turns any
//! result still in flight for the old state into a no-op.

use crate::api::ApiClient;
use crate::error::ClientResult;
use crate::protocol::{ChatResponse, Frame, HistoryMessage, Role, SourceRef};
use crate::transport::{StreamGuard, TransportEvent};
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Attached once, when the reply completes.
    pub sources: Option<Vec<SourceRef>>,
    pub streaming: bool,
}

impl Message {
    fn user(content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::User,
            content: content.to_string(),
            sources: None,
            streaming: false,
        }
    }

    fn assistant(content: String, sources: Option<Vec<SourceRef>>, streaming: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content,
            sources,
            streaming,
        }
    }
}

impl From<HistoryMessage> for Message {
    fn from(message: HistoryMessage) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            sources: None,
            streaming: false,
        }
    }
}

#[derive(Debug)]
enum Update {
    /// Event of the stream feeding the assistant message `message_id`.
    Stream {
        message_id: String,
        event: TransportEvent,
    },
    History(ClientResult<Vec<HistoryMessage>>),
    Cleared(ClientResult<String>),
    Reply {
        request_id: String,
        result: ClientResult<ChatResponse>,
    },
}

#[derive(Debug)]
struct Tagged {
    generation: u64,
    update: Update,
}

/// The reply currently being streamed.
#[derive(Debug)]
struct InFlight {
    message_id: String,
    sources: Option<Vec<SourceRef>>,
    // Dropping the guard aborts the request.
    stream: StreamGuard,
}

pub struct ChatSession {
    api: ApiClient,
    kb_id: String,
    messages: Vec<Message>,
    error: Option<String>,
    generation: u64,
    in_flight: Option<InFlight>,
    pending_reply: Option<String>,
    loading_history: bool,
    clearing: bool,
    history_version: u64,
    updates_tx: mpsc::UnboundedSender<Tagged>,
    updates: mpsc::UnboundedReceiver<Tagged>,
}

impl ChatSession {
    /// Creates the session and starts loading its persisted history.
    pub fn new(api: ApiClient, kb_id: impl Into<String>) -> Self {
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let mut session = Self {
            api,
            kb_id: kb_id.into(),
            messages: Vec::new(),
            error: None,
            generation: 0,
            in_flight: None,
            pending_reply: None,
            loading_history: false,
            clearing: false,
            history_version: 0,
            updates_tx,
            updates,
        };
        session.load_history();
        session
    }

    pub fn knowledge_base_id(&self) -> &str {
        &self.kb_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True while an assistant reply, streamed or not, is outstanding.
    pub fn is_replying(&self) -> bool {
        self.in_flight.is_some() || self.pending_reply.is_some()
    }

    /// Counts history loads that replaced the message list.
    pub fn history_version(&self) -> u64 {
        self.history_version
    }

    pub fn is_loading_history(&self) -> bool {
        self.loading_history
    }

    /// True while any operation still has a result to deliver.
    pub fn is_busy(&self) -> bool {
        self.is_replying() || self.loading_history || self.clearing
    }

    /// Replaces the message list with the backend's persisted history.
    ///
    /// Rejected while a reply is outstanding or another load is running.
    pub fn load_history(&mut self) -> bool {
        if self.is_replying() || self.loading_history {
            debug!(kb_id = %self.kb_id, "history load rejected: session busy");
            return false;
        }

        self.loading_history = true;
        self.error = None;
        let api = self.api.clone();
        let kb_id = self.kb_id.clone();
        self.dispatch(async move { Update::History(api.history(&kb_id).await) });
        true
    }

    /// Appends the user message and an empty streaming assistant message, then
    /// opens the stream that fills it.
    ///
    /// No-op for blank text, while a reply is outstanding, or while history is
    /// still loading or being cleared.
    pub fn send(&mut self, text: &str) -> bool {
        let Some(text) = self.accept_message(text) else {
            return false;
        };

        self.messages.push(Message::user(&text));
        let assistant = Message::assistant(String::new(), None, true);
        let message_id = assistant.id.clone();
        self.messages.push(assistant);

        let generation = self.generation;
        let tagged_id = message_id.clone();
        let cancel = self.api.transport().start(
            &self.api.chat_stream_url(&self.kb_id),
            &self.api.chat_request(&text),
            self.updates_tx.clone(),
            move |event| Tagged {
                generation,
                update: Update::Stream {
                    message_id: tagged_id.clone(),
                    event,
                },
            },
        );

        debug!(kb_id = %self.kb_id, generation, message_id = %message_id, "reply stream started");
        self.in_flight = Some(InFlight {
            message_id,
            sources: None,
            stream: cancel.into_guard(),
        });
        true
    }

    /// Request/response variant of [`send`](Self::send); the assistant message
    /// is appended whole when the reply arrives.
    pub fn send_non_streaming(&mut self, text: &str) -> bool {
        let Some(text) = self.accept_message(text) else {
            return false;
        };

        self.messages.push(Message::user(&text));
        let request_id = Uuid::new_v4().to_string();
        self.pending_reply = Some(request_id.clone());

        let api = self.api.clone();
        let kb_id = self.kb_id.clone();
        self.dispatch(async move {
            let result = api.chat(&kb_id, &api.chat_request(&text)).await;
            Update::Reply { request_id, result }
        });
        true
    }

    /// Cancels the outstanding reply and freezes every streaming message as is.
    pub fn stop(&mut self) -> bool {
        let stopped_reply = self.pending_reply.take().is_some();
        let Some(in_flight) = self.in_flight.take() else {
            return stopped_reply;
        };

        let handle = in_flight.stream.handle();
        debug!(state = ?handle.state(), "cancelling reply stream");
        handle.cancel();
        for message in self.messages.iter_mut().filter(|m| m.streaming) {
            message.streaming = false;
        }
        debug!(kb_id = %self.kb_id, message_id = %in_flight.message_id, "reply stopped");
        true
    }

    /// Deletes the persisted history; the local list is emptied only once the
    /// backend confirms.
    pub fn clear_history(&mut self) -> bool {
        if self.clearing {
            return false;
        }

        self.clearing = true;
        self.error = None;
        let api = self.api.clone();
        let kb_id = self.kb_id.clone();
        self.dispatch(async move { Update::Cleared(api.clear_history(&kb_id).await) });
        true
    }

    /// Resets the session for another knowledge base and loads its history.
    pub fn switch_knowledge_base(&mut self, kb_id: impl Into<String>) {
        self.invalidate();
        self.kb_id = kb_id.into();
        self.messages.clear();
        self.error = None;
        debug!(kb_id = %self.kb_id, generation = self.generation, "knowledge base switched");
        self.load_history();
    }

    /// Applies every update that has already arrived, without waiting.
    ///
    /// Returns whether anything was applied.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        while let Ok(tagged) = self.updates.try_recv() {
            changed |= self.apply(tagged);
        }
        changed
    }

    /// Waits for the next update and applies it.
    pub async fn next_update(&mut self) -> bool {
        match self.updates.recv().await {
            Some(tagged) => self.apply(tagged),
            None => false,
        }
    }

    /// Drives the session until no operation is outstanding.
    pub async fn wait_idle(&mut self) {
        while self.is_busy() {
            self.next_update().await;
        }
    }

    fn accept_message(&mut self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if self.is_replying() || self.loading_history || self.clearing {
            debug!(kb_id = %self.kb_id, "send rejected: session busy");
            return None;
        }
        self.error = None;
        Some(text.to_string())
    }

    fn dispatch<F>(&self, operation: F)
    where
        F: Future<Output = Update> + Send + 'static,
    {
        let tx = self.updates_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let update = operation.await;
            let _ = tx.send(Tagged { generation, update });
        });
    }

    /// Drops everything outstanding and moves to a new generation.
    fn invalidate(&mut self) {
        self.in_flight = None;
        self.pending_reply = None;
        self.loading_history = false;
        self.clearing = false;
        self.generation += 1;
    }

    fn apply(&mut self, tagged: Tagged) -> bool {
        if tagged.generation != self.generation {
            trace!(
                stale = tagged.generation,
                current = self.generation,
                "dropping update from superseded generation"
            );
            return false;
        }

        match tagged.update {
            Update::Stream { message_id, event } => self.apply_stream(&message_id, event),
            Update::History(result) => {
                self.loading_history = false;
                match result {
                    Ok(history) => {
                        self.messages = history.into_iter().map(Message::from).collect();
                        self.history_version += 1;
                    }
                    Err(err) => self.error = Some(err.to_string()),
                }
                true
            }
            Update::Cleared(result) => {
                self.clearing = false;
                match result {
                    Ok(_) => {
                        self.invalidate();
                        self.messages.clear();
                    }
                    Err(err) => self.error = Some(err.to_string()),
                }
                true
            }
            Update::Reply { request_id, result } => {
                if self.pending_reply.as_deref() != Some(request_id.as_str()) {
                    return false;
                }
                self.pending_reply = None;
                match result {
                    Ok(reply) => self
                        .messages
                        .push(Message::assistant(reply.message, reply.sources, false)),
                    Err(err) => self.error = Some(err.to_string()),
                }
                true
            }
        }
    }

    fn apply_stream(&mut self, message_id: &str, event: TransportEvent) -> bool {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return false;
        };
        if in_flight.message_id != message_id {
            return false;
        }

        match event {
            TransportEvent::Frame(Frame::Chunk(text)) => {
                if let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) {
                    message.content.push_str(&text);
                }
            }
            TransportEvent::Frame(Frame::Sources(sources)) => {
                in_flight.sources = Some(sources);
            }
            TransportEvent::Frame(Frame::Done) | TransportEvent::Closed => {
                self.finish_stream(None);
            }
            TransportEvent::Failed(err) => {
                self.finish_stream(Some(err.to_string()));
            }
        }
        true
    }

    fn finish_stream(&mut self, error: Option<String>) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };

        if let Some(message) = self.messages.iter_mut().find(|m| m.id == in_flight.message_id) {
            message.streaming = false;
            if error.is_none() {
                message.sources = in_flight.sources;
            }
        }
        debug!(
            kb_id = %self.kb_id,
            message_id = %in_flight.message_id,
            failed = error.is_some(),
            "reply stream finished"
        );
        self.error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::server::{DEFAULT_KB_ID, event_stream_response, serve_router, spawn_test_server};
    use axum::Json;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn chunk(text: &str) -> Vec<u8> {
        format!("data: {}\n\n", json!({"type": "chunk", "data": text})).into_bytes()
    }

    fn sources_frame() -> Vec<u8> {
        let data = json!([{"content": "Y is defined as...", "document_id": "doc_1"}]);
        format!("data: {}\n\n", json!({"type": "sources", "data": data})).into_bytes()
    }

    fn done() -> Vec<u8> {
        b"data: {\"type\":\"done\"}\n\n".to_vec()
    }

    /// Backend with empty history whose stream endpoint replays `chunks`.
    async fn backend(chunks: Vec<Vec<u8>>, hang: bool) -> ApiClient {
        let app = Router::new()
            .route(
                "/api/chat/:kb_id/history",
                get(|| async { Json(Vec::<HistoryMessage>::new()) })
                    .delete(|| async { Json(json!({"message": "Cleared 0 messages"})) }),
            )
            .route(
                "/api/chat/:kb_id/stream",
                post(move || {
                    let chunks = chunks.clone();
                    async move { event_stream_response(chunks, hang) }
                }),
            );
        ApiClient::new(ClientConfig::new(&serve_router(app).await)).unwrap()
    }

    async fn ready_session(api: ApiClient) -> ChatSession {
        let mut session = ChatSession::new(api, "kb1");
        settle(&mut session).await;
        session
    }

    async fn settle(session: &mut ChatSession) {
        timeout(Duration::from_secs(5), session.wait_idle())
            .await
            .expect("session did not settle");
    }

    async fn poll_until(session: &mut ChatSession, done: impl Fn(&ChatSession) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done(&*session) {
                session.next_update().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn assistant(session: &ChatSession) -> &Message {
        session
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .unwrap()
    }

    #[tokio::test]
    async fn send_streams_chunks_into_one_assistant_message() {
        let api = backend(
            vec![sources_frame(), chunk("X "), chunk("is "), chunk("Y"), done()],
            false,
        )
        .await;
        let mut session = ready_session(api).await;

        assert!(session.send("What is X?"));
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "What is X?");
        assert!(!messages[0].streaming);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "");
        assert!(messages[1].streaming);
        let assistant_id = messages[1].id.clone();

        settle(&mut session).await;

        let reply = assistant(&session);
        assert_eq!(reply.id, assistant_id);
        assert_eq!(reply.content, "X is Y");
        assert!(!reply.streaming);
        let sources = reply.sources.as_ref().unwrap();
        assert_eq!(sources[0].document_id, "doc_1");
        assert!(session.error().is_none());
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn sources_wait_for_completion_and_stop_freezes_content() {
        let api = backend(vec![sources_frame(), chunk("Partial")], true).await;
        let mut session = ready_session(api).await;

        assert!(session.send("Tell me"));
        poll_until(&mut session, |s| assistant(s).content == "Partial").await;
        assert!(assistant(&session).sources.is_none());
        assert!(assistant(&session).streaming);

        assert!(session.stop());
        let reply = assistant(&session);
        assert_eq!(reply.content, "Partial");
        assert!(!reply.streaming);
        assert!(reply.sources.is_none());
        assert!(session.error().is_none());
        assert!(!session.is_busy());
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn send_is_single_flight() {
        let api = backend(vec![chunk("...")], true).await;
        let mut session = ready_session(api).await;

        assert!(session.send("first"));
        assert!(!session.send("second"));
        assert!(!session.send_non_streaming("third"));
        assert_eq!(session.messages().len(), 2);
        session.stop();
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let api = backend(vec![done()], false).await;
        let mut session = ready_session(api).await;

        assert!(!session.send("   \n"));
        assert!(!session.send(""));
        assert!(session.messages().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn send_is_rejected_while_history_loads() {
        let api = backend(vec![done()], false).await;
        let mut session = ChatSession::new(api, "kb1");

        assert!(session.is_loading_history());
        assert!(!session.send("too early"));
        settle(&mut session).await;
        assert!(session.send("now"));
        settle(&mut session).await;
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn send_is_rejected_while_clear_is_pending() {
        let api = backend(vec![chunk("answer"), done()], false).await;
        let mut session = ready_session(api).await;

        assert!(session.clear_history());
        assert!(!session.send("asked after clear"));
        assert!(!session.send_non_streaming("asked after clear"));
        settle(&mut session).await;
        assert!(session.messages().is_empty());
        assert!(session.error().is_none());

        assert!(session.send("asked after clear"));
        settle(&mut session).await;
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "asked after clear");
        assert_eq!(messages[1].content, "answer");
    }

    #[tokio::test]
    async fn later_sources_frame_replaces_earlier_one() {
        let sources = |doc: &str| {
            let data = json!([{"content": "excerpt", "document_id": doc}]);
            format!("data: {}\n\n", json!({"type": "sources", "data": data})).into_bytes()
        };
        let api = backend(
            vec![sources("doc_a"), sources("doc_b"), chunk("X is Y"), done()],
            false,
        )
        .await;
        let mut session = ready_session(api).await;

        assert!(session.send("What is X?"));
        settle(&mut session).await;

        let reply = assistant(&session);
        assert_eq!(reply.content, "X is Y");
        let sources = reply.sources.as_ref().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].document_id, "doc_b");
    }

    #[tokio::test]
    async fn successful_history_load_bumps_history_version() {
        let api = backend(Vec::new(), false).await;
        let mut session = ready_session(api).await;
        assert_eq!(session.history_version(), 1);

        assert!(session.load_history());
        settle(&mut session).await;
        assert_eq!(session.history_version(), 2);
    }

    #[tokio::test]
    async fn superseded_stream_cannot_touch_new_session() {
        let api = backend(Vec::new(), true).await;
        let mut session = ready_session(api).await;

        assert!(session.send("What is X?"));
        let old_generation = session.generation();
        let old_message_id = session.messages()[1].id.clone();

        session.switch_knowledge_base("kb2");
        assert_eq!(session.generation(), old_generation + 1);
        assert!(!session.is_streaming());
        settle(&mut session).await;
        assert_eq!(session.knowledge_base_id(), "kb2");
        assert!(session.messages().is_empty());

        let applied = session.apply(Tagged {
            generation: old_generation,
            update: Update::Stream {
                message_id: old_message_id,
                event: TransportEvent::Frame(Frame::Chunk("late".to_string())),
            },
        });
        assert!(!applied);
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn stopped_stream_events_do_not_leak_into_next_reply() {
        let api = backend(vec![chunk("a")], true).await;
        let mut session = ready_session(api).await;

        assert!(session.send("first"));
        let first_id = session.messages()[1].id.clone();
        session.stop();

        assert!(session.send("second"));
        let applied = session.apply(Tagged {
            generation: session.generation(),
            update: Update::Stream {
                message_id: first_id.clone(),
                event: TransportEvent::Frame(Frame::Chunk("stale".to_string())),
            },
        });
        assert!(!applied);
        let first = session.messages().iter().find(|m| m.id == first_id).unwrap();
        assert!(!first.content.contains("stale"));
        session.stop();
    }

    #[tokio::test]
    async fn transport_error_keeps_partial_answer() {
        let app = Router::new()
            .route(
                "/api/chat/:kb_id/history",
                get(|| async { Json(Vec::<HistoryMessage>::new()) }),
            )
            .route(
                "/api/chat/:kb_id/stream",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "generation failed") }),
            );
        let api = ApiClient::new(ClientConfig::new(&serve_router(app).await)).unwrap();
        let mut session = ready_session(api).await;

        assert!(session.send("What is X?"));
        settle(&mut session).await;

        let reply = assistant(&session);
        assert!(!reply.streaming);
        assert_eq!(reply.content, "");
        let error = session.error().unwrap();
        assert!(error.contains("500"), "{error}");
        assert!(error.contains("generation failed"), "{error}");
    }

    #[tokio::test]
    async fn closed_body_without_done_completes_reply() {
        let api = backend(vec![sources_frame(), chunk("answer")], false).await;
        let mut session = ready_session(api).await;

        session.send("q");
        settle(&mut session).await;

        let reply = assistant(&session);
        assert_eq!(reply.content, "answer");
        assert!(!reply.streaming);
        assert!(reply.sources.is_some());
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn history_is_loaded_in_backend_order() {
        let base_url = spawn_test_server().await;
        let api = ApiClient::new(ClientConfig::new(&base_url)).unwrap();
        api.chat(DEFAULT_KB_ID, &api.chat_request("first"))
            .await
            .unwrap();

        let mut session = ChatSession::new(api, DEFAULT_KB_ID);
        settle(&mut session).await;

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages.iter().all(|m| !m.streaming));
    }

    #[tokio::test]
    async fn streamed_reply_round_trips_through_mock_backend() {
        let base_url = spawn_test_server().await;
        let api = ApiClient::new(ClientConfig::new(&base_url)).unwrap();
        let mut session = ChatSession::new(api.clone(), DEFAULT_KB_ID);
        settle(&mut session).await;

        session.send("What is X?");
        settle(&mut session).await;
        assert_eq!(
            assistant(&session).content,
            "[Mock Streaming Response] Based on your question: What is X? "
        );
        assert_eq!(assistant(&session).sources.as_ref().unwrap().len(), 3);

        assert!(session.load_history());
        settle(&mut session).await;
        assert_eq!(session.messages().len(), 2);

        assert!(session.clear_history());
        settle(&mut session).await;
        assert!(session.messages().is_empty());
        assert!(api.history(DEFAULT_KB_ID).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_history_is_rejected_mid_stream() {
        let api = backend(Vec::new(), true).await;
        let mut session = ready_session(api).await;

        session.send("q");
        assert!(!session.load_history());
        session.stop();
        assert!(session.load_history());
        settle(&mut session).await;
    }

    #[tokio::test]
    async fn clear_during_stream_drops_the_stream() {
        let api = backend(vec![chunk("a")], true).await;
        let mut session = ready_session(api).await;

        session.send("q");
        let generation = session.generation();
        let message_id = session.messages()[1].id.clone();
        assert!(session.clear_history());
        settle(&mut session).await;

        assert!(session.messages().is_empty());
        assert!(!session.is_streaming());
        assert_eq!(session.generation(), generation + 1);

        let applied = session.apply(Tagged {
            generation,
            update: Update::Stream {
                message_id,
                event: TransportEvent::Frame(Frame::Chunk("b".to_string())),
            },
        });
        assert!(!applied);
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn failed_clear_keeps_local_messages() {
        let app = Router::new()
            .route(
                "/api/chat/:kb_id/history",
                get(|| async {
                    Json(json!([{
                        "id": "m1",
                        "role": "user",
                        "content": "kept",
                        "created_at": "2024-01-01T00:00:00"
                    }]))
                })
                .delete(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "disk full").into_response() }),
            );
        let api = ApiClient::new(ClientConfig::new(&serve_router(app).await)).unwrap();
        let mut session = ready_session(api).await;
        assert_eq!(session.messages().len(), 1);

        assert!(session.clear_history());
        settle(&mut session).await;

        assert_eq!(session.messages()[0].content, "kept");
        assert!(session.error().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn non_streaming_reply_is_appended_whole() {
        let base_url = spawn_test_server().await;
        let api = ApiClient::new(ClientConfig::new(&base_url)).unwrap();
        let mut session = ChatSession::new(api, DEFAULT_KB_ID);
        settle(&mut session).await;

        assert!(session.send_non_streaming("What is X?"));
        assert_eq!(session.messages().len(), 1);
        assert!(session.is_replying());
        settle(&mut session).await;

        let reply = assistant(&session);
        assert_eq!(reply.content, "[Mock Response] Based on your question: What is X?");
        assert!(!reply.streaming);
        assert_eq!(reply.sources.as_ref().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_knowledge_base_records_history_error() {
        let base_url = spawn_test_server().await;
        let api = ApiClient::new(ClientConfig::new(&base_url)).unwrap();
        let mut session = ChatSession::new(api, "missing");
        settle(&mut session).await;

        assert!(session.messages().is_empty());
        assert!(session.error().unwrap().contains("404"));
    }
}
