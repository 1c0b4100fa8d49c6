//! Streaming chat transport.
//!
//! One [`StreamTransport::start`] call issues exactly one request and drives
//! the response body through a [`FrameDecoder`] on a background task. Events
//! are delivered over a channel rather than callbacks, and the returned
//! [`CancelHandle`] aborts the request synchronously.

use crate::error::ClientError;
use crate::frame::FrameDecoder;
use crate::protocol::Frame;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use reqwest::header::ACCEPT;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Lifecycle of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Errored | StreamState::Cancelled
        )
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Frame(Frame),
    /// Unrequested failure. Always the last event of its stream.
    Failed(ClientError),
    /// The body ended without a `done` frame.
    Closed,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<StreamState>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Aborts a stream. Cloneable, and idempotent once the stream is terminal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
    task: AbortHandle,
}

impl CancelHandle {
    /// Stops the stream. No event is delivered after this returns.
    pub fn cancel(&self) {
        {
            let mut state = self.shared.lock();
            if state.is_terminal() {
                return;
            }
            *state = StreamState::Cancelled;
        }
        self.task.abort();
        debug!("stream cancelled");
    }

    pub fn state(&self) -> StreamState {
        *self.shared.lock()
    }

    /// Ties the stream to a scope: dropping the guard cancels it.
    pub fn into_guard(self) -> StreamGuard {
        StreamGuard { handle: self }
    }
}

#[derive(Debug)]
pub struct StreamGuard {
    handle: CancelHandle,
}

impl StreamGuard {
    pub fn handle(&self) -> &CancelHandle {
        &self.handle
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Opens streaming chat requests. Holds no per-stream state.
#[derive(Clone, Debug)]
pub struct StreamTransport {
    http: HttpClient,
}

impl StreamTransport {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Posts `payload` to `endpoint` and forwards every parsed event to `sink`,
    /// passed through `wrap` so callers can tag events before they are queued.
    ///
    /// Exactly one of a `done` frame, [`TransportEvent::Closed`] or
    /// [`TransportEvent::Failed`] ends the stream, unless it is cancelled first,
    /// in which case nothing further is sent.
    pub fn start<T, E, F>(
        &self,
        endpoint: &str,
        payload: &T,
        sink: mpsc::UnboundedSender<E>,
        wrap: F,
    ) -> CancelHandle
    where
        T: Serialize + ?Sized,
        E: Send + 'static,
        F: Fn(TransportEvent) -> E + Send + 'static,
    {
        let request = self
            .http
            .post(endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(payload);

        let shared = Arc::new(Shared::new());
        *shared.lock() = StreamState::Connecting;

        let emitter = Emitter {
            shared: Arc::clone(&shared),
            sink,
            wrap,
        };
        let endpoint = endpoint.to_string();
        let task = tokio::spawn(async move {
            read_stream(request, emitter).await;
            debug!(endpoint = %endpoint, "stream reader finished");
        });

        CancelHandle {
            shared,
            task: task.abort_handle(),
        }
    }

    /// Like [`start`](Self::start) with a dedicated, untagged channel.
    pub fn open<T>(
        &self,
        endpoint: &str,
        payload: &T,
    ) -> (CancelHandle, mpsc::UnboundedReceiver<TransportEvent>)
    where
        T: Serialize + ?Sized,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.start(endpoint, payload, tx, |event| event);
        (cancel, rx)
    }
}

struct Emitter<E, F> {
    shared: Arc<Shared>,
    sink: mpsc::UnboundedSender<E>,
    wrap: F,
}

impl<E, F> Emitter<E, F>
where
    F: Fn(TransportEvent) -> E,
{
    /// Moves to `next` and delivers `event`, unless the stream already ended.
    ///
    /// The state lock is held across the send so a concurrent cancel either
    /// happens before (nothing is sent) or after (the event was queued first).
    fn emit(&self, next: StreamState, event: Option<TransportEvent>) -> bool {
        let mut state = self.shared.lock();
        if state.is_terminal() {
            return false;
        }
        *state = next;

        if let Some(event) = event {
            if self.sink.send((self.wrap)(event)).is_err() {
                *state = StreamState::Cancelled;
                return false;
            }
        }
        true
    }

    fn fail(&self, err: ClientError) {
        warn!(error = %err, "chat stream failed");
        self.emit(StreamState::Errored, Some(TransportEvent::Failed(err)));
    }

    /// Returns false once no more frames should be read.
    fn frame(&self, frame: Frame) -> bool {
        let done = frame.is_terminal();
        let next = if done {
            StreamState::Completed
        } else {
            StreamState::Streaming
        };
        self.emit(next, Some(TransportEvent::Frame(frame))) && !done
    }
}

async fn read_stream<E, F>(request: reqwest::RequestBuilder, emitter: Emitter<E, F>)
where
    F: Fn(TransportEvent) -> E,
{
    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => return emitter.fail(err.into()),
    };

    if !response.status().is_success() {
        let err = ClientError::from_response("Failed to open stream", response).await;
        return emitter.fail(err);
    }

    if !emitter.emit(StreamState::Streaming, None) {
        return;
    }
    debug!(status = %response.status(), "chat stream open");

    let mut body = response.bytes_stream();
    let mut decoder = FrameDecoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => return emitter.fail(err.into()),
        };

        for frame in decoder.feed(&chunk) {
            if !emitter.frame(frame) {
                return;
            }
        }
    }

    if let Some(frame) = decoder.finish() {
        if !emitter.frame(frame) {
            return;
        }
    }

    emitter.emit(StreamState::Completed, Some(TransportEvent::Closed));
}
