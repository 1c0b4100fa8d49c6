use reqwest::StatusCode;
use thiserror::Error;

/// Errors produced by the HTTP wrappers and the stream transport.
///
/// The `Display` output is what a chat session records as its error string.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, read, or request-building failure.
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("{context}: {status} - {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A message was empty after trimming.
    #[error("message is empty")]
    EmptyMessage,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Reads the body of a failed response into a [`ClientError::Status`].
    pub async fn from_response(context: &'static str, response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::Status {
            context,
            status,
            body,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
