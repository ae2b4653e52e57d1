//! Error types for aichat

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error (connect, read, decode)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O error (stdout, history file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The server answered with a non-success status
    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// The model asked for a tool the executor does not know
    #[error("Function {0} not found")]
    ToolNotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Bad `-F` attachment argument
    #[error("Attachment error: {0}")]
    Attachment(String),

    /// Conversation history store failure
    #[error("History error: {0}")]
    History(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error from a status code and response body
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Error::Api {
            status,
            body: body.into(),
        }
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn attachment(msg: impl Into<String>) -> Self {
        Error::Attachment(msg.into())
    }

    pub fn history(msg: impl Into<String>) -> Self {
        Error::History(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Maps a transport failure, keeping timeouts distinguishable.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("endpoint is empty");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: endpoint is empty");
    }

    #[test]
    fn test_error_api() {
        let err = Error::api(500, "Internal Server Error");
        assert!(matches!(err, Error::Api { status: 500, .. }));
        assert_eq!(
            err.to_string(),
            "API request failed with status 500: Internal Server Error"
        );
    }

    #[test]
    fn test_error_tool_not_found() {
        let err = Error::ToolNotFound("launch_rocket".to_string());
        assert_eq!(err.to_string(), "Function launch_rocket not found");
    }

    #[test]
    fn test_error_tool() {
        let err = Error::tool("boom");
        assert!(matches!(err, Error::Tool(_)));
        assert_eq!(err.to_string(), "Tool execution error: boom");
    }

    #[test]
    fn test_error_attachment() {
        let err = Error::attachment("missing image=@ prefix");
        assert_eq!(err.to_string(), "Attachment error: missing image=@ prefix");
    }

    #[test]
    fn test_error_timeout() {
        let err = Error::timeout();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(err.to_string(), "Request timeout");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
