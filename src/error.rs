use thiserror::Error;

/// Main error type for the DXLink provider.
#[derive(Error, Debug)]
pub enum DxLinkError {
    #[error("Authentication rejected by feed: {0}")]
    Authentication(String),

    #[error("Handshake did not reach ready state within {0} seconds")]
    ConnectTimeout(u64),

    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Wire parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Token provider error: {0}")]
    Token(String),

    #[error("Maximum reconnect attempts exceeded")]
    MaxReconnectAttempts,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DxLinkError {
    /// Whether the reconnection machine should keep retrying after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DxLinkError::Authentication(_)
                | DxLinkError::ConnectTimeout(_)
                | DxLinkError::ChannelOpen(_)
                | DxLinkError::Transport(_)
                | DxLinkError::Token(_)
        )
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            DxLinkError::Authentication(_) => "authentication",
            DxLinkError::ConnectTimeout(_) => "connect_timeout",
            DxLinkError::ChannelOpen(_) => "channel_open",
            DxLinkError::Send(_) => "send",
            DxLinkError::Transport(_) => "transport",
            DxLinkError::Parse(_) => "parse",
            DxLinkError::Token(_) => "token",
            DxLinkError::MaxReconnectAttempts => "max_reconnect_attempts",
            DxLinkError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, DxLinkError>;
