use std::fmt;

use thiserror::Error;

use crate::stream::chain::ChainError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Http,
    Https,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Http => f.write_str("http"),
            ListenerKind::Https => f.write_str("https"),
        }
    }
}

/// Everything that can abort a single relayed request, response, message or datagram.
///
/// None of these are fatal to the service: the implicated relay or chain is torn down and
/// the error is logged.
#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("{0} server not ready")]
    ListenerNotReady(ListenerKind),
    #[error("bad header: {0}")]
    BadHeader(String),
    #[error("request canceled by hook")]
    HookBlocked,
    #[error("hook failed: {0:#}")]
    HookFailed(anyhow::Error),
    #[error("host is required")]
    MissingHost,
    #[error("invalid request target `{0}`")]
    InvalidTarget(String),
    #[error("inbound connection already closed")]
    InboundClosed,
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("unsupported content-encoding `{0}`")]
    UnsupportedEncoding(String),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("invalid dispatch options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}

impl From<std::io::Error> for InterceptError {
    fn from(err: std::io::Error) -> Self {
        InterceptError::Transport(err.into())
    }
}

impl From<hyper::Error> for InterceptError {
    fn from(err: hyper::Error) -> Self {
        InterceptError::Transport(err.into())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for InterceptError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        InterceptError::Transport(err.into())
    }
}

impl From<tokio::time::error::Elapsed> for InterceptError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        InterceptError::Transport(err.into())
    }
}
