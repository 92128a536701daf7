use tokio_tungstenite::tungstenite;

/// Why a `join` call failed. Delivered exactly once to the original caller.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("no available voice nodes")]
    NoAvailableNodes,
    #[error("voice connection timeout")]
    Timeout,
    #[error("invalid channel id")]
    InvalidChannel,
    #[error("disconnected{}", reason_suffix(.0))]
    Disconnected(Option<String>),
    #[error("gateway error: {0}")]
    Gateway(String),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

/// Node-local failure. Never fatal to the pool; the node stays disconnected
/// until its backoff fires.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("invalid handshake header: {0}")]
    Handshake(#[from] tungstenite::http::header::InvalidHeaderValue),
}
