use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::CodecError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Not connected")]
    NotConnected,
}
