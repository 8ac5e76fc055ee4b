use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T, E = CdpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error("{0}")]
    Ws(#[from] tungstenite::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// A protocol-level error returned by the browser, passed through
    /// verbatim.
    #[error("{0}")]
    Chrome(#[from] crate::wire::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("request timed out")]
    Timeout,
    /// The transport is closed; every pending caller observes this exactly
    /// once.
    #[error("connection closed")]
    Closed,
    #[error("received no response from the browser instance")]
    NoResponse,
    #[error("{0}")]
    Url(#[from] url::ParseError),
    #[error("{0}")]
    Decode(#[from] base64::DecodeError),
    /// Error message not covered by any of the above.
    #[error("{0}")]
    Message(String),
}

impl CdpError {
    pub fn msg(msg: impl Into<String>) -> Self {
        CdpError::Message(msg.into())
    }

    /// True when this error came back from the browser rather than from the
    /// transport.
    pub fn is_protocol(&self) -> bool {
        matches!(self, CdpError::Chrome(_))
    }
}
