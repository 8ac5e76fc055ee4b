use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CdpError, Result};

/// The whole string identifier of a protocol method like `Page.navigate`.
pub type MethodId = Cow<'static, str>;

/// Identifier correlating a request with its response.
///
/// Ids are assigned from a process-wide counter and are never reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(i64);

impl CallId {
    pub fn new(id: i64) -> Self {
        CallId(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({})", self.0)
    }
}

/// A request sent to the browser, identified by `id`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MethodCall {
    pub id: CallId,
    pub method: MethodId,
    /// The session the browser should route this call to, omitted for
    /// browser-scope calls.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// A response to a [`MethodCall`].
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
pub struct Response {
    pub id: CallId,
    pub result: Option<serde_json::Value>,
    pub error: Option<Error>,
}

/// An event emitted by the browser, optionally tagged with the session it
/// originated from.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
pub struct Event {
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

/// The error type emitted by the browser for failed requests.
///
/// Carried verbatim; never rewritten into a different error kind when
/// surfaced to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cdp error {}: {}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " ({data})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// An inbound frame is either a response to a submitted call or an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Response),
    Event(Event),
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<i64>,
    method: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<Error>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// Serialize a call into the UTF-8 JSON the browser expects, no trailing
/// newline.
pub fn encode(call: &MethodCall) -> Result<String> {
    serde_json::to_string(call).map_err(CdpError::from)
}

/// Classify an inbound frame as a response or an event.
///
/// A frame carrying both a non-zero numeric `id` and a `method` classifies as
/// a response: the protocol guarantees events carry no id, so the id wins.
pub fn decode(raw: &str) -> Result<Frame> {
    let frame: RawFrame = serde_json::from_str(raw)
        .map_err(|e| CdpError::MalformedFrame(e.to_string()))?;

    match frame.id {
        Some(id) if id != 0 => Ok(Frame::Response(Response {
            id: CallId::new(id),
            result: frame.result,
            error: frame.error,
        })),
        _ => match frame.method {
            Some(method) if !method.is_empty() => Ok(Frame::Event(Event {
                method,
                params: frame.params,
                session_id: frame.session_id,
            })),
            _ => Err(CdpError::MalformedFrame(
                "frame carries neither an id nor a method".to_string(),
            )),
        },
    }
}
