//! Command handlers.
//!
//! Each handler receives the decoded request plus the ambient daemon
//! context and returns the uniform reply envelope. Handlers drive CDP
//! against the active session; lifecycle commands work without one.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;

use crate::conn::Transport;
use crate::daemon::DaemonContext;
use crate::dispatch::{Reply, Request};
use crate::error::CdpError;
use crate::supervisor::{Session, Supervisor};

pub mod admin;
pub mod interact;
pub mod observe;
pub mod ready;

pub(crate) const NO_ACTIVE_SESSION: &str =
    "no active session - use 'webctl target <id>' to select";

/// Everything a session-scoped handler needs for one invocation.
pub(crate) struct ActiveCall {
    pub transport: Transport,
    pub supervisor: Arc<Supervisor>,
    pub session: Session,
    pub timeout: Duration,
}

impl ActiveCall {
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Issue a CDP call on the active session with the default deadline.
    pub async fn call(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        self.transport
            .send_on_session(&self.session.session_id, method, params, self.deadline())
            .await
    }
}

/// Decode command params; the handler never sees the raw envelope value.
pub(crate) fn parse_params<T: DeserializeOwned + Default>(req: &Request) -> Result<T, Reply> {
    let params = req.effective_params();
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params)
        .map_err(|err| Reply::failure(format!("invalid params: {err}")))
}

/// The insertion-ordered session list with the active one flagged, as
/// attached to `status`, `target`, and no-active-session errors.
pub(crate) fn sessions_json(ctx: &DaemonContext) -> serde_json::Value {
    match ctx.supervisor() {
        Some(supervisor) => {
            let active = supervisor.active_session_id();
            let sessions: Vec<serde_json::Value> = supervisor
                .list_sessions()
                .into_iter()
                .map(|session| session_json(&session, active.as_deref()))
                .collect();
            serde_json::Value::Array(sessions)
        }
        None => serde_json::Value::Array(Vec::new()),
    }
}

pub(crate) fn session_json(session: &Session, active: Option<&str>) -> serde_json::Value {
    let mut value = serde_json::to_value(session).unwrap_or_default();
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "active".to_string(),
            serde_json::Value::Bool(Some(session.session_id.as_str()) == active),
        );
    }
    value
}

/// Resolve the active session or produce the stable error envelope with the
/// session list inlined.
pub(crate) fn require_active(ctx: &DaemonContext) -> Result<ActiveCall, Reply> {
    let Some(link) = ctx.browser() else {
        return Err(Reply::failure_with(
            NO_ACTIVE_SESSION,
            serde_json::json!({ "sessions": [] }),
        ));
    };
    if link.transport.is_closed() {
        return Err(Reply::failure("daemon shutting down"));
    }
    match link.supervisor.active_session() {
        Some(session) => Ok(ActiveCall {
            transport: link.transport.clone(),
            supervisor: link.supervisor.clone(),
            session,
            timeout: ctx.command_timeout,
        }),
        None => Err(Reply::failure_with(
            NO_ACTIVE_SESSION,
            serde_json::json!({ "sessions": sessions_json(ctx) }),
        )),
    }
}

/// Map a CDP-layer error onto the envelope. Protocol errors pass through
/// verbatim; a closed transport reads as the daemon going away.
pub(crate) fn cdp_failure(err: CdpError) -> Reply {
    match err {
        CdpError::Closed => Reply::failure("daemon shutting down"),
        other => Reply::failure(other.to_string()),
    }
}

/// `DOM.getDocument` + `DOM.querySelector`, with the stable not-found
/// message.
pub(crate) async fn resolve_node(call: &ActiveCall, selector: &str) -> Result<i64, Reply> {
    let doc = call
        .call("DOM.getDocument", Some(serde_json::json!({ "depth": 0 })))
        .await
        .map_err(cdp_failure)?;
    let root = doc["root"]["nodeId"].as_i64().unwrap_or_default();

    let found = call
        .call(
            "DOM.querySelector",
            Some(serde_json::json!({ "nodeId": root, "selector": selector })),
        )
        .await
        .map_err(cdp_failure)?;
    match found["nodeId"].as_i64() {
        Some(node_id) if node_id != 0 => Ok(node_id),
        _ => Err(Reply::failure(format!("element not found: {selector}"))),
    }
}

/// Embed a string into a generated JavaScript expression.
pub(crate) fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}
