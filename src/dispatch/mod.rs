//! The unified command execution layer.
//!
//! One typed request/response contract served over three interchangeable
//! executors: the local Unix socket, the optional TCP listener, and a direct
//! in-process call. All three share the handler set and the ambient daemon
//! context, so behaviour cannot diverge between them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::commands;
use crate::daemon::DaemonContext;

pub mod executor;
pub mod server;

pub use executor::{DirectExecutor, Executor, LocalExecutor, TcpExecutor};

/// The request envelope shared by every executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    /// Session query for the `target` command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
    /// Shared token for the TCP listener; ignored on the other transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Clients may also inline command parameters as top-level keys; they
    /// are treated as `params` when that field is absent.
    #[serde(flatten, default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            params: serde_json::Value::Null,
            target: None,
            debug: false,
            auth: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The command parameters, whether nested under `params` or inlined at
    /// the top level of the envelope.
    pub fn effective_params(&self) -> serde_json::Value {
        if !self.params.is_null() {
            self.params.clone()
        } else if !self.extra.is_empty() {
            serde_json::Value::Object(self.extra.clone())
        } else {
            serde_json::Value::Null
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// The response envelope. Field naming is stable; new payload keys may be
/// added but never renamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Reply {
    /// A success reply; `payload` must serialize to a JSON object or null.
    pub fn success(payload: serde_json::Value) -> Self {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            ok: true,
            error: None,
            payload,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            payload: serde_json::Map::new(),
        }
    }

    /// An error reply carrying extra context, e.g. the session list attached
    /// to a no-active-session error.
    pub fn failure_with(error: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut reply = Reply::failure(error);
        if let serde_json::Value::Object(map) = payload {
            reply.payload = map;
        }
        reply
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.get(key)
    }
}

/// Route a request to its handler. Every executor funnels through here.
pub async fn execute(ctx: &Arc<DaemonContext>, req: Request) -> Reply {
    if req.debug {
        tracing::debug!(cmd = %req.cmd, params = %req.params, "dispatching");
    }

    let reply = match req.cmd.as_str() {
        "status" => commands::admin::status(ctx, &req).await,
        "target" => commands::admin::target(ctx, &req).await,
        "clear" => commands::admin::clear(ctx, &req).await,
        "shutdown" => commands::admin::shutdown(ctx, &req).await,

        "console" => commands::observe::console(ctx, &req).await,
        "network" => commands::observe::network(ctx, &req).await,
        "html" => commands::observe::html(ctx, &req).await,
        "css" => commands::observe::css(ctx, &req).await,
        "cookies" => commands::observe::cookies(ctx, &req).await,
        "screenshot" => commands::observe::screenshot(ctx, &req).await,
        "eval" => commands::observe::eval(ctx, &req).await,

        "navigate" => commands::interact::navigate(ctx, &req).await,
        "reload" => commands::interact::reload(ctx, &req).await,
        "back" => commands::interact::back(ctx, &req).await,
        "forward" => commands::interact::forward(ctx, &req).await,
        "click" => commands::interact::click(ctx, &req).await,
        "type" => commands::interact::type_text(ctx, &req).await,
        "focus" => commands::interact::focus(ctx, &req).await,
        "key" => commands::interact::key(ctx, &req).await,
        "select" => commands::interact::select(ctx, &req).await,
        "scroll" => commands::interact::scroll(ctx, &req).await,

        "ready" => commands::ready::ready(ctx, &req).await,

        other => Reply::failure(format!("unknown command: {other}")),
    };

    if req.debug {
        tracing::debug!(cmd = %req.cmd, ok = reply.ok, "dispatched");
    }
    reply
}
