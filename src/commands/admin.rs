use std::sync::Arc;

use serde::Deserialize;

use super::{parse_params, session_json, sessions_json};
use crate::daemon::DaemonContext;
use crate::dispatch::{Reply, Request};
use crate::supervisor::SwitchOutcome;

/// Daemon liveness plus the session table. Works with or without a browser.
pub async fn status(ctx: &Arc<DaemonContext>, _req: &Request) -> Reply {
    let active = ctx
        .supervisor()
        .and_then(|supervisor| supervisor.active_session())
        .map(|session| session_json(&session, Some(session.session_id.as_str())))
        .unwrap_or(serde_json::Value::Null);

    Reply::success(serde_json::json!({
        "running": true,
        "pid": ctx.pid,
        "sessions": sessions_json(ctx),
        "activeSession": active,
    }))
}

/// List sessions, or switch the active one when a query is given.
pub async fn target(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let Some(query) = req.target.as_deref().filter(|q| !q.is_empty()) else {
        return Reply::success(serde_json::json!({
            "sessions": sessions_json(ctx),
            "activeSession": active_json(ctx),
        }));
    };

    let Some(supervisor) = ctx.supervisor() else {
        return Reply::failure_with(
            format!("no matching target '{query}'"),
            serde_json::json!({ "sessions": [] }),
        );
    };

    match supervisor.switch_active(query) {
        SwitchOutcome::Switched(session) => Reply::success(serde_json::json!({
            "sessions": sessions_json(ctx),
            "activeSession": session_json(&session, Some(session.session_id.as_str())),
        })),
        SwitchOutcome::Ambiguous(candidates) => {
            let candidates: Vec<_> = candidates
                .iter()
                .map(|session| session_json(session, supervisor.active_session_id().as_deref()))
                .collect();
            Reply::failure_with(
                format!("ambiguous target '{query}'"),
                serde_json::json!({ "sessions": candidates }),
            )
        }
        SwitchOutcome::NotFound(all) => {
            let all: Vec<_> = all
                .iter()
                .map(|session| session_json(session, supervisor.active_session_id().as_deref()))
                .collect();
            Reply::failure_with(
                format!("no matching target '{query}'"),
                serde_json::json!({ "sessions": all }),
            )
        }
    }
}

fn active_json(ctx: &DaemonContext) -> serde_json::Value {
    ctx.supervisor()
        .and_then(|supervisor| supervisor.active_session())
        .map(|session| session_json(&session, Some(session.session_id.as_str())))
        .unwrap_or(serde_json::Value::Null)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClearParams {
    target: Option<String>,
}

/// Drop buffered entries. Idempotent; `network` and `all` also delete the
/// body files this process wrote.
pub async fn clear(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let params: ClearParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let target = params
        .target
        .or_else(|| req.target.clone())
        .unwrap_or_else(|| "all".to_string());

    match target.as_str() {
        "console" => ctx.buffers.clear_console(),
        "network" => ctx.buffers.clear_network(),
        "all" => ctx.buffers.clear_all(),
        other => {
            return Reply::failure(format!(
                "invalid clear target '{other}', expected console, network or all"
            ))
        }
    }
    Reply::success(serde_json::json!({ "cleared": target }))
}

/// Reply, then take the process down: close the transport and exit.
pub async fn shutdown(ctx: &Arc<DaemonContext>, _req: &Request) -> Reply {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        // Small grace period so the reply reaches the client first.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        ctx.request_shutdown();
    });
    Reply::success(serde_json::json!({ "stopping": true }))
}
