use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::{cdp_failure, parse_params, require_active, ActiveCall};
use crate::daemon::DaemonContext;
use crate::dispatch::{Reply, Request};

/// How long the network must stay quiet to count as idle.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);
/// Polling cadence for the selector/predicate/idle modes.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReadyParams {
    selector: Option<String>,
    predicate: Option<String>,
    network_idle: bool,
    timeout_secs: Option<u64>,
}

/// Synchronisation command with four modes, first match wins:
/// selector poll, JavaScript predicate, network idle, document readiness.
/// All four share a single deadline.
pub async fn ready(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: ReadyParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(call.timeout);
    let deadline = Instant::now() + timeout;

    let outcome = if let Some(selector) = &params.selector {
        wait_for_selector(&call, selector, deadline).await
    } else if let Some(predicate) = &params.predicate {
        wait_for_predicate(&call, predicate, deadline).await
    } else if params.network_idle {
        wait_for_network_idle(ctx, &call, deadline).await
    } else {
        wait_for_document(&call, deadline).await
    };

    match outcome {
        Ok(reply) => reply,
        Err(()) => Reply::failure(format!("ready timed out after {timeout:?}")),
    }
}

async fn wait_for_selector(
    call: &ActiveCall,
    selector: &str,
    deadline: Instant,
) -> Result<Reply, ()> {
    loop {
        let doc = call
            .call("DOM.getDocument", Some(serde_json::json!({ "depth": 0 })))
            .await;
        if let Ok(doc) = doc {
            let root = doc["root"]["nodeId"].as_i64().unwrap_or_default();
            if let Ok(found) = call
                .call(
                    "DOM.querySelector",
                    Some(serde_json::json!({ "nodeId": root, "selector": selector })),
                )
                .await
            {
                if found["nodeId"].as_i64().unwrap_or_default() != 0 {
                    return Ok(Reply::success(serde_json::json!({ "matched": selector })));
                }
            }
        }
        if pause(deadline).await.is_err() {
            return Err(());
        }
    }
}

async fn wait_for_predicate(
    call: &ActiveCall,
    predicate: &str,
    deadline: Instant,
) -> Result<Reply, ()> {
    loop {
        let result = call
            .transport
            .send_on_session(
                &call.session.session_id,
                "Runtime.evaluate",
                Some(serde_json::json!({
                    "expression": predicate,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
                deadline,
            )
            .await;
        if let Ok(result) = result {
            if is_truthy(&result["result"]["value"]) {
                return Ok(Reply::success(serde_json::json!({})));
            }
        }
        if pause(deadline).await.is_err() {
            return Err(());
        }
    }
}

async fn wait_for_network_idle(
    ctx: &Arc<DaemonContext>,
    call: &ActiveCall,
    deadline: Instant,
) -> Result<Reply, ()> {
    let session = call.session.session_id.as_str();
    loop {
        let inflight = ctx.buffers.network.inflight(session);
        let quiet = match ctx.buffers.network.last_activity(session) {
            Some(at) => at.elapsed() >= NETWORK_IDLE_WINDOW,
            // No requests observed at all counts as quiet.
            None => true,
        };
        if inflight == 0 && quiet {
            return Ok(Reply::success(serde_json::json!({})));
        }
        if pause(deadline).await.is_err() {
            return Err(());
        }
    }
}

async fn wait_for_document(call: &ActiveCall, deadline: Instant) -> Result<Reply, ()> {
    // Already-loaded pages return immediately.
    let mut load_rx = call.supervisor.watch_load();
    let state = call
        .call(
            "Runtime.evaluate",
            Some(serde_json::json!({
                "expression": "document.readyState",
                "returnByValue": true,
            })),
        )
        .await;
    match state {
        Ok(result) if result["result"]["value"].as_str() == Some("complete") => {
            return Ok(Reply::success(serde_json::json!({})));
        }
        Ok(_) => {}
        Err(err) => return Ok(cdp_failure(err)),
    }

    loop {
        match tokio::time::timeout_at(deadline, load_rx.recv()).await {
            Ok(Ok(session)) if session == call.session.session_id => {
                return Ok(Reply::success(serde_json::json!({})));
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Ok(Reply::failure("daemon shutting down")),
            Err(_) => return Err(()),
        }
    }
}

/// Sleep one poll interval, failing once the shared deadline has passed.
async fn pause(deadline: Instant) -> Result<(), ()> {
    if Instant::now() + POLL_INTERVAL >= deadline {
        // Let the clock actually reach the deadline before reporting it.
        tokio::time::sleep_until(deadline).await;
        return Err(());
    }
    tokio::time::sleep(POLL_INTERVAL).await;
    Ok(())
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Null => false,
        _ => true,
    }
}
