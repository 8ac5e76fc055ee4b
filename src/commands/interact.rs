use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::{cdp_failure, js_string, parse_params, require_active, resolve_node, ActiveCall};
use crate::daemon::DaemonContext;
use crate::dispatch::{Reply, Request};
use crate::error::CdpError;
use crate::supervisor::NavCommit;

/// Wait for the main frame of the session to commit a navigation.
///
/// This is a commit, not a load: it is enough to keep titles and URLs fresh
/// without paying for the full page load.
async fn await_commit(
    call: &ActiveCall,
    mut nav_rx: tokio::sync::broadcast::Receiver<NavCommit>,
    deadline: Instant,
) -> Result<String, Reply> {
    loop {
        let commit = match tokio::time::timeout_at(deadline, nav_rx.recv()).await {
            Ok(Ok(commit)) => commit,
            Ok(Err(_)) => return Err(Reply::failure("daemon shutting down")),
            Err(_) => return Err(Reply::failure("navigation timed out")),
        };
        if commit.session_id == call.session.session_id && commit.is_main_frame {
            return Ok(commit.url);
        }
    }
}

/// Optionally extend the wait until `Page.loadEventFired`.
async fn await_load(
    call: &ActiveCall,
    mut load_rx: tokio::sync::broadcast::Receiver<String>,
    deadline: Instant,
) -> Result<(), Reply> {
    loop {
        let session = match tokio::time::timeout_at(deadline, load_rx.recv()).await {
            Ok(Ok(session)) => session,
            Ok(Err(_)) => return Err(Reply::failure("daemon shutting down")),
            Err(_) => return Err(Reply::failure("page load timed out")),
        };
        if session == call.session.session_id {
            return Ok(());
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NavigateParams {
    url: Option<String>,
    wait: bool,
    timeout_secs: Option<u64>,
}

pub async fn navigate(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: NavigateParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(url) = params.url else {
        return Reply::failure("navigate requires a url");
    };

    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(call.timeout);
    let deadline = Instant::now() + timeout;

    // Subscribed before the command goes out so the commit cannot be missed.
    let nav_rx = call.supervisor.watch_navigation();
    let load_rx = call.supervisor.watch_load();

    let result = match call
        .call("Page.navigate", Some(serde_json::json!({ "url": url })))
        .await
    {
        Ok(result) => result,
        Err(err) => return cdp_failure(err),
    };
    if let Some(error_text) = result["errorText"].as_str() {
        if !error_text.is_empty() {
            return Reply::failure(format!("navigation failed: {error_text}"));
        }
    }

    let committed = match await_commit(&call, nav_rx, deadline).await {
        Ok(url) => url,
        Err(reply) => return reply,
    };
    if params.wait {
        if let Err(reply) = await_load(&call, load_rx, deadline).await {
            return reply;
        }
    }

    Reply::success(serde_json::json!({ "url": committed }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ReloadParams {
    wait: bool,
    timeout_secs: Option<u64>,
}

pub async fn reload(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: ReloadParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(call.timeout);
    let deadline = Instant::now() + timeout;
    let nav_rx = call.supervisor.watch_navigation();
    let load_rx = call.supervisor.watch_load();

    if let Err(err) = call.call("Page.reload", None).await {
        return cdp_failure(err);
    }
    let committed = match await_commit(&call, nav_rx, deadline).await {
        Ok(url) => url,
        Err(reply) => return reply,
    };
    if params.wait {
        if let Err(reply) = await_load(&call, load_rx, deadline).await {
            return reply;
        }
    }
    Reply::success(serde_json::json!({ "url": committed }))
}

pub async fn back(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    history_step(ctx, req, -1, "nothing to go back to").await
}

pub async fn forward(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    history_step(ctx, req, 1, "nothing to go forward to").await
}

async fn history_step(
    ctx: &Arc<DaemonContext>,
    req: &Request,
    step: i64,
    exhausted: &str,
) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: ReloadParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    let history = match call.call("Page.getNavigationHistory", None).await {
        Ok(history) => history,
        Err(err) => return cdp_failure(err),
    };
    let current = history["currentIndex"].as_i64().unwrap_or_default();
    let entries = history["entries"].as_array().cloned().unwrap_or_default();
    let target = current + step;
    if target < 0 || target as usize >= entries.len() {
        return Reply::failure(exhausted.to_string());
    }
    let Some(entry_id) = entries[target as usize]["id"].as_i64() else {
        return Reply::failure(exhausted.to_string());
    };

    let timeout = params
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(call.timeout);
    let deadline = Instant::now() + timeout;
    let nav_rx = call.supervisor.watch_navigation();
    let load_rx = call.supervisor.watch_load();

    if let Err(err) = call
        .call(
            "Page.navigateToHistoryEntry",
            Some(serde_json::json!({ "entryId": entry_id })),
        )
        .await
    {
        return cdp_failure(err);
    }
    let committed = match await_commit(&call, nav_rx, deadline).await {
        Ok(url) => url,
        Err(reply) => return reply,
    };
    if params.wait {
        if let Err(reply) = await_load(&call, load_rx, deadline).await {
            return reply;
        }
    }
    Reply::success(serde_json::json!({ "url": committed }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SelectorParams {
    selector: Option<String>,
}

pub async fn click(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: SelectorParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(selector) = params.selector else {
        return Reply::failure("click requires a selector");
    };

    let node_id = match resolve_node(&call, &selector).await {
        Ok(node_id) => node_id,
        Err(reply) => return reply,
    };

    let model = match call
        .call("DOM.getBoxModel", Some(serde_json::json!({ "nodeId": node_id })))
        .await
    {
        Ok(model) => model,
        Err(err) => return cdp_failure(err),
    };
    let Some(quad) = model["model"]["content"].as_array() else {
        return Reply::failure(format!("element has no box model: {selector}"));
    };
    let xs: Vec<f64> = quad.iter().step_by(2).filter_map(|v| v.as_f64()).collect();
    let ys: Vec<f64> = quad
        .iter()
        .skip(1)
        .step_by(2)
        .filter_map(|v| v.as_f64())
        .collect();
    if xs.is_empty() || ys.is_empty() {
        return Reply::failure(format!("element has no box model: {selector}"));
    }
    let x = xs.iter().sum::<f64>() / xs.len() as f64;
    let y = ys.iter().sum::<f64>() / ys.len() as f64;

    // Non-fatal: report when the centre point actually hits some other
    // element, the click is dispatched regardless.
    let probe = format!(
        "(() => {{ const el = document.querySelector({sel}); if (!el) return true; \
         const hit = document.elementFromPoint({x}, {y}); \
         return !!(hit && (hit === el || el.contains(hit))); }})()",
        sel = js_string(&selector),
    );
    let covered = match call
        .call(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": probe, "returnByValue": true })),
        )
        .await
    {
        Ok(result) => result["result"]["value"].as_bool() == Some(false),
        Err(_) => false,
    };

    for kind in ["mousePressed", "mouseReleased"] {
        if let Err(err) = call
            .call(
                "Input.dispatchMouseEvent",
                Some(serde_json::json!({
                    "type": kind,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                })),
            )
            .await
        {
            return cdp_failure(err);
        }
    }

    if covered {
        Reply::success(serde_json::json!({ "warning": "element appears covered" }))
    } else {
        Reply::success(serde_json::json!({}))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TypeParams {
    text: Option<String>,
    selector: Option<String>,
    clear: bool,
    key: Option<String>,
}

pub async fn type_text(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: TypeParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(text) = params.text else {
        return Reply::failure("type requires text");
    };

    if let Some(selector) = &params.selector {
        let node_id = match resolve_node(&call, selector).await {
            Ok(node_id) => node_id,
            Err(reply) => return reply,
        };
        if let Err(err) = call
            .call("DOM.focus", Some(serde_json::json!({ "nodeId": node_id })))
            .await
        {
            return cdp_failure(err);
        }
    }

    if params.clear {
        // Select-all with the platform shortcut, then delete the selection.
        let modifiers = if cfg!(target_os = "macos") { 4 } else { 2 };
        if let Err(err) = dispatch_key_with_modifiers(&call, "a", "KeyA", 65, modifiers).await {
            return cdp_failure(err);
        }
        if let Err(err) = dispatch_key(&call, "Backspace").await {
            return cdp_failure(err);
        }
    }

    if let Err(err) = call
        .call("Input.insertText", Some(serde_json::json!({ "text": text })))
        .await
    {
        return cdp_failure(err);
    }

    if let Some(key) = &params.key {
        if let Err(err) = dispatch_key(&call, key).await {
            return cdp_failure(err);
        }
    }

    Reply::success(serde_json::json!({}))
}

pub async fn focus(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: SelectorParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(selector) = params.selector else {
        return Reply::failure("focus requires a selector");
    };
    let node_id = match resolve_node(&call, &selector).await {
        Ok(node_id) => node_id,
        Err(reply) => return reply,
    };
    match call
        .call("DOM.focus", Some(serde_json::json!({ "nodeId": node_id })))
        .await
    {
        Ok(_) => Reply::success(serde_json::json!({})),
        Err(err) => cdp_failure(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KeyParams {
    key: Option<String>,
}

pub async fn key(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: KeyParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(key) = params.key else {
        return Reply::failure("key requires a key name");
    };
    match dispatch_key(&call, &key).await {
        Ok(()) => Reply::success(serde_json::json!({})),
        Err(err) => cdp_failure(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SelectParams {
    selector: Option<String>,
    value: Option<String>,
}

pub async fn select(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: SelectParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let (Some(selector), Some(value)) = (params.selector, params.value) else {
        return Reply::failure("select requires a selector and a value");
    };

    let script = format!(
        "(() => {{ const el = document.querySelector({sel}); if (!el) return 'missing'; \
         el.value = {val}; \
         el.dispatchEvent(new Event('input', {{ bubbles: true }})); \
         el.dispatchEvent(new Event('change', {{ bubbles: true }})); \
         return 'ok'; }})()",
        sel = js_string(&selector),
        val = js_string(&value),
    );
    let result = match call
        .call(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": script, "returnByValue": true })),
        )
        .await
    {
        Ok(result) => result,
        Err(err) => return cdp_failure(err),
    };
    match result["result"]["value"].as_str() {
        Some("ok") => Reply::success(serde_json::json!({})),
        _ => Reply::failure(format!("element not found: {selector}")),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScrollParams {
    selector: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
}

pub async fn scroll(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: ScrollParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    if let Some(selector) = &params.selector {
        let node_id = match resolve_node(&call, selector).await {
            Ok(node_id) => node_id,
            Err(reply) => return reply,
        };
        return match call
            .call(
                "DOM.scrollIntoViewIfNeeded",
                Some(serde_json::json!({ "nodeId": node_id })),
            )
            .await
        {
            Ok(_) => Reply::success(serde_json::json!({})),
            Err(err) => cdp_failure(err),
        };
    }

    let dx = params.x.unwrap_or(0.0);
    let dy = params.y.unwrap_or(0.0);
    let script = format!("window.scrollBy({dx}, {dy})");
    match call
        .call(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": script })),
        )
        .await
    {
        Ok(_) => Reply::success(serde_json::json!({})),
        Err(err) => cdp_failure(err),
    }
}

/// Key name to `(key, code, windowsVirtualKeyCode, text)`.
fn key_definition(name: &str) -> (String, String, i64, Option<String>) {
    match name {
        "Enter" => ("Enter".into(), "Enter".into(), 13, Some("\r".into())),
        "Tab" => ("Tab".into(), "Tab".into(), 9, None),
        "Escape" => ("Escape".into(), "Escape".into(), 27, None),
        "Backspace" => ("Backspace".into(), "Backspace".into(), 8, None),
        "Delete" => ("Delete".into(), "Delete".into(), 46, None),
        "ArrowUp" => ("ArrowUp".into(), "ArrowUp".into(), 38, None),
        "ArrowDown" => ("ArrowDown".into(), "ArrowDown".into(), 40, None),
        "ArrowLeft" => ("ArrowLeft".into(), "ArrowLeft".into(), 37, None),
        "ArrowRight" => ("ArrowRight".into(), "ArrowRight".into(), 39, None),
        "PageUp" => ("PageUp".into(), "PageUp".into(), 33, None),
        "PageDown" => ("PageDown".into(), "PageDown".into(), 34, None),
        "Home" => ("Home".into(), "Home".into(), 36, None),
        "End" => ("End".into(), "End".into(), 35, None),
        "Space" => (" ".into(), "Space".into(), 32, Some(" ".into())),
        other => {
            let code = other
                .chars()
                .next()
                .map(|c| c.to_ascii_uppercase() as i64)
                .unwrap_or(0);
            (other.into(), String::new(), code, Some(other.into()))
        }
    }
}

async fn dispatch_key(call: &ActiveCall, name: &str) -> Result<(), CdpError> {
    let (key, code, key_code, text) = key_definition(name);
    let down_type = if text.is_some() { "keyDown" } else { "rawKeyDown" };

    let mut down = serde_json::json!({
        "type": down_type,
        "key": key,
        "code": code,
        "windowsVirtualKeyCode": key_code,
    });
    if let Some(text) = &text {
        down["text"] = serde_json::Value::String(text.clone());
    }
    call.call("Input.dispatchKeyEvent", Some(down)).await?;

    call.call(
        "Input.dispatchKeyEvent",
        Some(serde_json::json!({
            "type": "keyUp",
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": key_code,
        })),
    )
    .await?;
    Ok(())
}

async fn dispatch_key_with_modifiers(
    call: &ActiveCall,
    key: &str,
    code: &str,
    key_code: i64,
    modifiers: i64,
) -> Result<(), CdpError> {
    call.call(
        "Input.dispatchKeyEvent",
        Some(serde_json::json!({
            "type": "rawKeyDown",
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": key_code,
            "modifiers": modifiers,
        })),
    )
    .await?;
    call.call(
        "Input.dispatchKeyEvent",
        Some(serde_json::json!({
            "type": "keyUp",
            "key": key,
            "code": code,
            "windowsVirtualKeyCode": key_code,
            "modifiers": modifiers,
        })),
    )
    .await?;
    Ok(())
}
