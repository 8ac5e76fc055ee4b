use std::sync::Arc;

use serde::Deserialize;
use tokio::time::Instant;

use super::{cdp_failure, parse_params, require_active, resolve_node};
use crate::capture::{ConsoleFilter, NetworkFilter, RangeSel, RangeSpec};
use crate::daemon::DaemonContext;
use crate::dispatch::{Reply, Request};
use crate::error::CdpError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConsoleFilterSpec {
    types: Option<Vec<String>>,
    #[serde(alias = "find")]
    find_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConsoleParams {
    filters: ConsoleFilterSpec,
    range: RangeSpec,
}

/// Query the console ring for the active session.
pub async fn console(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: ConsoleParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    let range = match RangeSel::from_spec(&params.range) {
        Ok(range) => range,
        Err(err) => return Reply::failure(err.to_string()),
    };
    let filter = ConsoleFilter::new(params.filters.types, params.filters.find_text);

    let entries: Vec<_> = ctx
        .buffers
        .console
        .snapshot(Some(&call.session.session_id))
        .into_iter()
        .filter(|entry| filter.matches(entry))
        .collect();
    let entries = range.apply(entries);
    let count = entries.len();

    Reply::success(serde_json::json!({
        "entries": entries,
        "count": count,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct NetworkFilterSpec {
    types: Option<Vec<String>>,
    methods: Option<Vec<String>>,
    #[serde(alias = "status")]
    status_patterns: Option<Vec<String>>,
    #[serde(alias = "url")]
    url_regex: Option<String>,
    mimes: Option<Vec<String>>,
    min_duration: Option<f64>,
    min_size: Option<u64>,
    #[serde(alias = "failed")]
    only_failed: bool,
    #[serde(alias = "find")]
    find_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NetworkParams {
    filters: NetworkFilterSpec,
    range: RangeSpec,
}

/// Query the network ring for the active session.
pub async fn network(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: NetworkParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    // Validation happens before any browser traffic.
    let range = match RangeSel::from_spec(&params.range) {
        Ok(range) => range,
        Err(err) => return Reply::failure(err.to_string()),
    };
    let spec = params.filters;
    let filter = match NetworkFilter::new(
        spec.types,
        spec.methods,
        spec.status_patterns,
        spec.url_regex,
        spec.mimes,
        spec.min_duration,
        spec.min_size,
        spec.only_failed,
        spec.find_text,
    ) {
        Ok(filter) => filter,
        Err(err) => return Reply::failure(err.to_string()),
    };

    let entries: Vec<_> = ctx
        .buffers
        .network
        .snapshot(Some(&call.session.session_id))
        .into_iter()
        .filter(|entry| filter.matches(entry))
        .collect();
    let entries = range.apply(entries);
    let count = entries.len();

    Reply::success(serde_json::json!({
        "entries": entries,
        "count": count,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HtmlParams {
    selector: Option<String>,
}

/// Outer HTML of the document, or of the first node matching a selector.
pub async fn html(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: HtmlParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    let node_id = match &params.selector {
        Some(selector) => match resolve_node(&call, selector).await {
            Ok(node_id) => node_id,
            Err(reply) => return reply,
        },
        None => {
            let doc = match call
                .call("DOM.getDocument", Some(serde_json::json!({ "depth": 0 })))
                .await
            {
                Ok(doc) => doc,
                Err(err) => return cdp_failure(err),
            };
            doc["root"]["nodeId"].as_i64().unwrap_or_default()
        }
    };

    match call
        .call("DOM.getOuterHTML", Some(serde_json::json!({ "nodeId": node_id })))
        .await
    {
        Ok(result) => Reply::success(serde_json::json!({
            "html": result["outerHTML"].as_str().unwrap_or_default(),
        })),
        Err(err) => cdp_failure(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CssParams {
    selector: Option<String>,
    properties: Option<Vec<String>>,
}

/// Computed styles for the first node matching a selector.
pub async fn css(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: CssParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(selector) = params.selector else {
        return Reply::failure("css requires a selector");
    };

    // Both enables are idempotent on an already-enabled session.
    if let Err(err) = call.call("DOM.enable", None).await {
        return cdp_failure(err);
    }
    if let Err(err) = call.call("CSS.enable", None).await {
        return cdp_failure(err);
    }

    let node_id = match resolve_node(&call, &selector).await {
        Ok(node_id) => node_id,
        Err(reply) => return reply,
    };

    let computed = match call
        .call(
            "CSS.getComputedStyleForNode",
            Some(serde_json::json!({ "nodeId": node_id })),
        )
        .await
    {
        Ok(result) => result,
        Err(err) => return cdp_failure(err),
    };

    let wanted: Option<Vec<String>> = params
        .properties
        .map(|props| props.iter().map(|p| p.to_ascii_lowercase()).collect());
    let mut styles = serde_json::Map::new();
    if let Some(list) = computed["computedStyle"].as_array() {
        for prop in list {
            let Some(name) = prop["name"].as_str() else {
                continue;
            };
            if let Some(wanted) = &wanted {
                if !wanted.iter().any(|w| w == &name.to_ascii_lowercase()) {
                    continue;
                }
            }
            styles.insert(
                name.to_string(),
                prop["value"].clone(),
            );
        }
    }

    Reply::success(serde_json::json!({ "styles": styles }))
}

/// Cookies visible to the active page.
pub async fn cookies(ctx: &Arc<DaemonContext>, _req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    match call.call("Network.getCookies", None).await {
        Ok(result) => Reply::success(serde_json::json!({
            "cookies": result.get("cookies").cloned().unwrap_or(serde_json::json!([])),
        })),
        Err(err) => cdp_failure(err),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ScreenshotParams {
    path: Option<String>,
    full_page: bool,
}

/// PNG capture of the active page, written to a caller path or a temp file.
pub async fn screenshot(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: ScreenshotParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };

    let mut capture = serde_json::json!({ "format": "png" });
    if params.full_page {
        capture["captureBeyondViewport"] = serde_json::Value::Bool(true);
    }
    let result = match call.call("Page.captureScreenshot", Some(capture)).await {
        Ok(result) => result,
        Err(err) => return cdp_failure(err),
    };

    let data = result["data"].as_str().unwrap_or_default();
    use base64::Engine;
    let bytes = match base64::engine::general_purpose::STANDARD.decode(data) {
        Ok(bytes) => bytes,
        Err(err) => return Reply::failure(format!("undecodable screenshot data: {err}")),
    };

    let path = match params.path {
        Some(path) => std::path::PathBuf::from(path),
        None => std::env::temp_dir().join(format!(
            "webctl-screenshot-{}.png",
            chrono::Local::now().format("%Y-%m-%d-%H%M%S")
        )),
    };
    if let Err(err) = tokio::fs::write(&path, &bytes).await {
        return Reply::failure(format!("cannot write {}: {err}", path.display()));
    }

    Reply::success(serde_json::json!({ "path": path.to_string_lossy() }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EvalParams {
    expression: Option<String>,
    timeout_secs: Option<u64>,
    await_promise: Option<bool>,
}

/// Evaluate a JavaScript expression on the active session.
///
/// The reply omits `value` when the result is `undefined` and includes it,
/// as JSON null, when the result is `null`.
pub async fn eval(ctx: &Arc<DaemonContext>, req: &Request) -> Reply {
    let call = match require_active(ctx) {
        Ok(call) => call,
        Err(reply) => return reply,
    };
    let params: EvalParams = match parse_params(req) {
        Ok(params) => params,
        Err(reply) => return reply,
    };
    let Some(expression) = params.expression else {
        return Reply::failure("eval requires an expression");
    };

    let timeout = params
        .timeout_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or(call.timeout);
    let deadline = Instant::now() + timeout;

    let eval_params = serde_json::json!({
        "expression": expression,
        "returnByValue": true,
        "awaitPromise": params.await_promise.unwrap_or(true),
    });
    let result = match call
        .transport
        .send_on_session(
            &call.session.session_id,
            "Runtime.evaluate",
            Some(eval_params),
            deadline,
        )
        .await
    {
        Ok(result) => result,
        Err(CdpError::Timeout) => {
            return Reply::failure(format!("evaluation timed out after {timeout:?}"))
        }
        Err(err) => return cdp_failure(err),
    };

    if let Some(details) = result.get("exceptionDetails") {
        if !details.is_null() {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("evaluation failed");
            return Reply::failure(text.to_string());
        }
    }

    let object = &result["result"];
    match object["type"].as_str() {
        Some("undefined") => Reply::success(serde_json::json!({})),
        _ => {
            let value = match object.get("value") {
                Some(value) => value.clone(),
                None => object["description"]
                    .as_str()
                    .map(|d| serde_json::Value::String(d.to_string()))
                    .unwrap_or(serde_json::Value::Null),
            };
            Reply::success(serde_json::json!({ "value": value }))
        }
    }
}
