//! Full-stack scenarios: mock browser, supervisor, capture buffers, and the
//! dispatcher driven through the direct executor.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{echo_ok, eventually, MockCdp};
use webctl::capture::CaptureBuffers;
use webctl::conn::Transport;
use webctl::daemon::{BrowserLink, DaemonContext};
use webctl::dispatch::{execute, Request};
use webctl::supervisor::Supervisor;

const BODY_CAP: usize = 102_400;

async fn stack_with<F>(responder: F) -> (Arc<DaemonContext>, MockCdp)
where
    F: Fn(&serde_json::Value) -> Option<serde_json::Value> + Send + 'static,
{
    static STACK_SEQ: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    let mock = MockCdp::spawn(responder).await;
    let body_dir = std::env::temp_dir().join(format!(
        "webctl-e2e-{}-{}",
        std::process::id(),
        STACK_SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    ));
    let buffers = CaptureBuffers::new(64, BODY_CAP, body_dir);
    let ctx = DaemonContext::new(buffers.clone(), Duration::from_secs(5));

    let transport = Transport::connect(&mock.url).await.unwrap();
    buffers.install(&transport);
    let supervisor = Supervisor::start(transport.clone(), buffers, Duration::from_secs(5))
        .await
        .unwrap();
    ctx.attach_browser(BrowserLink {
        transport,
        supervisor,
    });
    (ctx, mock)
}

async fn stack() -> (Arc<DaemonContext>, MockCdp) {
    stack_with(echo_ok).await
}

async fn attach_page(mock: &MockCdp, session_id: &str, title: &str) {
    mock.event(
        "Target.attachedToTarget",
        serde_json::json!({
            "sessionId": session_id,
            "targetInfo": {
                "targetId": format!("T-{session_id}"),
                "type": "page",
                "url": format!("https://{session_id}.test/"),
                "title": title,
            },
            "waitingForDebugger": true,
        }),
        None,
    );
}

fn console_params(kind: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "type": kind,
        "timestamp": 1_700_000_000_000u64,
        "args": [ { "type": "string", "value": text } ],
    })
}

#[tokio::test]
async fn console_filter_and_tail_return_matches_in_order() {
    let (ctx, mock) = stack().await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    for kind in ["log", "warn", "error", "log"] {
        mock.event(
            "Runtime.consoleAPICalled",
            console_params(kind, &format!("{kind} message")),
            Some("S1"),
        );
    }
    eventually(|| ctx.buffers.console.len() == 4, "console filled").await;

    let reply = execute(
        &ctx,
        Request::new("console").with_params(serde_json::json!({
            "filters": { "types": ["error", "warn"] },
            "range": { "tail": 5 },
        })),
    )
    .await;

    assert!(reply.ok);
    assert_eq!(reply.get("count"), Some(&serde_json::json!(2)));
    let entries = reply.get("entries").unwrap().as_array().unwrap();
    assert_eq!(entries[0]["type"], "warn");
    assert_eq!(entries[1]["type"], "error");
}

#[tokio::test]
async fn network_status_patterns_select_the_right_decades() {
    let (ctx, mock) = stack().await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    for (i, status) in [200, 404, 500, 502, 200].iter().enumerate() {
        let request_id = format!("req-{i}");
        mock.event(
            "Network.requestWillBeSent",
            serde_json::json!({
                "requestId": request_id,
                "request": { "url": format!("https://api.test/{i}"), "method": "GET", "headers": {} },
                "timestamp": 1.0 + i as f64,
                "wallTime": 1_700_000_000.0 + i as f64,
                "type": "Fetch",
            }),
            Some("S1"),
        );
        mock.event(
            "Network.responseReceived",
            serde_json::json!({
                "requestId": request_id,
                "timestamp": 1.5 + i as f64,
                "response": {
                    "status": status,
                    "statusText": "",
                    "headers": {},
                    "mimeType": "application/json",
                },
            }),
            Some("S1"),
        );
    }
    eventually(|| ctx.buffers.network.len() == 5, "network filled").await;

    let reply = execute(
        &ctx,
        Request::new("network").with_params(serde_json::json!({
            "filters": { "statusPatterns": ["4xx", "5xx"] },
            "range": { "all": true },
        })),
    )
    .await;

    assert!(reply.ok);
    assert_eq!(reply.get("count"), Some(&serde_json::json!(3)));
    let entries = reply.get("entries").unwrap().as_array().unwrap();
    let statuses: Vec<i64> = entries.iter().map(|e| e["status"].as_i64().unwrap()).collect();
    assert_eq!(statuses, vec![404, 500, 502]);
}

#[tokio::test]
async fn oversized_textual_bodies_are_truncated_at_the_cap() {
    let big_body = "a".repeat(150 * 1024);
    let (ctx, mock) = stack_with(move |cmd| {
        if cmd["method"] == "Network.getResponseBody" {
            Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "body": big_body, "base64Encoded": false },
            }))
        } else {
            echo_ok(cmd)
        }
    })
    .await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    mock.event(
        "Network.requestWillBeSent",
        serde_json::json!({
            "requestId": "big-1",
            "request": { "url": "https://api.test/big.txt", "method": "GET", "headers": {} },
            "timestamp": 1.0,
            "wallTime": 1_700_000_000.0,
            "type": "Fetch",
        }),
        Some("S1"),
    );
    mock.event(
        "Network.responseReceived",
        serde_json::json!({
            "requestId": "big-1",
            "timestamp": 1.2,
            "response": {
                "status": 200,
                "statusText": "OK",
                "headers": {},
                "mimeType": "text/plain",
            },
        }),
        Some("S1"),
    );
    mock.event(
        "Network.loadingFinished",
        serde_json::json!({
            "requestId": "big-1",
            "timestamp": 1.4,
            "encodedDataLength": 153600,
        }),
        Some("S1"),
    );

    eventually(
        || {
            ctx.buffers
                .network
                .snapshot(Some("S1"))
                .first()
                .and_then(|e| e.body.as_ref().map(|b| b.len()))
                == Some(BODY_CAP)
        },
        "body materialised and truncated",
    )
    .await;
    let entry = &ctx.buffers.network.snapshot(Some("S1"))[0];
    assert!(entry.body_truncated);
    assert_eq!(entry.body.as_ref().unwrap().len(), 102_400);
    assert!(entry.body_path.is_none());
}

#[tokio::test]
async fn conflicting_range_selectors_fail_without_touching_the_browser() {
    let (ctx, mock) = stack().await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    let reply = execute(
        &ctx,
        Request::new("console").with_params(serde_json::json!({
            "range": { "head": 3, "tail": 5 },
        })),
    )
    .await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().starts_with("invalid range"));

    let reply = execute(
        &ctx,
        Request::new("network").with_params(serde_json::json!({
            "filters": { "statusPatterns": ["9xx"] },
        })),
    )
    .await;
    assert!(!reply.ok);
    assert!(reply.error.unwrap().starts_with("invalid status pattern"));
}

#[tokio::test]
async fn network_idle_settles_after_a_redirect_chain() {
    let (ctx, mock) = stack().await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    mock.event(
        "Network.requestWillBeSent",
        serde_json::json!({
            "requestId": "nav-1",
            "request": { "url": "http://redirect.test/", "method": "GET", "headers": {} },
            "timestamp": 1.0,
            "wallTime": 1_700_000_000.0,
            "type": "Document",
        }),
        Some("S1"),
    );
    // The http→https hop re-fires requestWillBeSent for the same id.
    mock.event(
        "Network.requestWillBeSent",
        serde_json::json!({
            "requestId": "nav-1",
            "request": { "url": "https://redirect.test/", "method": "GET", "headers": {} },
            "redirectResponse": {
                "status": 301,
                "statusText": "Moved Permanently",
                "headers": { "location": "https://redirect.test/" },
                "mimeType": "text/html",
            },
            "timestamp": 1.1,
            "wallTime": 1_700_000_000.1,
            "type": "Document",
        }),
        Some("S1"),
    );
    mock.event(
        "Network.responseReceived",
        serde_json::json!({
            "requestId": "nav-1",
            "timestamp": 1.3,
            "response": {
                "status": 200,
                "statusText": "OK",
                "headers": {},
                "mimeType": "text/html",
            },
        }),
        Some("S1"),
    );
    mock.event(
        "Network.loadingFinished",
        serde_json::json!({
            "requestId": "nav-1",
            "timestamp": 1.5,
            "encodedDataLength": 512,
        }),
        Some("S1"),
    );

    eventually(|| ctx.buffers.network.inflight("S1") == 0, "chain settled").await;
    let entries = ctx.buffers.network.snapshot(Some("S1"));
    assert_eq!(entries.len(), 1, "the redirect hop did not duplicate the entry");
    assert_eq!(entries[0].url, "https://redirect.test/");
    assert_eq!(entries[0].status, Some(200));

    let reply = execute(
        &ctx,
        Request::new("ready").with_params(serde_json::json!({
            "networkIdle": true,
            "timeoutSecs": 3,
        })),
    )
    .await;
    assert!(reply.ok, "network-idle must settle after a redirect");
}

#[tokio::test]
async fn target_switch_envelopes_follow_the_resolution_rules() {
    let (ctx, mock) = stack().await;
    attach_page(&mock, "AB1111", "Alpha").await;
    attach_page(&mock, "AC2222", "Beta").await;
    attach_page(&mock, "BB3333", "Gamma").await;
    eventually(
        || ctx.supervisor().unwrap().list_sessions().len() == 3,
        "three sessions",
    )
    .await;

    let reply = execute(&ctx, Request::new("target").with_target("A")).await;
    assert!(!reply.ok);
    assert!(reply.error.as_deref().unwrap().starts_with("ambiguous target"));
    assert_eq!(reply.get("sessions").unwrap().as_array().unwrap().len(), 2);

    let reply = execute(&ctx, Request::new("target").with_target("AB")).await;
    assert!(reply.ok);
    assert_eq!(
        reply.get("activeSession").unwrap()["sessionId"],
        "AB1111"
    );

    let reply = execute(&ctx, Request::new("target").with_target("zz")).await;
    assert!(!reply.ok);
    assert!(reply.error.as_deref().unwrap().starts_with("no matching target"));
    assert_eq!(reply.get("sessions").unwrap().as_array().unwrap().len(), 3);

    // Listing without a query reports the switch that stuck.
    let reply = execute(&ctx, Request::new("target")).await;
    assert!(reply.ok);
    assert_eq!(
        reply.get("activeSession").unwrap()["sessionId"],
        "AB1111"
    );
}

#[tokio::test]
async fn navigate_returns_on_commit_and_status_sees_the_new_url() {
    let (ctx, mut mock) = stack().await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    let nav_ctx = ctx.clone();
    let nav = tokio::spawn(async move {
        execute(
            &nav_ctx,
            Request::new("navigate")
                .with_params(serde_json::json!({ "url": "https://next.test/page" })),
        )
        .await
    });

    let cmd = mock.expect_method("Page.navigate").await;
    assert_eq!(cmd["params"]["url"], "https://next.test/page");
    assert_eq!(cmd["sessionId"], "S1");

    // The commit, not the load, releases the command.
    mock.event(
        "Page.frameNavigated",
        serde_json::json!({
            "frame": { "id": "F1", "url": "https://next.test/page" },
        }),
        Some("S1"),
    );

    let reply = nav.await.unwrap();
    assert!(reply.ok);
    assert_eq!(reply.get("url"), Some(&serde_json::json!("https://next.test/page")));

    let status = execute(&ctx, Request::new("status")).await;
    assert_eq!(
        status.get("activeSession").unwrap()["url"],
        "https://next.test/page"
    );
}

#[tokio::test]
async fn ready_returns_immediately_on_a_complete_document() {
    let (ctx, mock) = stack_with(|cmd| {
        if cmd["method"] == "Runtime.evaluate" {
            Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "result": { "type": "string", "value": "complete" } },
            }))
        } else {
            echo_ok(cmd)
        }
    })
    .await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    let start = std::time::Instant::now();
    let reply = execute(&ctx, Request::new("ready")).await;
    assert!(reply.ok);
    assert!(start.elapsed() < Duration::from_secs(1), "no waiting on a loaded page");
}

#[tokio::test]
async fn eval_distinguishes_undefined_from_null() {
    let (ctx, mock) = stack_with(|cmd| {
        if cmd["method"] == "Runtime.evaluate" {
            let expr = cmd["params"]["expression"].as_str().unwrap_or_default();
            let result = if expr.contains("null") {
                serde_json::json!({ "type": "object", "subtype": "null", "value": null })
            } else {
                serde_json::json!({ "type": "undefined" })
            };
            Some(serde_json::json!({ "id": cmd["id"], "result": { "result": result } }))
        } else {
            echo_ok(cmd)
        }
    })
    .await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    let reply = execute(
        &ctx,
        Request::new("eval").with_params(serde_json::json!({ "expression": "void 0" })),
    )
    .await;
    assert!(reply.ok);
    assert!(reply.get("value").is_none(), "undefined omits the value key");

    let reply = execute(
        &ctx,
        Request::new("eval").with_params(serde_json::json!({ "expression": "null" })),
    )
    .await;
    assert!(reply.ok);
    assert_eq!(reply.get("value"), Some(&serde_json::Value::Null));
}

#[tokio::test]
async fn click_attaches_a_warning_when_the_element_is_covered() {
    let (ctx, mock) = stack_with(|cmd| {
        match cmd["method"].as_str().unwrap_or_default() {
            "DOM.getDocument" => Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "root": { "nodeId": 1 } },
            })),
            "DOM.querySelector" => Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "nodeId": 42 },
            })),
            "DOM.getBoxModel" => Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "model": {
                    "content": [10.0, 10.0, 30.0, 10.0, 30.0, 20.0, 10.0, 20.0],
                    "width": 20, "height": 10,
                } },
            })),
            // The centre point hits an overlay, not the element.
            "Runtime.evaluate" => Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "result": { "type": "boolean", "value": false } },
            })),
            _ => echo_ok(cmd),
        }
    })
    .await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    let reply = execute(
        &ctx,
        Request::new("click").with_params(serde_json::json!({ "selector": "#buy" })),
    )
    .await;
    assert!(reply.ok, "covered element still gets the click");
    assert_eq!(
        reply.get("warning"),
        Some(&serde_json::json!("element appears covered"))
    );
}

#[tokio::test]
async fn missing_elements_use_the_stable_not_found_message() {
    let (ctx, mock) = stack_with(|cmd| {
        match cmd["method"].as_str().unwrap_or_default() {
            "DOM.getDocument" => Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "root": { "nodeId": 1 } },
            })),
            "DOM.querySelector" => Some(serde_json::json!({
                "id": cmd["id"],
                "result": { "nodeId": 0 },
            })),
            _ => echo_ok(cmd),
        }
    })
    .await;
    attach_page(&mock, "S1", "page").await;
    eventually(
        || ctx.supervisor().unwrap().active_session().is_some(),
        "session active",
    )
    .await;

    let reply = execute(
        &ctx,
        Request::new("click").with_params(serde_json::json!({ "selector": "#ghost" })),
    )
    .await;
    assert!(!reply.ok);
    assert_eq!(reply.error.as_deref(), Some("element not found: #ghost"));
}
