//! Transport client behaviour against a scripted CDP endpoint: request
//! correlation, timeouts, event fan-out, and close semantics.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use common::{echo_ok, silent, MockCdp};
use webctl::conn::Transport;
use webctl::error::CdpError;

fn deadline(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

#[tokio::test]
async fn concurrent_calls_each_get_their_own_response() {
    let mock = MockCdp::spawn(|cmd| {
        // Echo the method name back so responses are distinguishable.
        Some(serde_json::json!({
            "id": cmd["id"],
            "result": { "method": cmd["method"] },
        }))
    })
    .await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let transport = transport.clone();
        handles.push(tokio::spawn(async move {
            let method: webctl::wire::MethodId = format!("Test.call{i}").into();
            let result = transport.send(method, None, deadline(5)).await.unwrap();
            assert_eq!(result["method"], format!("Test.call{i}"));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn responses_correlate_out_of_order() {
    let mut mock = MockCdp::spawn(silent).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let t1 = transport.clone();
    let first = tokio::spawn(async move { t1.send("Test.first", None, deadline(5)).await });
    let c1 = mock.next_command().await;

    let t2 = transport.clone();
    let second = tokio::spawn(async move { t2.send("Test.second", None, deadline(5)).await });
    let c2 = mock.next_command().await;

    // Answer the second call before the first.
    mock.raw(serde_json::json!({ "id": c2["id"], "result": { "n": 2 } }).to_string());
    mock.raw(serde_json::json!({ "id": c1["id"], "result": { "n": 1 } }).to_string());

    assert_eq!(first.await.unwrap().unwrap()["n"], 1);
    assert_eq!(second.await.unwrap().unwrap()["n"], 2);
}

#[tokio::test]
async fn timed_out_call_never_sees_its_late_response() {
    let mut mock = MockCdp::spawn(silent).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let result = transport
        .send("Test.slow", None, Instant::now() + Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(CdpError::Timeout)));

    // The late response for the abandoned id is discarded silently and the
    // transport keeps working.
    let stale = mock.next_command().await;
    mock.raw(serde_json::json!({ "id": stale["id"], "result": { "late": true } }).to_string());

    let t = transport.clone();
    let next = tokio::spawn(async move { t.send("Test.next", None, deadline(5)).await });
    let cmd = mock.expect_method("Test.next").await;
    mock.raw(serde_json::json!({ "id": cmd["id"], "result": { "ok": 1 } }).to_string());
    assert_eq!(next.await.unwrap().unwrap()["ok"], 1);
}

#[tokio::test]
async fn session_sends_stamp_the_frame() {
    let mut mock = MockCdp::spawn(echo_ok).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    transport
        .send_on_session("SESSION-9", "Runtime.enable", None, deadline(5))
        .await
        .unwrap();
    let cmd = mock.expect_method("Runtime.enable").await;
    assert_eq!(cmd["sessionId"], "SESSION-9");
}

#[tokio::test]
async fn protocol_errors_pass_through_verbatim() {
    let mock = MockCdp::spawn(|cmd| {
        Some(serde_json::json!({
            "id": cmd["id"],
            "error": { "code": -32000, "message": "Cannot find context" },
        }))
    })
    .await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let err = transport
        .send("Runtime.evaluate", None, deadline(5))
        .await
        .unwrap_err();
    match err {
        CdpError::Chrome(err) => {
            assert_eq!(err.code, -32000);
            assert_eq!(err.to_string(), "cdp error -32000: Cannot find context");
        }
        other => panic!("expected protocol error, got {other}"),
    }
}

#[tokio::test]
async fn event_fanout_invokes_each_handler_in_arrival_order() {
    let mock = MockCdp::spawn(echo_ok).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let seen_a: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_b: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen_a.clone();
    transport.subscribe("Test.tick", move |event| {
        sink.lock().unwrap().push(event.params["n"].as_i64().unwrap());
    });
    let sink = seen_b.clone();
    transport.subscribe("Test.tick", move |event| {
        sink.lock().unwrap().push(event.params["n"].as_i64().unwrap());
    });

    for n in 0..5 {
        mock.event("Test.tick", serde_json::json!({ "n": n }), None);
    }

    common::eventually(
        || seen_a.lock().unwrap().len() == 5 && seen_b.lock().unwrap().len() == 5,
        "both handlers saw five events",
    )
    .await;
    assert_eq!(*seen_a.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(*seen_b.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn malformed_frames_are_dropped_silently() {
    let mut mock = MockCdp::spawn(silent).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    mock.raw("this is not json");
    mock.raw(r#"{"params":{"orphan":true}}"#);

    let t = transport.clone();
    let call = tokio::spawn(async move { t.send("Test.alive", None, deadline(5)).await });
    let cmd = mock.expect_method("Test.alive").await;
    mock.raw(serde_json::json!({ "id": cmd["id"], "result": { "alive": true } }).to_string());
    assert_eq!(call.await.unwrap().unwrap()["alive"], true);
}

#[tokio::test]
async fn close_wakes_pending_callers_and_is_clean() {
    let mock = MockCdp::spawn(silent).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let t = transport.clone();
    let pending = tokio::spawn(async move { t.send("Test.hang", None, deadline(30)).await });
    // Give the call a moment to hit the wire.
    tokio::time::sleep(Duration::from_millis(50)).await;

    transport.close().await;
    assert!(matches!(pending.await.unwrap(), Err(CdpError::Closed)));

    // Idempotent, and further sends are rejected.
    transport.close().await;
    let err = transport.send("Test.after", None, deadline(1)).await;
    assert!(matches!(err, Err(CdpError::Closed)));

    transport.closed().await;
    assert!(transport.is_closed());
    assert!(transport.last_error().is_none());
}

#[tokio::test]
async fn server_disappearing_terminates_the_transport() {
    let mock = MockCdp::spawn(silent).await;
    let transport = Transport::connect(&mock.url).await.unwrap();

    let t = transport.clone();
    let pending = tokio::spawn(async move { t.send("Test.hang", None, deadline(30)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    drop(mock);

    assert!(matches!(pending.await.unwrap(), Err(CdpError::Closed)));
    transport.closed().await;
    assert!(transport.is_closed());
}
