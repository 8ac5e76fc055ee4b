//! A scriptable CDP endpoint: accepts one WebSocket connection, records
//! every command frame it receives, answers through a responder callback,
//! and pushes arbitrary event frames to the client.
#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub struct MockCdp {
    pub url: String,
    commands: mpsc::UnboundedReceiver<serde_json::Value>,
    frames: mpsc::UnboundedSender<String>,
}

/// Reply to every command with an empty result.
pub fn echo_ok(cmd: &serde_json::Value) -> Option<serde_json::Value> {
    Some(serde_json::json!({ "id": cmd["id"], "result": {} }))
}

/// Never reply; the test drives responses by hand via `raw`.
pub fn silent(_cmd: &serde_json::Value) -> Option<serde_json::Value> {
    None
}

impl MockCdp {
    pub async fn spawn<F>(responder: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Option<serde_json::Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (frames, mut frame_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            loop {
                tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => {
                            if sink.send(Message::text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    msg = source.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(cmd) = serde_json::from_str::<serde_json::Value>(text.as_str()) {
                                let _ = cmd_tx.send(cmd.clone());
                                if let Some(resp) = responder(&cmd) {
                                    if sink.send(Message::text(resp.to_string())).await.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        });

        Self {
            url: format!("ws://{addr}"),
            commands,
            frames,
        }
    }

    /// Push a raw frame to the connected client.
    pub fn raw(&self, frame: impl Into<String>) {
        self.frames.send(frame.into()).unwrap();
    }

    /// Push an event frame, optionally tagged with a session id.
    pub fn event(&self, method: &str, params: serde_json::Value, session_id: Option<&str>) {
        let mut frame = serde_json::json!({ "method": method, "params": params });
        if let Some(session_id) = session_id {
            frame["sessionId"] = serde_json::json!(session_id);
        }
        self.raw(frame.to_string());
    }

    /// Next command frame the server observed.
    pub async fn next_command(&mut self) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(2), self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("mock server gone")
    }

    /// Skip forward to the next command with the given method.
    pub async fn expect_method(&mut self, method: &str) -> serde_json::Value {
        loop {
            let cmd = self.next_command().await;
            if cmd["method"] == method {
                return cmd;
            }
        }
    }
}

/// Poll `probe` until it returns true or the deadline passes.
pub async fn eventually<F>(mut probe: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never became true: {what}");
}
