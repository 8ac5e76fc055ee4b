use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::ring::Ring;
use crate::conn::{Transport, WeakTransport};
use crate::wire::Event;

/// One captured console message or uncaught exception.
///
/// Arguments hold plain JSON values only: remote-object references are
/// resolved at event time, because they go stale as soon as the page
/// navigates or the execution context is cleared.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub session_id: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
    pub args: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<i64>,
    /// Buffer-internal handle for filling resolved arguments in place;
    /// zero for entries with nothing left to resolve.
    #[serde(skip)]
    pub(crate) fill_token: u64,
}

pub struct ConsoleBuffer {
    ring: Mutex<Ring<ConsoleEntry>>,
    next_fill: AtomicU64,
    resolve_timeout: Duration,
}

/// An argument as it arrived on the event, before resolution.
enum RawArg {
    /// Already a plain JSON value.
    Value(serde_json::Value),
    /// A remote object that must be resolved while its id is still valid.
    Remote { object_id: String },
}

impl ConsoleBuffer {
    pub fn new(cap: usize, resolve_timeout: Duration) -> Self {
        Self {
            ring: Mutex::new(Ring::new(cap)),
            next_fill: AtomicU64::new(0),
            resolve_timeout,
        }
    }

    /// Subscribe to the per-session runtime events on `transport`.
    ///
    /// Handlers run on the transport read loop; entries whose arguments are
    /// all plain values are appended inline, anything needing a
    /// `Runtime.getProperties` round-trip is finished on a spawned task.
    pub fn install(self: &Arc<Self>, transport: &Transport) {
        let weak = transport.downgrade();

        let buffer = self.clone();
        let link = weak.clone();
        transport.subscribe("Runtime.consoleAPICalled", move |event| {
            buffer.on_console_api_called(event, &link);
        });

        let buffer = self.clone();
        transport.subscribe("Runtime.exceptionThrown", move |event| {
            buffer.on_exception_thrown(event);
        });
    }

    fn on_console_api_called(self: &Arc<Self>, event: &Event, link: &WeakTransport) {
        let Some(session_id) = event.session_id.clone() else {
            return;
        };
        let params = &event.params;

        let kind = params["type"].as_str().unwrap_or("log").to_string();
        let timestamp = params["timestamp"].as_f64().unwrap_or_default() as i64;

        // Classify each argument and render a placeholder alongside, so the
        // entry can be inserted complete at arrival.
        let raw = params["args"].as_array().cloned().unwrap_or_default();
        let mut raw_args = Vec::with_capacity(raw.len());
        let mut args = Vec::with_capacity(raw.len());
        for arg in &raw {
            let classified = classify_arg(arg);
            args.push(match &classified {
                RawArg::Value(v) => v.clone(),
                RawArg::Remote { .. } => serde_json::Value::String(preview(arg)),
            });
            raw_args.push(classified);
        }
        let text = raw.iter().map(preview).collect::<Vec<_>>().join(" ");

        let top_frame = &params["stackTrace"]["callFrames"][0];
        let source_url = top_frame["url"].as_str().map(str::to_string);
        let line = top_frame["lineNumber"].as_i64();
        let column = top_frame["columnNumber"].as_i64();

        let needs_fill = raw_args.iter().any(|a| matches!(a, RawArg::Remote { .. }));
        let fill_token = if needs_fill {
            self.next_fill.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            0
        };

        // Inserted at arrival so the buffer keeps event order regardless of
        // how long resolution takes.
        self.push(ConsoleEntry {
            session_id: session_id.clone(),
            timestamp,
            kind,
            text,
            args,
            source_url,
            line,
            column,
            fill_token,
        });
        if !needs_fill {
            return;
        }

        // Resolution has to happen within this event turn, but the CDP
        // round-trips cannot run on the read loop; fan out and fill the
        // already-inserted entry in place.
        let buffer = self.clone();
        let link = link.clone();
        let timeout = self.resolve_timeout;
        tokio::spawn(async move {
            let mut resolved = Vec::with_capacity(raw_args.len());
            for arg in raw_args {
                resolved.push(match arg {
                    RawArg::Value(v) => v,
                    RawArg::Remote { object_id } => {
                        resolve_remote(&link, &session_id, &object_id, timeout).await
                    }
                });
            }
            // The entry may have been evicted or purged while resolving.
            let mut ring = buffer.ring.lock().unwrap();
            if let Some(entry) = ring.find_mut(|e| e.fill_token == fill_token) {
                entry.args = resolved;
            }
        });
    }

    fn on_exception_thrown(&self, event: &Event) {
        let Some(session_id) = event.session_id.clone() else {
            return;
        };
        let params = &event.params;
        let details = &params["exceptionDetails"];

        let mut text = details["text"].as_str().unwrap_or("Uncaught").to_string();
        if let Some(description) = details["exception"]["description"].as_str() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(description);
        }

        self.push(ConsoleEntry {
            session_id,
            timestamp: params["timestamp"].as_f64().unwrap_or_default() as i64,
            kind: "exception".to_string(),
            text,
            args: Vec::new(),
            source_url: details["url"].as_str().map(str::to_string),
            line: details["lineNumber"].as_i64(),
            column: details["columnNumber"].as_i64(),
            fill_token: 0,
        });
    }

    fn push(&self, entry: ConsoleEntry) {
        self.ring.lock().unwrap().push(entry);
    }

    /// All entries, oldest first, optionally restricted to one session.
    pub fn snapshot(&self, session_id: Option<&str>) -> Vec<ConsoleEntry> {
        let ring = self.ring.lock().unwrap();
        ring.iter()
            .filter(|e| session_id.map_or(true, |s| e.session_id == s))
            .cloned()
            .collect()
    }

    pub fn purge_session(&self, session_id: &str) {
        self.ring
            .lock()
            .unwrap()
            .retain(|e| e.session_id != session_id);
    }

    pub fn clear(&self) {
        self.ring.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sort an event argument into plain-value or needs-resolution.
fn classify_arg(arg: &serde_json::Value) -> RawArg {
    let kind = arg["type"].as_str().unwrap_or_default();
    match kind {
        "object" => {
            if let Some(object_id) = arg["objectId"].as_str() {
                RawArg::Remote {
                    object_id: object_id.to_string(),
                }
            } else {
                RawArg::Value(arg.get("value").cloned().unwrap_or(serde_json::Value::Null))
            }
        }
        // Functions carry no enumerable value worth walking; their
        // description is the useful rendering.
        "function" => RawArg::Value(
            arg["description"]
                .as_str()
                .map(|d| serde_json::Value::String(d.to_string()))
                .unwrap_or_else(|| serde_json::Value::String("undefined".to_string())),
        ),
        "undefined" => RawArg::Value(serde_json::Value::String("undefined".to_string())),
        _ => {
            if let Some(value) = arg.get("value") {
                RawArg::Value(value.clone())
            } else if let Some(unserializable) = arg["unserializableValue"].as_str() {
                RawArg::Value(serde_json::Value::String(unserializable.to_string()))
            } else {
                RawArg::Value(serde_json::Value::String("undefined".to_string()))
            }
        }
    }
}

/// Human text for one argument, used for the entry's joined `text` field.
fn preview(arg: &serde_json::Value) -> String {
    if let Some(s) = arg["value"].as_str() {
        return s.to_string();
    }
    if let Some(value) = arg.get("value") {
        if !value.is_null() {
            return value.to_string();
        }
    }
    if let Some(description) = arg["description"].as_str() {
        return description.to_string();
    }
    if let Some(unserializable) = arg["unserializableValue"].as_str() {
        return unserializable.to_string();
    }
    arg["type"].as_str().unwrap_or("undefined").to_string()
}

/// Resolve a remote object's enumerable own properties to a JSON map.
///
/// Depth is bounded to one level: nested objects render as their
/// description. A failed resolution yields the error's message text so the
/// other arguments survive.
async fn resolve_remote(
    link: &WeakTransport,
    session_id: &str,
    object_id: &str,
    timeout: Duration,
) -> serde_json::Value {
    let Some(transport) = link.upgrade() else {
        return serde_json::Value::String("undefined".to_string());
    };

    let params = serde_json::json!({
        "objectId": object_id,
        "ownProperties": true,
    });
    let deadline = Instant::now() + timeout;
    match transport
        .send_on_session(session_id, "Runtime.getProperties", Some(params), deadline)
        .await
    {
        Ok(result) => {
            let mut map = serde_json::Map::new();
            if let Some(props) = result["result"].as_array() {
                for prop in props {
                    if !prop["enumerable"].as_bool().unwrap_or(false) {
                        continue;
                    }
                    let Some(name) = prop["name"].as_str() else {
                        continue;
                    };
                    let value = &prop["value"];
                    let rendered = if let Some(v) = value.get("value") {
                        v.clone()
                    } else if let Some(unserializable) = value["unserializableValue"].as_str() {
                        serde_json::Value::String(unserializable.to_string())
                    } else if let Some(description) = value["description"].as_str() {
                        serde_json::Value::String(description.to_string())
                    } else {
                        serde_json::Value::String("undefined".to_string())
                    };
                    map.insert(name.to_string(), rendered);
                }
            }
            serde_json::Value::Object(map)
        }
        Err(err) => serde_json::Value::String(err.to_string()),
    }
}
