use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::conn::{Transport, WeakTransport};
use crate::wire::Event;

/// The canonical set of exact content types held inline.
///
/// `text/*` prefixes and `+json`/`+xml` suffixes are handled in
/// [`is_textual_mime`]; everything else goes to disk.
static TEXTUAL_MIMES: phf::Set<&'static str> = phf::phf_set! {
    "application/json",
    "application/javascript",
    "application/x-javascript",
    "application/xml",
    "application/xhtml+xml",
    "application/x-www-form-urlencoded",
    "image/svg+xml",
};

/// Whether a response body of this content type is held inline.
pub fn is_textual_mime(mime: &str) -> bool {
    let mime = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime.starts_with("text/")
        || TEXTUAL_MIMES.contains(mime.as_str())
        || mime.ends_with("+json")
        || mime.ends_with("+xml")
}

/// One captured network exchange, stitched together from the four
/// `Network.*` lifecycle events and keyed by `(sessionId, requestId)`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    pub session_id: String,
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Milliseconds since the unix epoch.
    pub request_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub request_headers: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_path: Option<String>,
    pub body_truncated: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Monotonic event timestamp of `requestWillBeSent`, for duration math.
    #[serde(skip)]
    mono_ts: f64,
}

type EntryKey = (String, String);

struct NetState {
    entries: VecDeque<NetworkEntry>,
    /// Sequence number of `entries.front()`; grows as the ring evicts.
    first_seq: u64,
    index: HashMap<EntryKey, u64>,
    cap: usize,
    /// Requests observed but not yet finished/failed, per session.
    inflight: HashMap<String, usize>,
    last_activity: HashMap<String, Instant>,
}

impl NetState {
    fn push(&mut self, entry: NetworkEntry) {
        if self.entries.len() == self.cap {
            if let Some(evicted) = self.entries.pop_front() {
                let key = (evicted.session_id.clone(), evicted.request_id.clone());
                if self.index.get(&key) == Some(&self.first_seq) {
                    self.index.remove(&key);
                }
                self.first_seq += 1;
                remove_body_file(&evicted);
            }
        }
        let seq = self.first_seq + self.entries.len() as u64;
        self.index
            .insert((entry.session_id.clone(), entry.request_id.clone()), seq);
        self.entries.push_back(entry);
    }

    fn get_mut(&mut self, session_id: &str, request_id: &str) -> Option<&mut NetworkEntry> {
        let key = (session_id.to_string(), request_id.to_string());
        let seq = *self.index.get(&key)?;
        let pos = seq.checked_sub(self.first_seq)? as usize;
        self.entries.get_mut(pos)
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (pos, entry) in self.entries.iter().enumerate() {
            self.index.insert(
                (entry.session_id.clone(), entry.request_id.clone()),
                self.first_seq + pos as u64,
            );
        }
    }
}

pub struct NetworkBuffer {
    state: Mutex<NetState>,
    body_dir: PathBuf,
    body_cap: usize,
    fetch_timeout: Duration,
}

impl NetworkBuffer {
    pub fn new(cap: usize, body_cap: usize, body_dir: PathBuf, fetch_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(NetState {
                entries: VecDeque::new(),
                first_seq: 0,
                index: HashMap::new(),
                cap: cap.max(1),
                inflight: HashMap::new(),
                last_activity: HashMap::new(),
            }),
            body_dir,
            body_cap,
            fetch_timeout,
        }
    }

    pub fn body_cap(&self) -> usize {
        self.body_cap
    }

    pub fn body_dir(&self) -> &Path {
        &self.body_dir
    }

    /// Subscribe to the per-session network lifecycle events.
    ///
    /// Entry bookkeeping is plain mutex work on the read loop; body
    /// materialisation fans out to a task holding a [`WeakTransport`].
    pub fn install(self: &Arc<Self>, transport: &Transport) {
        let weak = transport.downgrade();

        let buffer = self.clone();
        transport.subscribe("Network.requestWillBeSent", move |event| {
            buffer.on_request_will_be_sent(event);
        });

        let buffer = self.clone();
        transport.subscribe("Network.responseReceived", move |event| {
            buffer.on_response_received(event);
        });

        let buffer = self.clone();
        let link = weak.clone();
        transport.subscribe("Network.loadingFinished", move |event| {
            buffer.on_loading_finished(event, &link);
        });

        let buffer = self.clone();
        transport.subscribe("Network.loadingFailed", move |event| {
            buffer.on_loading_failed(event);
        });
    }

    fn on_request_will_be_sent(&self, event: &Event) {
        let Some(session_id) = event.session_id.clone() else {
            return;
        };
        let params = &event.params;
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let request = &params["request"];
        // A redirect hop re-announces the same requestId with the previous
        // hop's response attached; there is no loadingFinished in between.
        let is_redirect = params
            .get("redirectResponse")
            .map_or(false, |r| !r.is_null());

        let mut state = self.state.lock().unwrap();

        if is_redirect {
            if let Some(entry) = state.get_mut(&session_id, request_id) {
                let redirect = &params["redirectResponse"];
                entry.url = request["url"].as_str().unwrap_or_default().to_string();
                entry.method = request["method"].as_str().unwrap_or_default().to_string();
                entry.request_headers = request.get("headers").cloned().unwrap_or_default();
                entry.status = redirect["status"].as_i64();
                entry.status_text = redirect["statusText"].as_str().map(str::to_string);
                entry.mime_type = redirect["mimeType"].as_str().map(str::to_string);
                entry.response_headers = redirect.get("headers").cloned();
                state.last_activity.insert(session_id, Instant::now());
                return;
            }
            // The pre-redirect entry was already evicted; recreate it below,
            // but its inflight slot is still outstanding.
        }

        let entry = NetworkEntry {
            session_id: session_id.clone(),
            request_id: request_id.to_string(),
            url: request["url"].as_str().unwrap_or_default().to_string(),
            method: request["method"].as_str().unwrap_or_default().to_string(),
            resource_type: params["type"].as_str().map(str::to_string),
            status: None,
            status_text: None,
            mime_type: None,
            request_time: (params["wallTime"].as_f64().unwrap_or_default() * 1000.0) as i64,
            response_time: None,
            duration_sec: None,
            size: None,
            request_headers: request.get("headers").cloned().unwrap_or_default(),
            response_headers: None,
            body: None,
            body_path: None,
            body_truncated: false,
            failed: false,
            error: None,
            mono_ts: params["timestamp"].as_f64().unwrap_or_default(),
        };

        state.push(entry);
        if !is_redirect {
            *state.inflight.entry(session_id.clone()).or_insert(0) += 1;
        }
        state.last_activity.insert(session_id, Instant::now());
    }

    fn on_response_received(&self, event: &Event) {
        let Some(session_id) = event.session_id.as_deref() else {
            return;
        };
        let params = &event.params;
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let response = &params["response"];

        let mut state = self.state.lock().unwrap();
        let mono_now = params["timestamp"].as_f64().unwrap_or_default();
        if let Some(entry) = state.get_mut(session_id, request_id) {
            entry.status = response["status"].as_i64();
            entry.status_text = response["statusText"].as_str().map(str::to_string);
            entry.mime_type = response["mimeType"].as_str().map(str::to_string);
            entry.response_headers = response.get("headers").cloned();
            let elapsed = (mono_now - entry.mono_ts).max(0.0);
            entry.response_time = Some(entry.request_time + (elapsed * 1000.0) as i64);
        }
        state
            .last_activity
            .insert(session_id.to_string(), Instant::now());
    }

    fn on_loading_finished(self: &Arc<Self>, event: &Event, link: &WeakTransport) {
        let Some(session_id) = event.session_id.clone() else {
            return;
        };
        let params = &event.params;
        let Some(request_id) = params["requestId"].as_str().map(str::to_string) else {
            return;
        };
        let mono_now = params["timestamp"].as_f64().unwrap_or_default();

        let mime = {
            let mut state = self.state.lock().unwrap();
            let mime = state.get_mut(&session_id, &request_id).map(|entry| {
                entry.size = params["encodedDataLength"].as_u64();
                entry.duration_sec = Some((mono_now - entry.mono_ts).max(0.0));
                entry.mime_type.clone().unwrap_or_default()
            });
            self.settle(&mut state, &session_id);
            mime
        };
        let Some(mime) = mime else {
            return;
        };

        // The browser releases response data on its own schedule; fetch now
        // or lose it.
        let buffer = self.clone();
        let link = link.clone();
        tokio::spawn(async move {
            buffer
                .materialize_body(&link, session_id, request_id, mime)
                .await;
        });
    }

    fn on_loading_failed(&self, event: &Event) {
        let Some(session_id) = event.session_id.as_deref() else {
            return;
        };
        let params = &event.params;
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let mono_now = params["timestamp"].as_f64().unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(session_id, request_id) {
            entry.failed = true;
            entry.error = params["errorText"].as_str().map(str::to_string);
            entry.status = Some(0);
            entry.duration_sec = Some((mono_now - entry.mono_ts).max(0.0));
        }
        let session_id = session_id.to_string();
        self.settle(&mut state, &session_id);
    }

    fn settle(&self, state: &mut NetState, session_id: &str) {
        if let Some(count) = state.inflight.get_mut(session_id) {
            *count = count.saturating_sub(1);
        }
        state
            .last_activity
            .insert(session_id.to_string(), Instant::now());
    }

    async fn materialize_body(
        &self,
        link: &WeakTransport,
        session_id: String,
        request_id: String,
        mime: String,
    ) {
        let Some(transport) = link.upgrade() else {
            return;
        };
        let params = serde_json::json!({ "requestId": request_id });
        let deadline = Instant::now() + self.fetch_timeout;
        let result = transport
            .send_on_session(&session_id, "Network.getResponseBody", Some(params), deadline)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                // Body already purged by a navigation or similar; the entry
                // stays, just without a body.
                tracing::debug!(request_id = %request_id, "response body unavailable: {err}");
                return;
            }
        };

        let raw = reply["body"].as_str().unwrap_or_default();
        let base64_encoded = reply["base64Encoded"].as_bool().unwrap_or(false);

        if is_textual_mime(&mime) {
            let text = if base64_encoded {
                use base64::Engine;
                match base64::engine::general_purpose::STANDARD.decode(raw) {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(_) => raw.to_string(),
                }
            } else {
                raw.to_string()
            };
            let truncated = text.len() > self.body_cap;
            let mut text = text;
            if truncated {
                // Cut on a char boundary at or below the cap.
                let mut cut = self.body_cap;
                while cut > 0 && !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.get_mut(&session_id, &request_id) {
                entry.body = Some(text);
                entry.body_truncated = truncated;
            }
            return;
        }

        let bytes = if base64_encoded {
            use base64::Engine;
            match base64::engine::general_purpose::STANDARD.decode(raw) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::debug!(request_id = %request_id, "undecodable body: {err}");
                    return;
                }
            }
        } else {
            raw.as_bytes().to_vec()
        };

        let url = {
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&session_id, &request_id) {
                Some(entry) => entry.url.clone(),
                None => return,
            }
        };

        let file_name = body_file_name(&request_id, &url, &mime);
        let path = self.body_dir.join(file_name);
        if let Err(err) = tokio::fs::create_dir_all(&self.body_dir).await {
            tracing::warn!("cannot create body directory: {err}");
            return;
        }
        if let Err(err) = tokio::fs::write(&path, &bytes).await {
            tracing::warn!("cannot write body file {}: {err}", path.display());
            return;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(&session_id, &request_id) {
            entry.body_path = Some(path.to_string_lossy().into_owned());
        } else {
            // Evicted while we were writing; don't leak the file.
            drop(state);
            let _ = std::fs::remove_file(&path);
        }
    }

    pub fn snapshot(&self, session_id: Option<&str>) -> Vec<NetworkEntry> {
        let state = self.state.lock().unwrap();
        state
            .entries
            .iter()
            .filter(|e| session_id.map_or(true, |s| e.session_id == s))
            .cloned()
            .collect()
    }

    pub fn purge_session(&self, session_id: &str) {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0u64;
        state.entries.retain(|entry| {
            let keep = entry.session_id != session_id;
            if !keep {
                remove_body_file(entry);
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            state.reindex();
        }
        state.inflight.remove(session_id);
        state.last_activity.remove(session_id);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for entry in &state.entries {
            remove_body_file(entry);
        }
        state.entries.clear();
        state.index.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of requests observed but not yet settled for a session.
    pub fn inflight(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .inflight
            .get(session_id)
            .copied()
            .unwrap_or(0)
    }

    /// Instant of the most recent network activity for a session, if any.
    pub fn last_activity(&self, session_id: &str) -> Option<Instant> {
        self.state
            .lock()
            .unwrap()
            .last_activity
            .get(session_id)
            .copied()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, entry: NetworkEntry) {
        self.state.lock().unwrap().push(entry);
    }
}

fn remove_body_file(entry: &NetworkEntry) {
    if let Some(path) = &entry.body_path {
        let _ = std::fs::remove_file(path);
    }
}

/// `YYYY-MM-DD-HHMMSS-<requestId>-<sanitised-basename>.<ext>`
fn body_file_name(request_id: &str, url: &str, mime: &str) -> String {
    let stamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S");
    let basename = url_basename(url);
    let (stem, ext) = match basename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem.to_string(), ext.to_string())
        }
        _ => (basename, ext_for_mime(mime).to_string()),
    };
    format!(
        "{stamp}-{}-{}.{}",
        sanitize(request_id),
        sanitize(&stem),
        sanitize(&ext)
    )
}

fn url_basename(url: &str) -> String {
    let path = url::Url::parse(url)
        .ok()
        .map(|u| u.path().to_string())
        .unwrap_or_else(|| url.to_string());
    let base = path.rsplit('/').next().unwrap_or_default();
    if base.is_empty() {
        "body".to_string()
    } else {
        base.to_string()
    }
}

fn sanitize(part: &str) -> String {
    let cleaned: String = part
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "body".to_string()
    } else {
        cleaned.chars().take(80).collect()
    }
}

fn ext_for_mime(mime: &str) -> &'static str {
    let mime = mime.split(';').next().unwrap_or_default().trim();
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "application/pdf" => "pdf",
        "application/zip" => "zip",
        "font/woff2" => "woff2",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        _ => "bin",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(session: &str, request: &str, status: Option<i64>) -> NetworkEntry {
        NetworkEntry {
            session_id: session.to_string(),
            request_id: request.to_string(),
            url: format!("https://example.com/{request}"),
            method: "GET".to_string(),
            resource_type: None,
            status,
            status_text: None,
            mime_type: None,
            request_time: 0,
            response_time: None,
            duration_sec: None,
            size: None,
            request_headers: serde_json::json!({}),
            response_headers: None,
            body: None,
            body_path: None,
            body_truncated: false,
            failed: false,
            error: None,
            mono_ts: 0.0,
        }
    }

    fn buffer(cap: usize) -> NetworkBuffer {
        NetworkBuffer::new(
            cap,
            102_400,
            std::env::temp_dir().join("webctl-test-bodies"),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn mime_classification() {
        assert!(is_textual_mime("text/html"));
        assert!(is_textual_mime("text/plain; charset=utf-8"));
        assert!(is_textual_mime("application/json"));
        assert!(is_textual_mime("Application/JSON"));
        assert!(is_textual_mime("application/problem+json"));
        assert!(is_textual_mime("image/svg+xml"));
        assert!(!is_textual_mime("image/png"));
        assert!(!is_textual_mime("application/octet-stream"));
        assert!(!is_textual_mime("video/mp4"));
    }

    #[test]
    fn ring_bound_holds_last_entries() {
        let buf = buffer(3);
        for i in 0..5 {
            buf.insert_for_test(entry("S", &format!("r{i}"), Some(200)));
        }
        let entries = buf.snapshot(None);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].request_id, "r2");
        assert_eq!(entries[2].request_id, "r4");
    }

    #[test]
    fn stitching_survives_eviction_offsets() {
        let buf = buffer(2);
        buf.insert_for_test(entry("S", "a", None));
        buf.insert_for_test(entry("S", "b", None));
        buf.insert_for_test(entry("S", "c", None));
        let mut state = buf.state.lock().unwrap();
        assert!(state.get_mut("S", "a").is_none());
        assert_eq!(state.get_mut("S", "b").unwrap().request_id, "b");
        assert_eq!(state.get_mut("S", "c").unwrap().request_id, "c");
    }

    fn net_event(method: &str, params: serde_json::Value) -> Event {
        Event {
            method: method.to_string(),
            params,
            session_id: Some("S".to_string()),
        }
    }

    #[test]
    fn redirects_update_in_place_and_never_leak_inflight() {
        let buf = buffer(16);
        buf.on_request_will_be_sent(&net_event(
            "Network.requestWillBeSent",
            serde_json::json!({
                "requestId": "r1",
                "request": { "url": "http://a.test/", "method": "GET", "headers": {} },
                "timestamp": 1.0,
                "wallTime": 1.0,
                "type": "Document",
            }),
        ));
        assert_eq!(buf.inflight("S"), 1);

        // Same requestId re-announced for the https hop.
        buf.on_request_will_be_sent(&net_event(
            "Network.requestWillBeSent",
            serde_json::json!({
                "requestId": "r1",
                "request": { "url": "https://a.test/", "method": "GET", "headers": {} },
                "redirectResponse": {
                    "status": 301,
                    "statusText": "Moved Permanently",
                    "headers": { "location": "https://a.test/" },
                    "mimeType": "text/html",
                },
                "timestamp": 1.2,
                "wallTime": 1.2,
                "type": "Document",
            }),
        ));

        let entries = buf.snapshot(None);
        assert_eq!(entries.len(), 1, "one entry per (session, requestId)");
        assert_eq!(entries[0].url, "https://a.test/");
        assert_eq!(entries[0].status, Some(301));
        assert_eq!(buf.inflight("S"), 1, "a redirect hop is not a new request");

        buf.on_loading_failed(&net_event(
            "Network.loadingFailed",
            serde_json::json!({
                "requestId": "r1",
                "timestamp": 1.5,
                "errorText": "net::ERR_ABORTED",
            }),
        ));
        assert_eq!(buf.inflight("S"), 0, "the chain settles exactly once");
        assert_eq!(buf.snapshot(None).len(), 1);
    }

    #[test]
    fn purge_is_session_scoped() {
        let buf = buffer(16);
        buf.insert_for_test(entry("A", "1", Some(200)));
        buf.insert_for_test(entry("B", "2", Some(404)));
        buf.insert_for_test(entry("A", "3", Some(500)));
        buf.purge_session("A");
        let rest = buf.snapshot(None);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].session_id, "B");
        // Lookups for survivors still resolve after the reindex.
        let mut state = buf.state.lock().unwrap();
        assert!(state.get_mut("B", "2").is_some());
    }

    #[test]
    fn body_file_names_are_path_safe() {
        let name = body_file_name("1000.12", "https://example.com/a/logo.png?v=2", "image/png");
        assert!(name.contains("1000.12"));
        assert!(name.ends_with("logo.png"));
        assert!(!name.contains('/'));
        assert!(!name.contains('?'));

        let fallback = body_file_name("7", "https://example.com/", "application/pdf");
        assert!(fallback.ends_with("body.pdf"));
    }
}
