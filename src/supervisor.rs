use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::capture::CaptureBuffers;
use crate::conn::Transport;
use crate::error::Result;
use crate::wire::Event;

/// One attached CDP target, multiplexed over the shared socket in flat
/// session mode. Session ids are assigned by the browser and never reused.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub kind: SessionKind,
    /// Milliseconds since the unix epoch.
    pub attached_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Page,
    Other,
}

/// Outcome of resolving a `target` query against the session table.
#[derive(Debug)]
pub enum SwitchOutcome {
    Switched(Session),
    Ambiguous(Vec<Session>),
    NotFound(Vec<Session>),
}

/// A main-frame navigation commit observed on a session.
#[derive(Debug, Clone)]
pub struct NavCommit {
    pub session_id: String,
    pub url: String,
    pub is_main_frame: bool,
}

#[derive(Default)]
struct SessionTable {
    /// Attach order; ids are pushed on attach and removed on detach.
    order: Vec<String>,
    sessions: HashMap<String, Session>,
    active: Option<String>,
}

impl SessionTable {
    /// Insert the session and apply the active-selector rules. Returns true
    /// when the active session changed.
    fn attach(&mut self, session: Session) -> bool {
        let id = session.session_id.clone();
        let is_page = session.kind == SessionKind::Page;
        self.order.push(id.clone());
        self.sessions.insert(id.clone(), session);

        if is_page && self.active.is_none() {
            self.active = Some(id);
            return true;
        }
        false
    }

    /// Remove the session; when it was active, the most recently attached
    /// remaining page session takes over. Returns true on active change.
    fn detach(&mut self, session_id: &str) -> bool {
        self.order.retain(|id| id != session_id);
        self.sessions.remove(session_id);

        if self.active.as_deref() == Some(session_id) {
            self.active = self
                .order
                .iter()
                .rev()
                .find(|id| {
                    self.sessions
                        .get(id.as_str())
                        .map_or(false, |s| s.kind == SessionKind::Page)
                })
                .cloned();
            return true;
        }
        false
    }

    fn ordered(&self) -> Vec<Session> {
        self.order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .cloned()
            .collect()
    }

    fn active_session(&self) -> Option<Session> {
        self.active
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .cloned()
    }

    /// Resolution order: exact id prefix (case-sensitive), then title
    /// substring (case-insensitive). Only page sessions are eligible.
    fn resolve(&self, query: &str) -> SwitchOutcome {
        let pages: Vec<&Session> = self
            .order
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|s| s.kind == SessionKind::Page)
            .collect();

        let by_prefix: Vec<&Session> = pages
            .iter()
            .copied()
            .filter(|s| s.session_id.starts_with(query))
            .collect();
        if by_prefix.len() == 1 {
            return SwitchOutcome::Switched(by_prefix[0].clone());
        }
        if by_prefix.len() > 1 {
            return SwitchOutcome::Ambiguous(by_prefix.into_iter().cloned().collect());
        }

        let needle = query.to_lowercase();
        let by_title: Vec<&Session> = pages
            .iter()
            .copied()
            .filter(|s| s.title.to_lowercase().contains(&needle))
            .collect();
        match by_title.len() {
            1 => SwitchOutcome::Switched(by_title[0].clone()),
            0 => SwitchOutcome::NotFound(pages.into_iter().cloned().collect()),
            _ => SwitchOutcome::Ambiguous(by_title.into_iter().cloned().collect()),
        }
    }
}

/// Maintains the browser-level attachment: discovers page targets,
/// auto-attaches in flat mode, designates one session as active, re-enables
/// the capture domains per session, and purges buffers on detach.
///
/// At most one supervisor instance exists per process.
pub struct Supervisor {
    transport: Transport,
    buffers: Arc<CaptureBuffers>,
    table: Mutex<SessionTable>,
    active_tx: watch::Sender<Option<String>>,
    nav_tx: broadcast::Sender<NavCommit>,
    load_tx: broadcast::Sender<String>,
    cmd_timeout: Duration,
}

impl Supervisor {
    /// Run the startup protocol against a connected transport.
    ///
    /// On failure the transport is closed and the underlying error surfaces.
    pub async fn start(
        transport: Transport,
        buffers: Arc<CaptureBuffers>,
        cmd_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (active_tx, _) = watch::channel(None);
        let (nav_tx, _) = broadcast::channel(256);
        let (load_tx, _) = broadcast::channel(256);

        let supervisor = Arc::new(Self {
            transport: transport.clone(),
            buffers,
            table: Mutex::new(SessionTable::default()),
            active_tx,
            nav_tx,
            load_tx,
            cmd_timeout,
        });

        supervisor.subscribe_events();

        match supervisor.enable_auto_attach().await {
            Ok(()) => Ok(supervisor),
            Err(err) => {
                transport.close().await;
                Err(err)
            }
        }
    }

    fn subscribe_events(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.transport.subscribe("Target.attachedToTarget", {
            let weak = weak.clone();
            move |event| {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_attached(event);
                }
            }
        });
        self.transport.subscribe("Target.detachedFromTarget", {
            let weak = weak.clone();
            move |event| {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_detached(event);
                }
            }
        });
        self.transport.subscribe("Target.targetInfoChanged", {
            let weak = weak.clone();
            move |event| {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_info_changed(event);
                }
            }
        });
        self.transport.subscribe("Page.frameNavigated", {
            let weak = weak.clone();
            move |event| {
                if let Some(supervisor) = weak.upgrade() {
                    supervisor.on_frame_navigated(event);
                }
            }
        });
        self.transport.subscribe("Page.loadEventFired", {
            let weak = weak.clone();
            move |event| {
                if let Some(supervisor) = weak.upgrade() {
                    if let Some(session_id) = &event.session_id {
                        let _ = supervisor.load_tx.send(session_id.clone());
                    }
                }
            }
        });

        // A transport close is terminal: drop every session so queries see a
        // consistent empty table.
        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            transport.closed().await;
            if let Some(supervisor) = weak.upgrade() {
                let mut table = supervisor.table.lock().unwrap();
                table.order.clear();
                table.sessions.clear();
                table.active = None;
                drop(table);
                let _ = supervisor.active_tx.send(None);
            }
        });
    }

    async fn enable_auto_attach(&self) -> Result<()> {
        let deadline = Instant::now() + self.cmd_timeout;
        self.transport
            .send(
                "Target.setDiscoverTargets",
                Some(serde_json::json!({ "discover": true })),
                deadline,
            )
            .await?;
        self.transport
            .send(
                "Target.setAutoAttach",
                Some(serde_json::json!({
                    "autoAttach": true,
                    "flatten": true,
                    "waitForDebuggerOnStart": true,
                })),
                deadline,
            )
            .await?;
        Ok(())
    }

    fn on_attached(self: &Arc<Self>, event: &Event) {
        let params = &event.params;
        let Some(session_id) = params["sessionId"].as_str() else {
            return;
        };
        let info = &params["targetInfo"];
        let kind = match info["type"].as_str() {
            Some("page") => SessionKind::Page,
            _ => SessionKind::Other,
        };

        let session = Session {
            session_id: session_id.to_string(),
            target_id: info["targetId"].as_str().unwrap_or_default().to_string(),
            url: info["url"].as_str().unwrap_or_default().to_string(),
            title: info["title"].as_str().unwrap_or_default().to_string(),
            kind,
            attached_at: epoch_ms(),
        };

        tracing::debug!(session = %session.session_id, url = %session.url, ?kind, "target attached");

        let changed = {
            let mut table = self.table.lock().unwrap();
            table.attach(session)
        };
        if changed {
            self.notify_active();
        }

        // Domain enablement needs CDP round-trips, which cannot run on the
        // read loop delivering this event.
        let supervisor = self.clone();
        let session_id = session_id.to_string();
        let is_page = kind == SessionKind::Page;
        tokio::spawn(async move {
            if let Err(err) = supervisor.prime_session(&session_id, is_page).await {
                tracing::warn!(session = %session_id, "failed to prime session: {err}");
            }
        });
    }

    /// Enable the capture domains on a fresh page session, then release the
    /// target paused by `waitForDebuggerOnStart`.
    async fn prime_session(&self, session_id: &str, is_page: bool) -> Result<()> {
        let deadline = Instant::now() + self.cmd_timeout;
        if is_page {
            let body_cap = self.buffers.network.body_cap() as u64;
            self.transport
                .send_on_session(session_id, "Runtime.enable", None, deadline)
                .await?;
            self.transport
                .send_on_session(
                    session_id,
                    "Network.enable",
                    Some(serde_json::json!({
                        "maxResourceBufferSize": body_cap * 8,
                        "maxTotalBufferSize": body_cap * 64,
                    })),
                    deadline,
                )
                .await?;
            self.transport
                .send_on_session(session_id, "Page.enable", None, deadline)
                .await?;
        }
        self.transport
            .send_on_session(session_id, "Runtime.runIfWaitingForDebugger", None, deadline)
            .await?;
        Ok(())
    }

    fn on_detached(&self, event: &Event) {
        let Some(session_id) = event.params["sessionId"].as_str() else {
            return;
        };
        tracing::debug!(session = %session_id, "target detached");

        let changed = {
            let mut table = self.table.lock().unwrap();
            table.detach(session_id)
        };
        self.buffers.purge_session(session_id);
        if changed {
            self.notify_active();
        }
    }

    fn on_info_changed(&self, event: &Event) {
        let info = &event.params["targetInfo"];
        let Some(target_id) = info["targetId"].as_str() else {
            return;
        };
        let mut table = self.table.lock().unwrap();
        for session in table.sessions.values_mut() {
            if session.target_id == target_id {
                if let Some(url) = info["url"].as_str() {
                    session.url = url.to_string();
                }
                if let Some(title) = info["title"].as_str() {
                    session.title = title.to_string();
                }
            }
        }
    }

    fn on_frame_navigated(&self, event: &Event) {
        let Some(session_id) = event.session_id.as_deref() else {
            return;
        };
        let frame = &event.params["frame"];
        let commit = NavCommit {
            session_id: session_id.to_string(),
            url: frame["url"].as_str().unwrap_or_default().to_string(),
            is_main_frame: frame.get("parentId").map_or(true, |p| p.is_null()),
        };
        if commit.is_main_frame {
            let mut table = self.table.lock().unwrap();
            if let Some(session) = table.sessions.get_mut(session_id) {
                session.url = commit.url.clone();
            }
        }
        let _ = self.nav_tx.send(commit);
    }

    fn notify_active(&self) {
        let active = self.table.lock().unwrap().active.clone();
        let _ = self.active_tx.send(active);
    }

    /// Insertion-ordered session list.
    pub fn list_sessions(&self) -> Vec<Session> {
        self.table.lock().unwrap().ordered()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.table.lock().unwrap().active_session()
    }

    pub fn active_session_id(&self) -> Option<String> {
        self.table.lock().unwrap().active.clone()
    }

    /// Resolve `query` and, on a unique match, make it the active session.
    /// Selecting the already-active session is a no-op success.
    pub fn switch_active(&self, query: &str) -> SwitchOutcome {
        let outcome = {
            let mut table = self.table.lock().unwrap();
            match table.resolve(query) {
                SwitchOutcome::Switched(session) => {
                    table.active = Some(session.session_id.clone());
                    SwitchOutcome::Switched(session)
                }
                other => other,
            }
        };
        if matches!(outcome, SwitchOutcome::Switched(_)) {
            self.notify_active();
        }
        outcome
    }

    /// Single-slot notification of active-session changes; latest wins.
    pub fn watch_active(&self) -> watch::Receiver<Option<String>> {
        self.active_tx.subscribe()
    }

    pub fn watch_navigation(&self) -> broadcast::Receiver<NavCommit> {
        self.nav_tx.subscribe()
    }

    pub fn watch_load(&self) -> broadcast::Receiver<String> {
        self.load_tx.subscribe()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn command_timeout(&self) -> Duration {
        self.cmd_timeout
    }
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Session events the daemon plumbs into command handlers. Kept `Weak` so
/// handlers never extend the supervisor's lifetime.
pub type SupervisorRef = Weak<Supervisor>;
