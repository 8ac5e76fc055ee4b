use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;

use crate::browser;
use crate::capture::{CaptureBuffers, DEFAULT_BODY_CAP, DEFAULT_BUFFER_CAP};
use crate::conn::Transport;
use crate::dispatch::server;
use crate::error::{CdpError, Result};
use crate::paths;
use crate::supervisor::Supervisor;

/// Default deadline for a single command; generous because slow page
/// navigations are routine.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Debug address of the browser; `ws://` is used as-is, `http://` is
    /// resolved through `/json/version`.
    pub browser_url: Option<String>,
    /// Optional TCP listen address for remote clients.
    pub tcp: Option<String>,
    /// Shared token required on the TCP listener.
    pub token: Option<String>,
    pub body_cap: usize,
    pub buffer_cap: usize,
    pub command_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            browser_url: None,
            tcp: None,
            token: None,
            body_cap: DEFAULT_BODY_CAP,
            buffer_cap: DEFAULT_BUFFER_CAP,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// The connected browser: one transport, one supervisor.
pub struct BrowserLink {
    pub transport: Transport,
    pub supervisor: Arc<Supervisor>,
}

/// Ambient state handed to every command handler, identical across the
/// three executors. Handlers read the supervisor, transport and buffers
/// through this context; they never own them.
pub struct DaemonContext {
    pub pid: u32,
    pub buffers: Arc<CaptureBuffers>,
    pub command_timeout: Duration,
    browser: OnceLock<BrowserLink>,
    shutdown: broadcast::Sender<()>,
}

impl DaemonContext {
    pub fn new(buffers: Arc<CaptureBuffers>, command_timeout: Duration) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            pid: std::process::id(),
            buffers,
            command_timeout,
            browser: OnceLock::new(),
            shutdown,
        })
    }

    pub fn browser(&self) -> Option<&BrowserLink> {
        self.browser.get()
    }

    pub fn supervisor(&self) -> Option<&Arc<Supervisor>> {
        self.browser.get().map(|link| &link.supervisor)
    }

    pub fn attach_browser(&self, link: BrowserLink) {
        if self.browser.set(link).is_err() {
            tracing::warn!("browser already attached, ignoring second attachment");
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

/// Run the supervisor process until a shutdown request or signal.
pub async fn run(config: DaemonConfig) -> Result<()> {
    paths::ensure_runtime_dir()?;
    let socket_path = paths::socket_path();
    let pid_path = paths::pid_path();
    let pid = std::process::id();

    reclaim_stale_socket(&socket_path).await?;
    let unix_listener = UnixListener::bind(&socket_path)?;
    paths::restrict_socket(&socket_path)?;
    std::fs::write(&pid_path, format!("{pid}\n"))?;
    tracing::info!(socket = %socket_path.display(), "control socket ready");

    let tcp_listener = match &config.tcp {
        Some(addr) => Some(bind_tcp(addr).await?),
        None => None,
    };

    let buffers = CaptureBuffers::new(
        config.buffer_cap,
        config.body_cap,
        paths::body_dir(pid),
    );
    let ctx = DaemonContext::new(buffers.clone(), config.command_timeout);

    connect_browser(&ctx, &config).await?;

    let mut server_tasks = Vec::new();
    server_tasks.push(tokio::spawn(server::serve_unix(
        ctx.clone(),
        unix_listener,
        ctx.shutdown_signal(),
    )));
    if let Some(listener) = tcp_listener {
        server_tasks.push(tokio::spawn(server::serve_tcp(
            ctx.clone(),
            listener,
            config.token.clone(),
            ctx.shutdown_signal(),
        )));
    }

    wait_for_exit(&ctx).await;
    tracing::info!("shutting down");

    if let Some(link) = ctx.browser() {
        link.transport.close().await;
    }
    for task in server_tasks {
        task.abort();
    }
    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// Establish the CDP attachment. A missing browser is fatal only when the
/// operator named one explicitly; otherwise the daemon runs browserless and
/// `status` keeps answering.
async fn connect_browser(ctx: &Arc<DaemonContext>, config: &DaemonConfig) -> Result<()> {
    let explicit = config.browser_url.is_some();
    let url = config
        .browser_url
        .clone()
        .unwrap_or_else(|| "http://127.0.0.1:9222".to_string());

    let link = async {
        let ws_url = browser::resolve_ws_url(&url).await?;
        let transport = Transport::connect(&ws_url).await?;
        // Buffers subscribe before the supervisor issues setAutoAttach so no
        // early event slips past them.
        ctx.buffers.install(&transport);
        let supervisor =
            Supervisor::start(transport.clone(), ctx.buffers.clone(), ctx.command_timeout).await?;
        Ok::<_, CdpError>(BrowserLink {
            transport,
            supervisor,
        })
    }
    .await;

    match link {
        Ok(link) => {
            // A transport close is terminal for the process.
            let watcher = link.transport.clone();
            ctx.attach_browser(link);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                watcher.closed().await;
                if let Some(err) = watcher.last_error() {
                    tracing::error!("browser connection lost: {err}");
                } else {
                    tracing::info!("browser connection closed");
                }
                ctx.request_shutdown();
            });
            Ok(())
        }
        Err(err) if explicit => Err(err),
        Err(err) => {
            tracing::warn!("no browser attached: {err}");
            Ok(())
        }
    }
}

/// A leftover socket from a dead daemon is removed; a live one is an error.
async fn reclaim_stale_socket(path: &PathBuf) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => Err(CdpError::msg(format!(
            "daemon already running on {}",
            path.display()
        ))),
        Err(_) => {
            std::fs::remove_file(path)?;
            Ok(())
        }
    }
}

async fn bind_tcp(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            let port = addr.rsplit(':').next().unwrap_or(addr);
            Err(CdpError::msg(format!("port is already in use: {port}")))
        }
        Err(err) => Err(err.into()),
    }
}

async fn wait_for_exit(ctx: &Arc<DaemonContext>) {
    let mut shutdown = ctx.shutdown_signal();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler");
        tokio::select! {
            _ = shutdown.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = shutdown.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
}
