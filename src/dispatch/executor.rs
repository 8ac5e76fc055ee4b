use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};

use super::{execute, Reply, Request};
use crate::daemon::DaemonContext;

/// One command in, one envelope out. The three implementations are
/// behaviourally identical; a transport problem is reported inside the
/// envelope so callers only ever deal with one shape.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, req: Request) -> Reply;
}

/// Runs the handler in-process, sharing the handler set and context with
/// the socket executors. Exists so an interactive front-end can skip the
/// socket hop.
pub struct DirectExecutor {
    ctx: Arc<DaemonContext>,
}

impl DirectExecutor {
    pub fn new(ctx: Arc<DaemonContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Executor for DirectExecutor {
    async fn execute(&self, req: Request) -> Reply {
        execute(&self.ctx, req).await
    }
}

/// Connects to the daemon's Unix control socket, fresh connection per
/// command.
pub struct LocalExecutor {
    socket: PathBuf,
}

impl LocalExecutor {
    pub fn new(socket: PathBuf) -> Self {
        Self { socket }
    }

    pub fn at_default_path() -> Self {
        Self::new(crate::paths::socket_path())
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(&self, req: Request) -> Reply {
        let stream = match UnixStream::connect(&self.socket).await {
            Ok(stream) => stream,
            Err(err) => return Reply::failure(format!("daemon not running: {err}")),
        };
        roundtrip(stream, &req).await
    }
}

/// The same newline-framed protocol over TCP, with an optional shared
/// bearer token stamped onto every request.
pub struct TcpExecutor {
    addr: String,
    token: Option<String>,
}

impl TcpExecutor {
    pub fn new(addr: impl Into<String>, token: Option<String>) -> Self {
        Self {
            addr: addr.into(),
            token,
        }
    }
}

#[async_trait]
impl Executor for TcpExecutor {
    async fn execute(&self, req: Request) -> Reply {
        let mut req = req;
        if req.auth.is_none() {
            req.auth = self.token.clone();
        }
        let stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(err) => return Reply::failure(format!("daemon not running: {err}")),
        };
        roundtrip(stream, &req).await
    }
}

/// Write one request line, read one reply line, close.
async fn roundtrip<S>(stream: S, req: &Request) -> Reply
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    let mut line = match serde_json::to_string(req) {
        Ok(line) => line,
        Err(err) => return Reply::failure(format!("unencodable request: {err}")),
    };
    line.push('\n');
    if let Err(err) = write_half.write_all(line.as_bytes()).await {
        return Reply::failure(format!("daemon not running: {err}"));
    }

    let mut reader = BufReader::new(read_half);
    let mut reply_line = String::new();
    match reader.read_line(&mut reply_line).await {
        Ok(0) => Reply::failure("daemon closed the connection without replying".to_string()),
        Ok(_) => serde_json::from_str(&reply_line)
            .unwrap_or_else(|err| Reply::failure(format!("invalid reply from daemon: {err}"))),
        Err(err) => Reply::failure(format!("daemon not running: {err}")),
    }
}
