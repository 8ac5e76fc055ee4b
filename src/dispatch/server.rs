use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::broadcast;

use super::{execute, Reply, Request};
use crate::daemon::DaemonContext;

/// Accept loop for the local control socket. Each connection serves exactly
/// one request and closes.
pub async fn serve_unix(
    ctx: Arc<DaemonContext>,
    listener: UnixListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        serve_connection(ctx, stream, None).await;
                    });
                }
                Err(err) => {
                    tracing::warn!("unix accept failed: {err}");
                    break;
                }
            }
        }
    }
}

/// Accept loop for the optional TCP listener, guarded by a shared token.
pub async fn serve_tcp(
    ctx: Arc<DaemonContext>,
    listener: TcpListener,
    token: Option<String>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "tcp client connected");
                    let ctx = ctx.clone();
                    let token = token.clone();
                    tokio::spawn(async move {
                        serve_connection(ctx, stream, token).await;
                    });
                }
                Err(err) => {
                    tracing::warn!("tcp accept failed: {err}");
                    break;
                }
            }
        }
    }
}

/// Newline-framed JSON: one request line in, one reply line out.
async fn serve_connection<S>(ctx: Arc<DaemonContext>, stream: S, token: Option<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let reply = match reader.read_line(&mut line).await {
        Ok(0) => return,
        Ok(_) => match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                if let Some(expected) = token.as_deref() {
                    let presented = req.auth.as_deref().unwrap_or("");
                    if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
                        write_reply(&mut write_half, &Reply::failure("unauthorized")).await;
                        return;
                    }
                }
                execute(&ctx, req).await
            }
            Err(err) => Reply::failure(format!("invalid request: {err}")),
        },
        Err(err) => {
            tracing::debug!("client read failed: {err}");
            return;
        }
    };

    write_reply(&mut write_half, &reply).await;
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, reply: &Reply) {
    let mut line = match serde_json::to_string(reply) {
        Ok(line) => line,
        Err(err) => {
            tracing::error!("unencodable reply: {err}");
            return;
        }
    };
    line.push('\n');
    if let Err(err) = writer.write_all(line.as_bytes()).await {
        tracing::debug!("client write failed: {err}");
    }
    let _ = writer.flush().await;
}

/// Length-leaking but content-constant-time comparison; tokens of unequal
/// length fail fast without revealing where they differ.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_semantics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(constant_time_eq(b"", b""));
    }
}
