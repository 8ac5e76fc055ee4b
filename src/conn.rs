use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use fnv::FnvHashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use hashbrown::HashMap;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{CdpError, Result};
use crate::wire::{self, CallId, Event, Frame, MethodCall, MethodId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

type EventHandler = Box<dyn Fn(&Event) + Send + Sync>;
type PendingCall = oneshot::Sender<Result<wire::Response>>;

const STATE_OPEN: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Process-wide call id counter; ids are never reused, even across
/// reconnects.
static NEXT_CALL_ID: AtomicI64 = AtomicI64::new(1);

/// The client half of one CDP WebSocket connection.
///
/// Cheap to clone; all clones share the connection. One background task owns
/// the read side and dispatches frames: responses are correlated with their
/// callers through the pending-call table, events fan out to subscribers in
/// registration order.
///
/// Subscriber handlers run on the read loop and must not block; anything
/// long-running (further CDP calls in particular) has to be offloaded to a
/// spawned task holding a [`WeakTransport`].
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

/// A non-owning handle used by event-path consumers so the subscriber table
/// does not keep the transport alive through a reference cycle.
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    pub fn upgrade(&self) -> Option<Transport> {
        self.inner.upgrade().map(|inner| Transport { inner })
    }
}

struct Inner {
    sink: tokio::sync::Mutex<WsSink>,
    pending: Mutex<FnvHashMap<CallId, PendingCall>>,
    subscribers: RwLock<HashMap<MethodId, Vec<EventHandler>>>,
    state: AtomicU8,
    terminal: Mutex<Option<Arc<CdpError>>>,
    done: watch::Sender<bool>,
}

impl Transport {
    /// Open a WebSocket to the browser's debugger URL and spawn the read
    /// loop.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (stream, _) = connect_async(ws_url).await?;
        let (sink, source) = stream.split();
        let (done, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            sink: tokio::sync::Mutex::new(sink),
            pending: Mutex::new(FnvHashMap::default()),
            subscribers: RwLock::new(HashMap::new()),
            state: AtomicU8::new(STATE_OPEN),
            terminal: Mutex::new(None),
            done,
        });

        tokio::spawn(read_loop(inner.clone(), source));

        Ok(Self { inner })
    }

    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Issue a browser-scope call and await its response.
    pub async fn send(
        &self,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
        deadline: Instant,
    ) -> Result<serde_json::Value> {
        self.send_inner(method.into(), params, None, deadline).await
    }

    /// Identical to [`Transport::send`] but stamps the frame with a session
    /// id so the browser routes it to that page target.
    pub async fn send_on_session(
        &self,
        session_id: &str,
        method: impl Into<MethodId>,
        params: Option<serde_json::Value>,
        deadline: Instant,
    ) -> Result<serde_json::Value> {
        self.send_inner(method.into(), params, Some(session_id.to_string()), deadline)
            .await
    }

    async fn send_inner(
        &self,
        method: MethodId,
        params: Option<serde_json::Value>,
        session_id: Option<String>,
        deadline: Instant,
    ) -> Result<serde_json::Value> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(CdpError::Closed);
        }

        let id = CallId::new(NEXT_CALL_ID.fetch_add(1, Ordering::SeqCst));
        let call = MethodCall {
            id,
            method,
            session_id,
            params,
        };
        let raw = wire::encode(&call)?;

        let (tx, rx) = oneshot::channel();
        // Registered before the frame hits the wire so a fast reply always
        // finds its slot.
        self.inner.pending.lock().unwrap().insert(id, tx);

        {
            let mut sink = self.inner.sink.lock().await;
            if self.inner.state.load(Ordering::SeqCst) != STATE_OPEN {
                self.inner.pending.lock().unwrap().remove(&id);
                return Err(CdpError::Closed);
            }
            if let Err(err) = sink.send(WsMessage::Text(raw.into())).await {
                // A write failure wakes this caller only; the read side may
                // still observe data.
                self.inner.pending.lock().unwrap().remove(&id);
                return Err(err.into());
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => {
                let resp = result?;
                if let Some(err) = resp.error {
                    Err(CdpError::Chrome(err))
                } else {
                    Ok(resp.result.unwrap_or(serde_json::Value::Null))
                }
            }
            // Read loop gone without delivering.
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                // A late response for the removed id is discarded silently by
                // the read loop.
                self.inner.pending.lock().unwrap().remove(&id);
                Err(CdpError::Timeout)
            }
        }
    }

    /// Register an event handler. Multiple handlers per method are invoked
    /// in registration order; subscriptions last for the transport lifetime.
    pub fn subscribe(
        &self,
        method: impl Into<MethodId>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        self.inner
            .subscribers
            .write()
            .unwrap()
            .entry(method.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Request closure. Idempotent: the first call wins, later calls are
    /// no-ops. Wakes every pending call with [`CdpError::Closed`]; the read
    /// loop keeps delivering events until the socket EOFs.
    pub async fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.inner.fail_pending();
        let mut sink = self.inner.sink.lock().await;
        let _ = sink.send(WsMessage::Close(None)).await;
    }

    /// After closure, the error that caused it; `None` while open or when
    /// closed cleanly.
    pub fn last_error(&self) -> Option<Arc<CdpError>> {
        self.inner.terminal.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Resolves once the transport has terminated.
    pub async fn closed(&self) {
        let mut rx = self.inner.done.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Inner {
    /// Wake every pending caller with `Closed`. A dead receiver cannot stall
    /// anything: oneshot sends are non-blocking.
    fn fail_pending(&self) {
        let drained: Vec<PendingCall> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(CdpError::Closed));
        }
    }

    /// Transition to `Closed` exactly once, recording the terminal cause.
    fn finalize(&self, error: Option<CdpError>) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }
        if let Some(err) = error {
            *self.terminal.lock().unwrap() = Some(Arc::new(err));
        }
        self.fail_pending();
        let _ = self.done.send(true);
    }
}

async fn read_loop(inner: Arc<Inner>, mut source: WsSource) {
    let error = loop {
        match source.next().await {
            Some(Ok(WsMessage::Text(text))) => match wire::decode(text.as_str()) {
                Ok(Frame::Response(resp)) => {
                    let slot = inner.pending.lock().unwrap().remove(&resp.id);
                    if let Some(tx) = slot {
                        let _ = tx.send(Ok(resp));
                    } else {
                        tracing::trace!(id = %resp.id, "discarding late response");
                    }
                }
                Ok(Frame::Event(event)) => {
                    let subscribers = inner.subscribers.read().unwrap();
                    if let Some(handlers) = subscribers.get(event.method.as_str()) {
                        for handler in handlers {
                            handler(&event);
                        }
                    }
                }
                Err(err) => {
                    // Malformed frames are dropped; the transport continues.
                    tracing::debug!("dropping malformed frame: {err}");
                }
            },
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
            Some(Ok(WsMessage::Close(_))) | None => break None,
            Some(Ok(other)) => {
                tracing::debug!("ignoring unexpected ws message: {other:?}");
            }
            Some(Err(err)) => {
                // Socket errors after a requested close are part of teardown,
                // not a terminal cause.
                if inner.state.load(Ordering::SeqCst) != STATE_OPEN {
                    break None;
                }
                break Some(CdpError::Ws(err));
            }
        }
    };

    if let Some(err) = &error {
        tracing::warn!("cdp transport terminated: {err}");
    }
    inner.finalize(error);
}
