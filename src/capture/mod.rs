//! Eager capture buffers.
//!
//! The browser's console and network events are ephemeral: remote object
//! references die on navigation and response bodies are released once the
//! page moves on. These buffers materialise both into bounded, queryable
//! memory at event time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::conn::Transport;

pub mod console;
pub mod network;
pub mod query;
pub mod ring;

pub use console::{ConsoleBuffer, ConsoleEntry};
pub use network::{NetworkBuffer, NetworkEntry};
pub use query::{ConsoleFilter, NetworkFilter, QueryError, RangeSel, RangeSpec, StatusPattern};

/// Default capacity of each ring.
pub const DEFAULT_BUFFER_CAP: usize = 10_000;
/// Default inline body cap in bytes (100 KiB).
pub const DEFAULT_BODY_CAP: usize = 102_400;

/// The two session-tagged rings plus their shared configuration.
pub struct CaptureBuffers {
    pub console: Arc<ConsoleBuffer>,
    pub network: Arc<NetworkBuffer>,
}

impl CaptureBuffers {
    pub fn new(buffer_cap: usize, body_cap: usize, body_dir: PathBuf) -> Arc<Self> {
        let fetch_timeout = Duration::from_secs(10);
        Arc::new(Self {
            console: Arc::new(ConsoleBuffer::new(buffer_cap, fetch_timeout)),
            network: Arc::new(NetworkBuffer::new(
                buffer_cap,
                body_cap,
                body_dir,
                fetch_timeout,
            )),
        })
    }

    /// Register both buffers as subscribers of the transport's event fan-out.
    pub fn install(&self, transport: &Transport) {
        self.console.install(transport);
        self.network.install(transport);
    }

    /// Drop every entry tagged with `session_id`, and nothing else.
    pub fn purge_session(&self, session_id: &str) {
        self.console.purge_session(session_id);
        self.network.purge_session(session_id);
    }

    pub fn clear_console(&self) {
        self.console.clear();
    }

    /// Drops entries and deletes any body files this process wrote.
    pub fn clear_network(&self) {
        self.network.clear();
    }

    pub fn clear_all(&self) {
        self.clear_console();
        self.clear_network();
    }
}
