//! Virtual listener: hands tunneled streams to a server-side consumer
//! instead of dialing a TCP target.

use std::sync::Weak;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::WhetError;
use crate::server::ServerInner;
use crate::stream::WhetStream;

/// Yields one [`WhetStream`] per tunneled connection to its target name.
///
/// Streams are published on an unbounded handoff channel after the
/// handshake completes; `accept` blocks until the next one arrives.
pub struct WhetListener {
    name: String,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<WhetStream>>,
    server: Weak<ServerInner>,
}

impl WhetListener {
    pub(crate) fn new(
        name: String,
        incoming: mpsc::UnboundedReceiver<WhetStream>,
        server: Weak<ServerInner>,
    ) -> Self {
        Self {
            name,
            incoming: AsyncMutex::new(incoming),
            server,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next tunneled stream. Fails once the listener (or its
    /// server) is closed; a pending accept is woken with the same error.
    pub async fn accept(&self) -> Result<WhetStream, WhetError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(WhetError::Closed)
    }

    /// Unregisters the target. Blocked and future accepts return
    /// [`WhetError::Closed`]; sessions already handed off are unaffected.
    pub fn close(&self) {
        if let Some(server) = self.server.upgrade() {
            server.remove_listener(&self.name);
        }
    }
}
