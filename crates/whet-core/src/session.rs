//! The peer session: one WebRTC peer connection, one detached data channel,
//! and the pumps that move bytes between the channel and a local stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::data::data_channel::DataChannel as RawDataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{
    BUFFERED_AMOUNT_HIGH, BUFFERED_AMOUNT_LOW, DRAIN_POLL_INTERVAL, DRAIN_POLL_LIMIT,
    MAX_CHUNK_SIZE,
};
use crate::error::WhetError;
use crate::registry::SessionRegistry;

/// A single tunnel: peer connection, data channel, and teardown state.
///
/// The only mutable state shared between the pump tasks is the pair of
/// monotone flags and the capacity-1 backpressure signal; data-channel
/// writes are serialized behind `write_lock`.
pub struct Session {
    id: OnceLock<Uuid>,
    peer: Arc<RTCPeerConnection>,
    channel: OnceLock<Arc<RTCDataChannel>>,
    raw: OnceLock<Arc<RawDataChannel>>,
    registry: Arc<SessionRegistry>,
    resource_url: OnceLock<String>,
    bearer_token: Option<String>,
    verify_tls: bool,
    client_ready: AtomicBool,
    closed: AtomicBool,
    closed_notify: Notify,
    send_more_tx: mpsc::Sender<()>,
    send_more_rx: AsyncMutex<mpsc::Receiver<()>>,
    write_lock: AsyncMutex<()>,
}

impl Session {
    pub(crate) fn new(
        peer: Arc<RTCPeerConnection>,
        registry: Arc<SessionRegistry>,
        bearer_token: Option<String>,
        verify_tls: bool,
    ) -> Arc<Self> {
        let (send_more_tx, send_more_rx) = mpsc::channel(1);
        let session = Arc::new(Self {
            id: OnceLock::new(),
            peer,
            channel: OnceLock::new(),
            raw: OnceLock::new(),
            registry,
            resource_url: OnceLock::new(),
            bearer_token,
            verify_tls,
            client_ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            send_more_tx,
            send_more_rx: AsyncMutex::new(send_more_rx),
            write_lock: AsyncMutex::new(()),
        });
        install_peer_watch(&session);
        session
    }

    pub fn id(&self) -> Option<Uuid> {
        self.id.get().copied()
    }

    pub(crate) fn set_id(&self, id: Uuid) {
        let _ = self.id.set(id);
    }

    pub fn resource_url(&self) -> Option<&str> {
        self.resource_url.get().map(String::as_str)
    }

    pub(crate) fn set_resource_url(&self, url: String) {
        let _ = self.resource_url.set(url);
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    pub(crate) fn verify_tls(&self) -> bool {
        self.verify_tls
    }

    pub(crate) fn peer(&self) -> &Arc<RTCPeerConnection> {
        &self.peer
    }

    /// Binds the data channel and installs the flow-control callback. The
    /// low-water callback must never block: it pushes into a capacity-1
    /// channel and drops the notification when one is already pending.
    pub(crate) async fn bind_channel(&self, channel: Arc<RTCDataChannel>) -> bool {
        if self.channel.set(channel.clone()).is_err() {
            debug!(label = channel.label(), "ignoring extra data channel");
            return false;
        }
        channel
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW)
            .await;
        let send_more = self.send_more_tx.clone();
        channel
            .on_buffered_amount_low(Box::new(move || {
                let send_more = send_more.clone();
                Box::pin(async move {
                    let _ = send_more.try_send(());
                })
            }))
            .await;
        true
    }

    pub(crate) fn channel(&self) -> Result<&Arc<RTCDataChannel>, WhetError> {
        self.channel
            .get()
            .ok_or_else(|| WhetError::Transport("data channel not bound".into()))
    }

    pub(crate) fn attach_detached(&self, raw: Arc<RawDataChannel>) {
        let _ = self.raw.set(raw);
    }

    fn raw(&self) -> Result<Arc<RawDataChannel>, WhetError> {
        self.raw
            .get()
            .cloned()
            .ok_or_else(|| WhetError::Transport("data channel not detached".into()))
    }

    pub fn client_ready(&self) -> bool {
        self.client_ready.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_client_ready(&self) {
        self.client_ready.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Writes to the data channel, chunked at the maximum message size and
    /// gated on the buffered-amount high-water mark. Blocks until all bytes
    /// are queued or the session closes.
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), WhetError> {
        let raw = self.raw()?;
        let channel = self.channel()?.clone();
        let _guard = self.write_lock.lock().await;
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            if self.is_closed() {
                return Err(WhetError::Closed);
            }
            raw.write(&Bytes::copy_from_slice(chunk))
                .await
                .map_err(WhetError::transport)?;

            if channel.buffered_amount().await > BUFFERED_AMOUNT_HIGH {
                let mut send_more = self.send_more_rx.lock().await;
                tokio::select! {
                    _ = send_more.recv() => {}
                    _ = self.wait_closed() => return Err(WhetError::Closed),
                }
            }
        }
        Ok(())
    }

    /// Reads one data-channel message into `buf`. Returns 0 on end of
    /// stream; errors are folded into 0 because a zero-byte read always
    /// means teardown for the caller.
    pub async fn receive_raw(&self, buf: &mut [u8]) -> usize {
        let raw = match self.raw() {
            Ok(raw) => raw,
            Err(_) => return 0,
        };
        match raw.read(buf).await {
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "data channel read ended");
                0
            }
        }
    }

    /// Bounded wait for the channel's buffered amount to reach zero. The
    /// counter has been observed to stick; after the cap we close anyway.
    pub(crate) async fn drain(&self) {
        let Ok(channel) = self.channel() else { return };
        let channel = channel.clone();
        for _ in 0..DRAIN_POLL_LIMIT {
            if channel.buffered_amount().await == 0 {
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
        let buffered = channel.buffered_amount().await;
        warn!(
            buffered = buffered,
            "buffered amount did not drain before close"
        );
    }

    /// Idempotent teardown: marks the session closed, closes the data
    /// channel and the peer connection, and removes the registry entry.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed_notify.notify_waiters();
        if let Some(channel) = self.channel.get() {
            let _ = channel.close().await;
        }
        let _ = self.peer.close().await;
        if let Some(id) = self.id.get() {
            self.registry.remove(id);
        }
        debug!(id = ?self.id.get(), "session closed");
    }
}

/// Peer failure surfaces as a close so blocked tasks exit.
fn install_peer_watch(session: &Arc<Session>) {
    let watched = Arc::downgrade(session);
    session
        .peer
        .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let watched = watched.clone();
            Box::pin(async move {
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Closed
                ) {
                    if let Some(session) = watched.upgrade() {
                        if !session.is_closed() {
                            debug!(?state, "peer connection ended, closing session");
                            tokio::spawn(async move { session.close().await });
                        }
                    }
                }
            })
        }));
}

/// Local stream -> data channel. On clean EOF the buffered amount is
/// drained (bounded) before the session closes so queued bytes still reach
/// the peer.
pub(crate) async fn pump_stream_to_channel<R>(session: Arc<Session>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    // No application byte may traverse the channel before both ready
    // sentinels have been exchanged.
    if !session.client_ready() {
        debug!("pump started before handshake completed, closing");
        session.close().await;
        return;
    }
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "local stream read ended");
                0
            }
        };
        if n == 0 {
            session.drain().await;
            break;
        }
        if let Err(err) = session.send_raw(&buf[..n]).await {
            debug!(error = %err, "tunnel send ended");
            break;
        }
    }
    session.close().await;
}

/// Data channel -> local stream.
pub(crate) async fn pump_channel_to_stream<W>(session: Arc<Session>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    if !session.client_ready() {
        debug!("pump started before handshake completed, closing");
        session.close().await;
        return;
    }
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let n = session.receive_raw(&mut buf).await;
        if n == 0 {
            break;
        }
        if let Err(err) = writer.write_all(&buf[..n]).await {
            debug!(error = %err, "local stream write ended");
            break;
        }
    }
    let _ = writer.shutdown().await;
    session.close().await;
}

/// Runs both pumps until either direction ends, then tears the other one
/// down. Aborting the lagging pump drops its stream half, which closes the
/// underlying socket.
pub(crate) async fn pump_bidirectional<R, W>(session: Arc<Session>, reader: R, writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut outbound = tokio::spawn(pump_stream_to_channel(session.clone(), reader));
    let mut inbound = tokio::spawn(pump_channel_to_stream(session, writer));
    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }
}
