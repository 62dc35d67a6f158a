//! Ready-sentinel exchange that brackets application bytes.
//!
//! The server sends `SERVER_READY` as the first message once its side of the
//! tunnel is usable (or `SERVER_ERROR` if the forward dial failed); the
//! client answers with `CLIENT_READY`. Any other first message is fatal.
//! The channel is ordered and reliable, so the sentinels cannot interleave
//! with application data.

use tracing::debug;

use crate::error::WhetError;
use crate::session::Session;

pub const SERVER_READY: &[u8] = b"SERVER_READY";
pub const CLIENT_READY: &[u8] = b"CLIENT_READY";
pub const SERVER_ERROR: &[u8] = b"SERVER_ERROR";

/// Slack over the sentinel length so oversized first messages are seen as
/// wrong content instead of a short-buffer read error.
const SENTINEL_READ_BUF: usize = 2 * SERVER_READY.len();

/// Exact match only: length and bytes. `"SERVER_READY\0"`, padding, or a
/// case change all fail.
pub(crate) fn validate_sentinel(message: &[u8], expected: &'static [u8]) -> Result<(), WhetError> {
    if message == expected {
        return Ok(());
    }
    Err(WhetError::Handshake(format!(
        "expected {} sentinel, got {} bytes",
        String::from_utf8_lossy(expected),
        message.len()
    )))
}

/// Server side: announce readiness, then require `CLIENT_READY` as the
/// client's first message.
pub(crate) async fn server_handshake(session: &Session) -> Result<(), WhetError> {
    session.send_raw(SERVER_READY).await?;
    debug!("sent SERVER_READY, waiting for client");

    let mut buf = [0u8; SENTINEL_READ_BUF];
    let n = session.receive_raw(&mut buf).await;
    if n == 0 {
        return Err(WhetError::Handshake(
            "channel closed before CLIENT_READY".into(),
        ));
    }
    validate_sentinel(&buf[..n], CLIENT_READY)?;
    session.mark_client_ready();
    Ok(())
}

/// Client side: require `SERVER_READY` as the server's first message, then
/// acknowledge. `SERVER_ERROR` reports a failed forward dial on the far
/// side; anything else is a protocol violation.
pub(crate) async fn client_handshake(session: &Session) -> Result<(), WhetError> {
    let mut buf = [0u8; SENTINEL_READ_BUF];
    let n = session.receive_raw(&mut buf).await;
    if n == 0 {
        return Err(WhetError::Handshake(
            "channel closed before SERVER_READY".into(),
        ));
    }
    if &buf[..n] == SERVER_ERROR {
        return Err(WhetError::Dial(
            "server could not reach the forward target".into(),
        ));
    }
    validate_sentinel(&buf[..n], SERVER_READY)?;

    session.send_raw(CLIENT_READY).await?;
    session.mark_client_ready();
    debug!("handshake complete");
    Ok(())
}
