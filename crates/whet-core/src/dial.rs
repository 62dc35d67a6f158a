//! Client side of the tunnel: dialing targets through a signaling server.

use std::sync::Arc;

use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config;
use crate::error::WhetError;
use crate::handshake;
use crate::registry::client_sessions;
use crate::session::{pump_bidirectional, Session};
use crate::stream::WhetStream;

/// Knobs for the signaling HTTP client.
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Verify the signaling server's TLS certificate. Off by default: the
    /// security boundary is ICE/DTLS, TLS on the signaling channel is
    /// opportunistic.
    pub verify_tls: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self { verify_tls: false }
    }
}

/// Dials `target_name` through the signaling server and returns the tunnel
/// as a TCP-like stream.
pub async fn dial(
    signal_server: &str,
    target_name: &str,
    bearer_token: Option<&str>,
) -> Result<WhetStream, WhetError> {
    dial_with_options(signal_server, target_name, bearer_token, DialOptions::default()).await
}

pub async fn dial_with_options(
    signal_server: &str,
    target_name: &str,
    bearer_token: Option<&str>,
    options: DialOptions,
) -> Result<WhetStream, WhetError> {
    let session = dial_session(signal_server, target_name, bearer_token, options).await?;
    Ok(WhetStream::new(session))
}

/// Proxies one accepted local TCP connection through a fresh tunnel to
/// `target_name`. Returns once either direction ends and the session is
/// torn down.
pub async fn proxy_tcp_connection(
    conn: TcpStream,
    signal_server: &str,
    target_name: &str,
    bearer_token: Option<&str>,
) -> Result<(), WhetError> {
    let session = dial_session(
        signal_server,
        target_name,
        bearer_token,
        DialOptions::default(),
    )
    .await?;
    let (tcp_read, tcp_write) = conn.into_split();
    pump_bidirectional(session.clone(), tcp_read, tcp_write).await;
    session.close().await;
    notify_delete(&session).await;
    Ok(())
}

/// Full dial: peer + data channel, non-trickle offer, POST, answer,
/// registration, handshake.
pub(crate) async fn dial_session(
    signal_server: &str,
    target_name: &str,
    bearer_token: Option<&str>,
    options: DialOptions,
) -> Result<Arc<Session>, WhetError> {
    let peer = config::new_peer_connection().await?;
    let session = Session::new(
        peer.clone(),
        client_sessions().clone(),
        bearer_token.map(str::to_owned),
        options.verify_tls,
    );

    let channel = peer
        .create_data_channel(config::DATA_CHANNEL_LABEL, Some(config::data_channel_init()))
        .await
        .map_err(WhetError::signaling)?;
    session.bind_channel(channel.clone()).await;

    // The channel is detached inside on_open; the dialer blocks below until
    // that has happened (or the peer fails first).
    let opened = Arc::new(Notify::new());
    let open_session = session.clone();
    let open_channel = channel.clone();
    let open_notify = opened.clone();
    channel.on_open(Box::new(move || {
        let session = open_session.clone();
        let channel = open_channel.clone();
        let notify = open_notify.clone();
        Box::pin(async move {
            match channel.detach().await {
                Ok(raw) => {
                    session.attach_detached(raw);
                    notify.notify_one();
                }
                Err(err) => {
                    warn!(error = %err, "failed to detach data channel");
                    tokio::spawn(async move { session.close().await });
                }
            }
        })
    }));

    let endpoint = signaling_url(signal_server, target_name);
    let connected = async {
        let offer = peer.create_offer(None).await.map_err(WhetError::signaling)?;
        let mut gather = peer.gathering_complete_promise().await;
        peer.set_local_description(offer)
            .await
            .map_err(WhetError::signaling)?;
        // Non-trickle: ship the offer only once it carries every candidate.
        let _ = gather.recv().await;
        let local = peer
            .local_description()
            .await
            .ok_or_else(|| WhetError::Signaling("missing local description".into()))?;

        info!(%endpoint, "posting offer to signaling server");
        let client = http_client(options.verify_tls)?;
        let mut request = client
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/sdp")
            .body(local.sdp);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(WhetError::signaling)?;

        // WHEP-style servers answer 201 Created; some return a plain 200.
        let status = response.status();
        if status != StatusCode::CREATED && status != StatusCode::OK {
            return Err(WhetError::Signaling(format!(
                "signaling POST returned {status}"
            )));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| WhetError::Signaling("response missing Location header".into()))?;
        let (id, resource_url) = resolve_resource(&endpoint, &location)?;
        let answer_sdp = response.text().await.map_err(WhetError::signaling)?;

        let answer = RTCSessionDescription::answer(answer_sdp).map_err(WhetError::signaling)?;
        peer.set_remote_description(answer)
            .await
            .map_err(WhetError::signaling)?;

        session.set_id(id);
        session.set_resource_url(resource_url);
        client_sessions().insert(id, session.clone());
        debug!(%id, "session registered, waiting for data channel");

        tokio::select! {
            _ = opened.notified() => {}
            _ = session.wait_closed() => {
                return Err(WhetError::Transport(
                    "peer connection failed before the data channel opened".into(),
                ));
            }
        }

        handshake::client_handshake(&session).await
    }
    .await;

    match connected {
        Ok(()) => Ok(session),
        Err(err) => {
            session.close().await;
            notify_delete(&session).await;
            Err(err)
        }
    }
}

/// Releases the signaling resource with a DELETE. Best effort: failures are
/// logged, never propagated.
pub(crate) async fn notify_delete(session: &Arc<Session>) {
    let Some(url) = session.resource_url().map(str::to_owned) else {
        return;
    };
    let client = match http_client(session.verify_tls()) {
        Ok(client) => client,
        Err(err) => {
            debug!(error = %err, "could not build client for DELETE");
            return;
        }
    };
    let mut request = client.delete(&url);
    if let Some(token) = session.bearer_token() {
        request = request.bearer_auth(token);
    }
    match request.send().await {
        Ok(response) => debug!(%url, status = %response.status(), "released signaling resource"),
        Err(err) => debug!(%url, error = %err, "DELETE request failed"),
    }
}

fn http_client(verify_tls: bool) -> Result<reqwest::Client, WhetError> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!verify_tls)
        .build()
        .map_err(WhetError::signaling)
}

/// `<server>/whet/<target>`, defaulting to `http://` when the server string
/// has no scheme. Dots in the target select nested mounts.
fn signaling_url(signal_server: &str, target_name: &str) -> String {
    let target_path = target_name.replace('.', "/");
    let base = signal_server.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/whet/{target_path}")
    } else {
        format!("http://{base}/whet/{target_path}")
    }
}

/// The resource ID is the last path segment of the Location header, which
/// may be relative to the signaling endpoint.
fn resolve_resource(endpoint: &str, location: &str) -> Result<(Uuid, String), WhetError> {
    let base = Url::parse(endpoint).map_err(WhetError::signaling)?;
    let resolved = base.join(location).map_err(WhetError::signaling)?;
    let id = resolved
        .path_segments()
        .and_then(|segments| segments.last())
        .and_then(|segment| Uuid::parse_str(segment).ok())
        .ok_or_else(|| {
            WhetError::Signaling(format!("Location {location:?} has no resource id"))
        })?;
    Ok((id, resolved.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_url_defaults_scheme() {
        assert_eq!(
            signaling_url("127.0.0.1:8088", "remoterange"),
            "http://127.0.0.1:8088/whet/remoterange"
        );
        assert_eq!(
            signaling_url("https://tunnel.example.com/", "ssh"),
            "https://tunnel.example.com/whet/ssh"
        );
    }

    #[test]
    fn signaling_url_expands_dotted_targets() {
        assert_eq!(
            signaling_url("http://host", "edge.ssh"),
            "http://host/whet/edge/ssh"
        );
    }

    #[test]
    fn resolves_resource_ids_from_absolute_and_relative_locations() {
        let id = Uuid::new_v4();
        let endpoint = "http://127.0.0.1:8088/whet/remoterange";

        let absolute = format!("http://127.0.0.1:8088/whet/{id}");
        let (parsed, url) = resolve_resource(endpoint, &absolute).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(url, absolute);

        let relative = format!("/whet/{id}");
        let (parsed, url) = resolve_resource(endpoint, &relative).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(url, absolute);
    }

    #[test]
    fn rejects_locations_without_a_uuid() {
        let endpoint = "http://127.0.0.1:8088/whet/remoterange";
        assert!(resolve_resource(endpoint, "/whet/not-a-uuid").is_err());
    }
}
