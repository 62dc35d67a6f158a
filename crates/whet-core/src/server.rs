//! Server side of the tunnel: target table, session negotiation, and the
//! `/whet/` signaling endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config;
use crate::error::WhetError;
use crate::handshake::{self, SERVER_ERROR};
use crate::listener::WhetListener;
use crate::registry::SessionRegistry;
use crate::session::{pump_bidirectional, Session};
use crate::stream::WhetStream;
use crate::target::{normalize_name, ForwardTarget};

/// What a negotiated session does once its data channel opens.
#[derive(Clone)]
enum SessionRole {
    /// Dial a real TCP destination and proxy bytes to it.
    Forward { addr: String },
    /// Hand the tunneled stream to the named virtual listener.
    Listener { name: String },
}

enum TargetEntry {
    Forward(ForwardTarget),
    Listener {
        listener: Arc<WhetListener>,
        handoff: mpsc::UnboundedSender<WhetStream>,
    },
}

/// One signaling server: a table of targets, a session registry, and an
/// optional bearer token gating POSTs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WhetServer {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    bearer_token: Option<String>,
    targets: Mutex<HashMap<String, TargetEntry>>,
    sessions: Arc<SessionRegistry>,
}

impl ServerInner {
    /// Drops a listener target; its handoff sender goes with it, which
    /// wakes any blocked accept.
    pub(crate) fn remove_listener(&self, name: &str) {
        let mut targets = self.targets.lock().unwrap();
        if matches!(targets.get(name), Some(TargetEntry::Listener { .. })) {
            targets.remove(name);
        }
    }
}

impl WhetServer {
    pub fn new(bearer_token: Option<String>, targets: HashMap<String, ForwardTarget>) -> Self {
        let targets = targets
            .into_iter()
            .map(|(name, target)| (name, TargetEntry::Forward(target)))
            .collect();
        Self {
            inner: Arc::new(ServerInner {
                bearer_token,
                targets: Mutex::new(targets),
                sessions: SessionRegistry::new(),
            }),
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.inner.bearer_token.as_deref()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.inner.sessions
    }

    /// Registers a virtual listener target. Idempotent per name; fails if a
    /// forward target already owns the name.
    pub fn add_listener(&self, name: &str) -> Result<Arc<WhetListener>, WhetError> {
        let name = normalize_name(name)
            .ok_or_else(|| WhetError::Config(format!("invalid listener name {name:?}")))?;
        let mut targets = self.inner.targets.lock().unwrap();
        match targets.get(&name) {
            Some(TargetEntry::Listener { listener, .. }) => Ok(listener.clone()),
            Some(TargetEntry::Forward(_)) => Err(WhetError::Config(format!(
                "target {name} is already registered as a forward target"
            ))),
            None => {
                let (handoff, incoming) = mpsc::unbounded_channel();
                let listener = Arc::new(WhetListener::new(
                    name.clone(),
                    incoming,
                    Arc::downgrade(&self.inner),
                ));
                targets.insert(
                    name,
                    TargetEntry::Listener {
                        listener: listener.clone(),
                        handoff,
                    },
                );
                Ok(listener)
            }
        }
    }

    fn resolve(&self, name: &str, offset: u16) -> Result<SessionRole, WhetError> {
        let targets = self.inner.targets.lock().unwrap();
        match targets.get(name) {
            Some(TargetEntry::Forward(target)) => Ok(SessionRole::Forward {
                addr: target.resolve(offset)?,
            }),
            Some(TargetEntry::Listener { .. }) => {
                if offset != 0 {
                    return Err(WhetError::Target(format!(
                        "listener target {name} has no port range"
                    )));
                }
                Ok(SessionRole::Listener {
                    name: name.to_owned(),
                })
            }
            None => Err(WhetError::Target(name.to_owned())),
        }
    }

    fn hand_off(&self, name: &str, stream: WhetStream) -> bool {
        let handoff = {
            let targets = self.inner.targets.lock().unwrap();
            match targets.get(name) {
                Some(TargetEntry::Listener { handoff, .. }) => handoff.clone(),
                _ => return false,
            }
        };
        handoff.send(stream).is_ok()
    }

    /// The signaling routes, ready to merge into a host router. Preflight
    /// OPTIONS requests are answered by the CORS layer.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/whet/*target", post(handle_post).delete(handle_delete))
            .layer(cors_layer())
            .with_state(self.clone())
    }

    /// Closes every remaining session. Call on process shutdown.
    pub async fn shutdown(&self) {
        self.inner.sessions.close_all().await;
    }
}

/// CORS policy shared by the signaling and health routes: wildcard origin,
/// the WHEP verbs, and an exposed Location header. A wildcard origin cannot
/// be combined with credentials, so no credentials header is sent.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::LOCATION])
}

/// `GET /health` payload, mounted by the daemon next to the signaling
/// routes.
pub async fn health() -> impl IntoResponse {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(json!({ "status": "ok", "timestamp": timestamp }))
}

async fn handle_post(
    State(server): State<WhetServer>,
    Path(suffix): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    // Authorization comes before target inspection so unauthorized callers
    // cannot probe the target table.
    if let Some(expected) = server.bearer_token() {
        let authorized = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| value == format!("Bearer {expected}"))
            .unwrap_or(false);
        if !authorized {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    }

    let role = match parse_path_suffix(&suffix)
        .and_then(|(name, offset)| server.resolve(&name, offset))
    {
        Ok(role) => role,
        Err(err) => {
            debug!(%suffix, error = %err, "rejecting target");
            return error_response(StatusCode::BAD_REQUEST, "invalid target");
        }
    };

    match negotiate(server, role, body).await {
        Ok((id, answer_sdp)) => {
            let location = format!("{}://{}/whet/{}", scheme_of(&headers), host_of(&headers), id);
            let Ok(location) = HeaderValue::from_str(&location) else {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "bad host header");
            };
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/sdp"),
            );
            headers.insert(header::LOCATION, location);
            (StatusCode::CREATED, headers, answer_sdp).into_response()
        }
        Err(err) => {
            warn!(error = %err, "session negotiation failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to negotiate session",
            )
        }
    }
}

async fn handle_delete(State(server): State<WhetServer>, Path(suffix): Path<String>) -> Response {
    if let Ok(id) = Uuid::parse_str(&suffix) {
        if let Some(session) = server.sessions().remove(&id) {
            info!(%id, "deleting session");
            tokio::spawn(async move { session.close().await });
        }
    }
    // Idempotent: 200 whether or not the resource existed.
    StatusCode::OK.into_response()
}

/// Builds the peer, wires the data-channel lifecycle, and runs the
/// non-trickle offer/answer exchange. The session is registered only once
/// negotiation succeeds; a half-built session is torn down.
async fn negotiate(
    server: WhetServer,
    role: SessionRole,
    offer_sdp: String,
) -> Result<(Uuid, String), WhetError> {
    let peer = config::new_peer_connection().await?;
    let session = Session::new(peer.clone(), server.sessions().clone(), None, false);
    let id = Uuid::new_v4();
    session.set_id(id);
    install_channel_handlers(&server, &session, role);

    let negotiated = async {
        let offer = RTCSessionDescription::offer(offer_sdp).map_err(WhetError::signaling)?;
        peer.set_remote_description(offer)
            .await
            .map_err(WhetError::signaling)?;
        let answer = peer
            .create_answer(None)
            .await
            .map_err(WhetError::signaling)?;
        let mut gather = peer.gathering_complete_promise().await;
        peer.set_local_description(answer)
            .await
            .map_err(WhetError::signaling)?;
        // Non-trickle: the answer carries every candidate we will ever
        // offer, so gathering must finish before we respond.
        let _ = gather.recv().await;
        peer.local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| WhetError::Signaling("missing local description".into()))
    }
    .await;

    match negotiated {
        Ok(sdp) => {
            server.sessions().insert(id, session);
            debug!(%id, "session negotiated");
            Ok((id, sdp))
        }
        Err(err) => {
            session.close().await;
            Err(err)
        }
    }
}

fn install_channel_handlers(server: &WhetServer, session: &Arc<Session>, role: SessionRole) {
    let on_channel_session = session.clone();
    let on_channel_server = server.clone();
    session
        .peer()
        .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let session = on_channel_session.clone();
            let server = on_channel_server.clone();
            let role = role.clone();
            Box::pin(async move {
                debug!(label = channel.label(), "data channel announced");
                if !session.bind_channel(channel.clone()).await {
                    return;
                }
                let open_session = session.clone();
                let open_server = server.clone();
                let open_channel = channel.clone();
                channel.on_open(Box::new(move || {
                    let session = open_session.clone();
                    let server = open_server.clone();
                    let channel = open_channel.clone();
                    let role = role.clone();
                    Box::pin(async move {
                        tokio::spawn(run_session_channel(server, session, channel, role));
                    })
                }));
            })
        }));
}

/// Drives a server-side session from channel-open to teardown: detach,
/// resolve the role, handshake, then pump (or hand off) bytes.
async fn run_session_channel(
    server: WhetServer,
    session: Arc<Session>,
    channel: Arc<RTCDataChannel>,
    role: SessionRole,
) {
    let raw = match channel.detach().await {
        Ok(raw) => raw,
        Err(err) => {
            warn!(error = %err, "failed to detach data channel");
            session.close().await;
            return;
        }
    };
    session.attach_detached(raw);

    match role {
        SessionRole::Forward { addr } => {
            let tcp = match TcpStream::connect(&addr).await {
                Ok(tcp) => tcp,
                Err(err) => {
                    warn!(%addr, error = %err, "forward dial failed");
                    let _ = session.send_raw(SERVER_ERROR).await;
                    session.drain().await;
                    session.close().await;
                    return;
                }
            };
            if let Err(err) = handshake::server_handshake(&session).await {
                debug!(error = %err, "handshake failed");
                session.close().await;
                return;
            }
            debug!(%addr, "tunnel established, proxying");
            let (tcp_read, tcp_write) = tcp.into_split();
            pump_bidirectional(session, tcp_read, tcp_write).await;
        }
        SessionRole::Listener { name } => {
            if let Err(err) = handshake::server_handshake(&session).await {
                debug!(error = %err, "handshake failed");
                session.close().await;
                return;
            }
            debug!(%name, "handing tunneled stream to listener");
            let stream = WhetStream::new(session.clone());
            if !server.hand_off(&name, stream) {
                debug!(%name, "listener closed, dropping stream");
                session.close().await;
            }
        }
    }
}

/// Splits `name[-offset]`; more than one `-` or a non-numeric offset is
/// invalid.
fn parse_path_suffix(suffix: &str) -> Result<(String, u16), WhetError> {
    let invalid = || WhetError::Target(suffix.to_owned());
    let mut parts = suffix.split('-');
    let raw_name = parts.next().unwrap_or_default();
    let offset = match parts.next() {
        Some(raw) => raw.parse::<u16>().map_err(|_| invalid())?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(invalid());
    }
    let name = normalize_name(raw_name).ok_or_else(invalid)?;
    Ok((name, offset))
}

fn scheme_of(headers: &HeaderMap) -> &str {
    headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|proto| *proto == "https")
        .unwrap_or("http")
}

fn host_of(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost")
}

fn error_response(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_offset_suffixes() {
        assert_eq!(parse_path_suffix("ssh").unwrap(), ("ssh".into(), 0));
        assert_eq!(parse_path_suffix("range-7").unwrap(), ("range".into(), 7));
        assert_eq!(parse_path_suffix("Range-7").unwrap(), ("range".into(), 7));
    }

    #[test]
    fn rejects_bad_suffixes() {
        assert!(parse_path_suffix("a-b").is_err());
        assert!(parse_path_suffix("a-1-2").is_err());
        assert!(parse_path_suffix("").is_err());
        assert!(parse_path_suffix("-1").is_err());
        assert!(parse_path_suffix("na me").is_err());
    }

    #[tokio::test]
    async fn listener_registration_is_idempotent() {
        let server = WhetServer::new(None, HashMap::new());
        let first = server.add_listener("hello").unwrap();
        let second = server.add_listener("hello").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn listener_name_cannot_shadow_forward_target() {
        let targets = crate::target::parse_forward_targets(&["ssh=localhost:22".into()]).unwrap();
        let server = WhetServer::new(None, targets);
        assert!(server.add_listener("ssh").is_err());
        assert!(server.add_listener("bad-name").is_err());
    }

    #[tokio::test]
    async fn closed_listener_fails_pending_accept() {
        let server = WhetServer::new(None, HashMap::new());
        let listener = server.add_listener("hello").unwrap();
        let accept = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        listener.close();
        let result = accept.await.unwrap();
        assert!(matches!(result, Err(WhetError::Closed)));
    }
}
