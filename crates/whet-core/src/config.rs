//! WebRTC engine construction and the tunnel's fixed parameters.

use std::sync::Arc;
use std::time::Duration;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::WhetError;

/// A single data-channel message can safely carry up to 16 KiB, so both the
/// copy buffers and the outgoing chunk size use the same bound.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024;

/// High-water mark for the data channel's buffered amount. Senders gate on
/// this before pushing the next chunk.
pub const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Low-water threshold installed on the channel; crossing it signals the
/// sender that it may continue.
pub const BUFFERED_AMOUNT_LOW: usize = 512 * 1024;

pub const DATA_CHANNEL_LABEL: &str = "data";

pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Bounded wait for the buffered amount to drain before teardown.
pub(crate) const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub(crate) const DRAIN_POLL_LIMIT: u32 = 100;

pub(crate) fn build_api() -> Result<API, WhetError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(WhetError::signaling)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(WhetError::signaling)?;

    let mut setting = SettingEngine::default();
    // The whole engine runs on detached channels: raw byte reads/writes
    // instead of per-message callbacks.
    setting.detach_data_channels();
    // Same-host tunnels (and the loopback test rigs) need loopback host
    // candidates, which the ICE agent excludes by default.
    setting.set_include_loopback_candidate(true);

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// One STUN server, max-bundle, RTCP-mux required. No media is negotiated;
/// bundling keeps the whole session on a single transport.
pub(crate) fn peer_configuration() -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_owned()],
            ..Default::default()
        }],
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub(crate) async fn new_peer_connection() -> Result<Arc<RTCPeerConnection>, WhetError> {
    let api = build_api()?;
    let peer = api
        .new_peer_connection(peer_configuration())
        .await
        .map_err(WhetError::signaling)?;
    Ok(Arc::new(peer))
}

/// Ordered and reliable; no retransmit limit override.
pub(crate) fn data_channel_init() -> RTCDataChannelInit {
    RTCDataChannelInit {
        ordered: Some(true),
        ..Default::default()
    }
}
