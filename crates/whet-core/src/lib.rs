//! WHET connection engine: tunnels TCP byte streams over ordered, reliable
//! WebRTC data channels negotiated through a WHEP-shaped HTTP signaling
//! exchange.
//!
//! The server side registers forward targets (real TCP destinations) or
//! virtual listeners, mounts the signaling router under `/whet/`, and pumps
//! bytes between the data channel and the resolved destination. The client
//! side dials a target by name and gets back either a [`WhetStream`] (a
//! TCP-like async stream) or a fully proxied local TCP connection.

pub mod config;
pub mod dial;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod target;

pub use dial::{dial, dial_with_options, proxy_tcp_connection, DialOptions};
pub use error::WhetError;
pub use handshake::{CLIENT_READY, SERVER_ERROR, SERVER_READY};
pub use listener::WhetListener;
pub use registry::SessionRegistry;
pub use server::WhetServer;
pub use session::Session;
pub use stream::WhetStream;
pub use target::{parse_forward_targets, parse_listen_targets, ForwardTarget, ListenTarget, TargetKind};
