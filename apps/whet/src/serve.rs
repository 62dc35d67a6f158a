//! Serve mode: the signaling endpoint plus whatever static mounts and
//! reverse proxies the host wants on the same listener.

use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use once_cell::sync::Lazy;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use whet_core::{
    parse_forward_targets,
    server::{cors_layer, health},
    WhetServer,
};

use crate::cli::Cli;

pub async fn run(cli: Cli, token: Option<String>) -> anyhow::Result<()> {
    if cli.tcptarget.is_empty() && cli.servefolder.is_empty() && cli.proxytarget.is_empty() {
        anyhow::bail!("no server targets specified");
    }
    let targets = parse_forward_targets(&cli.tcptarget)?;
    for target in targets.values() {
        info!(spec = %target, "forward target registered");
    }
    let server = WhetServer::new(token, targets);

    // The signaling routes already carry the CORS layer; give health the
    // same policy without double-wrapping them.
    let health_routes = Router::new()
        .route("/health", get(health))
        .layer(cors_layer());
    let mut app = server.router().merge(health_routes);
    for spec in &cli.servefolder {
        let (subdomain, path) = split_mount(spec)?;
        info!(subdomain, path, "serving static folder");
        app = app.nest_service(&format!("/{subdomain}"), ServeDir::new(path));
    }
    for spec in &cli.proxytarget {
        let (subdomain, addr) = split_mount(spec)?;
        info!(subdomain, addr, "reverse proxying");
        let proxy = Router::new()
            .route(&format!("/{subdomain}/*path"), any(proxy_handler))
            .with_state(ProxyTarget {
                addr: addr.to_owned(),
            });
        app = app.merge(proxy);
    }
    let app = app.layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&cli.server)
        .await
        .with_context(|| format!("failed to bind {}", cli.server))?;
    info!(addr = %cli.server, "whet signaling server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Every remaining session passes through the Closing path.
    server.shutdown().await;
    Ok(())
}

fn split_mount(spec: &str) -> anyhow::Result<(&str, &str)> {
    let (subdomain, value) = spec
        .split_once('=')
        .with_context(|| format!("invalid mount spec {spec:?} (expected subdomain=value)"))?;
    let subdomain = subdomain.trim_matches('/');
    if subdomain.is_empty() || value.is_empty() {
        anyhow::bail!("invalid mount spec {spec:?} (expected subdomain=value)");
    }
    Ok((subdomain, value))
}

#[derive(Clone)]
struct ProxyTarget {
    addr: String,
}

static PROXY_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Pass-through proxy: the mount's first path segment is stripped and the
/// remainder forwarded to the target address.
async fn proxy_handler(
    State(target): State<ProxyTarget>,
    method: Method,
    RawQuery(query): RawQuery,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut url = format!("http://{}/{}", target.addr, path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(&query);
    }

    let mut request = PROXY_CLIENT.request(method, &url).body(body);
    for (name, value) in headers.iter() {
        if name == header::HOST {
            continue;
        }
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let mut response_headers = HeaderMap::new();
            for (name, value) in upstream.headers() {
                // The body is buffered below; framing headers no longer apply.
                if name == header::TRANSFER_ENCODING || name == header::CONTENT_LENGTH {
                    continue;
                }
                response_headers.insert(name.clone(), value.clone());
            }
            match upstream.bytes().await {
                Ok(bytes) => (status, response_headers, bytes).into_response(),
                Err(err) => {
                    warn!(%url, error = %err, "failed to read upstream response");
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
        Err(err) => {
            warn!(%url, error = %err, "upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
