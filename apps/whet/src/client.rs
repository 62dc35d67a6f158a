//! Client mode: local TCP listeners, each accepted connection proxied
//! through a fresh tunnel to its named target.

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use whet_core::{parse_listen_targets, proxy_tcp_connection};

use crate::cli::Cli;

pub async fn run(cli: Cli, token: Option<String>) -> anyhow::Result<()> {
    if cli.tcplisten.is_empty() {
        anyhow::bail!("no listener addresses specified");
    }
    let listens = parse_listen_targets(&cli.tcplisten)?;

    let mut accept_loops = Vec::with_capacity(listens.len());
    for listen in listens {
        let local_addr = listen.local_addr();
        let listener = TcpListener::bind(&local_addr)
            .await
            .with_context(|| format!("failed to bind {local_addr}"))?;
        info!(%local_addr, tunnel = %listen.path_suffix(), "listening for tunnel connections");

        let signal_server = cli.server.clone();
        let token = token.clone();
        accept_loops.push(tokio::spawn(async move {
            loop {
                let (conn, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                debug!(%peer, tunnel = %listen.path_suffix(), "accepted connection");
                let signal_server = signal_server.clone();
                let token = token.clone();
                let suffix = listen.path_suffix();
                tokio::spawn(async move {
                    if let Err(err) =
                        proxy_tcp_connection(conn, &signal_server, &suffix, token.as_deref()).await
                    {
                        warn!(error = %err, "tunnel ended with error");
                    }
                });
            }
        }));
    }

    info!("whet client running");
    futures_util::future::join_all(accept_loops).await;
    Ok(())
}
