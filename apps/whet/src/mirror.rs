//! Length-prefixed echo server used by the end-to-end tests: reads a
//! 4-byte little-endian length and that many payload bytes, then writes
//! both back.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub async fn run(addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind mirror server on {addr}"))?;
    info!(%addr, "mirror server listening");

    loop {
        let (mut conn, peer) = listener.accept().await?;
        debug!(%peer, "mirror connection accepted");
        tokio::spawn(async move {
            if let Err(err) = echo(&mut conn).await {
                debug!(%peer, error = %err, "mirror connection ended");
            }
        });
    }
}

async fn echo(conn: &mut TcpStream) -> std::io::Result<()> {
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    conn.read_exact(&mut payload).await?;

    conn.write_all(&len_buf).await?;
    conn.write_all(&payload).await?;
    conn.shutdown().await
}
