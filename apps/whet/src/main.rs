mod cli;
mod client;
mod mirror;
mod serve;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = cli::Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %err, "whet exited with error");
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: cli::Cli) -> anyhow::Result<()> {
    let token = if cli.gentoken {
        let token = Uuid::new_v4().to_string();
        println!("Generated bearer token: {token}");
        Some(token)
    } else {
        cli.token.clone()
    };

    if cli.detached {
        debug!("--detached is implied; data channels always run detached");
    }

    if let Some(addr) = cli.mirror.clone() {
        return mirror::run(&addr).await;
    }
    if cli.serve {
        serve::run(cli, token).await
    } else {
        client::run(cli, token).await
    }
}
