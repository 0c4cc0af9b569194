use std::net::SocketAddr;
use std::process;

use anyhow::Context;
use clap::Parser;
use kvrep_replicator::RuntimeConfig;

#[derive(Parser)]
#[command(name = "kvrep-replicator")]
#[command(about = "Replicates secret versions from a key vault to a cross-domain secret store")]
struct ReplicatorArgs {
    /// Override bind address (defaults to REPLICATOR__BIND_ADDRESS or 0.0.0.0:8080)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("replicator exited with error: {err:#}");
        process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    let args = ReplicatorArgs::parse();
    kvrep_replicator::telemetry::init()?;

    let bind = args
        .bind
        .or_else(|| std::env::var("REPLICATOR__BIND_ADDRESS").ok())
        .unwrap_or_else(|| "0.0.0.0:8080".into());
    let http_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;

    kvrep_replicator::run(RuntimeConfig { http_addr }).await
}
