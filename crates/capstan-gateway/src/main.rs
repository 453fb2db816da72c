use capstan_core::CoreConfig;
use capstan_gateway::{start_gateway, GatewaySettings};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "capstan", about = "Capstan workflow execution gateway")]
struct Args {
    #[arg(long, default_value_t = 18990)]
    port: u16,

    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Root directory for the filesystem blob store.
    #[arg(long, default_value = "./capstan-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = CoreConfig::from_env()?;

    start_gateway(GatewaySettings {
        port: args.port,
        bind: args.bind,
        config,
        data_dir: args.data_dir,
        llm: None,
    })
    .await
}
