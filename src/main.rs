#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use torii_gateway::server;

#[derive(Parser)]
#[command(name = "torii-gateway", about = "HTTP API gateway with pluggable request policies")]
struct Cli {
    /// Path to the gateway config file (YAML)
    #[arg(short, long, default_value = "gateway.yaml")]
    config: PathBuf,

    /// Listen address (overrides gateway.port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Admin API listen address (overrides gateway.admin_port)
    #[arg(long)]
    admin_listen: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
