#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use skipper::server::bootstrap;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "skipper", about = "Programmable HTTP reverse proxy")]
struct Cli {
    /// Path to the proxy config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Path to the route definition file
    #[arg(short, long, default_value = "routes.toml")]
    routes: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(bootstrap::run(bootstrap::BootstrapArgs {
        config_path: cli.config,
        routes_path: cli.routes,
    }))
}
