use std::path::PathBuf;

use clap::Parser;

use invoker::config::InvokerConfig;
use invoker::service::InvokerService;
use invoker::tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match cli.config.as_deref().and_then(|p| p.to_str()) {
        Some(path) => InvokerConfig::from_path(path)?,
        None => InvokerConfig::default(),
    };

    setup_tracing(&config)?;

    let service = InvokerService::new(config);
    service.start().await
}
