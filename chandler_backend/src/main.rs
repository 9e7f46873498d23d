use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::{debug, info};

use chandler_lib::plugins::core::init_logging;
use chandler_lib::plugins::mixer::PushCallback;
use chandler_lib::utilities::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "chandler", version)]
struct Cli {
	/// TOML configuration file. Defaults to ./chandler.toml if present.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Show file to load and save (.json or .cbor).
	#[arg(long)]
	show: Option<PathBuf>,

	/// Log level used when RUST_LOG is unset.
	#[arg(long)]
	log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let mut config = EngineConfig::load(cli.config.as_deref()).context("Could not load configuration")?;
	if let Some(show) = cli.show {
		config.show_file = Some(show);
	}
	if let Some(level) = cli.log_level {
		config.log_level = level;
	}
	init_logging(&config.log_level);

	let runtime = tokio::runtime::Runtime::new().context("Could not start the tokio runtime")?;
	return runtime.block_on(async move {
		let push: PushCallback = Box::new(|board| {
			if let Ok(status) = board.group_status() {
				match serde_json::to_string(&status) {
					Ok(json) => debug!(target: "chandler::status", "{json}"),
					Err(err) => debug!(error = %err, "Could not serialize status"),
				}
			}
		});
		let engine = chandler_lib::async_main(config, Some(push)).await?;
		info!("Chandler is running, press Ctrl+C to stop");
		tokio::signal::ctrl_c().await.context("Could not listen for Ctrl+C")?;
		info!("Shutting down");
		return engine.shutdown().await;
	});
}
