//! Main entry point for the bridge relay.
//!
//! Watches the source chain for deposits, has them co-signed, submits them
//! to the destination bridge and follows them until they are final. A
//! critical failure stops the process with a non-zero exit code. When
//! enabled, a read-only status API runs alongside the relay.

use clap::Parser;
use relay_config::Config;
use relay_core::RelayError;
use std::path::PathBuf;

mod apis;
mod factory_registry;
mod server;

use factory_registry::build_relay;

/// Command-line arguments for the relay.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, default_value = "config.toml", env = "RELAY_CONFIG")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	let path = args
		.config
		.to_str()
		.ok_or_else(|| format!("Configuration path {:?} is not valid UTF-8", args.config))?;
	let config = Config::from_file(path).await?;
	tracing::info!(relay_id = %config.relay.id, "Loaded configuration");

	let api_config = config.api.clone().filter(|api| api.enabled);
	let relay = build_relay(config.clone()).await?;

	let outcome = match api_config {
		Some(api_config) => {
			let state = server::AppState::new(&config, relay.storage().clone());
			tokio::select! {
				result = relay.run() => result,
				result = server::start_server(api_config, state) => {
					tracing::info!("API server finished");
					result?;
					Ok(())
				},
			}
		},
		None => relay.run().await,
	};

	match outcome {
		Ok(()) => {
			tracing::info!("Stopped relay");
			Ok(())
		},
		Err(RelayError::Critical(e)) => {
			tracing::error!(worker = e.worker, error = %e.message, "Relay halted");
			std::process::exit(1);
		},
		Err(e) => Err(e.into()),
	}
}
