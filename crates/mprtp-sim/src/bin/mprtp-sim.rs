//! Run a simulated multipath session and print the outcome as JSON.
//!
//! Usage: mprtp-sim [scenario.toml]
//!
//! Without an argument the built-in two-path scenario runs. Log verbosity
//! follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};

use mprtp_sim::ScenarioConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read scenario {path}"))?;
            ScenarioConfig::from_toml_str(&text).with_context(|| format!("in {path}"))?
        }
        None => ScenarioConfig::default(),
    };

    let report = mprtp_sim::run(config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
