//! Managed Software Update - Preflight Gate
//!
//! Runs before the update client does its main work: refreshes the session
//! token, forwards recent activity logs, refuses unattended runs on metered
//! uplinks unless the server overrides, and converges local configuration.
//! The exit code tells the update client whether to continue.

#![forbid(unsafe_code)]

mod orchestrator;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use msu_common::{
    DigDnsProbe, HostIdentitySource, Invocation, LogConfig, NetworkClassifier, PreflightConfig,
    PreflightError, ProcessCredentialExchange, ProcessReportTransport, SystemInterfaces,
    init_logging,
};
use tracing::{error, info};

use crate::orchestrator::Preflight;

#[derive(Parser)]
#[command(name = "msu-preflight")]
#[command(author, version, about = "Preflight gate for managed software update runs")]
struct Cli {
    /// Invocation mode; `auto` enables network gating, anything else is interactive
    mode: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long, env = "MSU_PREFLIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print a JSON run summary on success
    #[arg(long)]
    json: bool,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(path) = &cli.log_file {
        log_config = log_config.with_file(path);
    }
    let logging_guards = match init_logging(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            // No subscriber is installed, so report straight to stderr.
            let err = PreflightError::from(e);
            eprintln!("msu-preflight: {err}");
            std::process::exit(err.exit_code());
        }
    };

    let config = match PreflightConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            let err = PreflightError::from(e);
            error!(error = %err, exit_code = err.exit_code(), "Preflight not started");
            drop(logging_guards);
            std::process::exit(err.exit_code());
        }
    };

    let invocation = Invocation::from_arg(cli.mode.as_deref());
    let classifier = NetworkClassifier::new(SystemInterfaces::default(), DigDnsProbe::default())
        .with_interfaces(&config.cellular_interface, &config.wifi_interface)
        .with_dns_timeout(config.dns_timeout());
    let preflight = Preflight::new(
        config.clone(),
        ProcessCredentialExchange::new(&config.auth_binary),
        ProcessReportTransport::new(&config.auth_binary),
        classifier,
        HostIdentitySource::new(&config.default_track),
    );

    match preflight.run(&invocation).await {
        Ok(summary) => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            info!("Preflight passed");
            Ok(())
        }
        Err(e) => {
            let code = e.exit_code();
            error!(error = %e, exit_code = code, "Preflight failed");
            // process::exit skips destructors; flush file logs first.
            drop(logging_guards);
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use msu_common::{ExitStatus, RunMode};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_bad_log_filter_exits_usage() {
        let config = LogConfig::from_env("info").with_level("msu_common=notalevel");
        let Err(e) = init_logging(&config) else {
            panic!("invalid filter accepted");
        };
        let err = PreflightError::from(e);
        assert_eq!(err.exit_code(), ExitStatus::Usage.code());
    }

    #[test]
    fn test_mode_positional() {
        let cli = Cli::try_parse_from(["msu-preflight", "auto", "--json"]).unwrap();
        assert_eq!(RunMode::from_arg(cli.mode.as_deref()), RunMode::Auto);
        assert!(cli.json);

        let cli = Cli::try_parse_from(["msu-preflight"]).unwrap();
        assert_eq!(RunMode::from_arg(cli.mode.as_deref()), RunMode::Interactive);

        let cli = Cli::try_parse_from(["msu-preflight", "manualcheck", "-v"]).unwrap();
        let invocation = Invocation::from_arg(cli.mode.as_deref());
        assert_eq!(invocation.mode(), RunMode::Interactive);
        assert_eq!(invocation.runtype(), "manualcheck");
        assert!(cli.verbose);
    }
}
