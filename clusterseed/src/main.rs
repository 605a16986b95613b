//! `clusterseed`: bootstrap a single-node Kubernetes cluster.
//!
//! Run with no flags on a freshly provisioned host. Every flag can also be
//! set through the `CLUSTERSEED_*` environment variable named beside it.

use anyhow::Result;
use clap::Parser;
use clusterseed::prelude::*;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};

#[derive(Debug, Parser)]
#[command(name = "clusterseed")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bootstrap a single-node Kubernetes cluster and its add-ons", long_about = None)]
struct Cli {
    /// kubeadm cluster configuration
    #[arg(long, env = "CLUSTERSEED_CLUSTER_CONFIG", default_value = clusterseed::config::DEFAULT_CLUSTER_CONFIG)]
    cluster_config: PathBuf,

    /// Admin kubeconfig written by kubeadm
    #[arg(long, env = "CLUSTERSEED_KUBECONFIG", default_value = clusterseed::config::DEFAULT_KUBECONFIG)]
    kubeconfig: PathBuf,

    /// Manifests applied to the storage namespace before the operator
    #[arg(long, env = "CLUSTERSEED_ROOK_OVERRIDES", default_value = clusterseed::config::DEFAULT_ROOK_OVERRIDES)]
    rook_overrides: PathBuf,

    /// Policy manifests applied last
    #[arg(long, env = "CLUSTERSEED_DEFAULT_POLICIES", default_value = clusterseed::config::DEFAULT_POLICIES)]
    default_policies: PathBuf,

    /// Helm repository cache directory
    #[arg(long, env = "CLUSTERSEED_HELM_CACHE", default_value = clusterseed::config::DEFAULT_HELM_CACHE)]
    helm_cache: PathBuf,

    /// Helm repository config file
    #[arg(long, env = "CLUSTERSEED_HELM_REPOSITORY_CONFIG", default_value = clusterseed::config::DEFAULT_HELM_REPOSITORY_CONFIG)]
    helm_repository_config: PathBuf,

    /// Seconds between control-plane readiness polls
    #[arg(long, env = "CLUSTERSEED_POLL_INTERVAL", default_value_t = clusterseed::config::DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval: u64,

    /// Give up waiting for the control plane after this many polls
    #[arg(long, env = "CLUSTERSEED_READINESS_MAX_ATTEMPTS")]
    readiness_max_attempts: Option<u32>,

    /// Give up waiting for the control plane after this many seconds
    #[arg(long, env = "CLUSTERSEED_READINESS_TIMEOUT")]
    readiness_timeout: Option<u64>,

    /// Use this host address instead of probing the default route
    #[arg(long, env = "CLUSTERSEED_HOST_ADDRESS")]
    host_address: Option<IpAddr>,

    /// Validate and print the stage plan without running it
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, env = "CLUSTERSEED_VERBOSE")]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "CLUSTERSEED_JSON_LOGS")]
    json: bool,
}

impl Cli {
    fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            cluster_config_path: self.cluster_config.clone(),
            kubeconfig_path: self.kubeconfig.clone(),
            rook_overrides_path: self.rook_overrides.clone(),
            default_policies_path: self.default_policies.clone(),
            helm_repository_cache: self.helm_cache.clone(),
            helm_repository_config: self.helm_repository_config.clone(),
            poll_interval_secs: self.poll_interval,
            readiness_max_attempts: self.readiness_max_attempts,
            readiness_timeout_secs: self.readiness_timeout,
            host_address: self.host_address,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json, if cli.verbose { Level::DEBUG } else { Level::INFO });

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", failure_line(&e));
            ExitCode::FAILURE
        }
    }
}

/// Error messages embed their cause; only the outermost one is printed.
fn failure_line(error: &anyhow::Error) -> String {
    error.to_string()
}

async fn run(cli: &Cli) -> Result<()> {
    let config = cli.bootstrap_config();
    config.validate()?;
    let config = Arc::new(config);

    let pipeline = Pipeline::new(bootstrap_pipeline(&config))?;

    if cli.dry_run {
        for (index, stage) in pipeline.spec().stages.iter().enumerate() {
            info!(stage = %stage.name, "{}. {}", index + 1, stage.description);
            for step in &stage.steps {
                info!(stage = %stage.name, "   {}", step.describe());
            }
        }
        return Ok(());
    }

    let cancel = Arc::new(CancellationToken::new());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel("interrupted");
            }
        });
    }

    let ctx = BootstrapContext::new(config.clone(), Collaborators::system(&config))
        .with_cancellation(cancel);

    let report = pipeline.run(&ctx).await?;

    info!(
        stages = report.stages.len(),
        duration = ?report.duration,
        host_address = ?report.host_address.map(|a| a.to_string()),
        "Successfully initialized Kubernetes cluster"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let cli = Cli::try_parse_from(["clusterseed"]).unwrap();
        assert_eq!(cli.bootstrap_config(), BootstrapConfig::default());
    }

    #[test]
    fn test_failure_line_names_stage_and_cause_once() {
        let failure = PipelineError::new(
            "control-plane-init",
            "run `kubeadm init --config /root/clusterconfig.yaml`",
            BootstrapError::Command(CommandError::Failed {
                command: "kubeadm init --config /root/clusterconfig.yaml".to_string(),
                exit_code: Some(1),
                output: "[ERROR Port-6443]: Port 6443 is in use".to_string(),
            }),
        );

        let line = failure_line(&anyhow::Error::from(failure));

        assert!(line.starts_with("Stage 'control-plane-init' failed at"));
        assert_eq!(line.matches("exited with status 1").count(), 1);
    }

    #[test]
    fn test_config_failure_keeps_its_reason() {
        let err = BootstrapConfig::default().with_poll_interval_secs(0).validate().unwrap_err();
        let line = failure_line(&anyhow::Error::from(err));

        assert_eq!(line, "Invalid configuration: poll interval must be at least one second");
    }

    #[test]
    fn test_flags_override_paths() {
        let cli = Cli::try_parse_from([
            "clusterseed",
            "--kubeconfig",
            "/srv/admin.conf",
            "--poll-interval",
            "2",
            "--readiness-max-attempts",
            "30",
            "--host-address",
            "10.0.0.5",
        ])
        .unwrap();
        let config = cli.bootstrap_config();

        assert_eq!(config.kubeconfig_path, PathBuf::from("/srv/admin.conf"));
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.readiness_max_attempts, Some(30));
        assert_eq!(config.host_address, Some("10.0.0.5".parse().unwrap()));
    }
}
