//! Progressive Delivery Controller - operator CLI.
//!
//! Thin client over the daemon's HTTP control API: start, watch, and
//! steer rollouts from a terminal or CI job.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pdc_common::api::{RollbackRequest, RollbackResponse, RolloutAck, StartRolloutRequest};
use pdc_common::types::{RollbackReason, RolloutStatus, RouterStats};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pdc")]
#[command(author, version, about = "Progressive Delivery Controller CLI")]
struct Cli {
    /// Daemon base URL
    #[arg(long, default_value = "http://127.0.0.1:7430", env = "PDC_URL")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a rollout from a TOML definition file
    Start {
        /// Rollout definition: a [config] table and an optional [target] table
        file: PathBuf,
    },
    /// Show the status of a rollout
    Status { name: String },
    /// Halt a rollout's decision loop without changing its phase
    Stop { name: String },
    /// Force an immediate phase advance
    Promote { name: String },
    /// Force an immediate rollback
    Rollback {
        name: String,
        /// Reason recorded with the rollback
        #[arg(long, value_enum, default_value = "manual")]
        reason: ReasonArg,
    },
    /// List rollback targets, most recent first
    History,
    /// Show routing distribution per target
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReasonArg {
    Manual,
    HighErrorRate,
    HighLatency,
    HealthCheckFail,
    CanaryFailed,
}

impl From<ReasonArg> for RollbackReason {
    fn from(arg: ReasonArg) -> Self {
        match arg {
            ReasonArg::Manual => Self::Manual,
            ReasonArg::HighErrorRate => Self::HighErrorRate,
            ReasonArg::HighLatency => Self::HighLatency,
            ReasonArg::HealthCheckFail => Self::HealthCheckFail,
            ReasonArg::CanaryFailed => Self::CanaryFailed,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new(cli.url);

    match cli.command {
        Command::Start { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let request: StartRolloutRequest = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let status: RolloutStatus = client.post_json("/rollouts", &request)?;
            println!(
                "started rollout `{}`: phase {} at {}% canary traffic",
                status.name, status.phase, status.current_weight
            );
        }
        Command::Status { name } => {
            let status: RolloutStatus = client.get_json(&format!("/rollouts/{name}"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Stop { name } => {
            let ack: RolloutAck = client.post_empty(&format!("/rollouts/{name}/stop"))?;
            println!("stopped `{}` at phase {}", ack.name, ack.phase);
        }
        Command::Promote { name } => {
            let ack: RolloutAck = client.post_empty(&format!("/rollouts/{name}/promote"))?;
            println!(
                "promoted `{}` to phase {} ({}% canary traffic)",
                ack.name, ack.phase, ack.weight
            );
        }
        Command::Rollback { name, reason } => {
            let request = RollbackRequest {
                reason: Some(reason.into()),
            };
            let response: RollbackResponse =
                client.post_json(&format!("/rollouts/{name}/rollback"), &request)?;
            println!("rolled `{}` back to {}", name, response.rolled_back_to);
        }
        Command::History => {
            let targets: serde_json::Value = client.get_json("/history")?;
            println!("{}", serde_json::to_string_pretty(&targets)?);
        }
        Command::Stats => {
            let stats: RouterStats = client.get_json("/router/stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

/// Minimal JSON client over the daemon API.
struct Client {
    base_url: String,
}

impl Client {
    fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut response = ureq::get(&url).call().map_err(flatten_error)?;
        response
            .body_mut()
            .read_json::<T>()
            .context("failed to decode daemon response")
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut response = ureq::post(&url).send_json(body).map_err(flatten_error)?;
        response
            .body_mut()
            .read_json::<T>()
            .context("failed to decode daemon response")
    }

    fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.post_json(path, &serde_json::json!({}))
    }
}

/// Turn transport and status errors into operator-readable failures.
fn flatten_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::StatusCode(code) => anyhow::anyhow!("daemon returned HTTP {code}"),
        other => anyhow::Error::new(other).context("request to daemon failed"),
    }
}
