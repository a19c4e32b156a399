//! rollctl — operator CLI for the rollgate update engine.
//!
//! Opens the redb update store named in the config and runs one engine
//! operation per invocation, printing the result as JSON.
//!
//! # Usage
//!
//! ```text
//! rollctl --config rollctl.toml apply fleet.toml
//! rollctl check-in --app io.example.os --track stable --instance node-1 --instance-version 1.0.0
//! rollctl event --app os --group prod --instance node-1 --event 3:2
//! rollctl floors --channel stable --from 1.0.0
//! rollctl stats --group prod --window 7d
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rollgate_engine::{
    CheckInRequest, Engine, EventReport, ProgressEvent, StatsWindow,
};
use rollgate_state::StateStore;

mod config;
mod manifest;

use config::RollctlConfig;
use manifest::FleetManifest;

#[derive(Parser)]
#[command(
    name = "rollctl",
    about = "rollgate — update rollout decisions",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to rollctl.toml.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the store path from the config.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or update the catalog described by a fleet manifest.
    Apply {
        manifest: PathBuf,
    },
    /// Run one client check-in and print the response.
    CheckIn {
        /// Application id or product id.
        #[arg(long)]
        app: String,
        /// Track name or group id.
        #[arg(long)]
        track: String,
        #[arg(long)]
        instance: String,
        /// Version the instance currently runs.
        #[arg(long = "instance-version", id = "instance_version")]
        instance_version: String,
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
        #[arg(long, default_value = "")]
        arch: String,
        #[arg(long)]
        alias: Option<String>,
        /// Progress events as TYPE:RESULT, applied before the update check.
        #[arg(long = "event", value_parser = parse_event)]
        events: Vec<ProgressEvent>,
        /// Only register the instance and apply events.
        #[arg(long)]
        no_update_check: bool,
        /// Accept floors and target in one response.
        #[arg(long)]
        multi_manifest: bool,
    },
    /// Report a single progress event.
    Event {
        #[arg(long)]
        app: String,
        #[arg(long)]
        group: String,
        #[arg(long)]
        instance: String,
        /// TYPE:RESULT, e.g. 3:2 for a completed update.
        #[arg(long, value_parser = parse_event)]
        event: ProgressEvent,
        #[arg(long)]
        error_code: Option<String>,
    },
    /// List a channel's floors, or those an instance version must pass.
    Floors {
        #[arg(long)]
        channel: String,
        /// Instance version to compute required floors for.
        #[arg(long)]
        from: Option<String>,
    },
    /// Rollout statistics of a group.
    Stats {
        #[arg(long)]
        group: String,
        /// One of 1h, 1d, 7d, 30d.
        #[arg(long, default_value = "1d")]
        window: StatsWindow,
    },
    /// Status history of an instance.
    History {
        #[arg(long)]
        app: String,
        #[arg(long)]
        instance: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Activity log of an application.
    Activity {
        #[arg(long)]
        app: String,
        /// Unix timestamp; defaults to everything.
        #[arg(long, default_value = "0")]
        since: u64,
    },
}

fn parse_event(s: &str) -> Result<ProgressEvent, String> {
    let (kind, result) = s
        .split_once(':')
        .ok_or_else(|| format!("expected TYPE:RESULT, got {s:?}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .map_err(|e| format!("invalid event code {v:?}: {e}"))
    };
    Ok(ProgressEvent {
        event_type: parse(kind)?,
        event_result: parse(result)?,
        previous_version: None,
        error_code: None,
    })
}

fn init_tracing(config: &RollctlConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(config.log_filter(std::env::var("RUST_LOG").ok()))
        .context("invalid log filter")?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct GroupStats {
    group_id: String,
    window: String,
    instances: rollgate_state::InstancesStatusStats,
    versions: Vec<rollgate_state::VersionBreakdownEntry>,
    rollout: Option<rollgate_state::UpdatesStats>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = RollctlConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store.path = store;
    }
    init_tracing(&config)?;

    if let Some(parent) = config.store.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let store = StateStore::open(&config.store.path)
        .with_context(|| format!("open store {}", config.store.path.display()))?;
    debug!(path = ?config.store.path, "update store opened");

    let timeout = Duration::from_secs(config.engine.request_timeout_secs.max(1));
    let engine = Engine::new(Arc::new(store), config.engine.clone());

    tokio::time::timeout(timeout, run(&engine, cli.command))
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {}s", timeout.as_secs()))?
}

async fn run(engine: &Engine, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Apply { manifest } => {
            let manifest = FleetManifest::from_file(&manifest)?;
            let summary = manifest.apply(engine).await?;
            print_json(&summary)
        }
        Command::CheckIn {
            app,
            track,
            instance,
            instance_version,
            ip,
            arch,
            alias,
            events,
            no_update_check,
            multi_manifest,
        } => {
            let response = engine
                .process_check_in(&CheckInRequest {
                    instance_id: instance,
                    alias,
                    ip,
                    version: instance_version,
                    app_id: app,
                    track,
                    arch,
                    events,
                    update_check: !no_update_check,
                    multi_manifest,
                })
                .await?;
            info!(group = %response.group_id, "check-in processed");
            print_json(&response)
        }
        Command::Event {
            app,
            group,
            instance,
            mut event,
            error_code,
        } => {
            event.error_code = error_code;
            let status = engine
                .register_event(&EventReport {
                    instance_id: instance,
                    app_id: app,
                    group_id: group,
                    event,
                })
                .await?;
            print_json(&serde_json::json!({ "status": status }))
        }
        Command::Floors { channel, from } => match from {
            Some(version) => print_json(&engine.required_floors(&channel, &version).await?),
            None => print_json(&engine.list_channel_floors(&channel).await?),
        },
        Command::Stats { group, window } => {
            let stats = GroupStats {
                instances: engine.group_instances_stats(&group, window).await?,
                versions: engine.group_version_breakdown(&group).await?,
                rollout: engine.group_updates_stats(&group).await?,
                window: window.to_string(),
                group_id: group,
            };
            print_json(&stats)
        }
        Command::History {
            app,
            instance,
            limit,
        } => {
            let record = engine
                .get_instance(&instance, &app)
                .await?
                .with_context(|| format!("unknown instance {instance}"))?;
            let history = engine
                .instance_status_history(&instance, &record.application.application_id, limit)
                .await?;
            print_json(&serde_json::json!({ "instance": record, "history": history }))
        }
        Command::Activity { app, since } => print_json(&engine.list_activity(&app, since).await?),
    }
}
