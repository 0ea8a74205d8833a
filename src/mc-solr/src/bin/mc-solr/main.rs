// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Command-line driver for Solr instances and shards.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mc_solr::config::Config;
use mc_solr::net;
use mc_solr::ops::Operations;
use mc_solr::supervisor::StopSignals;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static DEFAULT_LOG_FILTER: &str = "mc_solr=info";

#[derive(Parser, Debug)]
#[clap(name = "mc-solr", next_line_help = true)]
struct Args {
    #[clap(subcommand)]
    command: Command,
    /// TOML file overriding the built-in configuration.
    #[clap(long, env = "MC_SOLR_CONFIG_FILE", global = true)]
    config_file: Option<PathBuf>,
    /// Which log messages to emit, in `tracing-subscriber`'s `EnvFilter`
    /// syntax.
    #[clap(long, env = "MC_SOLR_LOG_FILTER", default_value = DEFAULT_LOG_FILTER, global = true)]
    log_filter: String,
    #[clap(flatten)]
    overrides: Overrides,
}

/// Overrides of single configuration fields, applied on top of the
/// configuration file.
#[derive(clap::Args, Debug)]
struct Overrides {
    /// Root of Solr distribution installs.
    #[clap(long, env = "MC_SOLR_DIST_DIR", global = true)]
    dist_dir: Option<PathBuf>,
    /// Solr version to install and run.
    #[clap(long, env = "MC_SOLR_VERSION", global = true)]
    solr_version: Option<String>,
    /// Shared Solr home with the collection configurations.
    #[clap(long, env = "MC_SOLR_HOME", global = true)]
    solr_home: Option<PathBuf>,
    /// Parent of the instance data directories.
    #[clap(long, env = "MC_SOLR_BASE_DATA_DIR", global = true)]
    base_data_dir: Option<PathBuf>,
    /// Port of the standalone instance.
    #[clap(long, env = "MC_SOLR_STANDALONE_PORT", global = true)]
    standalone_port: Option<u16>,
    /// Port of shard 1; shard N listens on this port plus N - 1.
    #[clap(long, env = "MC_SOLR_STARTING_PORT", global = true)]
    starting_port: Option<u16>,
    #[clap(long, env = "MC_SOLR_ZOOKEEPER_HOST", global = true)]
    zookeeper_host: Option<String>,
    #[clap(long, env = "MC_SOLR_ZOOKEEPER_PORT", global = true)]
    zookeeper_port: Option<u16>,
    /// The `java` executable.
    #[clap(long, env = "MC_SOLR_JAVA", global = true)]
    java: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(dir) = self.dist_dir {
            config.dist.dir = dir;
        }
        if let Some(version) = self.solr_version {
            config.dist.solr_version = version;
        }
        if let Some(home) = self.solr_home {
            config.home.solr_home = home;
        }
        if let Some(dir) = self.base_data_dir {
            config.home.base_data_dir = dir;
        }
        if let Some(port) = self.standalone_port {
            config.standalone.port = port;
        }
        if let Some(port) = self.starting_port {
            config.cluster.starting_port = port;
        }
        if let Some(host) = self.zookeeper_host {
            config.zookeeper.host = host;
        }
        if let Some(port) = self.zookeeper_port {
            config.zookeeper.port = port;
        }
        if let Some(java) = self.java {
            config.java.binary = java;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the Solr distribution if it is not installed yet.
    Install,
    /// Run the standalone instance until terminated.
    RunStandalone {
        /// Hostname the instance advertises. Defaults to this host's fully
        /// qualified name.
        #[clap(long)]
        hostname: Option<String>,
    },
    /// Run one shard of a cluster until terminated.
    RunShard {
        #[clap(long)]
        shard_num: u32,
        #[clap(long)]
        shard_count: u32,
        /// Hostname the shard advertises to ZooKeeper and the other shards.
        /// Defaults to this host's fully qualified name.
        #[clap(long)]
        hostname: Option<String>,
    },
    /// Upload collection configurations to ZooKeeper.
    SyncConfig,
    /// Reload every collection of one shard.
    ReloadShard {
        #[clap(long)]
        shard_num: u32,
        #[clap(long, default_value = net::LOCALHOST)]
        host: String,
    },
    /// Reload every collection of shards 1 through the shard count.
    ReloadAll {
        #[clap(long)]
        shard_count: u32,
        #[clap(long, default_value = net::LOCALHOST)]
        host: String,
    },
    /// Optimize collection indexes.
    Optimize {
        #[clap(long, default_value = net::LOCALHOST)]
        host: String,
        /// Defaults to the standalone port.
        #[clap(long)]
        port: Option<u16>,
        /// Collection to optimize; may be repeated. Defaults to all.
        #[clap(long = "collection", action = clap::ArgAction::Append)]
        collections: Vec<String>,
    },
    /// Upgrade the stopped standalone instance's indexes to the current
    /// Lucene format.
    UpgradeStandaloneIndex,
    /// Upgrade every stopped shard's indexes to the current Lucene format.
    UpgradeShardIndexes,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    let filter = match EnvFilter::try_new(&args.log_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("mc-solr: invalid log filter {:?}: {e}", args.log_filter);
            process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(err) = run(args).await {
        error!("mc-solr: fatal: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    let mut config = Config::load(args.config_file.as_deref()).context("loading configuration")?;
    args.overrides.apply(&mut config);
    config.validate()?;
    let ops = Operations::new(config)?;

    match args.command {
        Command::Install => {
            let dist = ops.install().await?;
            info!(
                "Solr {} is installed at {}.",
                dist.version,
                dist.path().display()
            );
        }
        Command::RunStandalone { hostname } => {
            let signals = stop_on_signal()?;
            ops.run_standalone(hostname, &signals).await?;
        }
        Command::RunShard {
            shard_num,
            shard_count,
            hostname,
        } => {
            let signals = stop_on_signal()?;
            ops.run_shard(shard_num, shard_count, hostname, &signals)
                .await?;
        }
        Command::SyncConfig => ops.sync_config().await?,
        Command::ReloadShard { shard_num, host } => ops.reload_shard(shard_num, &host).await?,
        Command::ReloadAll { shard_count, host } => ops.reload_all(shard_count, &host).await?,
        Command::Optimize {
            host,
            port,
            collections,
        } => ops.optimize(&host, port, collections).await?,
        Command::UpgradeStandaloneIndex => ops.upgrade_standalone_index().await?,
        Command::UpgradeShardIndexes => ops.upgrade_shard_indexes().await?,
    }
    Ok(())
}

/// Stop requests driven by SIGTERM and SIGINT: the first signal stops Solr
/// gracefully, the second kills it.
fn stop_on_signal() -> Result<StopSignals, anyhow::Error> {
    let signals = StopSignals::default();
    let mut sigterm =
        signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let requests = signals.clone();
    tokio::spawn(async move {
        for received in 1u32.. {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            if received == 1 {
                info!("received {name}, stopping Solr");
                requests.stop.cancel();
            } else {
                warn!("received {name} again, killing Solr");
                requests.kill.cancel();
                break;
            }
        }
    });
    Ok(signals)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply_on_top_of_file() {
        let args = Args::try_parse_from([
            "mc-solr",
            "run-shard",
            "--shard-num",
            "2",
            "--shard-count",
            "4",
            "--starting-port",
            "9000",
            "--zookeeper-host",
            "zk.example.net",
        ])
        .unwrap();
        let mut config = Config::from_toml("[cluster]\nstarting_port = 8000\njvm_heap_size = \"4g\"")
            .unwrap();
        args.overrides.apply(&mut config);
        assert_eq!(config.cluster.starting_port, 9000);
        assert_eq!(config.cluster.jvm_heap_size.as_deref(), Some("4g"));
        assert_eq!(config.zookeeper.host, "zk.example.net");
        assert!(matches!(
            args.command,
            Command::RunShard {
                shard_num: 2,
                shard_count: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_repeated_collections() {
        let args = Args::try_parse_from([
            "mc-solr",
            "optimize",
            "--collection",
            "mediacloud",
            "--collection",
            "collection1",
        ])
        .unwrap();
        let Command::Optimize { collections, .. } = args.command else {
            panic!("unexpected command");
        };
        assert_eq!(collections, vec!["mediacloud", "collection1"]);
    }
}
