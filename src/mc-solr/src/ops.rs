// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The operations exposed on the command line.
//!
//! Every operation that needs the distribution installs it first, so any
//! host may be the first to run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::cluster::{self, AdminApi, HttpAdminApi, IndexUpgrader};
use crate::command::{CommandRunner, ForegroundRunner, Invocation};
use crate::config::Config;
use crate::dist::{self, ArchiveFetcher, Distribution, HttpFetcher};
use crate::error::{Error, IoResultExt, Result};
use crate::files;
use crate::home::{Collection, SolrHome};
use crate::instance::InstanceSpec;
use crate::java;
use crate::layout;
use crate::net;
use crate::supervisor::{ProcessSupervisor, StopSignals};
use crate::topology::{self, ShardDescriptor};
use crate::zookeeper::{self, ZkCli};

/// Operations over one configuration and the external systems it talks to.
#[derive(Debug, Clone)]
pub struct Operations {
    config: Config,
    /// Directory searched for legacy shards.
    cwd: PathBuf,
    fetcher: Arc<dyn ArchiveFetcher>,
    runner: Arc<dyn CommandRunner>,
    admin: Arc<dyn AdminApi>,
}

impl Operations {
    /// Operations talking to the real world: HTTP downloads, child processes
    /// and Solr's admin API.
    pub fn new(config: Config) -> Result<Operations> {
        let cwd = std::env::current_dir().with_path("resolving", Path::new("."))?;
        let admin = HttpAdminApi::new(&config.home.admin_path)?;
        Ok(Operations::with_seams(
            config,
            cwd,
            Arc::new(HttpFetcher::default()),
            Arc::new(ForegroundRunner),
            Arc::new(admin),
        ))
    }

    pub fn with_seams(
        config: Config,
        cwd: PathBuf,
        fetcher: Arc<dyn ArchiveFetcher>,
        runner: Arc<dyn CommandRunner>,
        admin: Arc<dyn AdminApi>,
    ) -> Operations {
        Operations {
            config,
            cwd,
            fetcher,
            runner,
            admin,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Installs the configured distribution unless it is installed already.
    pub async fn install(&self) -> Result<Distribution> {
        let dist = Distribution::new(&self.config.dist)?;
        dist::ensure_installed(&dist, &self.config.dist, &*self.fetcher).await?;
        Ok(dist)
    }

    fn home(&self) -> Result<SolrHome> {
        SolrHome::open(&self.config.home.solr_home)
    }

    fn collections(&self) -> Result<Vec<Collection>> {
        self.home()?.collections()
    }

    fn base_data_dir(&self) -> Result<PathBuf> {
        let path = files::absolute(&self.config.home.base_data_dir)?;
        if !path.is_dir() {
            return Err(Error::MissingPath {
                what: "Solr data directory",
                path,
            });
        }
        Ok(path)
    }

    /// Runs the standalone instance until a stop is requested.
    ///
    /// A stop requested before Solr is launched ends the run without
    /// launching it.
    pub async fn run_standalone(
        &self,
        hostname: Option<String>,
        signals: &StopSignals,
    ) -> Result<()> {
        let launch = tokio::select! {
            biased;
            _ = signals.stop.cancelled() => {
                info!("Stop requested before Solr was launched.");
                return Ok(());
            }
            launch = self.prepare_standalone(hostname) => launch?,
        };
        self.supervise(launch, signals).await
    }

    async fn prepare_standalone(&self, hostname: Option<String>) -> Result<Launch> {
        let dist = self.install().await?;
        let base_data_dir = self.base_data_dir()?;
        let data_dir = topology::standalone_data_dir(&base_data_dir)?;

        let config = &self.config.standalone;
        if net::tcp_port_is_open(net::LOCALHOST, config.port).await {
            return Err(Error::PortInUse {
                host: net::LOCALHOST.into(),
                port: config.port,
            });
        }

        info!("Starting standalone Solr instance on port {}...", config.port);
        let spec = InstanceSpec {
            hostname: resolve_hostname(hostname).await,
            port: config.port,
            jvm_heap_size: config.jvm_heap_size.clone(),
            jvm_opts: config.jvm_opts.clone(),
            extra_args: vec![],
            connect_retries: config.connect_retries,
        };
        self.prepare_instance(dist, &base_data_dir, data_dir, spec)
            .await
    }

    /// Runs shard `shard_num` of `shard_count` until a stop is requested.
    /// Waits for ZooKeeper to come up first.
    pub async fn run_shard(
        &self,
        shard_num: u32,
        shard_count: u32,
        hostname: Option<String>,
        signals: &StopSignals,
    ) -> Result<()> {
        if shard_num < 1 {
            return Err(Error::InvalidShardNum(shard_num));
        }
        topology::check_shard_count(shard_count)?;

        let launch = tokio::select! {
            biased;
            _ = signals.stop.cancelled() => {
                info!("Stop requested before Solr was launched.");
                return Ok(());
            }
            launch = self.prepare_shard(shard_num, shard_count, hostname) => launch?,
        };
        self.supervise(launch, signals).await
    }

    async fn prepare_shard(
        &self,
        shard_num: u32,
        shard_count: u32,
        hostname: Option<String>,
    ) -> Result<Launch> {
        let dist = self.install().await?;
        let base_data_dir = self.base_data_dir()?;
        let config = &self.config.cluster;
        let shard = ShardDescriptor::new(
            shard_num,
            shard_count,
            config.starting_port,
            &base_data_dir,
        )?;

        let zookeeper = &self.config.zookeeper;
        info!("Waiting for ZooKeeper to start on {}...", zookeeper.address());
        let up = net::wait_for_tcp_port_to_open(
            &zookeeper.host,
            zookeeper.port,
            zookeeper.connect_retries,
            self.config.java.retry_interval,
        )
        .await;
        if !up {
            return Err(Error::ZooKeeperUnreachable {
                host: zookeeper.host.clone(),
                port: zookeeper.port,
            });
        }
        info!("ZooKeeper is up!");

        info!("Starting Solr shard {shard_num} on port {}...", shard.port);
        let spec = InstanceSpec {
            hostname: resolve_hostname(hostname).await,
            port: shard.port,
            jvm_heap_size: config.jvm_heap_size.clone(),
            jvm_opts: config.jvm_opts.clone(),
            extra_args: vec![
                format!("-DzkHost={}", zookeeper.address()),
                format!("-DnumShards={}", shard.shard_count),
            ],
            connect_retries: config.connect_retries,
        };
        self.prepare_instance(dist, &base_data_dir, shard.data_dir, spec)
            .await
    }

    /// Checks the launch preconditions and builds the instance directory.
    async fn prepare_instance(
        &self,
        dist: Distribution,
        base_data_dir: &Path,
        data_dir: PathBuf,
        spec: InstanceSpec,
    ) -> Result<Launch> {
        topology::check_legacy_layout(&self.cwd, base_data_dir)?;
        let java = &self.config.java;
        java::ensure_java_version(&java.binary, &java.min_version).await?;

        let home = self.home()?;
        let layout = files::blocking(move || layout::build(&home, &dist, &data_dir)).await?;
        layout.verify_launchable(&spec.hostname, spec.port).await?;

        info!("Starting Solr instance on {}, port {}...", spec.hostname, spec.port);
        let invocation =
            spec.to_invocation(&java.binary, &layout, &self.config.home.lucene_match_version);
        Ok(Launch { invocation, spec })
    }

    async fn supervise(&self, launch: Launch, signals: &StopSignals) -> Result<()> {
        if signals.stop_requested() {
            info!("Stop requested before Solr was launched.");
            return Ok(());
        }
        let java = &self.config.java;
        let mut supervisor = ProcessSupervisor::new(java.sigkill_timeout, java.retry_interval);
        supervisor
            .run(
                &launch.invocation,
                launch.spec.port,
                launch.spec.connect_retries,
                signals,
            )
            .await
    }

    /// Uploads every collection's configuration to ZooKeeper.
    pub async fn sync_config(&self) -> Result<()> {
        let dist = self.install().await?;
        let zookeeper = &self.config.zookeeper;
        let zkcli = ZkCli::new(&self.config.java.binary, &dist, zookeeper)?;
        let collections = self.collections()?;
        zookeeper::sync(&zkcli, zookeeper, &collections, &*self.runner).await
    }

    pub async fn reload_shard(&self, shard_num: u32, host: &str) -> Result<()> {
        let collections = self.collections()?;
        cluster::reload_shard(
            &*self.admin,
            &collections,
            shard_num,
            host,
            self.config.cluster.starting_port,
        )
        .await
    }

    pub async fn reload_all(&self, shard_count: u32, host: &str) -> Result<()> {
        let collections = self.collections()?;
        cluster::reload_all(
            &*self.admin,
            &collections,
            shard_count,
            host,
            self.config.cluster.starting_port,
        )
        .await
    }

    /// Optimizes `collections`, or every collection if none are given.
    pub async fn optimize(
        &self,
        host: &str,
        port: Option<u16>,
        collections: Vec<String>,
    ) -> Result<()> {
        let collections = if collections.is_empty() {
            self.collections()?.into_iter().map(|c| c.name).collect()
        } else {
            collections
        };
        let port = port.unwrap_or(self.config.standalone.port);
        cluster::optimize(&*self.admin, host, port, &collections).await
    }

    pub async fn upgrade_standalone_index(&self) -> Result<()> {
        let dist = self.install().await?;
        let base_data_dir = self.base_data_dir()?;
        let upgrader = IndexUpgrader::locate(&self.config.java.binary, &dist)?;
        let collections = self.collections()?;
        cluster::upgrade_standalone_index(
            &upgrader,
            &collections,
            &base_data_dir,
            self.config.standalone.port,
            &*self.runner,
        )
        .await
    }

    pub async fn upgrade_shard_indexes(&self) -> Result<()> {
        let dist = self.install().await?;
        let base_data_dir = self.base_data_dir()?;
        let upgrader = IndexUpgrader::locate(&self.config.java.binary, &dist)?;
        let collections = self.collections()?;
        cluster::upgrade_shard_indexes(
            &upgrader,
            &collections,
            &base_data_dir,
            self.config.cluster.starting_port,
            &*self.runner,
        )
        .await
    }
}

/// A prepared instance, ready to be supervised.
struct Launch {
    invocation: Invocation,
    spec: InstanceSpec,
}

async fn resolve_hostname(hostname: Option<String>) -> String {
    match hostname {
        Some(hostname) => hostname,
        None => net::local_fqdn().await,
    }
}
