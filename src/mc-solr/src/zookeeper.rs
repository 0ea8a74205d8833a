// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Uploading collection configuration to ZooKeeper with Solr's ZkCLI.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::info;

use crate::command::{CommandRunner, Invocation};
use crate::config::ZooKeeperConfig;
use crate::dist::Distribution;
use crate::error::{Error, IoResultExt, Result};
use crate::files;
use crate::home::Collection;
use crate::net;

const ZKCLI_CLASS: &str = "org.apache.solr.cloud.ZkCLI";

/// Where ZkCLI's logging configuration lives, relative to jetty home.
/// Solr 4.6 used the first, later versions the second.
const LOG4J_CANDIDATES: &[&str] = &["cloud-scripts", "scripts/cloud-scripts"];

/// A ZkCLI command line bound to one distribution and ZooKeeper ensemble.
#[derive(Debug, Clone)]
pub struct ZkCli {
    java: PathBuf,
    classpath: String,
    log4j_properties: PathBuf,
    zk_host: String,
}

impl ZkCli {
    /// Locates ZkCLI's libraries and logging configuration in `dist`.
    pub fn new(java: &Path, dist: &Distribution, zookeeper: &ZooKeeperConfig) -> Result<ZkCli> {
        let jetty_home = dist.jetty_home()?;
        let candidates: Vec<PathBuf> = LOG4J_CANDIDATES
            .iter()
            .map(|dir| jetty_home.join(dir).join("log4j.properties"))
            .collect();
        let log4j_properties = candidates
            .iter()
            .find(|path| path.is_file())
            .cloned()
            .ok_or_else(|| Error::ZkLog4jNotFound(candidates.clone()))?;

        let classpath = [
            dist.path().join("dist"),
            jetty_home.join("solr-webapp/webapp/WEB-INF/lib"),
            jetty_home.join("lib/ext"),
        ]
        .iter()
        .map(|dir| format!("{}/*", dir.display()))
        .join(":");

        Ok(ZkCli {
            java: java.to_path_buf(),
            classpath,
            log4j_properties,
            zk_host: zookeeper.address(),
        })
    }

    /// ZkCLI invoked with `args`.
    pub fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(&self.java)
            .arg("-classpath")
            .arg(&self.classpath)
            .arg(format!(
                "-Dlog4j.configuration=file://{}",
                self.log4j_properties.display()
            ))
            .arg(ZKCLI_CLASS)
            .arg("-zkhost")
            .arg(&self.zk_host)
            .args(args)
    }
}

/// Uploads and links the configuration of every collection, in order.
///
/// The first failing ZkCLI run aborts the sync.
pub async fn sync(
    zkcli: &ZkCli,
    zookeeper: &ZooKeeperConfig,
    collections: &[Collection],
    runner: &dyn CommandRunner,
) -> Result<()> {
    if !net::tcp_port_is_open(&zookeeper.host, zookeeper.port).await {
        return Err(Error::ZooKeeperUnreachable {
            host: zookeeper.host.clone(),
            port: zookeeper.port,
        });
    }

    info!("Uploading Solr collection configurations to ZooKeeper...");
    for collection in collections {
        let name = collection.name.as_str();
        // ZooKeeper's uploader doesn't follow symlinks.
        info!("Copying collection's '{name}' configuration to a temporary directory...");
        let tmp = tempfile::TempDir::new()
            .with_path("creating temporary directory in", &std::env::temp_dir())?;
        let conf = tmp.path().join(name);
        files::copy_dir_all(&collection.conf_path(), &conf)?;

        info!("Uploading collection's '{name}' configuration at '{}'...", conf.display());
        let confdir = conf.display().to_string();
        runner
            .run(&zkcli.invocation([
                "-cmd", "upconfig", "-confdir", confdir.as_str(), "-confname", name,
            ]))
            .await?;

        info!("Linking collection's '{name}' configuration...");
        runner
            .run(&zkcli.invocation([
                "-cmd", "linkconfig", "-collection", name, "-confname", name,
            ]))
            .await?;
    }
    info!("Uploaded Solr collection configurations to ZooKeeper.");
    Ok(())
}
