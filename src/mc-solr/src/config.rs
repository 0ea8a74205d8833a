// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Configuration for every component.
//!
//! Each component takes one explicit configuration value whose [`Default`]
//! carries the built-in settings. [`Config::load`] merges an optional TOML
//! file over those defaults; the command line then overrides single fields.
//!
//! The file mirrors the sections of [`Config`]. Durations are given in whole
//! seconds:
//!
//! ```toml
//! [dist]
//! dir = "/opt/mediacloud/dist"
//! solr_version = "6.5.0"
//! install_timeout_secs = 600
//!
//! [cluster]
//! starting_port = 7981
//! jvm_heap_size = "4g"
//!
//! [zookeeper]
//! host = "zk.example.net"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, IoResultExt, Result};

/// Placeholder substituted with the Solr version in download URL templates.
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Full configuration, one section per component.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub dist: DistConfig,
    pub home: HomeConfig,
    pub standalone: StandaloneConfig,
    pub cluster: ClusterConfig,
    pub zookeeper: ZooKeeperConfig,
    pub java: JavaConfig,
}

/// Where and which Solr distribution is installed.
#[derive(Debug, Clone)]
pub struct DistConfig {
    /// Root under which `solr-<version>/` is installed.
    pub dir: PathBuf,
    pub solr_version: String,
    /// Download URL; [`VERSION_PLACEHOLDER`] is replaced with the version.
    pub download_url_template: String,
    /// How long to wait for a concurrent installer to release the lock.
    pub install_timeout: Duration,
    /// How often to check whether the lock was released.
    pub lock_poll_interval: Duration,
}

impl Default for DistConfig {
    fn default() -> Self {
        DistConfig {
            dir: PathBuf::from("dist"),
            solr_version: "6.5.0".into(),
            download_url_template:
                "https://archive.apache.org/dist/lucene/solr/{version}/solr-{version}.tgz".into(),
            install_timeout: Duration::from_secs(5 * 60),
            lock_poll_interval: Duration::from_secs(1),
        }
    }
}

impl DistConfig {
    /// The download URL of the configured version.
    pub fn download_url(&self) -> String {
        self.download_url_template
            .replace(VERSION_PLACEHOLDER, &self.solr_version)
    }
}

/// The shared Solr home and where instance data lives.
#[derive(Debug, Clone)]
pub struct HomeConfig {
    /// Shared Solr home with `collections/`, `solr.xml` and friends.
    pub solr_home: PathBuf,
    /// Parent of every instance data directory.
    pub base_data_dir: PathBuf,
    /// Passed to instances as `-Dmediacloud.luceneMatchVersion`.
    pub lucene_match_version: String,
    /// Context path of Solr's web application.
    pub admin_path: String,
}

impl Default for HomeConfig {
    fn default() -> Self {
        HomeConfig {
            solr_home: PathBuf::from("solr"),
            base_data_dir: PathBuf::from("data"),
            lucene_match_version: "6.5.0".into(),
            admin_path: "/solr".into(),
        }
    }
}

/// A single-instance deployment.
#[derive(Debug, Clone)]
pub struct StandaloneConfig {
    pub port: u16,
    pub jvm_heap_size: Option<String>,
    pub jvm_opts: Vec<String>,
    /// Number of one-per-interval probes while waiting for the port.
    pub connect_retries: u32,
}

impl Default for StandaloneConfig {
    fn default() -> Self {
        StandaloneConfig {
            port: 8983,
            jvm_heap_size: Some("256m".into()),
            jvm_opts: vec!["-XX:+UseG1GC".into()],
            connect_retries: 120,
        }
    }
}

/// A sharded deployment.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Port of shard 1; shard `n` listens on `starting_port + n - 1`.
    pub starting_port: u16,
    pub jvm_heap_size: Option<String>,
    pub jvm_opts: Vec<String>,
    pub connect_retries: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            starting_port: 7981,
            jvm_heap_size: Some("256m".into()),
            jvm_opts: vec!["-XX:+UseG1GC".into()],
            connect_retries: 300,
        }
    }
}

/// The ZooKeeper ensemble shards register with.
#[derive(Debug, Clone)]
pub struct ZooKeeperConfig {
    pub host: String,
    pub port: u16,
    /// Probes while waiting for ZooKeeper before starting a shard.
    pub connect_retries: u32,
}

impl Default for ZooKeeperConfig {
    fn default() -> Self {
        ZooKeeperConfig {
            host: "localhost".into(),
            port: 9983,
            connect_retries: 300,
        }
    }
}

impl ZooKeeperConfig {
    /// `host:port` as passed to `-zkhost` and `-DzkHost`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The Java runtime and process supervision.
#[derive(Debug, Clone)]
pub struct JavaConfig {
    /// The `java` executable.
    pub binary: PathBuf,
    /// Oldest acceptable `java -version`.
    pub min_version: String,
    /// Grace period between SIGTERM and SIGKILL when stopping an instance.
    pub sigkill_timeout: Duration,
    /// Delay between port probes.
    pub retry_interval: Duration,
}

impl Default for JavaConfig {
    fn default() -> Self {
        JavaConfig {
            binary: PathBuf::from("java"),
            min_version: "1.8".into(),
            sigkill_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Builds a configuration from the built-in defaults, overridden by the
    /// TOML file at `path` if one is given.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            None => Ok(Config::default()),
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).with_path("reading configuration file", path)?;
                Config::from_toml(&contents)
            }
        }
    }

    /// Parses `contents` and merges it over the defaults.
    pub fn from_toml(contents: &str) -> Result<Config> {
        let raw: RawConfig = toml::from_str(contents)?;
        let config = Config::from(raw);
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.dist.solr_version.is_empty() {
            return Err(Error::Config("dist.solr_version must not be empty".into()));
        }
        if !self.dist.download_url_template.contains(VERSION_PLACEHOLDER) {
            return Err(Error::Config(format!(
                "dist.download_url_template must contain {VERSION_PLACEHOLDER}"
            )));
        }
        if self.dist.lock_poll_interval.is_zero() {
            return Err(Error::Config("dist.lock_poll_interval_secs must be positive".into()));
        }
        if self.cluster.starting_port == 0 {
            return Err(Error::Config("cluster.starting_port must be positive".into()));
        }
        Ok(())
    }
}

// Raw file representation. Every field is optional; missing fields keep their
// default value.

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    dist: RawDistConfig,
    home: RawHomeConfig,
    standalone: RawInstanceConfig,
    cluster: RawClusterConfig,
    zookeeper: RawZooKeeperConfig,
    java: RawJavaConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawDistConfig {
    dir: Option<PathBuf>,
    solr_version: Option<String>,
    download_url_template: Option<String>,
    #[serde(deserialize_with = "deser_duration_secs_opt")]
    install_timeout_secs: Option<Duration>,
    #[serde(deserialize_with = "deser_duration_secs_opt")]
    lock_poll_interval_secs: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawHomeConfig {
    solr_home: Option<PathBuf>,
    base_data_dir: Option<PathBuf>,
    lucene_match_version: Option<String>,
    admin_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawInstanceConfig {
    port: Option<u16>,
    jvm_heap_size: Option<String>,
    jvm_opts: Option<Vec<String>>,
    connect_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawClusterConfig {
    starting_port: Option<u16>,
    jvm_heap_size: Option<String>,
    jvm_opts: Option<Vec<String>>,
    connect_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawZooKeeperConfig {
    host: Option<String>,
    port: Option<u16>,
    connect_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawJavaConfig {
    binary: Option<PathBuf>,
    min_version: Option<String>,
    #[serde(deserialize_with = "deser_duration_secs_opt")]
    sigkill_timeout_secs: Option<Duration>,
    #[serde(deserialize_with = "deser_duration_secs_opt")]
    retry_interval_secs: Option<Duration>,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Config {
        let Config {
            dist,
            home,
            standalone,
            cluster,
            zookeeper,
            java,
        } = Config::default();
        Config {
            dist: DistConfig {
                dir: raw.dist.dir.unwrap_or(dist.dir),
                solr_version: raw.dist.solr_version.unwrap_or(dist.solr_version),
                download_url_template: raw
                    .dist
                    .download_url_template
                    .unwrap_or(dist.download_url_template),
                install_timeout: raw.dist.install_timeout_secs.unwrap_or(dist.install_timeout),
                lock_poll_interval: raw
                    .dist
                    .lock_poll_interval_secs
                    .unwrap_or(dist.lock_poll_interval),
            },
            home: HomeConfig {
                solr_home: raw.home.solr_home.unwrap_or(home.solr_home),
                base_data_dir: raw.home.base_data_dir.unwrap_or(home.base_data_dir),
                lucene_match_version: raw
                    .home
                    .lucene_match_version
                    .unwrap_or(home.lucene_match_version),
                admin_path: raw.home.admin_path.unwrap_or(home.admin_path),
            },
            standalone: StandaloneConfig {
                port: raw.standalone.port.unwrap_or(standalone.port),
                jvm_heap_size: raw.standalone.jvm_heap_size.or(standalone.jvm_heap_size),
                jvm_opts: raw.standalone.jvm_opts.unwrap_or(standalone.jvm_opts),
                connect_retries: raw
                    .standalone
                    .connect_retries
                    .unwrap_or(standalone.connect_retries),
            },
            cluster: ClusterConfig {
                starting_port: raw.cluster.starting_port.unwrap_or(cluster.starting_port),
                jvm_heap_size: raw.cluster.jvm_heap_size.or(cluster.jvm_heap_size),
                jvm_opts: raw.cluster.jvm_opts.unwrap_or(cluster.jvm_opts),
                connect_retries: raw.cluster.connect_retries.unwrap_or(cluster.connect_retries),
            },
            zookeeper: ZooKeeperConfig {
                host: raw.zookeeper.host.unwrap_or(zookeeper.host),
                port: raw.zookeeper.port.unwrap_or(zookeeper.port),
                connect_retries: raw
                    .zookeeper
                    .connect_retries
                    .unwrap_or(zookeeper.connect_retries),
            },
            java: JavaConfig {
                binary: raw.java.binary.unwrap_or(java.binary),
                min_version: raw.java.min_version.unwrap_or(java.min_version),
                sigkill_timeout: raw.java.sigkill_timeout_secs.unwrap_or(java.sigkill_timeout),
                retry_interval: raw.java.retry_interval_secs.unwrap_or(java.retry_interval),
            },
        }
    }
}

fn deser_duration_secs_opt<'de, D>(deser: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<u64> = Deserialize::deserialize(deser)?;
    Ok(secs.map(Duration::from_secs))
}
