// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Error types for Solr instance and cluster operations.
//!
//! Every failure is fatal to the operation that raised it. Variants are
//! grouped by the kind of problem they describe:
//!
//! ```text
//! Error
//!   ├── precondition      missing paths, ports, hostnames, ZooKeeper, Java
//!   ├── concurrency       install lock timeout
//!   ├── external process  child exit, startup timeout, tool failure, HTTP
//!   ├── integrity         broken install, symlink conflicts, library lookup
//!   └── legacy layout     carries a ready-to-run migration plan
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::topology::MigrationPlan;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure of an installation, layout, supervision or cluster operation.
#[derive(Debug, Error)]
pub enum Error {
    /// A directory or file the operation depends on does not exist.
    #[error("{what} '{}' does not exist", path.display())]
    MissingPath {
        /// What the path was expected to be.
        what: &'static str,
        /// The missing path.
        path: PathBuf,
    },

    /// A collection directory without a `conf` subdirectory.
    #[error("configuration for collection '{name}' does not exist at '{}'", path.display())]
    MissingCollectionConf {
        /// The collection name.
        name: String,
        /// The expected configuration directory.
        path: PathBuf,
    },

    /// Shard numbers start at 1.
    #[error("shard number must be 1 or greater (got {0})")]
    InvalidShardNum(u32),

    /// Shard counts start at 1.
    #[error("shard count must be 1 or greater (got {0})")]
    InvalidShardCount(u32),

    /// The derived shard port does not fit into a TCP port.
    #[error("shard {shard_num} with starting port {starting_port} exceeds the port range")]
    PortOutOfRange {
        /// The shard number.
        shard_num: u32,
        /// The configured first shard port.
        starting_port: u16,
    },

    /// Something is already listening where an instance is about to bind.
    #[error("port {port} is already open on {host}")]
    PortInUse {
        /// The probed host.
        host: String,
        /// The probed port.
        port: u16,
    },

    /// An operation needs a running instance but nothing listens on its port.
    #[error("{what} is not running on {host}:{port}")]
    NotRunning {
        /// Human-readable name of the instance.
        what: String,
        /// The probed host.
        host: String,
        /// The probed port.
        port: u16,
    },

    /// An offline operation found its instance still running.
    #[error("{what} is running on {host}:{port}")]
    StillRunning {
        /// Human-readable name of the instance.
        what: String,
        /// The probed host.
        host: String,
        /// The probed port.
        port: u16,
    },

    /// The hostname an instance advertises does not resolve.
    #[error("hostname '{0}' does not resolve")]
    Unresolvable(String),

    /// ZooKeeper does not accept connections.
    #[error("ZooKeeper is not running at {host}:{port}")]
    ZooKeeperUnreachable {
        /// ZooKeeper host.
        host: String,
        /// ZooKeeper port.
        port: u16,
    },

    /// The installed Java runtime is older than required.
    #[error("Java is too old (expected: {expected}, actual: {actual})")]
    JavaTooOld {
        /// Minimum version.
        expected: String,
        /// Version reported by `java -version`.
        actual: String,
    },

    /// `java -version` could not be run or understood.
    #[error("unable to determine Java version: {0}")]
    JavaVersion(String),

    /// Shard index upgrades need a multi-shard layout.
    #[error("found {found} shard(s) in '{}', expected at least 2", dir.display())]
    TooFewShards {
        /// Number of consecutive shard directories found.
        found: u32,
        /// The base data directory that was scanned.
        dir: PathBuf,
    },

    /// No jetty home candidate of the distribution contains `start.jar`.
    #[error("unable to locate jetty home among {candidates:?} in '{}'", dist.display())]
    JettyHomeNotFound {
        /// Distribution directory.
        dist: PathBuf,
        /// Candidate subdirectories that were checked.
        candidates: &'static [&'static str],
    },

    /// None of the known locations of ZkCLI's logging configuration exist.
    #[error("unable to find log4j.properties for ZkCLI in {0:?}")]
    ZkLog4jNotFound(Vec<PathBuf>),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("unable to parse configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    /// Another installer holds the install lock for longer than allowed.
    ///
    /// The lock file is left in place. If no installer is running, the lock
    /// was left behind by a crashed installer and must be removed by hand.
    #[error(
        "timed out after {} waiting for install lock '{}'; \
         remove it if no other installer is running",
        humantime::format_duration(*timeout),
        path.display()
    )]
    LockTimeout {
        /// The lock file.
        path: PathBuf,
        /// How long we waited.
        timeout: Duration,
    },

    /// The supervised process exited on its own.
    #[error("Solr (PID {pid}) exited unexpectedly: {status}")]
    ChildExited {
        /// PID of the child.
        pid: u32,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// The supervised process never opened its port.
    #[error("Solr (PID {pid}) did not open port {port} after {retries} attempts")]
    StartupTimeout {
        /// PID of the child.
        pid: u32,
        /// The port that was probed.
        port: u16,
        /// Number of probes.
        retries: u32,
    },

    /// An external tool exited unsuccessfully.
    #[error("command `{command}` failed: {status}")]
    CommandFailed {
        /// The shell-quoted command line.
        command: String,
        /// Exit status as reported by the OS.
        status: String,
    },

    /// An HTTP request failed.
    #[error("unable to {action}: {source}")]
    Http {
        /// What the request was supposed to do.
        action: String,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The install post-condition did not hold.
    #[error("installed everything but Solr is still not installed at '{}'", path.display())]
    InstallIncomplete {
        /// The distribution directory.
        path: PathBuf,
    },

    /// A non-symlink occupies a path this tool manages as a symlink.
    #[error("'{}' exists but is not a symlink", path.display())]
    SymlinkConflict {
        /// The conflicting path.
        path: PathBuf,
    },

    /// A library lookup matched zero or several files.
    #[error("expected exactly one '{pattern}' in '{}', found {found}", dir.display())]
    LibraryMatch {
        /// The file name pattern.
        pattern: String,
        /// The searched directory.
        dir: PathBuf,
        /// Number of matches.
        found: usize,
    },

    /// A `mediacloud-shard-*` directory with an unparseable name.
    #[error("unable to parse shard number of legacy shard directory '{0}'")]
    LegacyShardName(String),

    /// A legacy shard without collections.
    #[error("no collections found in legacy shard {0}")]
    LegacyShardEmpty(u32),

    /// A migration target already holds data.
    #[error("destination data directory '{}' already exists", path.display())]
    DestinationExists {
        /// The existing destination.
        path: PathBuf,
    },

    /// Pre-resharding shard directories were found.
    #[error("{0}")]
    LegacyLayout(MigrationPlan),

    /// An I/O operation on a specific path failed.
    #[error("{action} '{}': {source}", path.display())]
    Io {
        /// What we were doing.
        action: &'static str,
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A zip archive could not be read.
    #[error("unable to extract '{}': {source}", path.display())]
    Zip {
        /// The archive.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: zip::result::ZipError,
    },
}

/// Attaches the path being operated on to I/O errors.
pub trait IoResultExt<T> {
    /// Converts an [`io::Error`] into [`Error::Io`] naming `action` and `path`.
    fn with_path(self, action: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn with_path(self, action: &'static str, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            action,
            path: path.to_path_buf(),
            source,
        })
    }
}
