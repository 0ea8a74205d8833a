// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Installation of the Solr binary distribution.
//!
//! A distribution root may be shared between hosts (e.g. over NFS), so the
//! only synchronization available is the filesystem itself. Two marker files
//! inside `<root>/solr-<version>/` describe the installation:
//!
//! * `.installing` is the install lock. It is created with create-new
//!   semantics; whoever creates it installs, everyone else polls until it is
//!   gone or a timeout elapses.
//! * `.installed` is written after a successful installation, *before* the
//!   lock is released, so there is never a moment where neither exists
//!   during a successful install.
//!
//! A lock left behind by a crashed installer is never removed automatically.
//! Callers fail with [`Error::LockTimeout`] until an operator removes it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::archive;
use crate::config::DistConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::files;
use crate::net;

/// Install lock marker.
pub const INSTALLING_FILE: &str = ".installing";
/// Successful installation marker.
pub const INSTALLED_FILE: &str = ".installed";
/// A file every distribution ships; its absence means the install is broken.
pub const SENTINEL_FILE: &str = "README.txt";
/// Subdirectories that may hold jetty's `start.jar`: Solr 4 used `example`,
/// Solr 5+ uses `server`.
pub const JETTY_HOME_CANDIDATES: &[&str] = &["example", "server"];

/// Installation state derived from the distribution directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Not installed.
    Absent,
    /// Marked as installed, but the distribution's files are missing.
    Corrupt,
    /// Installed and intact.
    Installed,
}

/// One versioned Solr distribution below an install root.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub version: String,
    pub download_url: String,
    /// Absolute install root.
    pub root: PathBuf,
}

impl Distribution {
    /// Describes the distribution `config` asks for.
    ///
    /// The install root must exist.
    pub fn new(config: &DistConfig) -> Result<Distribution> {
        let root = files::absolute(&config.dir)?;
        if !root.is_dir() {
            return Err(Error::MissingPath {
                what: "distribution directory",
                path: root,
            });
        }
        Ok(Distribution {
            version: config.solr_version.clone(),
            download_url: config.download_url(),
            root,
        })
    }

    /// `<root>/solr-<version>`.
    pub fn path(&self) -> PathBuf {
        self.root.join(format!("solr-{}", self.version))
    }

    pub fn installing_marker(&self) -> PathBuf {
        self.path().join(INSTALLING_FILE)
    }

    pub fn installed_marker(&self) -> PathBuf {
        self.path().join(INSTALLED_FILE)
    }

    /// Inspects the distribution directory without modifying it.
    pub fn state(&self) -> InstallState {
        if !self.installed_marker().is_file() {
            InstallState::Absent
        } else if self.path().join(SENTINEL_FILE).is_file() {
            InstallState::Installed
        } else {
            InstallState::Corrupt
        }
    }

    /// Jetty home of the distribution, the directory containing `start.jar`.
    ///
    /// If several candidates qualify, the newest layout wins.
    pub fn jetty_home(&self) -> Result<PathBuf> {
        let path = self.path();
        let found = JETTY_HOME_CANDIDATES
            .iter()
            .rev()
            .map(|candidate| path.join(candidate))
            .find(|candidate| candidate.join("start.jar").exists());
        match found {
            Some(home) => {
                debug!("jetty.home found: {}", home.display());
                Ok(home)
            }
            None => Err(Error::JettyHomeNotFound {
                dist: path,
                candidates: JETTY_HOME_CANDIDATES,
            }),
        }
    }

    /// Solr's expanded web application.
    pub fn webapp_dir(&self) -> Result<PathBuf> {
        Ok(self.jetty_home()?.join("solr-webapp").join("webapp"))
    }
}

/// Downloads distribution archives.
#[async_trait]
pub trait ArchiveFetcher: std::fmt::Debug + Send + Sync {
    /// Stores the archive at `url` in the file `dest`.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Fetches archives over HTTP(S).
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[async_trait]
impl ArchiveFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let http_err = |source: reqwest::Error| Error::Http {
            action: format!("download {url}"),
            source,
        };
        let mut res = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(http_err)?;
        let mut file = fs::File::create(dest)
            .await
            .with_path("creating", dest)?;
        while let Some(chunk) = res.chunk().await.map_err(http_err)? {
            file.write_all(&chunk).await.with_path("writing", dest)?;
        }
        file.flush().await.with_path("writing", dest)?;
        Ok(())
    }
}

/// A held install lock.
///
/// Dropping the lock does *not* release it: an installer that fails halfway
/// leaves the lock behind so that the partial installation is noticed.
#[derive(Debug)]
#[must_use = "the lock stays held until released"]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    /// Creates the lock file at `path`, polling every `poll_interval` while
    /// another process holds it, for at most `timeout`.
    pub async fn acquire(
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<InstallLock> {
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    // Recorded to help operators find the holder of a stale
                    // lock.
                    let holder = format!(
                        "host={} pid={}\n",
                        net::local_hostname(),
                        std::process::id()
                    );
                    file.write_all(holder.as_bytes())
                        .await
                        .with_path("writing lock file", path)?;
                    file.flush().await.with_path("writing lock file", path)?;
                    debug!("acquired lock {}", path.display());
                    return Ok(InstallLock {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    debug!("waiting for lock {} to be released", path.display());
                    tokio::time::sleep(poll_interval).await;
                }
                Err(e) => return Err(e).with_path("creating lock file", path),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file.
    pub async fn release(self) -> Result<()> {
        fs::remove_file(&self.path)
            .await
            .with_path("removing lock file", &self.path)?;
        debug!("released lock {}", self.path.display());
        Ok(())
    }
}

/// Makes sure `dist` is installed, installing it if necessary.
///
/// Safe to call concurrently from several processes or hosts sharing the
/// install root: exactly one of them downloads and extracts the archive,
/// the others wait for it to finish.
pub async fn ensure_installed(
    dist: &Distribution,
    config: &DistConfig,
    fetcher: &dyn ArchiveFetcher,
) -> Result<()> {
    match dist.state() {
        InstallState::Installed => return Ok(()),
        InstallState::Corrupt if !dist.installing_marker().exists() => {
            remove_stale_marker(dist).await?;
        }
        InstallState::Corrupt | InstallState::Absent => {}
    }

    info!("Solr {} is not installed, installing...", dist.version);
    let path = dist.path();
    info!("Creating Solr directory {}...", path.display());
    fs::create_dir_all(&path)
        .await
        .with_path("creating directory", &path)?;

    info!("Locking Solr directory for installation...");
    let lock = InstallLock::acquire(
        &dist.installing_marker(),
        config.install_timeout,
        config.lock_poll_interval,
    )
    .await?;

    match dist.state() {
        InstallState::Installed => {
            info!("Solr got installed to said directory while waiting for it to unlock.");
            return lock.release().await;
        }
        InstallState::Corrupt => remove_stale_marker(dist).await?,
        InstallState::Absent => {}
    }

    let tmp = tempfile::TempDir::new()
        .with_path("creating temporary directory in", &std::env::temp_dir())?;
    let archive_path = tmp.path().join(format!("solr-{}.tgz", dist.version));
    info!("Downloading Solr {} from {}...", dist.version, dist.download_url);
    fetcher.fetch(&dist.download_url, &archive_path).await?;

    info!("Extracting {} to {}...", archive_path.display(), path.display());
    {
        let (archive_path, path) = (archive_path.clone(), path.clone());
        files::blocking(move || archive::extract_tarball(&archive_path, &path, true)).await?;
    }

    expand_webapp(dist).await?;

    info!("Creating 'installed' file...");
    let installed = dist.installed_marker();
    fs::write(&installed, format!("{}\n", dist.version))
        .await
        .with_path("writing", &installed)?;

    info!("Removing lock file...");
    lock.release().await?;

    if dist.state() != InstallState::Installed {
        return Err(Error::InstallIncomplete { path });
    }
    info!("Installed Solr {} to {}.", dist.version, path.display());
    Ok(())
}

async fn remove_stale_marker(dist: &Distribution) -> Result<()> {
    warn!(
        "Solr distribution was not found at path '{}' even though it was supposed to be there.",
        dist.path().display()
    );
    let marker = dist.installed_marker();
    fs::remove_file(&marker).await.with_path("removing", &marker)
}

/// Expands `solr.war` unless the distribution already ships it expanded
/// (Solr 5.5.2+ does). ZkCLI needs the expanded libraries.
async fn expand_webapp(dist: &Distribution) -> Result<()> {
    let jetty_home = dist.jetty_home()?;
    let webapp = jetty_home.join("solr-webapp").join("webapp");
    if webapp.join("index.html").exists() {
        return Ok(());
    }
    let war = jetty_home.join("webapps").join("solr.war");
    if !war.is_file() {
        return Err(Error::MissingPath {
            what: "Solr's .war file",
            path: war,
        });
    }
    info!("Extracting solr.war at '{}' to '{}'...", war.display(), webapp.display());
    files::blocking(move || archive::extract_zip(&war, &webapp)).await
}
