// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Operations spanning running or stopped instances: core reloads, index
//! optimization and offline index format upgrades.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::command::{CommandRunner, Invocation};
use crate::dist::Distribution;
use crate::error::{Error, Result};
use crate::home::Collection;
use crate::net;
use crate::topology;

/// Upper bound for a single admin request. Optimizing a large index takes a
/// while.
const ADMIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const INDEX_UPGRADER_CLASS: &str = "org.apache.lucene.index.IndexUpgrader";

/// Solr's HTTP admin endpoints.
#[async_trait]
pub trait AdminApi: Debug + Send + Sync {
    /// Reloads core `core` of the instance at `host:port`.
    async fn reload_core(&self, host: &str, port: u16, core: &str) -> Result<()>;
    /// Optimizes the index of `collection` through the instance at
    /// `host:port`.
    async fn optimize(&self, host: &str, port: u16, collection: &str) -> Result<()>;
}

/// [`AdminApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAdminApi {
    client: reqwest::Client,
    /// Context path of the web application, e.g. `/solr`.
    admin_path: String,
}

impl HttpAdminApi {
    pub fn new(admin_path: &str) -> Result<HttpAdminApi> {
        let client = reqwest::Client::builder()
            .timeout(ADMIN_REQUEST_TIMEOUT)
            .build()
            .map_err(|source| Error::Http {
                action: "build HTTP client".into(),
                source,
            })?;
        Ok(HttpAdminApi {
            client,
            admin_path: admin_path.trim_end_matches('/').into(),
        })
    }

    fn base_url(&self, host: &str, port: u16) -> String {
        format!("http://{host}:{port}{}", self.admin_path)
    }

    pub fn reload_url(&self, host: &str, port: u16, core: &str) -> String {
        format!(
            "{}/admin/cores?action=RELOAD&core={core}",
            self.base_url(host, port)
        )
    }

    pub fn optimize_url(&self, host: &str, port: u16, collection: &str) -> String {
        format!("{}/{collection}/update?optimize=true", self.base_url(host, port))
    }

    async fn get(&self, url: &str, action: String) -> Result<()> {
        debug!("Requesting URL {url}...");
        self.client
            .get(url)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map(|_| ())
            .map_err(|source| Error::Http { action, source })
    }
}

#[async_trait]
impl AdminApi for HttpAdminApi {
    async fn reload_core(&self, host: &str, port: u16, core: &str) -> Result<()> {
        let url = self.reload_url(host, port, core);
        self.get(&url, format!("reload core '{core}' on {host}:{port}"))
            .await
    }

    async fn optimize(&self, host: &str, port: u16, collection: &str) -> Result<()> {
        let url = self.optimize_url(host, port, collection);
        self.get(
            &url,
            format!("optimize collection '{collection}' index on {host}:{port}"),
        )
        .await
    }
}

async fn ensure_running(what: impl Into<String>, host: &str, port: u16) -> Result<()> {
    if !net::tcp_port_is_open(host, port).await {
        return Err(Error::NotRunning {
            what: what.into(),
            host: host.into(),
            port,
        });
    }
    Ok(())
}

async fn ensure_stopped(what: impl Into<String>, port: u16) -> Result<()> {
    if net::tcp_port_is_open(net::LOCALHOST, port).await {
        return Err(Error::StillRunning {
            what: what.into(),
            host: net::LOCALHOST.into(),
            port,
        });
    }
    Ok(())
}

/// Reloads every collection on shard `shard_num`, for example after its
/// configuration changed in ZooKeeper.
pub async fn reload_shard(
    api: &dyn AdminApi,
    collections: &[Collection],
    shard_num: u32,
    host: &str,
    starting_port: u16,
) -> Result<()> {
    let port = topology::shard_port(shard_num, starting_port)?;
    ensure_running(format!("shard {shard_num}"), host, port).await?;

    info!("Reloading shard {shard_num} on {host}:{port}...");
    for collection in collections {
        info!(
            "Reloading collection '{}' on shard {shard_num} on {host}:{port}...",
            collection.name
        );
        api.reload_core(host, port, &collection.name).await?;
    }
    info!("Reloaded shard {shard_num} on {host}:{port}.");
    Ok(())
}

/// Reloads shards `1..=shard_count` in order, stopping at the first failure.
pub async fn reload_all(
    api: &dyn AdminApi,
    collections: &[Collection],
    shard_count: u32,
    host: &str,
    starting_port: u16,
) -> Result<()> {
    topology::check_shard_count(shard_count)?;
    info!("Reloading {shard_count} shards on {host}...");
    for shard_num in 1..=shard_count {
        reload_shard(api, collections, shard_num, host, starting_port).await?;
    }
    info!("Reloaded {shard_count} shards on {host}.");
    Ok(())
}

/// Optimizes the indexes of `collections`, in name order.
///
/// In a cluster, optimizing through one shard optimizes all of them.
pub async fn optimize(
    api: &dyn AdminApi,
    host: &str,
    port: u16,
    collections: &[String],
) -> Result<()> {
    let mut collections = collections.to_vec();
    collections.sort();
    debug!("Solr collections to optimize: {}", collections.join(", "));
    ensure_running("Solr", host, port).await?;

    info!("Optimizing indexes on {host}:{port}...");
    for collection in &collections {
        info!("Optimizing collection's '{collection}' index on {host}:{port}...");
        api.optimize(host, port, collection).await?;
    }
    info!("Optimized indexes on {host}:{port}.");
    Ok(())
}

/// Lucene's IndexUpgrader as shipped with a distribution.
#[derive(Debug, Clone)]
pub struct IndexUpgrader {
    java: PathBuf,
    core_jar: PathBuf,
    backward_codecs_jar: PathBuf,
}

impl IndexUpgrader {
    /// Finds the Lucene libraries in `dist`.
    pub fn locate(java: &Path, dist: &Distribution) -> Result<IndexUpgrader> {
        let lib = dist.path().join("server/solr-webapp/webapp/WEB-INF/lib");
        if !lib.is_dir() {
            return Err(Error::MissingPath {
                what: "Lucene library directory",
                path: lib,
            });
        }
        Ok(IndexUpgrader {
            java: java.to_path_buf(),
            core_jar: find_one_library(&lib, "lucene-core-")?,
            backward_codecs_jar: find_one_library(&lib, "lucene-backward-codecs-")?,
        })
    }

    /// IndexUpgrader invoked on the index at `index`.
    pub fn invocation(&self, index: &Path) -> Invocation {
        Invocation::new(&self.java)
            .arg("-cp")
            .arg(format!(
                "{}:{}",
                self.core_jar.display(),
                self.backward_codecs_jar.display()
            ))
            .arg(INDEX_UPGRADER_CLASS)
            .arg("-verbose")
            .arg(index.display().to_string())
    }
}

/// The single `<prefix>*.jar` in `dir`.
fn find_one_library(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let pattern = format!(
        "{}/{}*.jar",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(prefix)
    );
    let paths = glob::glob(&pattern).map_err(|e| Error::Config(format!("{pattern}: {e}")))?;
    let mut found = vec![];
    for path in paths {
        let path = path.map_err(|e| Error::Io {
            action: "reading directory",
            path: e.path().to_path_buf(),
            source: e.into_error(),
        })?;
        found.push(path);
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        n => Err(Error::LibraryMatch {
            pattern: format!("{prefix}*.jar"),
            dir: dir.to_path_buf(),
            found: n,
        }),
    }
}

/// Upgrades the index of every collection in the stopped instance at
/// `data_dir`.
///
/// Callers make sure the instance is not running.
pub async fn upgrade_index(
    upgrader: &IndexUpgrader,
    collections: &[Collection],
    data_dir: &Path,
    runner: &dyn CommandRunner,
) -> Result<()> {
    if !data_dir.is_dir() {
        return Err(Error::MissingPath {
            what: "instance data directory",
            path: data_dir.to_path_buf(),
        });
    }
    for collection in collections {
        let collection_dir = data_dir.join(&collection.name);
        if !collection_dir.is_dir() {
            return Err(Error::MissingPath {
                what: "collection data directory",
                path: collection_dir,
            });
        }
        let index = collection_dir.join("data").join("index");
        if !index.is_dir() {
            return Err(Error::MissingPath {
                what: "index directory",
                path: index,
            });
        }
        info!("Upgrading index at path '{}'...", index.display());
        runner.run(&upgrader.invocation(&index)).await?;
        info!("Upgraded index at path '{}'.", index.display());
    }
    Ok(())
}

/// Upgrades the standalone instance's indexes. The instance listening on
/// `port` must be stopped.
pub async fn upgrade_standalone_index(
    upgrader: &IndexUpgrader,
    collections: &[Collection],
    base_data_dir: &Path,
    port: u16,
    runner: &dyn CommandRunner,
) -> Result<()> {
    info!("Making sure standalone instance isn't running...");
    ensure_stopped("Solr standalone instance", port).await?;

    info!("Upgrading standalone instance indexes...");
    let data_dir = topology::standalone_data_dir(base_data_dir)?;
    upgrade_index(upgrader, collections, &data_dir, runner).await?;
    info!("Upgraded standalone instance indexes.");
    Ok(())
}

/// Upgrades the indexes of every shard found in `base_data_dir`. At least
/// two shards must exist and all of them must be stopped.
pub async fn upgrade_shard_indexes(
    upgrader: &IndexUpgrader,
    collections: &[Collection],
    base_data_dir: &Path,
    starting_port: u16,
    runner: &dyn CommandRunner,
) -> Result<()> {
    info!("Looking for shards...");
    let shard_count = topology::discover_shard_count(base_data_dir)?;
    if shard_count < 2 {
        return Err(Error::TooFewShards {
            found: shard_count,
            dir: base_data_dir.to_path_buf(),
        });
    }
    info!("Found {shard_count} shards.");

    info!("Making sure shards aren't running...");
    for shard_num in 1..=shard_count {
        let port = topology::shard_port(shard_num, starting_port)?;
        ensure_stopped(format!("Solr shard {shard_num}"), port).await?;
    }

    info!("Upgrading shard indexes...");
    for shard_num in 1..=shard_count {
        let data_dir = topology::shard_data_dir(shard_num, base_data_dir)?;
        upgrade_index(upgrader, collections, &data_dir, runner).await?;
    }
    info!("Upgraded shard indexes.");
    Ok(())
}


#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::http::{StatusCode, Uri};
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::testing::RecordingAdmin;
    use super::*;
    use crate::command::testing::RecordingRunner;
    use crate::dist::testing::create_distribution;

    fn collections(names: &[&str]) -> Vec<Collection> {
        names
            .iter()
            .map(|name| Collection {
                name: name.to_string(),
                path: PathBuf::from("/srv/solr/collections").join(name),
            })
            .collect()
    }

    /// Binds `n` listeners on consecutive ports.
    async fn consecutive_listeners(n: u16) -> Vec<TcpListener> {
        'attempt: for _ in 0..100 {
            let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let start = first.local_addr().unwrap().port();
            let mut listeners = vec![first];
            for i in 1..n {
                let Some(port) = start.checked_add(i) else {
                    continue 'attempt;
                };
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => listeners.push(listener),
                    Err(_) => continue 'attempt,
                }
            }
            return listeners;
        }
        panic!("unable to bind {n} consecutive ports");
    }

    #[tokio::test]
    async fn test_reload_all_visits_shards_in_order() {
        let listeners = consecutive_listeners(2).await;
        let starting_port = listeners[0].local_addr().unwrap().port();
        let admin = RecordingAdmin::default();
        let collections = collections(&["collection1", "mediacloud"]);

        reload_all(&admin, &collections, 2, "127.0.0.1", starting_port)
            .await
            .unwrap();
        let p1 = starting_port;
        let p2 = starting_port + 1;
        assert_eq!(
            admin.calls(),
            vec![
                ("reload", p1, "collection1".to_string()),
                ("reload", p1, "mediacloud".to_string()),
                ("reload", p2, "collection1".to_string()),
                ("reload", p2, "mediacloud".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_reload_all_stops_at_first_closed_shard() {
        let mut listeners = consecutive_listeners(2).await;
        let starting_port = listeners[0].local_addr().unwrap().port();
        drop(listeners.pop());
        let admin = RecordingAdmin::default();

        let err = reload_all(&admin, &collections(&["collection1"]), 3, "127.0.0.1", starting_port)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::NotRunning { port, .. } if *port == starting_port + 1),
            "{err}"
        );
        assert_eq!(admin.calls().len(), 1);

        drop(listeners);
        let admin = RecordingAdmin::default();
        let err = reload_all(&admin, &collections(&["collection1"]), 2, "127.0.0.1", starting_port)
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::NotRunning { port, .. } if *port == starting_port),
            "{err}"
        );
        assert!(admin.calls().is_empty());

        assert!(matches!(
            reload_all(&admin, &[], 0, "127.0.0.1", starting_port).await,
            Err(Error::InvalidShardCount(0))
        ));
    }

    #[tokio::test]
    async fn test_optimize_sorts_collections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let admin = RecordingAdmin::default();
        optimize(
            &admin,
            "127.0.0.1",
            port,
            &["mediacloud".into(), "collection1".into()],
        )
        .await
        .unwrap();
        assert_eq!(
            admin.calls(),
            vec![
                ("optimize", port, "collection1".to_string()),
                ("optimize", port, "mediacloud".to_string()),
            ]
        );

        drop(listener);
        let err = optimize(&admin, "127.0.0.1", port, &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotRunning { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_http_admin_urls() {
        let seen = Arc::new(Mutex::new(vec![]));
        let app = {
            let seen = Arc::clone(&seen);
            Router::new().fallback(move |uri: Uri| {
                let seen = Arc::clone(&seen);
                async move {
                    let broken = uri.to_string().contains("broken");
                    seen.lock().unwrap().push(uri.to_string());
                    if broken {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            })
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let api = HttpAdminApi::new("/solr").unwrap();
        api.reload_core("127.0.0.1", port, "collection1")
            .await
            .unwrap();
        api.optimize("127.0.0.1", port, "collection1").await.unwrap();
        let err = api
            .reload_core("127.0.0.1", port, "broken")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http { .. }), "{err}");
        let err = api.optimize("127.0.0.1", port, "broken").await.unwrap_err();
        assert!(matches!(err, Error::Http { .. }), "{err}");

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "/solr/admin/cores?action=RELOAD&core=collection1".to_string(),
                "/solr/collection1/update?optimize=true".to_string(),
                "/solr/admin/cores?action=RELOAD&core=broken".to_string(),
                "/solr/broken/update?optimize=true".to_string(),
            ]
        );
    }

    struct UpgradeFixture {
        tmp: TempDir,
        dist: Distribution,
        base_data_dir: PathBuf,
    }

    fn upgrade_fixture() -> UpgradeFixture {
        let tmp = TempDir::new().unwrap();
        let dist = create_distribution(tmp.path());
        let base_data_dir = tmp.path().join("data");
        fs::create_dir(&base_data_dir).unwrap();
        UpgradeFixture {
            tmp,
            dist,
            base_data_dir,
        }
    }

    fn create_index(data_dir: &Path, collections: &[&str]) {
        for name in collections {
            fs::create_dir_all(data_dir.join(name).join("data/index")).unwrap();
        }
    }

    #[tokio::test]
    async fn test_upgrade_shard_indexes() {
        let f = upgrade_fixture();
        for shard in ["mediacloud-cluster-shard-1", "mediacloud-cluster-shard-2"] {
            create_index(&f.base_data_dir.join(shard), &["collection1", "mediacloud"]);
        }
        let upgrader = IndexUpgrader::locate(Path::new("java"), &f.dist).unwrap();
        let runner = RecordingRunner::default();
        let starting_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        upgrade_shard_indexes(
            &upgrader,
            &collections(&["collection1", "mediacloud"]),
            &f.base_data_dir,
            starting_port,
            &runner,
        )
        .await
        .unwrap();

        let recorded = runner.recorded();
        assert_eq!(recorded.len(), 4);
        let lib = f.dist.path().join("server/solr-webapp/webapp/WEB-INF/lib");
        assert_eq!(
            recorded[0].args,
            vec![
                "-cp".to_string(),
                format!(
                    "{}:{}",
                    lib.join("lucene-core-6.5.0.jar").display(),
                    lib.join("lucene-backward-codecs-6.5.0.jar").display()
                ),
                INDEX_UPGRADER_CLASS.to_string(),
                "-verbose".to_string(),
                f.base_data_dir
                    .join("mediacloud-cluster-shard-1/collection1/data/index")
                    .display()
                    .to_string(),
            ]
        );
        assert!(recorded[3].args[4].ends_with("mediacloud-cluster-shard-2/mediacloud/data/index"));
    }

    #[tokio::test]
    async fn test_upgrade_needs_two_shards() {
        let f = upgrade_fixture();
        create_index(&f.base_data_dir.join("mediacloud-cluster-shard-1"), &["collection1"]);
        let upgrader = IndexUpgrader::locate(Path::new("java"), &f.dist).unwrap();
        let err = upgrade_shard_indexes(
            &upgrader,
            &collections(&["collection1"]),
            &f.base_data_dir,
            7981,
            &RecordingRunner::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TooFewShards { found: 1, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_upgrade_refuses_running_instance() {
        let f = upgrade_fixture();
        create_index(&f.base_data_dir.join("mediacloud-standalone"), &["collection1"]);
        let upgrader = IndexUpgrader::locate(Path::new("java"), &f.dist).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let runner = RecordingRunner::default();

        let err = upgrade_standalone_index(
            &upgrader,
            &collections(&["collection1"]),
            &f.base_data_dir,
            port,
            &runner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::StillRunning { .. }), "{err}");
        assert!(runner.recorded().is_empty());

        drop(listener);
        upgrade_standalone_index(
            &upgrader,
            &collections(&["collection1"]),
            &f.base_data_dir,
            port,
            &runner,
        )
        .await
        .unwrap();
        assert_eq!(runner.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_index_is_fatal() {
        let f = upgrade_fixture();
        let data_dir = f.tmp.path().join("instance");
        create_index(&data_dir, &["collection1"]);
        fs::create_dir_all(data_dir.join("mediacloud")).unwrap();
        let upgrader = IndexUpgrader::locate(Path::new("java"), &f.dist).unwrap();
        let runner = RecordingRunner::default();
        let err = upgrade_index(
            &upgrader,
            &collections(&["collection1", "mediacloud"]),
            &data_dir,
            &runner,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MissingPath { what: "index directory", .. }), "{err}");
        assert_eq!(runner.recorded().len(), 1);
    }

    #[test]
    fn test_library_lookup_needs_exactly_one_match() {
        let f = upgrade_fixture();
        let lib = f.dist.path().join("server/solr-webapp/webapp/WEB-INF/lib");
        fs::write(lib.join("lucene-core-5.5.4.jar"), "jar").unwrap();
        let err = IndexUpgrader::locate(Path::new("java"), &f.dist).unwrap_err();
        assert!(matches!(err, Error::LibraryMatch { found: 2, .. }), "{err}");

        fs::remove_file(lib.join("lucene-backward-codecs-6.5.0.jar")).unwrap();
        fs::remove_file(lib.join("lucene-core-5.5.4.jar")).unwrap();
        let err = IndexUpgrader::locate(Path::new("java"), &f.dist).unwrap_err();
        assert!(matches!(err, Error::LibraryMatch { found: 0, .. }), "{err}");
    }
}
