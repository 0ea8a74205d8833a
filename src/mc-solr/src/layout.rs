// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Per-instance runtime directories.
//!
//! An instance runs out of its own data directory, which jetty treats as both
//! `jetty.home` and `jetty.base`. The directory holds
//!
//! * one subdirectory per collection with a private *copy* of the shared
//!   `conf` (Solr 5.5+ refuses symlinked configuration) and a generated
//!   `core.properties`;
//! * relative symlinks to the shared Solr home assets and to the jetty
//!   assets of the distribution.
//!
//! Building is idempotent: the collection configuration and all symlinks are
//! recreated on every run, index data is never touched.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::dist::Distribution;
use crate::error::{Error, IoResultExt, Result};
use crate::files;
use crate::home::{Collection, SolrHome};
use crate::net;

/// Solr home entries linked into every instance.
pub const HOME_ASSETS: &[&str] = &["contexts", "etc", "modules", "resources", "solr.xml"];
/// Jetty home entries linked into every instance.
pub const JETTY_ASSETS: &[&str] = &["lib", "solr-webapp", "start.jar", "solr"];

const CORE_PROPERTIES: &str = "core.properties";

/// A built instance directory and the paths needed to launch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub data_dir: PathBuf,
    pub log4j_properties: PathBuf,
    pub start_jar: PathBuf,
    pub webapp_dir: PathBuf,
    pub dist_path: PathBuf,
}

impl InstanceLayout {
    /// Fails unless an instance advertising `hostname` may bind `port`.
    pub async fn verify_launchable(&self, hostname: &str, port: u16) -> Result<()> {
        if !net::hostname_resolves(hostname).await {
            return Err(Error::Unresolvable(hostname.into()));
        }
        if net::tcp_port_is_open(net::LOCALHOST, port).await {
            return Err(Error::PortInUse {
                host: net::LOCALHOST.into(),
                port,
            });
        }
        Ok(())
    }
}

/// A symlink to create: `data_dir/<name>` → `src`.
struct Link {
    src: PathBuf,
    dst: PathBuf,
}

/// Builds or refreshes the instance directory `data_dir`.
///
/// Every precondition is checked before the first change to the filesystem,
/// so a failing build leaves `data_dir` as it was.
pub fn build(home: &SolrHome, dist: &Distribution, data_dir: &Path) -> Result<InstanceLayout> {
    let data_dir = files::absolute(data_dir)?;
    let jetty_home = dist.jetty_home()?;

    let links: Vec<Link> = HOME_ASSETS
        .iter()
        .map(|name| (home.path(), name))
        .chain(JETTY_ASSETS.iter().map(|name| (jetty_home.as_path(), name)))
        .map(|(base, name)| Link {
            src: base.join(name),
            dst: data_dir.join(name),
        })
        .collect();
    for link in &links {
        if !link.src.exists() {
            return Err(Error::MissingPath {
                what: "shared instance asset",
                path: link.src.clone(),
            });
        }
    }
    let log4j_properties = home.path().join("resources").join("log4j.properties");
    if !log4j_properties.is_file() {
        return Err(Error::MissingPath {
            what: "log4j.properties",
            path: log4j_properties,
        });
    }
    for link in &links {
        if files::lexists(&link.dst) && !link.dst.is_symlink() {
            return Err(Error::SymlinkConflict {
                path: link.dst.clone(),
            });
        }
    }
    let collections = home.collections()?;

    if !data_dir.is_dir() {
        info!("Creating data directory at {}...", data_dir.display());
        fs::create_dir_all(&data_dir).with_path("creating directory", &data_dir)?;
    }

    info!("Updating collections at {}...", data_dir.display());
    for collection in &collections {
        update_collection(collection, &data_dir)?;
    }

    info!("Symlinking shared configuration and libraries...");
    for link in &links {
        files::remove_any(&link.dst)?;
        debug!("symlinking {} to {}", link.src.display(), link.dst.display());
        files::relative_symlink(&link.src, &link.dst)?;
    }

    Ok(InstanceLayout {
        log4j_properties,
        start_jar: jetty_home.join("start.jar"),
        webapp_dir: jetty_home.join("solr-webapp"),
        dist_path: dist.path(),
        data_dir,
    })
}

fn update_collection(collection: &Collection, data_dir: &Path) -> Result<()> {
    info!("Updating collection '{}'...", collection.name);
    let dst_dir = data_dir.join(&collection.name);
    fs::create_dir_all(&dst_dir).with_path("creating directory", &dst_dir)?;

    // Might still be a symlink left by older layouts.
    let conf = dst_dir.join("conf");
    files::remove_any(&conf)?;
    debug!("copying {} to {}", collection.conf_path().display(), conf.display());
    files::copy_dir_all(&collection.conf_path(), &conf)?;

    let core_properties = dst_dir.join(CORE_PROPERTIES);
    fs::write(&core_properties, core_properties_contents(&collection.name, &dst_dir))
        .with_path("writing", &core_properties)
}

fn core_properties_contents(name: &str, instance_dir: &Path) -> String {
    format!(
        "
#
# This file is autogenerated. Don't bother editing it!
#

name={name}
instanceDir={}
",
        instance_dir.display()
    )
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::*;
    use crate::dist::testing::create_distribution;
    use crate::home::testing::create_solr_home;

    struct Fixture {
        tmp: TempDir,
        home: SolrHome,
        dist: Distribution,
    }

    impl Fixture {
        fn data_dir(&self) -> PathBuf {
            self.tmp.path().join("data/mediacloud-standalone")
        }
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let home_path = tmp.path().join("solr");
        create_solr_home(&home_path, &["collection1", "collection2"]);
        let dist_root = tmp.path().join("dist");
        fs::create_dir(&dist_root).unwrap();
        let dist = create_distribution(&dist_root);
        Fixture {
            home: SolrHome::open(&home_path).unwrap(),
            dist,
            tmp,
        }
    }

    #[test]
    fn test_build_is_idempotent() {
        let f = fixture();
        let data_dir = f.data_dir();
        let layout = build(&f.home, &f.dist, &data_dir).unwrap();
        let core_properties = data_dir.join("collection1/core.properties");
        let first = fs::read_to_string(&core_properties).unwrap();
        assert!(first.contains("name=collection1\n"));
        assert!(first.contains(&format!(
            "instanceDir={}\n",
            data_dir.join("collection1").display()
        )));

        let again = build(&f.home, &f.dist, &data_dir).unwrap();
        assert_eq!(layout, again);
        assert_eq!(fs::read_to_string(&core_properties).unwrap(), first);

        let conf: Vec<_> = fs::read_dir(data_dir.join("collection1/conf"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(conf.len(), 2, "{conf:?}");
        assert!(!data_dir.join("collection1/conf/conf").exists());

        for name in HOME_ASSETS.iter().chain(JETTY_ASSETS) {
            let link = data_dir.join(name);
            assert!(fs::read_link(&link).unwrap().is_relative(), "{name}");
            assert!(link.exists(), "{name}");
        }
        assert_eq!(layout.start_jar, f.dist.path().join("server/start.jar"));
        assert_eq!(layout.webapp_dir, f.dist.path().join("server/solr-webapp"));
    }

    #[test]
    fn test_links_resolve_when_data_dir_has_parent_components() {
        let f = fixture();
        fs::create_dir_all(f.tmp.path().join("x/y")).unwrap();
        let data_dir = f.tmp.path().join("x/y/../../data/mediacloud-standalone");

        let layout = build(&f.home, &f.dist, &data_dir).unwrap();
        assert_eq!(layout.data_dir, f.data_dir());
        for name in HOME_ASSETS.iter().chain(JETTY_ASSETS) {
            let link = f.data_dir().join(name);
            assert!(
                link.exists(),
                "dangling symlink {name}: {:?}",
                fs::read_link(&link)
            );
        }
        assert!(
            fs::read_to_string(f.data_dir().join("collection1/core.properties"))
                .unwrap()
                .contains(&format!(
                    "instanceDir={}\n",
                    f.data_dir().join("collection1").display()
                ))
        );
    }

    #[test]
    fn test_plain_file_conflict_changes_nothing() {
        let f = fixture();
        let data_dir = f.data_dir();
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("solr.xml"), "<solr/>").unwrap();

        let err = build(&f.home, &f.dist, &data_dir).unwrap_err();
        assert!(
            matches!(&err, Error::SymlinkConflict { path } if path == &data_dir.join("solr.xml")),
            "{err}"
        );
        assert!(!data_dir.join("collection1").exists());
        assert!(!files::lexists(&data_dir.join("etc")));
    }

    #[test]
    fn test_symlinked_conf_is_replaced_by_copy() {
        let f = fixture();
        let data_dir = f.data_dir();
        let old_conf = f.tmp.path().join("old-conf");
        fs::create_dir_all(&old_conf).unwrap();
        fs::write(old_conf.join("stale.xml"), "").unwrap();
        fs::create_dir_all(data_dir.join("collection2")).unwrap();
        symlink(&old_conf, data_dir.join("collection2/conf")).unwrap();

        build(&f.home, &f.dist, &data_dir).unwrap();
        let conf = data_dir.join("collection2/conf");
        assert!(!conf.is_symlink());
        assert!(conf.join("solrconfig.xml").is_file());
        assert!(!conf.join("stale.xml").exists());
        assert!(old_conf.join("stale.xml").is_file());
    }

    #[test]
    fn test_missing_asset_is_rejected() {
        let f = fixture();
        fs::remove_dir_all(f.home.path().join("modules")).unwrap();
        let err = build(&f.home, &f.dist, &f.data_dir()).unwrap_err();
        assert!(matches!(err, Error::MissingPath { .. }), "{err}");
        assert!(!f.data_dir().exists());
    }

    #[tokio::test]
    async fn test_verify_launchable() {
        let f = fixture();
        let layout = build(&f.home, &f.dist, &f.data_dir()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = layout.verify_launchable(net::LOCALHOST, port).await.unwrap_err();
        assert!(matches!(err, Error::PortInUse { .. }), "{err}");

        drop(listener);
        layout.verify_launchable(net::LOCALHOST, port).await.unwrap();
        let err = layout
            .verify_launchable("no-such-host.invalid", port)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unresolvable(_)), "{err}");
    }
}
