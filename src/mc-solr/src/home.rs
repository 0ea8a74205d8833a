// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The shared Solr home and the collections it defines.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::files;

/// A collection defined in the shared Solr home.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Collection {
    pub name: String,
    /// `<solr_home>/collections/<name>`.
    pub path: PathBuf,
}

impl Collection {
    /// The collection's configuration directory.
    pub fn conf_path(&self) -> PathBuf {
        self.path.join("conf")
    }
}

/// The shared Solr home directory.
#[derive(Debug, Clone)]
pub struct SolrHome {
    path: PathBuf,
}

impl SolrHome {
    /// Opens the Solr home at `path`, which must be a directory.
    pub fn open(path: &Path) -> Result<SolrHome> {
        let path = files::absolute(path)?;
        if !path.is_dir() {
            return Err(Error::MissingPath {
                what: "Solr home directory",
                path,
            });
        }
        Ok(SolrHome { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn collections_path(&self) -> PathBuf {
        self.path.join("collections")
    }

    /// Lists the collections, sorted by name.
    ///
    /// Entries starting with `_` or `.` and non-directories are skipped. A
    /// collection without a `conf` directory is an error.
    pub fn collections(&self) -> Result<Vec<Collection>> {
        let dir = self.collections_path();
        if !dir.is_dir() {
            return Err(Error::MissingPath {
                what: "collections directory",
                path: dir,
            });
        }
        let mut collections = vec![];
        for entry in fs::read_dir(&dir).with_path("reading directory", &dir)? {
            let entry = entry.with_path("reading directory", &dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') || name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let collection = Collection { name, path };
            if !collection.conf_path().is_dir() {
                return Err(Error::MissingCollectionConf {
                    path: collection.conf_path(),
                    name: collection.name,
                });
            }
            collections.push(collection);
        }
        collections.sort();
        debug!(
            "Solr collections: {:?}",
            collections.iter().map(|c| &c.name).collect::<Vec<_>>()
        );
        Ok(collections)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Creates a Solr home with the given collections and every shared asset
    /// an instance layout needs.
    pub fn create_solr_home(path: &Path, collections: &[&str]) {
        for name in collections {
            let conf = path.join("collections").join(name).join("conf");
            fs::create_dir_all(&conf).unwrap();
            fs::write(conf.join("solrconfig.xml"), format!("<config name=\"{name}\"/>")).unwrap();
            fs::write(conf.join("schema.xml"), "<schema/>").unwrap();
        }
        fs::create_dir_all(path.join("collections")).unwrap();
        for dir in ["contexts", "etc", "modules", "resources"] {
            fs::create_dir_all(path.join(dir)).unwrap();
        }
        fs::write(path.join("resources").join("log4j.properties"), "").unwrap();
        fs::write(path.join("solr.xml"), "<solr/>").unwrap();
    }
}
