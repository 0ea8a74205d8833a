// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Mapping of shards to ports and data directories.
//!
//! Shard `n` (counting from 1) of a cluster listens on
//! `starting_port + n - 1` and keeps its data in
//! `<base_data_dir>/mediacloud-cluster-shard-<n>`. A standalone instance uses
//! `<base_data_dir>/mediacloud-standalone`.
//!
//! Before resharding, shards lived in `./mediacloud-shard-<n>/solr/`. Such a
//! legacy layout is detected and reported with a migration plan; its data is
//! never moved by this crate.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, IoResultExt, Result};

/// Data directory name of a standalone instance.
pub const STANDALONE_DIR: &str = "mediacloud-standalone";
/// Data directory name prefix of cluster shards.
pub const SHARD_DIR_PREFIX: &str = "mediacloud-cluster-shard-";
/// Directory name prefix of pre-resharding shards.
pub const LEGACY_SHARD_PREFIX: &str = "mediacloud-shard-";

static LEGACY_SHARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^mediacloud-shard-(\d+)$").expect("valid regex"));

fn check_shard_num(shard_num: u32) -> Result<()> {
    if shard_num < 1 {
        return Err(Error::InvalidShardNum(shard_num));
    }
    Ok(())
}

/// Fails unless `shard_count` is at least 1.
pub fn check_shard_count(shard_count: u32) -> Result<()> {
    if shard_count < 1 {
        return Err(Error::InvalidShardCount(shard_count));
    }
    Ok(())
}

/// The port shard `shard_num` listens on.
pub fn shard_port(shard_num: u32, starting_port: u16) -> Result<u16> {
    check_shard_num(shard_num)?;
    u32::from(starting_port)
        .checked_add(shard_num - 1)
        .and_then(|port| u16::try_from(port).ok())
        .ok_or(Error::PortOutOfRange {
            shard_num,
            starting_port,
        })
}

fn check_base_data_dir(base_data_dir: &Path) -> Result<()> {
    if !base_data_dir.is_dir() {
        return Err(Error::MissingPath {
            what: "Solr data directory",
            path: base_data_dir.to_path_buf(),
        });
    }
    Ok(())
}

/// The data directory of shard `shard_num`.
pub fn shard_data_dir(shard_num: u32, base_data_dir: &Path) -> Result<PathBuf> {
    check_shard_num(shard_num)?;
    check_base_data_dir(base_data_dir)?;
    Ok(base_data_dir.join(format!("{SHARD_DIR_PREFIX}{shard_num}")))
}

/// The data directory of the standalone instance.
pub fn standalone_data_dir(base_data_dir: &Path) -> Result<PathBuf> {
    check_base_data_dir(base_data_dir)?;
    Ok(base_data_dir.join(STANDALONE_DIR))
}

/// Where one shard of a cluster runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub shard_num: u32,
    pub shard_count: u32,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl ShardDescriptor {
    pub fn new(
        shard_num: u32,
        shard_count: u32,
        starting_port: u16,
        base_data_dir: &Path,
    ) -> Result<ShardDescriptor> {
        check_shard_num(shard_num)?;
        check_shard_count(shard_count)?;
        Ok(ShardDescriptor {
            shard_num,
            shard_count,
            port: shard_port(shard_num, starting_port)?,
            data_dir: shard_data_dir(shard_num, base_data_dir)?,
        })
    }
}

/// Counts the shard data directories `1, 2, …` present in `base_data_dir`,
/// stopping at the first gap.
pub fn discover_shard_count(base_data_dir: &Path) -> Result<u32> {
    let mut shard_count = 0;
    while shard_data_dir(shard_count + 1, base_data_dir)?.is_dir() {
        shard_count += 1;
    }
    debug!("found {shard_count} shard(s) in {}", base_data_dir.display());
    Ok(shard_count)
}

/// Moving one collection's index data out of a legacy shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMove {
    pub collection: String,
    pub src: PathBuf,
    pub dst: PathBuf,
}

/// Instructions for migrating a legacy shard layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Directory containing the legacy shards.
    pub cwd: PathBuf,
    /// The legacy shard directories found, by shard number.
    pub legacy_dirs: Vec<PathBuf>,
    /// Highest legacy shard number.
    pub shard_count: u32,
    /// Data moves, indexed by shard number minus one.
    pub moves: Vec<Vec<DataMove>>,
}

impl MigrationPlan {
    /// Collection names of shard `shard_num`, in move order.
    pub fn collections(&self, shard_num: u32) -> Vec<&str> {
        shard_num
            .checked_sub(1)
            .and_then(|i| self.moves.get(usize::try_from(i).ok()?))
            .map(|moves| moves.iter().map(|m| m.collection.as_str()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Display for MigrationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Old shards were found at paths:")?;
        writeln!(f)?;
        for dir in &self.legacy_dirs {
            writeln!(f, "* {}", dir.display())?;
        }
        writeln!(f)?;
        writeln!(f, "Please migrate them by running:")?;
        writeln!(f)?;
        writeln!(f, "cd {}", self.cwd.display())?;
        writeln!(f)?;
        writeln!(f, "# Create empty new shard directory structure for each shard:")?;
        for shard_num in 1..=self.shard_count {
            writeln!(
                f,
                "mc-solr run-shard --shard-num {shard_num} --shard-count {} \
                 || echo \"It's fine to fail at this point.\"",
                self.shard_count
            )?;
        }
        writeln!(f)?;
        writeln!(f, "# Move data from old shards to new ones")?;
        for moves in &self.moves {
            for m in moves {
                writeln!(f, "mv {} {}", m.src.display(), m.dst.display())?;
            }
            writeln!(f)?;
        }
        writeln!(f, "# Remove old shards")?;
        for shard_num in 1..=self.shard_count {
            writeln!(f, "rm -rf {LEGACY_SHARD_PREFIX}{shard_num}/")?;
        }
        Ok(())
    }
}

/// Fails with [`Error::LegacyLayout`] if `cwd` contains pre-resharding
/// shard directories.
///
/// Nothing is moved; the error carries the plan an operator has to run.
pub fn check_legacy_layout(cwd: &Path, base_data_dir: &Path) -> Result<()> {
    match plan_legacy_migration(cwd, base_data_dir)? {
        None => Ok(()),
        Some(plan) => Err(Error::LegacyLayout(plan)),
    }
}

/// Builds the migration plan for legacy shards in `cwd`, if there are any.
pub fn plan_legacy_migration(cwd: &Path, base_data_dir: &Path) -> Result<Option<MigrationPlan>> {
    let mut legacy = vec![];
    for entry in fs::read_dir(cwd).with_path("reading directory", cwd)? {
        let entry = entry.with_path("reading directory", cwd)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(LEGACY_SHARD_PREFIX) {
            continue;
        }
        let shard_num: u32 = LEGACY_SHARD_RE
            .captures(&name)
            .and_then(|c| c[1].parse().ok())
            .ok_or_else(|| Error::LegacyShardName(name.clone()))?;
        legacy.push((shard_num, entry.path()));
    }
    if legacy.is_empty() {
        return Ok(None);
    }
    legacy.sort();
    let shard_count = legacy.iter().map(|(n, _)| *n).max().unwrap_or(0);
    info!("found {} legacy shard(s) in {}", legacy.len(), cwd.display());

    let mut moves = vec![];
    for shard_num in 1..=shard_count {
        let solr_dir = cwd.join(format!("{LEGACY_SHARD_PREFIX}{shard_num}")).join("solr");
        let mut collections = vec![];
        if solr_dir.is_dir() {
            for entry in fs::read_dir(&solr_dir).with_path("reading directory", &solr_dir)? {
                let entry = entry.with_path("reading directory", &solr_dir)?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("collection") {
                    collections.push(name);
                }
            }
        }
        if collections.is_empty() {
            return Err(Error::LegacyShardEmpty(shard_num));
        }
        collections.sort();

        let dst_shard_dir = shard_data_dir(shard_num, base_data_dir)?;
        let mut shard_moves = vec![];
        for collection in collections {
            let src = solr_dir.join(&collection).join("data");
            if !src.is_dir() {
                return Err(Error::MissingPath {
                    what: "source data directory",
                    path: src,
                });
            }
            let dst = dst_shard_dir.join(&collection).join("data");
            if dst.is_dir() {
                return Err(Error::DestinationExists { path: dst });
            }
            shard_moves.push(DataMove {
                collection,
                src,
                dst,
            });
        }
        moves.push(shard_moves);
    }

    Ok(Some(MigrationPlan {
        cwd: cwd.to_path_buf(),
        legacy_dirs: legacy.into_iter().map(|(_, path)| path).collect(),
        shard_count,
        moves,
    }))
}
