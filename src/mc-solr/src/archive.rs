// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Archive extraction.
//!
//! These functions block; call them from `spawn_blocking` in async code.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::trace;

use crate::error::{Error, IoResultExt, Result};

/// Extracts a gzipped tarball into `dest`.
///
/// With `strip_root`, the first path component of every entry is dropped,
/// so `solr-6.5.0/bin/solr` lands at `dest/bin/solr`.
pub fn extract_tarball(archive: &Path, dest: &Path, strip_root: bool) -> Result<()> {
    let file = File::open(archive).with_path("opening archive", archive)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(true);
    let entries = tarball.entries().with_path("reading archive", archive)?;
    for entry in entries {
        let mut entry = entry.with_path("reading archive", archive)?;
        let path = entry
            .path()
            .with_path("reading archive entry of", archive)?
            .into_owned();
        let Some(relative) = entry_destination(&path, strip_root) else {
            trace!("skipping archive entry {}", path.display());
            continue;
        };
        let target = dest.join(relative);
        unpack_entry(&mut entry, &target)?;
    }
    Ok(())
}

/// Maps an archive entry path to a path relative to the destination.
///
/// Returns `None` for entries that would end up outside the destination or
/// that are the stripped root itself.
fn entry_destination(path: &Path, strip_root: bool) -> Option<PathBuf> {
    let mut components = path.components().filter(|c| !matches!(c, Component::CurDir));
    if strip_root {
        components.next()?;
    }
    let mut relative = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => relative.push(part),
            _ => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

fn unpack_entry<T>(entry: &mut tar::Entry<T>, target: &Path) -> Result<()>
where
    T: Read,
{
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_path("creating directory", parent)?;
    }
    entry.unpack(target).with_path("unpacking", target)?;
    Ok(())
}

/// Extracts a zip archive (such as a `.war`) into `dest`.
pub fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_path("opening archive", archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|source| Error::Zip {
        path: archive.to_path_buf(),
        source,
    })?;
    fs::create_dir_all(dest).with_path("creating directory", dest)?;
    zip.extract(dest).map_err(|source| Error::Zip {
        path: archive.to_path_buf(),
        source,
    })
}
