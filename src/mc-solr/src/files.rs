// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Filesystem helpers shared by installation and layout building.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

/// Recursively copies `src` to `dst`, following symlinks in `src`.
///
/// `dst` must not exist yet.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            Error::Io {
                action: "walking",
                path,
                source: e.into(),
            }
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths below its root");
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).with_path("creating directory", &target)?;
        } else {
            fs::copy(entry.path(), &target).with_path("copying to", &target)?;
        }
    }
    Ok(())
}

/// Removes `path` whether it is a symlink, a file or a directory tree.
///
/// Symlinks are unlinked, never followed.
pub fn remove_any(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_path("inspecting", path),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).with_path("removing directory", path)
    } else {
        fs::remove_file(path).with_path("removing", path)
    }
}

/// Reports whether anything, including a dangling symlink, exists at `path`.
pub fn lexists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// The path of `target` relative to the directory `base`.
///
/// Both paths must be absolute.
pub fn relative_path(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<Component> = target.components().collect();
    let base: Vec<Component> = base.components().collect();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push("..");
    }
    for component in &target[common..] {
        relative.push(component.as_os_str());
    }
    relative
}

/// Creates a symlink at `link` pointing to `target` through a relative path.
pub fn relative_symlink(target: &Path, link: &Path) -> Result<()> {
    let target = absolute(target)?;
    let link = absolute(link)?;
    let parent = link.parent().unwrap_or(Path::new("/"));
    let relative = relative_path(&target, parent);
    symlink(&relative, &link).with_path("creating symlink", &link)
}

/// Runs blocking filesystem work off the async runtime.
///
/// Panics in `f` are propagated to the caller.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

/// Makes `path` absolute against the current directory without touching the
/// filesystem. `.` and `..` components are resolved lexically.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    let path = std::path::absolute(path).with_path("resolving", path)?;
    Ok(normalize(&path))
}

/// Drops `.` components and folds `..` into its parent. `..` at the root
/// stays at the root.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
