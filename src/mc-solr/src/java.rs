// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Java runtime checks.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"version "([^"]+)""#).expect("valid regex"));

/// Returns the version reported by `<java> -version`.
pub async fn java_version(java: &Path) -> Result<String> {
    let output = Command::new(java)
        .arg("-version")
        .output()
        .await
        .map_err(|e| Error::JavaVersion(format!("running {}: {e}", java.display())))?;
    // `java -version` prints to stderr.
    let banner = String::from_utf8_lossy(&output.stderr);
    parse_java_version(&banner)
        .map(str::to_owned)
        .ok_or_else(|| Error::JavaVersion(format!("unexpected output: {}", banner.trim())))
}

/// Extracts the quoted version from a `java -version` banner.
pub fn parse_java_version(banner: &str) -> Option<&str> {
    VERSION_RE
        .captures(banner)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Compares dotted version strings component by component.
///
/// Non-numeric separators (`.`, `_`, `-`, `+`) all split components; missing
/// trailing components count as zero, so `1.8` equals `1.8.0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn components(v: &str) -> Vec<u64> {
        v.split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse().unwrap_or(u64::MAX))
            .collect()
    }
    let (a, b) = (components(a), components(b));
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Fails unless `java` is at least `min_version`.
pub async fn ensure_java_version(java: &Path, min_version: &str) -> Result<()> {
    let actual = java_version(java).await?;
    debug!("Java version: {actual}");
    if compare_versions(&actual, min_version) == Ordering::Less {
        return Err(Error::JavaTooOld {
            expected: min_version.into(),
            actual,
        });
    }
    Ok(())
}
