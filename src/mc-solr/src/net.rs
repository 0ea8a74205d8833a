// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Network probes.

use std::ffi::{CStr, CString};
use std::ptr;
use std::time::Duration;

use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, trace};

/// Host that instances on this machine are probed on.
pub const LOCALHOST: &str = "localhost";

/// Upper bound for a single connection attempt.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reports whether something accepts TCP connections on `host:port`.
pub async fn tcp_port_is_open(host: &str, port: u16) -> bool {
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            trace!("{host}:{port} is closed: {e}");
            false
        }
        Err(_) => {
            trace!("{host}:{port} timed out");
            false
        }
    }
}

/// Probes `host:port` up to `retries` times, `interval` apart.
///
/// Returns whether the port opened within the budget.
pub async fn wait_for_tcp_port_to_open(
    host: &str,
    port: u16,
    retries: u32,
    interval: Duration,
) -> bool {
    for attempt in 1..=retries {
        if tcp_port_is_open(host, port).await {
            return true;
        }
        debug!("{host}:{port} is not open yet (attempt {attempt}/{retries})");
        if attempt < retries {
            tokio::time::sleep(interval).await;
        }
    }
    false
}

/// Reports whether `host` resolves to at least one address.
pub async fn hostname_resolves(host: &str) -> bool {
    match lookup_host((host, 0)).await {
        Ok(mut addrs) => addrs.next().is_some(),
        Err(e) => {
            debug!("unable to resolve {host}: {e}");
            false
        }
    }
}

/// The name of this machine, falling back to [`LOCALHOST`].
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        Ok(_) => LOCALHOST.into(),
        Err(e) => {
            debug!("gethostname failed: {e}");
            LOCALHOST.into()
        }
    }
}

/// The fully qualified name of this machine, the name instances advertise
/// to their peers by default.
///
/// Falls back to [`local_hostname`] if the name has no canonical form.
pub async fn local_fqdn() -> String {
    let hostname = local_hostname();
    let lookup = hostname.clone();
    match tokio::task::spawn_blocking(move || canonical_name(&lookup)).await {
        Ok(Some(fqdn)) => fqdn,
        Ok(None) => hostname,
        Err(e) => {
            debug!("canonical name lookup of {hostname} failed: {e}");
            hostname
        }
    }
}

/// The canonical name of `host` as reported by `getaddrinfo(3)`.
fn canonical_name(host: &str) -> Option<String> {
    let node = CString::new(host).ok()?;
    // SAFETY: an all-zero `addrinfo` is a valid, empty set of hints.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = libc::AI_CANONNAME;
    hints.ai_family = libc::AF_UNSPEC;
    hints.ai_socktype = libc::SOCK_STREAM;

    let mut res: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: `node` is NUL-terminated and `hints` is initialized. On success
    // `res` owns a list that is freed below.
    let rc = unsafe { libc::getaddrinfo(node.as_ptr(), ptr::null(), &hints, &mut res) };
    if rc != 0 || res.is_null() {
        debug!("unable to resolve {host} (getaddrinfo error {rc})");
        return None;
    }
    // SAFETY: `res` is a valid list returned by `getaddrinfo`. With
    // `AI_CANONNAME`, its first entry carries the canonical name or null.
    // The name is copied before the list is freed.
    let canonical = unsafe {
        let name = (*res).ai_canonname;
        let canonical = if name.is_null() {
            None
        } else {
            Some(CStr::from_ptr(name).to_string_lossy().into_owned())
        };
        libc::freeaddrinfo(res);
        canonical
    };
    canonical.filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_port_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_port_is_open("127.0.0.1", port).await);
        drop(listener);
        assert!(!tcp_port_is_open("127.0.0.1", port).await);
    }

    #[tokio::test]
    async fn test_wait_gives_up_after_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let opened =
            wait_for_tcp_port_to_open("127.0.0.1", port, 3, Duration::from_millis(10)).await;
        assert!(!opened);
    }

    #[tokio::test]
    async fn test_localhost_resolves() {
        assert!(hostname_resolves(LOCALHOST).await);
        assert!(!hostname_resolves("no-such-host.invalid").await);
        assert!(!local_hostname().is_empty());
    }

    #[tokio::test]
    async fn test_local_fqdn() {
        assert!(canonical_name(LOCALHOST).is_some_and(|name| name.starts_with(LOCALHOST)));
        assert_eq!(canonical_name("no-such-host.invalid"), None);
        assert!(!local_fqdn().await.is_empty());
    }
}
