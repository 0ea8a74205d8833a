// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Supervision of a single Solr JVM.
//!
//! ```text
//! Idle → Launching → WaitingForPort → Running → Stopping → Stopped
//!                          │                        ▲
//!                          └── port never opens ────┘
//! ```
//!
//! The supervisor owns the child for its whole life. Shutdown is requested
//! through [`StopSignals`], which the binary cancels on SIGTERM or SIGINT: the
//! first signal stops the child gracefully, a second one kills it right away.
//! The child is spawned with kill-on-drop and always reaped.

use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::Invocation;
use crate::error::{Error, IoResultExt, Result};
use crate::net;

/// Requests to stop a supervised process.
#[derive(Debug, Clone, Default)]
pub struct StopSignals {
    /// Stop gracefully: SIGTERM, then SIGKILL once the grace period is over.
    pub stop: CancellationToken,
    /// Cut the grace period short and SIGKILL.
    pub kill: CancellationToken,
}

impl StopSignals {
    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }
}

/// Lifecycle of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    WaitingForPort,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runs one child process until it is told to stop or dies.
#[derive(Debug)]
pub struct ProcessSupervisor {
    state: SupervisorState,
    /// Grace period between SIGTERM and SIGKILL.
    sigkill_timeout: Duration,
    /// Delay between port probes during startup.
    retry_interval: Duration,
}

impl ProcessSupervisor {
    pub fn new(sigkill_timeout: Duration, retry_interval: Duration) -> ProcessSupervisor {
        ProcessSupervisor {
            state: SupervisorState::Idle,
            sigkill_timeout,
            retry_interval,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, to: SupervisorState) {
        debug!("supervisor: {} -> {to}", self.state);
        self.state = to;
    }

    /// Launches `invocation` and supervises it until a stop is requested.
    ///
    /// The child must open `port` on localhost within `retries` probes. A
    /// child that exits on its own, before or after opening the port, is an
    /// error. Returns `Ok(())` only after a requested shutdown.
    pub async fn run(
        &mut self,
        invocation: &Invocation,
        port: u16,
        retries: u32,
        signals: &StopSignals,
    ) -> Result<()> {
        self.transition(SupervisorState::Launching);
        debug!("running command: {invocation}");
        let mut child = invocation
            .to_command()
            .kill_on_drop(true)
            .spawn()
            .with_path("spawning", Path::new(&invocation.program))?;
        let pid = child.id().unwrap_or_default();
        info!("Solr PID: {pid}");

        self.transition(SupervisorState::WaitingForPort);
        info!("Solr is starting on port {port}, will be available shortly...");
        let mut opened = false;
        for attempt in 1..=retries {
            if net::tcp_port_is_open(net::LOCALHOST, port).await {
                opened = true;
                break;
            }
            debug!("port {port} is not open yet (attempt {attempt}/{retries})");
            tokio::select! {
                status = child.wait() => {
                    self.transition(SupervisorState::Stopped);
                    return Err(exited(pid, status));
                }
                _ = signals.stop.cancelled() => {
                    info!("shutdown requested while Solr was starting");
                    self.stop(&mut child, pid, signals).await;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        if !opened {
            warn!("Solr did not open port {port}, stopping it");
            self.stop(&mut child, pid, signals).await;
            return Err(Error::StartupTimeout { pid, port, retries });
        }

        self.transition(SupervisorState::Running);
        info!("Solr is running on port {port}!");
        tokio::select! {
            status = child.wait() => {
                self.transition(SupervisorState::Stopped);
                Err(exited(pid, status))
            }
            _ = signals.stop.cancelled() => {
                self.stop(&mut child, pid, signals).await;
                Ok(())
            }
        }
    }

    /// Sends SIGTERM, waits for the grace period, then SIGKILLs. A kill
    /// request ends the grace period early. Always reaps the child.
    async fn stop(&mut self, child: &mut Child, pid: u32, signals: &StopSignals) {
        self.transition(SupervisorState::Stopping);
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Solr (PID {pid}) already exited: {status}");
            self.transition(SupervisorState::Stopped);
            return;
        }

        info!("Killing Solr process {pid}...");
        // The child is not reaped yet, so its PID cannot have been reused.
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => {
                if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    warn!("unable to send SIGTERM to {pid}: {e}");
                }
            }
            _ => warn!("invalid PID {pid}, skipping SIGTERM"),
        }

        let kill = tokio::select! {
            res = tokio::time::timeout(self.sigkill_timeout, child.wait()) => match res {
                Ok(Ok(status)) => {
                    debug!("Solr (PID {pid}) exited: {status}");
                    false
                }
                Ok(Err(e)) => {
                    warn!("unable to wait for Solr (PID {pid}): {e}");
                    false
                }
                Err(_) => {
                    warn!(
                        "Solr (PID {pid}) still running after {}, sending SIGKILL",
                        humantime::format_duration(self.sigkill_timeout)
                    );
                    true
                }
            },
            _ = signals.kill.cancelled() => {
                warn!("kill requested, sending SIGKILL to Solr (PID {pid})");
                true
            }
        };
        if kill {
            if let Err(e) = child.kill().await {
                warn!("unable to kill Solr (PID {pid}): {e}");
            }
        }
        self.transition(SupervisorState::Stopped);
    }
}

fn exited(pid: u32, status: std::io::Result<ExitStatus>) -> Error {
    let status = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("unable to wait: {e}"),
    };
    Error::ChildExited { pid, status }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::net::TcpListener;

    use super::*;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(Duration::from_secs(10), Duration::from_millis(20))
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn cancel_after(token: &CancellationToken, delay: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            token.cancel();
        });
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_child() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let signals = StopSignals::default();
        cancel_after(&signals.stop, Duration::from_millis(200));

        let mut supervisor = supervisor();
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        let start = Instant::now();
        supervisor
            .run(&Invocation::new("sleep").arg("30"), port, 10, &signals)
            .await
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_child_exiting_during_startup_is_an_error() {
        let port = closed_port().await;
        let mut supervisor = supervisor();
        let err = supervisor
            .run(
                &Invocation::new("sh").args(["-c", "exit 3"]),
                port,
                100,
                &StopSignals::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChildExited { .. }), "{err}");
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_child_exiting_while_running_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = supervisor()
            .run(
                &Invocation::new("sleep").arg("0.2"),
                port,
                10,
                &StopSignals::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChildExited { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_startup_timeout_stops_child() {
        let port = closed_port().await;
        let mut supervisor = supervisor();
        let err = supervisor
            .run(
                &Invocation::new("sleep").arg("30"),
                port,
                3,
                &StopSignals::default(),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::StartupTimeout { port: p, retries: 3, .. } if p == port),
            "{err}"
        );
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_sigkill_after_grace_period() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let signals = StopSignals::default();
        cancel_after(&signals.stop, Duration::from_millis(200));

        let mut supervisor =
            ProcessSupervisor::new(Duration::from_millis(200), Duration::from_millis(20));
        let start = Instant::now();
        supervisor
            .run(
                &Invocation::new("sh").args(["-c", "trap '' TERM; sleep 5"]),
                port,
                10,
                &signals,
            )
            .await
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_kill_request_cuts_grace_period_short() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let signals = StopSignals::default();
        cancel_after(&signals.stop, Duration::from_millis(200));
        cancel_after(&signals.kill, Duration::from_millis(400));

        let mut supervisor =
            ProcessSupervisor::new(Duration::from_secs(30), Duration::from_millis(20));
        let start = Instant::now();
        supervisor
            .run(
                &Invocation::new("sh").args(["-c", "trap '' TERM; sleep 10"]),
                port,
                10,
                &signals,
            )
            .await
            .unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
