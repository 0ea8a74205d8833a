// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Running external tools.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Invocation {
        Invocation {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Invocation {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// A [`Command`] that runs this invocation.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.program.to_string_lossy();
        let line = std::iter::once(shell_words::quote(&program))
            .chain(self.args.iter().map(|a| shell_words::quote(a)))
            .join(" ");
        f.write_str(&line)
    }
}

/// Runs external tools to completion.
#[async_trait]
pub trait CommandRunner: fmt::Debug + Send + Sync {
    /// Runs `invocation` in the foreground and fails unless it exits
    /// successfully.
    async fn run(&self, invocation: &Invocation) -> Result<()>;
}

/// Runs tools as child processes sharing our stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForegroundRunner;

#[async_trait]
impl CommandRunner for ForegroundRunner {
    async fn run(&self, invocation: &Invocation) -> Result<()> {
        debug!("running command: {invocation}");
        let status = invocation
            .to_command()
            .kill_on_drop(true)
            .status()
            .await
            .with_path("running", Path::new(&invocation.program))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::CommandFailed {
                command: invocation.to_string(),
                status: status.to_string(),
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records invocations instead of running them.
    #[derive(Debug, Default)]
    pub struct RecordingRunner {
        pub invocations: Mutex<Vec<Invocation>>,
        /// Fail the invocation with this (zero-based) index.
        pub fail_at: Option<usize>,
    }

    impl RecordingRunner {
        pub fn failing_at(index: usize) -> RecordingRunner {
            RecordingRunner {
                fail_at: Some(index),
                ..Default::default()
            }
        }

        pub fn recorded(&self) -> Vec<Invocation> {
            self.invocations.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, invocation: &Invocation) -> Result<()> {
            let mut invocations = self.invocations.lock().expect("lock poisoned");
            let index = invocations.len();
            invocations.push(invocation.clone());
            if self.fail_at == Some(index) {
                return Err(Error::CommandFailed {
                    command: invocation.to_string(),
                    status: "exit status: 1".into(),
                });
            }
            Ok(())
        }
    }
}
