//! Subprocess execution.
//!
//! A [`CommandRunner`] spawns a program, waits for it to exit and hands back
//! everything it wrote. Failing to start the program is reported as a
//! [`SpawnError`]; a program that ran and exited non-zero is a normal
//! [`ProcessOutput`] with a non-zero exit code.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;

/// Output captured from a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The OS refused to start the process.
#[derive(Debug, thiserror::Error)]
#[error("failed to start {}: {source}", program.display())]
pub struct SpawnError {
    pub program: PathBuf,
    #[source]
    pub source: std::io::Error,
}

pub type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<ProcessOutput, SpawnError>> + Send + 'a>>;

/// Runs external programs to completion.
pub trait CommandRunner: Send + Sync + fmt::Debug {
    fn run<'a>(&'a self, program: &'a Path, args: &'a [OsString]) -> RunFuture<'a>;
}

/// Runs programs with `tokio::process`, never blocking the runtime.
///
/// No timeout is applied: a gpg invocation waiting on a hardware token
/// touch may legitimately take as long as the operator needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

impl CommandRunner for TokioRunner {
    fn run<'a>(&'a self, program: &'a Path, args: &'a [OsString]) -> RunFuture<'a> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|source| SpawnError {
                    program: program.to_path_buf(),
                    source,
                })?;

            Ok(ProcessOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
            })
        })
    }
}
