//! Thin client over the `gpg` command line.
//!
//! Each method maps to one documented gpg invocation. The executable is
//! resolved through the shared [`GpgLocator`] on every call (a cache hit
//! after the first success) and run through the injected [`CommandRunner`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::locator::GpgLocator;
use crate::runner::{CommandRunner, ProcessOutput, SpawnError};

/// Error from a gpg invocation.
#[derive(Debug, thiserror::Error)]
pub enum GpgError {
    #[error("gpg executable not found (install GnuPG or set GPG_BRIDGE_GPG_PATH)")]
    NotFound,

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("gpg exited with {}: {}", describe_exit(.exit_code), .stderr.trim())]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_owned(),
    }
}

/// Client that shells out to the located `gpg` binary.
#[derive(Debug, Clone)]
pub struct Gpg {
    locator: Arc<GpgLocator>,
    runner: Arc<dyn CommandRunner>,
}

impl Gpg {
    pub fn new(locator: Arc<GpgLocator>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { locator, runner }
    }

    /// Resolve the gpg binary, failing with [`GpgError::NotFound`].
    pub async fn executable(&self) -> Result<PathBuf, GpgError> {
        self.locator.find_gpg_path().await.ok_or(GpgError::NotFound)
    }

    async fn run(&self, args: Vec<OsString>) -> Result<ProcessOutput, GpgError> {
        let gpg = self.executable().await?;
        debug!(
            "running gpg {}",
            args.first().map(|a| a.to_string_lossy()).unwrap_or_default()
        );
        Ok(self.runner.run(&gpg, &args).await?)
    }

    /// Run and require a zero exit; returns stdout.
    async fn run_checked(&self, args: Vec<OsString>) -> Result<String, GpgError> {
        let out = self.run(args).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(GpgError::Failed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            })
        }
    }

    /// Machine-readable public key listing (`--with-colons`).
    pub async fn list_keys_colons(&self) -> Result<String, GpgError> {
        self.run_checked(list_args()).await
    }

    /// Armored, minimal export of exactly one key.
    ///
    /// gpg exits zero with empty output when nothing matched, so empty
    /// output is reported as a failure too.
    pub async fn export_armored(&self, fingerprint: &str) -> Result<String, GpgError> {
        let out = self.run(export_args(fingerprint)).await?;
        if out.success() && !out.stdout.trim().is_empty() {
            Ok(out.stdout)
        } else {
            Err(GpgError::Failed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            })
        }
    }

    /// Armored detached signature of `file` by `fingerprint`; returns the
    /// signature text.
    pub async fn detach_sign(&self, fingerprint: &str, file: &Path) -> Result<String, GpgError> {
        self.run_checked(sign_args(fingerprint, file)).await
    }

    /// Import key material from `file`; returns gpg's status report, which
    /// it writes to stderr.
    pub async fn import(&self, file: &Path) -> Result<String, GpgError> {
        let out = self.run(import_args(file)).await?;
        if out.success() {
            Ok(out.stderr)
        } else {
            Err(GpgError::Failed {
                exit_code: out.exit_code,
                stderr: out.stderr,
            })
        }
    }
}

fn os_args(args: &[&str]) -> Vec<OsString> {
    args.iter().map(OsString::from).collect()
}

pub(crate) fn list_args() -> Vec<OsString> {
    os_args(&["--list-keys", "--with-colons"])
}

/// The trailing `!` pins the exact key instead of a substring match.
pub(crate) fn export_args(fingerprint: &str) -> Vec<OsString> {
    let mut args = os_args(&["--export", "--armor", "--export-options", "export-minimal"]);
    args.push(format!("{fingerprint}!").into());
    args
}

pub(crate) fn sign_args(fingerprint: &str, file: &Path) -> Vec<OsString> {
    let mut args = os_args(&["--sign", "--detach-sign", "--armor", "--local-user"]);
    args.push(fingerprint.into());
    args.extend(os_args(&["--output", "-", "--no-tty"]));
    args.push(file.as_os_str().to_owned());
    args
}

pub(crate) fn import_args(file: &Path) -> Vec<OsString> {
    let mut args = os_args(&["--batch", "--no-tty", "--import"]);
    args.push(file.as_os_str().to_owned());
    args
}
