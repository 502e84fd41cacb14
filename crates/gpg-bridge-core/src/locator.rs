//! Discovery of the `gpg` executable.
//!
//! The first successful lookup is cached for the life of the process and
//! never re-checked. A failed lookup is not cached, so installing gpg while
//! the bridge is running is picked up by the next request.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable to explicitly set the path to the `gpg` binary.
pub const GPG_PATH_ENV: &str = "GPG_BRIDGE_GPG_PATH";

#[cfg(not(windows))]
const WELL_KNOWN_PATHS: &[&str] = &[
    "/usr/local/bin/gpg",
    "/opt/homebrew/bin/gpg",
    "/usr/local/MacGPG2/bin/gpg",
    "/opt/local/bin/gpg",
    "/usr/bin/gpg",
    "/usr/local/bin/gpg2",
    "/usr/bin/gpg2",
];

#[cfg(windows)]
const WELL_KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files (x86)\GnuPG\bin\gpg.exe",
    r"C:\Program Files\GnuPG\bin\gpg.exe",
    r"C:\Program Files\Git\usr\bin\gpg.exe",
];

#[cfg(not(windows))]
const LOOKUP_TOOL: &str = "which";

#[cfg(windows)]
const LOOKUP_TOOL: &str = "where";

/// Finds and memoizes the gpg executable.
#[derive(Debug)]
pub struct GpgLocator {
    explicit: Option<PathBuf>,
    search_path: bool,
    candidates: Vec<PathBuf>,
    cached: OnceLock<PathBuf>,
}

impl GpgLocator {
    /// Locator for the running system.
    ///
    /// Order: the explicit path (from config), then `GPG_BRIDGE_GPG_PATH`,
    /// then `which gpg` / `where gpg`, then the well-known install locations.
    pub fn system(explicit: Option<PathBuf>) -> Self {
        let explicit = explicit.or_else(|| std::env::var_os(GPG_PATH_ENV).map(PathBuf::from));
        Self {
            explicit,
            search_path: true,
            candidates: WELL_KNOWN_PATHS.iter().map(PathBuf::from).collect(),
            cached: OnceLock::new(),
        }
    }

    /// Locator that only considers the given candidates, in order.
    pub fn with_candidates(candidates: Vec<PathBuf>) -> Self {
        Self {
            explicit: None,
            search_path: false,
            candidates,
            cached: OnceLock::new(),
        }
    }

    /// Locator whose answer is fixed up front.
    pub fn pinned(path: impl Into<PathBuf>) -> Self {
        let locator = Self::with_candidates(vec![]);
        let _ = locator.cached.set(path.into());
        locator
    }

    /// Resolve the gpg executable, or `None` when it cannot be found.
    pub async fn find_gpg_path(&self) -> Option<PathBuf> {
        if let Some(path) = self.cached.get() {
            return Some(path.clone());
        }

        let found = self.resolve().await?;
        let path = self.cached.get_or_init(|| found);
        info!("using gpg at {}", path.display());
        Some(path.clone())
    }

    async fn resolve(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            if is_executable(path).await {
                return Some(path.clone());
            }
            warn!(
                "configured gpg path {} is not an executable file, searching instead",
                path.display()
            );
        }

        if self.search_path
            && let Some(path) = lookup_on_path("gpg").await
        {
            return Some(path);
        }

        for candidate in &self.candidates {
            if is_executable(candidate).await {
                return Some(candidate.clone());
            }
        }

        debug!("gpg not found in {} candidate locations", self.candidates.len());
        None
    }
}

/// Ask the platform lookup tool for `name`, returning its first hit.
async fn lookup_on_path(name: &str) -> Option<PathBuf> {
    let output = Command::new(LOOKUP_TOOL)
        .arg(name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let path = PathBuf::from(line);
        if path.is_absolute() && is_executable(&path).await {
            return Some(path);
        }
    }
    None
}

async fn is_executable(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}
