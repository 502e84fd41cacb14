//! Per-request temporary files handed to gpg.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// A temp file could not be created or written.
#[derive(Debug, thiserror::Error)]
#[error("failed to write temp file {}: {source}", .path.display())]
pub struct TempError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// A file in the bridge's temp directory that is removed once gpg is done
/// with it.
///
/// Call [`remove`](Self::remove) after the subprocess exits. If the value
/// is dropped without that (early return, panic), `Drop` removes the file
/// synchronously. Removal failures are logged and never propagated.
#[derive(Debug)]
pub struct TempResource {
    path: PathBuf,
    removed: bool,
}

impl TempResource {
    /// Write `contents` to a new file named
    /// `<prefix>_<unix millis>_<random token>.<extension>` inside `dir`.
    ///
    /// The file is created exclusively (never overwrites) and, on unix,
    /// readable by the owner only.
    pub async fn create(
        dir: &Path,
        prefix: &str,
        extension: &str,
        contents: &[u8],
    ) -> Result<Self, TempError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let token = Uuid::new_v4().simple();
        let path = dir.join(format!("{prefix}_{millis}_{token}.{extension}"));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = match options.open(&path).await {
            Ok(file) => file,
            Err(source) => return Err(TempError { path, source }),
        };
        let resource = Self {
            path,
            removed: false,
        };
        // On a failed write `resource` drops and takes the partial file with it.
        let written = async {
            file.write_all(contents).await?;
            file.flush().await
        };
        if let Err(source) = written.await {
            return Err(TempError {
                path: resource.path.clone(),
                source,
            });
        }
        debug!("wrote {} bytes to {}", contents.len(), resource.path.display());
        Ok(resource)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Best effort: a failure is logged only.
    pub async fn remove(mut self) {
        self.removed = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!("failed to remove temp file {}: {e}", self.path.display());
        }
    }
}

impl Drop for TempResource {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("failed to remove temp file {}: {e}", self.path.display());
        }
    }
}
