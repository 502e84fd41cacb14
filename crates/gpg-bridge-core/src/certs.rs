//! TLS material for the listener.
//!
//! The certificate directory must hold exactly one private key and one
//! certificate, recognised by name (case-insensitive):
//!
//! - key: `cert.key`, `certificate.key` or `key.pem`
//! - certificate: `cert.crt`, `cert.pem`, `certificate.crt` or `certificate.pem`
//!
//! When the directory holds neither, a self-signed pair for the loopback
//! names can be generated and written as `key.pem` / `cert.pem`.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use regex::{Regex, RegexBuilder};
use time::{Duration, OffsetDateTime};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

static KEY_FILE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"^cert(?:ificate)?\.key$|^key\.pem$")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});

static CERT_FILE: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"^cert(?:ificate)?\.(?:crt|pem)$")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});

const GENERATED_KEY: &str = "key.pem";
const GENERATED_CERT: &str = "cert.pem";
const VALIDITY_DAYS: i64 = 365;

/// Names the generated certificate is valid for.
const SUBJECT_ALT_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "expected exactly one {kind} file in {}, found {}",
        .dir.display(),
        describe_found(.found)
    )]
    Candidates {
        kind: &'static str,
        dir: PathBuf,
        found: Vec<String>,
    },

    #[error(
        "refusing to generate certificates: {} already contains {}",
        .dir.display(),
        .found.join(", ")
    )]
    Incomplete { dir: PathBuf, found: Vec<String> },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

fn describe_found(found: &[String]) -> String {
    if found.is_empty() {
        "none".to_owned()
    } else {
        found.join(", ")
    }
}

/// A private key and certificate, both PEM.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub private_key: String,
    pub certificate: String,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("private_key", &"[REDACTED]")
            .field("certificate_len", &self.certificate.len())
            .finish()
    }
}

/// What [`CertificateProvider::ensure`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A complete pair was already present; nothing was written.
    Existing,
    /// A new self-signed pair was written.
    Generated,
}

#[derive(Debug, Default)]
struct Candidates {
    keys: Vec<String>,
    certs: Vec<String>,
}

/// Loads (and if asked, creates) the bundle in one directory.
#[derive(Debug, Clone)]
pub struct CertificateProvider {
    dir: PathBuf,
}

impl CertificateProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read the one key and one certificate in the directory.
    pub async fn load(&self) -> Result<CertificateBundle, CertError> {
        let found = self.scan().await?;
        let key = self.single("private key", found.keys)?;
        let cert = self.single("certificate", found.certs)?;

        let private_key = self.read(&key).await?;
        let certificate = self.read(&cert).await?;
        debug!("loaded {key} and {cert} from {}", self.dir.display());
        Ok(CertificateBundle {
            private_key,
            certificate,
        })
    }

    /// Make sure a usable pair exists, generating one into an empty
    /// directory. Never overwrites: a directory holding an ambiguous or
    /// partial set is an error.
    pub async fn ensure(&self) -> Result<EnsureOutcome, CertError> {
        let found = self.scan().await?;
        if found.keys.is_empty() && found.certs.is_empty() {
            self.generate().await?;
            return Ok(EnsureOutcome::Generated);
        }
        if found.keys.len() == 1 && found.certs.len() == 1 {
            return Ok(EnsureOutcome::Existing);
        }
        Err(CertError::Incomplete {
            dir: self.dir.clone(),
            found: found.keys.into_iter().chain(found.certs).collect(),
        })
    }

    async fn generate(&self) -> Result<(), CertError> {
        let bundle = generate_self_signed()?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| self.io_error(&self.dir, source))?;

        let key_path = self.dir.join(GENERATED_KEY);
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&key_path)
            .await
            .map_err(|source| self.io_error(&key_path, source))?;
        file.write_all(bundle.private_key.as_bytes())
            .await
            .map_err(|source| self.io_error(&key_path, source))?;
        file.flush()
            .await
            .map_err(|source| self.io_error(&key_path, source))?;

        let cert_path = self.dir.join(GENERATED_CERT);
        tokio::fs::write(&cert_path, bundle.certificate.as_bytes())
            .await
            .map_err(|source| self.io_error(&cert_path, source))?;

        info!("generated self-signed certificate in {}", self.dir.display());
        Ok(())
    }

    /// File names in the directory that look like a key or a certificate.
    /// A missing directory has no candidates.
    async fn scan(&self) -> Result<Candidates, CertError> {
        let mut found = Candidates::default();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(source) => return Err(self.io_error(&self.dir, source)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| self.io_error(&self.dir, source))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if KEY_FILE.is_match(&name) {
                found.keys.push(name);
            } else if CERT_FILE.is_match(&name) {
                found.certs.push(name);
            }
        }
        found.keys.sort();
        found.certs.sort();
        Ok(found)
    }

    fn single(&self, kind: &'static str, mut found: Vec<String>) -> Result<String, CertError> {
        if found.len() == 1 {
            return Ok(found.remove(0));
        }
        Err(CertError::Candidates {
            kind,
            dir: self.dir.clone(),
            found,
        })
    }

    async fn read(&self, name: &str) -> Result<String, CertError> {
        let path = self.dir.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| self.io_error(&path, source))
    }

    fn io_error(&self, path: &Path, source: io::Error) -> CertError {
        CertError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A fresh key and a one-year self-signed certificate for the loopback
/// names.
pub fn generate_self_signed() -> Result<CertificateBundle, CertError> {
    let names: Vec<String> = SUBJECT_ALT_NAMES.iter().map(|s| s.to_string()).collect();
    let mut params = CertificateParams::new(names)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, "US");
    dn.push(DnType::StateOrProvinceName, "Texas");
    dn.push(DnType::LocalityName, "Austin");
    dn.push(DnType::OrganizationName, "Unchained");
    dn.push(DnType::CommonName, "GPG-Bridge");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Ok(CertificateBundle {
        private_key: key_pair.serialize_pem(),
        certificate: cert.pem(),
    })
}
