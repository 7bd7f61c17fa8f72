// src/repository/mod.rs

//! Repository and artifact-cache boundary
//!
//! The transaction engine consumes repositories through the [`Repository`]
//! trait: cache lookup, checksum verification, and artifact download with
//! progress reporting. `HttpRepository` is the stock implementation; it
//! downloads into a local cache directory, verifies checksums, and removes
//! corrupt files before reporting failure.

use crate::error::{Error, Result};
use crate::packages::PackageRef;
use crate::progress::ProgressTracker;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Consumed interface to a package repository plus its local cache.
pub trait Repository {
    /// Whether a cached copy of the named artifact exists.
    fn exists(&self, filename: &str) -> bool;

    /// Absolute path of the named artifact in the local cache.
    fn abspath(&self, filename: &str) -> PathBuf;

    /// Verify a cached file against a `sha256:<hex>` checksum.
    fn verify(&self, path: &Path, checksum: &str) -> Result<bool>;

    /// Expected transfer size for a package, in bytes.
    fn download_size(&self, package: &PackageRef) -> u64;

    /// Fetch a package's binary artifact into the cache, reporting
    /// progress, and return the cached path.
    fn download(&self, package: &PackageRef, progress: &dyn ProgressTracker) -> Result<PathBuf>;
}

/// HTTP-backed repository with a local artifact cache.
pub struct HttpRepository {
    base_url: String,
    cache_dir: PathBuf,
    client: reqwest::blocking::Client,
}

impl HttpRepository {
    pub fn new(base_url: &str, cache_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cache_dir)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            cache_dir: cache_dir.to_path_buf(),
            client: reqwest::blocking::Client::new(),
        })
    }

    fn url_for(&self, filename: &str) -> String {
        format!("{}/{}", self.base_url, filename)
    }
}

impl Repository for HttpRepository {
    fn exists(&self, filename: &str) -> bool {
        self.abspath(filename).exists()
    }

    fn abspath(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }

    fn verify(&self, path: &Path, checksum: &str) -> Result<bool> {
        let expected = checksum.strip_prefix("sha256:").unwrap_or(checksum);
        let actual = sha256_file(path)?;
        Ok(actual.eq_ignore_ascii_case(expected))
    }

    fn download_size(&self, package: &PackageRef) -> u64 {
        // HEAD the artifact; unknown sizes count as zero toward the total
        let url = self.url_for(&package.filename());
        match self.client.head(&url).send() {
            Ok(resp) => resp.content_length().unwrap_or(0),
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                0
            }
        }
    }

    fn download(&self, package: &PackageRef, progress: &dyn ProgressTracker) -> Result<PathBuf> {
        let filename = package.filename();
        let dest = self.abspath(&filename);
        if dest.exists() {
            debug!("{} already cached", filename);
            return Ok(dest);
        }

        let url = self.url_for(&filename);
        info!("downloading {}", url);
        progress.set_message(&package.nevra());

        let mut resp = self.client.get(&url).send()?.error_for_status()?;

        // Stream into a temp name, rename only after a complete transfer
        let tmp = self.cache_dir.join(format!("{}.part", filename));
        let mut out = File::create(&tmp)?;
        let mut buf = [0u8; 65536];
        loop {
            let n = resp.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            progress.increment(n as u64);
        }
        out.sync_all()?;
        drop(out);

        // Corrupt transfers never make it into the cache
        if let Some(expected) = package.checksum() {
            let actual = sha256_file(&tmp)?;
            let want = expected.strip_prefix("sha256:").unwrap_or(expected);
            if !actual.eq_ignore_ascii_case(want) {
                warn!("checksum mismatch downloading {}, discarding", filename);
                let _ = fs::remove_file(&tmp);
                return Err(Error::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        fs::rename(&tmp, &dest)?;
        Ok(dest)
    }
}

/// Hex-encoded SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Verify a freshly fetched file, deleting it on mismatch so a corrupt
/// artifact never lingers in the cache.
pub fn verify_or_discard(repo: &dyn Repository, path: &Path, checksum: &str) -> Result<()> {
    if repo.verify(path, checksum)? {
        return Ok(());
    }
    warn!("checksum mismatch for {}, discarding", path.display());
    let actual = sha256_file(path).unwrap_or_else(|_| "<unreadable>".to_string());
    let _ = fs::remove_file(path);
    Err(Error::ChecksumMismatch {
        expected: checksum.to_string(),
        actual,
    })
}
