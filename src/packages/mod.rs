// src/packages/mod.rs

//! Package identity and the archive boundary
//!
//! Archive binary formats are an external collaborator: quern consumes
//! packages through the [`PackageArchive`] trait and never parses archive
//! bytes itself. The [`ArchiveLoader`] is the single identity-to-record
//! resolution capability injected into action construction; there is no
//! global side-channel for turning a [`PackageRef`] into file lists or
//! scriptlets.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use strum_macros::Display;

/// Where a package reference currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provenance {
    /// Known only from the resolver's decision; no local artifact yet
    Resolved,
    /// Concrete binary artifact in the local cache
    Binary(PathBuf),
    /// Source package; build input, never fetched by the executor
    Source,
}

/// Identity (NEVRA) plus provenance of one resolved package.
///
/// Immutable once materialized as a binary artifact: `materialize` is a
/// one-way transition and a no-op afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub epoch: u32,
    pub version: String,
    pub release: String,
    pub arch: String,
    provenance: Provenance,
    checksum: Option<String>,
}

impl PackageRef {
    pub fn resolved(name: &str, epoch: u32, version: &str, release: &str, arch: &str) -> Self {
        Self {
            name: name.to_string(),
            epoch,
            version: version.to_string(),
            release: release.to_string(),
            arch: arch.to_string(),
            provenance: Provenance::Resolved,
            checksum: None,
        }
    }

    pub fn binary(
        name: &str,
        epoch: u32,
        version: &str,
        release: &str,
        arch: &str,
        artifact: PathBuf,
    ) -> Self {
        Self {
            provenance: Provenance::Binary(artifact),
            ..Self::resolved(name, epoch, version, release, arch)
        }
    }

    pub fn source(name: &str, epoch: u32, version: &str, release: &str) -> Self {
        Self {
            provenance: Provenance::Source,
            ..Self::resolved(name, epoch, version, release, "src")
        }
    }

    /// Attach the expected `sha256:<hex>` checksum of the binary artifact,
    /// as reported by the resolver's repository metadata.
    pub fn with_checksum(mut self, checksum: &str) -> Self {
        self.checksum = Some(checksum.to_string());
        self
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// True once a concrete downloaded artifact backs this reference.
    pub fn is_binary(&self) -> bool {
        matches!(self.provenance, Provenance::Binary(_))
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        match &self.provenance {
            Provenance::Binary(p) => Some(p),
            _ => None,
        }
    }

    /// Substitute a concrete artifact for a resolver-only reference.
    /// No-op if the reference is already backed by an artifact.
    pub fn materialize(&mut self, artifact: PathBuf) {
        if !self.is_binary() {
            self.provenance = Provenance::Binary(artifact);
        }
    }

    /// Canonical `name-[epoch:]version-release.arch` rendering.
    pub fn nevra(&self) -> String {
        if self.epoch > 0 {
            format!(
                "{}-{}:{}-{}.{}",
                self.name, self.epoch, self.version, self.release, self.arch
            )
        } else {
            format!("{}-{}-{}.{}", self.name, self.version, self.release, self.arch)
        }
    }

    /// Cache filename for the binary artifact.
    pub fn filename(&self) -> String {
        format!("{}-{}-{}.{}.qpk", self.name, self.version, self.release, self.arch)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nevra())
    }
}

/// Lifecycle phase of an embedded package scriptlet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ScriptPhase {
    #[strum(serialize = "pre-install")]
    PreIn,
    #[strum(serialize = "post-install")]
    PostIn,
    #[strum(serialize = "pre-remove")]
    PreUn,
    #[strum(serialize = "post-remove")]
    PostUn,
    #[strum(serialize = "pre-upgrade")]
    PreUp,
    #[strum(serialize = "post-upgrade")]
    PostUp,
    #[strum(serialize = "post-transaction-install")]
    PostTransIn,
    #[strum(serialize = "post-transaction-remove")]
    PostTransUn,
    #[strum(serialize = "post-transaction-upgrade")]
    PostTransUp,
}

impl ScriptPhase {
    /// Phases deferred until every package's core work in the transaction
    /// is complete.
    pub fn is_post_transaction(&self) -> bool {
        matches!(self, Self::PostTransIn | Self::PostTransUn | Self::PostTransUp)
    }
}

/// Type of an entry in a package's file list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// One file owned by a package, as reported by the archive collaborator.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Root-relative path without leading slash
    pub path: String,
    pub kind: FileKind,
}

impl FileEntry {
    pub fn regular(path: &str) -> Self {
        Self {
            path: path.trim_start_matches('/').to_string(),
            kind: FileKind::Regular,
        }
    }
}

/// Consumed interface to one package archive.
pub trait PackageArchive {
    /// Bytes the package occupies once installed.
    fn install_size(&self) -> u64;

    /// Files the package owns.
    fn files(&self) -> &[FileEntry];

    /// Extract archive contents into the target root.
    fn extract(&self, root: &Path) -> Result<()>;

    /// Remove the package's files from the target root (explicit erase).
    fn remove(&self, root: &Path) -> Result<()>;

    /// Clean up a displaced incarnation after update/downgrade.
    fn cleanup(&self, root: &Path) -> Result<()>;

    /// Raw scriptlet bytes for a phase; `None` or empty means no-op.
    fn scriptlet(&self, phase: ScriptPhase) -> Option<Vec<u8>>;
}

/// Resolves a package identity to its archive record, whether that record
/// comes from a cached artifact or from the installed-package metadata.
pub trait ArchiveLoader {
    fn open(&self, package: &PackageRef) -> Result<Box<dyn PackageArchive>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nevra_rendering() {
        let plain = PackageRef::resolved("zlib", 0, "1.3.1", "2", "x86_64");
        assert_eq!(plain.nevra(), "zlib-1.3.1-2.x86_64");

        let epoch = PackageRef::resolved("bash", 1, "5.2", "4", "aarch64");
        assert_eq!(epoch.nevra(), "bash-1:5.2-4.aarch64");
    }

    #[test]
    fn test_materialize_is_one_way() {
        let mut pkg = PackageRef::resolved("zlib", 0, "1.3.1", "2", "x86_64");
        assert!(!pkg.is_binary());

        pkg.materialize(PathBuf::from("/var/cache/quern/zlib-1.3.1-2.x86_64.qpk"));
        assert!(pkg.is_binary());

        // A second materialize must not replace the artifact
        pkg.materialize(PathBuf::from("/elsewhere.qpk"));
        assert_eq!(
            pkg.artifact_path(),
            Some(Path::new("/var/cache/quern/zlib-1.3.1-2.x86_64.qpk"))
        );
    }

    #[test]
    fn test_checksum_attachment() {
        let plain = PackageRef::resolved("zlib", 0, "1.3.1", "2", "x86_64");
        assert!(plain.checksum().is_none());

        let summed = plain.with_checksum("sha256:deadbeef");
        assert_eq!(summed.checksum(), Some("sha256:deadbeef"));
    }

    #[test]
    fn test_post_transaction_phases() {
        assert!(ScriptPhase::PostTransIn.is_post_transaction());
        assert!(ScriptPhase::PostTransUn.is_post_transaction());
        assert!(ScriptPhase::PostTransUp.is_post_transaction());
        assert!(!ScriptPhase::PreIn.is_post_transaction());
        assert!(!ScriptPhase::PostUn.is_post_transaction());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(ScriptPhase::PreIn.to_string(), "pre-install");
        assert_eq!(ScriptPhase::PostUn.to_string(), "post-remove");
        assert_eq!(
            ScriptPhase::PostTransUp.to_string(),
            "post-transaction-upgrade"
        );
    }
}
