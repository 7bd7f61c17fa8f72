// src/transaction/action.rs

//! Single primitive operations tied to one resolved package
//!
//! Each `Action` is created by the builder, run once, and discarded.
//! Scriptlet actions stage the embedded script into the target root's
//! `/tmp` and execute it there under a bounded timeout; the staged file is
//! removed on every exit path.

use super::TransactionContext;
use crate::chroot::{StagedScript, run_in_root};
use crate::error::{Error, Result};
use crate::packages::{FileEntry, PackageRef, ScriptPhase};
use crate::progress::ProgressTracker;
use crate::repository::{Repository, verify_or_discard};
use std::collections::HashMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Window for the post-extraction ldconfig pass.
const LDCONFIG_TIMEOUT: Duration = Duration::from_secs(60);

/// Closed set of action variants. Scriptlet hooks carry their lifecycle
/// phase; the rest are filesystem or database operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Install,
    Reinstall,
    Update,
    Downgrade,
    Remove,
    Cleanup,
    Change,
    Script(ScriptPhase),
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Reinstall => write!(f, "reinstall"),
            Self::Update => write!(f, "update"),
            Self::Downgrade => write!(f, "downgrade"),
            Self::Remove => write!(f, "remove"),
            Self::Cleanup => write!(f, "cleanup"),
            Self::Change => write!(f, "change"),
            Self::Script(phase) => write!(f, "{}", phase),
        }
    }
}

/// One operation against one package.
pub struct Action {
    kind: ActionKind,
    package: PackageRef,
}

impl Action {
    /// Construct an action, substituting a cached artifact for a
    /// resolver-only reference when the cache already holds a verified
    /// copy. A stale cached file is discarded so `download` refetches it.
    pub fn new(kind: ActionKind, mut package: PackageRef, repository: &dyn Repository) -> Self {
        if !package.is_binary() {
            let filename = package.filename();
            if repository.exists(&filename) {
                let path = repository.abspath(&filename);
                let usable = match package.checksum() {
                    Some(sum) => match verify_or_discard(repository, &path, sum) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("discarding cached {}: {}", filename, e);
                            false
                        }
                    },
                    None => true,
                };
                if usable {
                    debug!("{} satisfied from cache", package);
                    package.materialize(path);
                }
            }
        }
        Self { kind, package }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn package(&self) -> &PackageRef {
        &self.package
    }

    /// Whether this action runs in the deferred (post-transaction) phase.
    pub fn is_deferred(&self) -> bool {
        matches!(self.kind, ActionKind::Script(phase) if phase.is_post_transaction())
    }

    /// Pure function of kind and provenance: only content-bearing kinds
    /// fetch, and only while no concrete artifact backs the reference.
    pub fn needs_download(&self) -> bool {
        let content_bearing = matches!(
            self.kind,
            ActionKind::Install
                | ActionKind::Reinstall
                | ActionKind::Update
                | ActionKind::Downgrade
                | ActionKind::Change
        );
        content_bearing && !self.package.is_binary()
    }

    /// Fetch and verify the artifact if needed. Idempotent: once the
    /// reference is backed by a concrete artifact this is a no-op. A
    /// checksum mismatch discards the fetched file and leaves the
    /// reference unmaterialized.
    pub fn download(
        &mut self,
        repository: &dyn Repository,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        if !self.needs_download() {
            return Ok(());
        }
        let path = repository.download(&self.package, progress)?;
        if let Some(sum) = self.package.checksum() {
            verify_or_discard(repository, &path, sum)?;
        }
        self.package.materialize(path);
        Ok(())
    }

    pub fn run(&self, ctx: &TransactionContext<'_>) -> Result<()> {
        info!("{} {}", self.kind, self.package);
        match self.kind {
            ActionKind::Install
            | ActionKind::Reinstall
            | ActionKind::Update
            | ActionKind::Downgrade => self.run_extract(ctx),
            ActionKind::Remove => self.run_remove(ctx, false),
            ActionKind::Cleanup => self.run_remove(ctx, true),
            ActionKind::Change => self.run_change(ctx),
            ActionKind::Script(phase) => self.run_scriptlet(ctx, phase),
        }
    }

    /// Register, extract, and refresh the linker cache when shared
    /// libraries landed.
    fn run_extract(&self, ctx: &TransactionContext<'_>) -> Result<()> {
        let archive = ctx.loader.open(&self.package)?;
        ctx.db.add_package(&self.package, archive.install_size() as i64)?;
        archive.extract(&ctx.root)?;

        if touches_linker_cache(archive.files()) {
            self.run_ldconfig(ctx)?;
        }
        Ok(())
    }

    /// Remove or clean up the package's files, then unregister it. Both
    /// paths end in the same terminal state and tolerate either order.
    fn run_remove(&self, ctx: &TransactionContext<'_>, displaced: bool) -> Result<()> {
        let archive = ctx.loader.open(&self.package)?;
        if displaced {
            archive.cleanup(&ctx.root)?;
        } else {
            archive.remove(&ctx.root)?;
        }
        ctx.db.remove_package(&self.package)?;
        Ok(())
    }

    /// Re-register metadata for a package whose contents are unchanged.
    fn run_change(&self, ctx: &TransactionContext<'_>) -> Result<()> {
        let archive = ctx.loader.open(&self.package)?;
        ctx.db.add_package(&self.package, archive.install_size() as i64)?;
        Ok(())
    }

    fn run_ldconfig(&self, ctx: &TransactionContext<'_>) -> Result<()> {
        let Some(ldconfig) = ldconfig_path(&ctx.root) else {
            debug!("no ldconfig in {}, skipping", ctx.root.display());
            return Ok(());
        };
        match run_in_root(
            &ctx.root,
            &ldconfig,
            &[],
            &HashMap::new(),
            None,
            LDCONFIG_TIMEOUT,
        )? {
            Some(out) if out.success() => Ok(()),
            Some(out) => {
                // A stale linker cache is recoverable; the install is not rolled back
                warn!("ldconfig in {} exited {}", ctx.root.display(), out.code);
                Ok(())
            }
            None => {
                warn!("ldconfig in {} timed out", ctx.root.display());
                Ok(())
            }
        }
    }

    /// Resolve, verify, stage, and execute one embedded scriptlet. The
    /// staged file is deleted on success, failure, and timeout alike.
    fn run_scriptlet(&self, ctx: &TransactionContext<'_>, phase: ScriptPhase) -> Result<()> {
        let archive = ctx.loader.open(&self.package)?;
        let Some(bytes) = archive.scriptlet(phase) else {
            return Ok(());
        };
        if bytes.is_empty() {
            return Ok(());
        }

        let interpreter = shebang_interpreter(&bytes);
        check_interpreter(&ctx.root, &interpreter)?;

        let script = StagedScript::create(&ctx.root, "scriptlet", &bytes)?;
        let mut envs = HashMap::new();
        envs.insert("QUERN_PACKAGE".to_string(), self.package.name.clone());
        envs.insert("QUERN_VERSION".to_string(), self.package.version.clone());
        envs.insert("QUERN_PHASE".to_string(), phase.to_string());
        envs.insert(
            "PATH".to_string(),
            "/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        );

        let outcome = run_in_root(
            &ctx.root,
            &interpreter,
            &[script.inner_path()],
            &envs,
            None,
            ctx.script_timeout,
        )?;
        // `script` drops here on every path, removing the staged file

        match outcome {
            Some(out) if out.success() => Ok(()),
            Some(out) => {
                let detail = out.stderr.trim();
                Err(Error::Script {
                    phase: phase.to_string(),
                    message: if detail.is_empty() {
                        format!("exited {}", out.code)
                    } else {
                        detail.to_string()
                    },
                })
            }
            None => Err(Error::ScriptTimeout {
                phase: phase.to_string(),
                secs: ctx.script_timeout.as_secs(),
            }),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.package)
    }
}

/// Interpreter named by the scriptlet's shebang line; `/bin/sh` when the
/// scriptlet has none.
fn shebang_interpreter(bytes: &[u8]) -> String {
    let first_line = bytes
        .split(|b| *b == b'\n')
        .next()
        .unwrap_or_default();
    let Some(rest) = first_line.strip_prefix(b"#!") else {
        return "/bin/sh".to_string();
    };
    String::from_utf8_lossy(rest)
        .split_whitespace()
        .next()
        .unwrap_or("/bin/sh")
        .to_string()
}

/// The interpreter must exist and be executable inside the target root
/// before any scriptlet bytes are staged.
fn check_interpreter(root: &std::path::Path, interpreter: &str) -> Result<()> {
    let inside = root.join(interpreter.trim_start_matches('/'));
    let usable = match std::fs::metadata(&inside) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    };
    if usable {
        Ok(())
    } else {
        Err(Error::MissingInterpreter {
            interpreter: interpreter.to_string(),
            root: root.to_path_buf(),
        })
    }
}

/// Whether any extracted file can invalidate the dynamic-linker cache:
/// a `.so` library (bare or versioned) or an ld.so.conf fragment.
fn touches_linker_cache(files: &[FileEntry]) -> bool {
    files.iter().any(|f| {
        f.path.ends_with(".so")
            || f.path.contains(".so.")
            || f.path.starts_with("etc/ld.so.conf")
    })
}

/// The ldconfig binary inside the root, preferring the traditional
/// location with a fallback for merged-usr layouts.
fn ldconfig_path(root: &std::path::Path) -> Option<String> {
    ["sbin/ldconfig", "usr/sbin/ldconfig"]
        .into_iter()
        .find(|rel| root.join(rel).is_file())
        .map(|rel| format!("/{rel}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct DirRepository {
        dir: PathBuf,
    }

    impl Repository for DirRepository {
        fn exists(&self, filename: &str) -> bool {
            self.dir.join(filename).exists()
        }
        fn abspath(&self, filename: &str) -> PathBuf {
            self.dir.join(filename)
        }
        fn verify(&self, path: &Path, checksum: &str) -> Result<bool> {
            let expected = checksum.strip_prefix("sha256:").unwrap_or(checksum);
            Ok(crate::repository::sha256_file(path)?.eq_ignore_ascii_case(expected))
        }
        fn download_size(&self, _package: &PackageRef) -> u64 {
            0
        }
        fn download(
            &self,
            package: &PackageRef,
            _progress: &dyn ProgressTracker,
        ) -> Result<PathBuf> {
            let dest = self.abspath(&package.filename());
            fs::write(&dest, b"artifact")?;
            Ok(dest)
        }
    }

    fn pkg(name: &str) -> PackageRef {
        PackageRef::resolved(name, 0, "1.0", "1", "x86_64")
    }

    #[test]
    fn test_cache_substitution_at_construction() {
        let dir = TempDir::new().unwrap();
        let repo = DirRepository {
            dir: dir.path().to_path_buf(),
        };
        let cached = dir.path().join(pkg("zlib").filename());
        fs::write(&cached, b"x").unwrap();

        let action = Action::new(ActionKind::Install, pkg("zlib"), &repo);
        assert!(action.package().is_binary());
        assert_eq!(action.package().artifact_path(), Some(cached.as_path()));
        assert!(!action.needs_download());
    }

    #[test]
    fn test_needs_download_matrix() {
        let dir = TempDir::new().unwrap();
        let repo = DirRepository {
            dir: dir.path().to_path_buf(),
        };

        for kind in [
            ActionKind::Install,
            ActionKind::Reinstall,
            ActionKind::Update,
            ActionKind::Downgrade,
            ActionKind::Change,
        ] {
            assert!(Action::new(kind, pkg("a"), &repo).needs_download());
        }
        for kind in [
            ActionKind::Remove,
            ActionKind::Cleanup,
            ActionKind::Script(ScriptPhase::PreIn),
            ActionKind::Script(ScriptPhase::PostTransUn),
        ] {
            assert!(!Action::new(kind, pkg("a"), &repo).needs_download());
        }
    }

    #[test]
    fn test_download_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = DirRepository {
            dir: dir.path().to_path_buf(),
        };
        let progress = crate::progress::SilentProgress::new();

        let mut action = Action::new(ActionKind::Install, pkg("zlib"), &repo);
        assert!(action.needs_download());

        action.download(&repo, &progress).unwrap();
        assert!(!action.needs_download());
        let first = action.package().artifact_path().unwrap().to_path_buf();

        // Second call must not fetch again or move the artifact
        fs::remove_file(&first).unwrap();
        action.download(&repo, &progress).unwrap();
        assert!(!first.exists());
        assert_eq!(action.package().artifact_path(), Some(first.as_path()));
    }

    fn artifact_checksum() -> String {
        // DirRepository::download always writes b"artifact"
        use sha2::{Digest, Sha256};
        format!("sha256:{}", hex::encode(Sha256::digest(b"artifact")))
    }

    #[test]
    fn test_corrupt_download_is_discarded() {
        let dir = TempDir::new().unwrap();
        let repo = DirRepository {
            dir: dir.path().to_path_buf(),
        };
        let progress = crate::progress::SilentProgress::new();

        let wrong = pkg("zlib").with_checksum("sha256:deadbeef");
        let mut action = Action::new(ActionKind::Install, wrong, &repo);
        let err = action.download(&repo, &progress).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));

        // The corrupt file is gone and the reference stays unmaterialized
        assert!(!dir.path().join(pkg("zlib").filename()).exists());
        assert!(action.needs_download());

        let good = pkg("zlib").with_checksum(&artifact_checksum());
        let mut action = Action::new(ActionKind::Install, good, &repo);
        action.download(&repo, &progress).unwrap();
        assert!(!action.needs_download());
    }

    #[test]
    fn test_stale_cached_artifact_is_not_substituted() {
        let dir = TempDir::new().unwrap();
        let repo = DirRepository {
            dir: dir.path().to_path_buf(),
        };
        let cached = dir.path().join(pkg("zlib").filename());
        fs::write(&cached, b"truncated transfer").unwrap();

        let action = Action::new(
            ActionKind::Install,
            pkg("zlib").with_checksum(&artifact_checksum()),
            &repo,
        );
        assert!(action.needs_download());
        assert!(!cached.exists());

        // Without a checksum the cached copy is still taken on trust
        fs::write(&cached, b"unverifiable").unwrap();
        let action = Action::new(ActionKind::Install, pkg("zlib"), &repo);
        assert!(!action.needs_download());
    }

    #[test]
    fn test_shebang_parsing() {
        assert_eq!(shebang_interpreter(b"#!/bin/bash\necho hi\n"), "/bin/bash");
        assert_eq!(
            shebang_interpreter(b"#!/usr/bin/env python3\nprint()\n"),
            "/usr/bin/env"
        );
        assert_eq!(shebang_interpreter(b"#!/bin/sh -e\nexit 0\n"), "/bin/sh");
        assert_eq!(shebang_interpreter(b"echo no shebang\n"), "/bin/sh");
        assert_eq!(shebang_interpreter(b""), "/bin/sh");
    }

    #[test]
    fn test_interpreter_check_inside_root() {
        let root = TempDir::new().unwrap();

        let err = check_interpreter(root.path(), "/bin/sh").unwrap_err();
        match err {
            Error::MissingInterpreter { interpreter, .. } => assert_eq!(interpreter, "/bin/sh"),
            other => panic!("unexpected error: {other}"),
        }

        let bin = root.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let sh = bin.join("sh");
        fs::write(&sh, b"#!/bin/true\n").unwrap();

        // Present but not executable still fails
        fs::set_permissions(&sh, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(check_interpreter(root.path(), "/bin/sh").is_err());

        fs::set_permissions(&sh, fs::Permissions::from_mode(0o755)).unwrap();
        check_interpreter(root.path(), "/bin/sh").unwrap();
    }

    #[test]
    fn test_linker_cache_detection() {
        assert!(touches_linker_cache(&[FileEntry::regular(
            "/usr/lib64/libz.so.1.3.1"
        )]));
        assert!(touches_linker_cache(&[FileEntry::regular(
            "/usr/lib64/libz.so"
        )]));
        assert!(touches_linker_cache(&[FileEntry::regular(
            "/etc/ld.so.conf.d/local.conf"
        )]));
        assert!(!touches_linker_cache(&[
            FileEntry::regular("/usr/bin/gzip"),
            FileEntry::regular("/usr/share/man/man1/gzip.1"),
            // ".so" mid-word must not count
            FileEntry::regular("/usr/share/doc/api.sockets.txt"),
            FileEntry::regular("/usr/share/dbus-1/org.freedesktop.resolve1.socket"),
        ]));
    }

    #[test]
    fn test_ldconfig_location_fallback() {
        let root = TempDir::new().unwrap();
        assert_eq!(ldconfig_path(root.path()), None);

        fs::create_dir_all(root.path().join("usr/sbin")).unwrap();
        fs::write(root.path().join("usr/sbin/ldconfig"), b"elf").unwrap();
        assert_eq!(
            ldconfig_path(root.path()),
            Some("/usr/sbin/ldconfig".to_string())
        );

        // The traditional location wins when both exist
        fs::create_dir_all(root.path().join("sbin")).unwrap();
        fs::write(root.path().join("sbin/ldconfig"), b"elf").unwrap();
        assert_eq!(
            ldconfig_path(root.path()),
            Some("/sbin/ldconfig".to_string())
        );
    }

    #[test]
    fn test_deferred_partition_flag() {
        let dir = TempDir::new().unwrap();
        let repo = DirRepository {
            dir: dir.path().to_path_buf(),
        };
        assert!(Action::new(ActionKind::Script(ScriptPhase::PostTransIn), pkg("a"), &repo).is_deferred());
        assert!(!Action::new(ActionKind::Script(ScriptPhase::PostIn), pkg("a"), &repo).is_deferred());
        assert!(!Action::new(ActionKind::Install, pkg("a"), &repo).is_deferred());
    }
}
