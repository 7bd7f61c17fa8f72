// src/build/mod.rs

//! Sandboxed package builds
//!
//! The orchestrator drives one build end to end: acquire a locked chroot
//! environment and a per-build cgroup, provision build dependencies
//! through the transaction engine, run the recipe's stages under a
//! deadline, post-process the staged install tree, and package the result
//! as a compressed archive. The environment can also be snapshotted to a
//! cache archive and restored later, skipping live mountpoints.

pub mod recipe;

pub use recipe::{BuildRecipe, BuildStage};

use crate::cgroup::CGroup;
use crate::chroot::{ChrootConfig, ChrootEnvironment, LOCK_FILE, StagedScript, run_in_root};
use crate::db::PackageDb;
use crate::error::{Error, Result};
use crate::packages::{ArchiveLoader, PackageRef};
use crate::progress::ProgressTracker;
use crate::repository::Repository;
use crate::transaction::{ResolverStep, TransactionBuilder, TransactionContext, TransactionExecutor};
use glob::Pattern;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Root-relative staging directory the install stage populates.
const RESULT_DIR: &str = "result";

/// Root-relative directory stage scripts run in.
const BUILD_DIR: &str = "build";

/// Window granted to the cgroup kill protocol after a stage timeout.
const STAGE_KILL_WINDOW: Duration = Duration::from_secs(10);

const OBJCOPY_TIMEOUT: Duration = Duration::from_secs(120);
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Configuration of one build invocation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build-root directory, created if absent
    pub root: PathBuf,
    pub target_arch: String,
    /// Where finished package archives land
    pub output_dir: PathBuf,
    pub stage_timeout: Duration,
    /// Host ccache directory bind-mounted into the environment
    pub ccache_dir: Option<PathBuf>,
    /// Cgroup controller root the per-build subgroup hangs under
    pub controller_root: PathBuf,
    pub jobs: usize,
}

impl BuildConfig {
    pub fn new(root: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            target_arch: std::env::consts::ARCH.to_string(),
            output_dir: output_dir.into(),
            stage_timeout: Duration::from_secs(3600),
            ccache_dir: None,
            controller_root: PathBuf::from("/sys/fs/cgroup/quern"),
            jobs: 1,
        }
    }
}

/// What one completed build produced.
#[derive(Debug)]
pub struct BuildArtifacts {
    pub package: PathBuf,
    pub install_size: u64,
}

/// Drives one package build inside a locked, disposable environment.
pub struct BuildOrchestrator {
    config: BuildConfig,
    recipe: BuildRecipe,
    env: ChrootEnvironment,
    cgroup: CGroup,
    db: PackageDb,
}

impl BuildOrchestrator {
    /// Acquire the build root and the per-build cgroup. Fails fast with
    /// `BuildRootLocked` when the root is already in use.
    pub fn new(recipe: BuildRecipe, config: BuildConfig) -> Result<Self> {
        let env_vars = compose_env(&recipe, &config);
        let chroot_config = ChrootConfig {
            env: env_vars,
            cache_dir: config.ccache_dir.clone(),
            ..ChrootConfig::new(&config.root)
        };
        let env = ChrootEnvironment::new(chroot_config)?;

        let cgroup = CGroup::new(&config.controller_root)?
            .create_subgroup(&format!("build-{}", recipe.package.name))?;
        let db = PackageDb::open(&config.root)?;

        Ok(Self {
            config,
            recipe,
            env,
            cgroup,
            db,
        })
    }

    pub fn root(&self) -> &Path {
        self.env.root()
    }

    pub fn db(&self) -> &PackageDb {
        &self.db
    }

    /// Install the recipe's build dependencies into the environment
    /// through the transaction engine. Any failed action fails the build.
    pub fn provision(
        &self,
        steps: &[ResolverStep],
        repository: &dyn Repository,
        loader: &dyn ArchiveLoader,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        let builder = TransactionBuilder::new(repository, loader, &self.db);
        let mut tx = builder.build(steps)?;
        info!(
            "provisioning {} with {} actions ({:+} bytes)",
            self.recipe.package.name,
            tx.len(),
            tx.install_size_delta()
        );

        let ctx = TransactionContext::new(&self.config.root, &self.db, repository, loader);
        let report = TransactionExecutor::run(&mut tx, &ctx, progress)?;
        if !report.succeeded() {
            return Err(Error::Build(format!(
                "{} of {} provisioning actions failed",
                report.failures.len(),
                report.attempted
            )));
        }
        Ok(())
    }

    /// Start the environment, run every stage, post-process, and package.
    /// The caller must still invoke `stop()` afterwards, including when
    /// this returns an error.
    pub fn build(&mut self) -> Result<BuildArtifacts> {
        self.env.start()?;
        fs::create_dir_all(self.config.root.join(BUILD_DIR))?;
        fs::create_dir_all(self.config.root.join(RESULT_DIR))?;

        for stage in BuildStage::ALL {
            let Some(script) = self.recipe.render_stage_script(stage) else {
                debug!("no {} stage for {}", stage, self.recipe.package.name);
                continue;
            };
            self.run_stage(stage, &script)?;
        }

        self.post_process()?;
        self.package_results()
    }

    fn run_stage(&self, stage: BuildStage, script: &str) -> Result<()> {
        info!("{}: {} stage", self.recipe.package.name, stage);
        let staged = StagedScript::create(&self.config.root, &stage.to_string(), script.as_bytes())?;

        // Spoof the reported machine when cross-building
        let host_arch = std::env::consts::ARCH;
        let (program, args): (&str, Vec<&str>) = if self.config.target_arch != host_arch {
            (
                "/usr/bin/setarch",
                vec![&self.config.target_arch, "/bin/sh", staged.inner_path()],
            )
        } else {
            ("/bin/sh", vec![staged.inner_path()])
        };

        let outcome = run_in_root(
            &self.config.root,
            program,
            &args,
            self.env.env_vars(),
            Some(&self.cgroup),
            self.config.stage_timeout,
        )?;

        match outcome {
            Some(out) if out.success() => {
                for line in out.stdout.lines() {
                    debug!("{}: {}", stage, line);
                }
                Ok(())
            }
            Some(out) => {
                let tail: Vec<&str> = out.stderr.lines().rev().take(10).collect();
                Err(Error::Build(format!(
                    "{} stage exited {}: {}",
                    stage,
                    out.code,
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                )))
            }
            None => {
                // The stage's session is dead; sweep daemonized survivors
                if let Err(e) = self.cgroup.killall(STAGE_KILL_WINDOW) {
                    warn!("post-timeout sweep incomplete: {}", e);
                }
                Err(Error::Build(format!(
                    "{} stage timed out after {}s",
                    stage,
                    self.config.stage_timeout.as_secs()
                )))
            }
        }
    }

    /// Fixed post-processing pass over the staged install tree. Man-page
    /// compression and static-library pruning are warn-only; debug-info
    /// extraction failure fails the build.
    fn post_process(&self) -> Result<()> {
        let result = self.config.root.join(RESULT_DIR);

        match compress_man_pages(&result) {
            Ok(n) if n > 0 => debug!("compressed {} man pages", n),
            Ok(_) => {}
            Err(e) => warn!("man-page compression failed: {}", e),
        }

        let keep: Vec<Pattern> = self
            .recipe
            .options
            .keep_static_libs
            .iter()
            .filter_map(|g| Pattern::new(g).ok())
            .collect();
        match prune_static_libs(&result, &keep) {
            Ok(n) if n > 0 => debug!("pruned {} static libraries", n),
            Ok(_) => {}
            Err(e) => warn!("static-library pruning failed: {}", e),
        }

        self.extract_debug_info(&result)
    }

    /// Split debug info out of every ELF object in the staged tree into
    /// `/usr/lib/debug`, then strip the originals.
    fn extract_debug_info(&self, result: &Path) -> Result<()> {
        let targets = elf_objects(result)?;
        if targets.is_empty() {
            return Ok(());
        }
        if !self.config.root.join("usr/bin/objcopy").exists() {
            return Err(Error::Build(format!(
                "{} ELF objects staged but no objcopy in the environment",
                targets.len()
            )));
        }

        for target in targets {
            let rel = target
                .strip_prefix(&self.config.root)
                .map_err(|_| Error::Build(format!("{} escapes the root", target.display())))?;
            let inner = format!("/{}", rel.display());
            let debug_inner = format!(
                "/{}/usr/lib/debug/{}.debug",
                RESULT_DIR,
                rel.strip_prefix(RESULT_DIR).unwrap_or(rel).display()
            );
            let debug_host = self.config.root.join(debug_inner.trim_start_matches('/'));
            if let Some(parent) = debug_host.parent() {
                fs::create_dir_all(parent)?;
            }

            self.objcopy(&["--only-keep-debug", &inner, &debug_inner])?;
            self.objcopy(&["--strip-debug", &inner])?;
        }
        Ok(())
    }

    fn objcopy(&self, args: &[&str]) -> Result<()> {
        match run_in_root(
            &self.config.root,
            "/usr/bin/objcopy",
            args,
            self.env.env_vars(),
            Some(&self.cgroup),
            OBJCOPY_TIMEOUT,
        )? {
            Some(out) if out.success() => Ok(()),
            Some(out) => Err(Error::Build(format!(
                "objcopy {} exited {}: {}",
                args.join(" "),
                out.code,
                out.stderr.trim()
            ))),
            None => Err(Error::Build("objcopy timed out".to_string())),
        }
    }

    /// Archive the staged install tree into the output directory.
    fn package_results(&self) -> Result<BuildArtifacts> {
        let result = self.config.root.join(RESULT_DIR);
        fs::create_dir_all(&self.config.output_dir)?;

        let pkg = PackageRef::resolved(
            &self.recipe.package.name,
            self.recipe.package.epoch,
            &self.recipe.package.version,
            &self.recipe.package.release,
            &self.config.target_arch,
        );
        let dest = self.config.output_dir.join(pkg.filename());

        let install_size = archive_tree(&result, &dest, &[])?;
        info!("packaged {} ({} bytes installed)", dest.display(), install_size);
        Ok(BuildArtifacts {
            package: dest,
            install_size,
        })
    }

    /// Snapshot the whole environment to a cache archive, skipping any
    /// subtree rooted at a live mountpoint.
    pub fn export_cache(&self, dest: &Path) -> Result<()> {
        let mounts = fs::read_to_string("/proc/mounts").unwrap_or_default();
        let skip = mountpoints_under(&self.config.root, &mounts);
        info!(
            "exporting environment cache to {} ({} live mountpoints skipped)",
            dest.display(),
            skip.len()
        );
        archive_tree(&self.config.root, dest, &skip)?;
        Ok(())
    }

    /// Restore an environment snapshot into the root and refresh the
    /// installed-package view, which the import replaced on disk.
    pub fn import_cache(&mut self, archive: &Path) -> Result<()> {
        info!("importing environment cache from {}", archive.display());
        let file = File::open(archive)?;
        let decoder = zstd::Decoder::new(file)?;
        tar::Archive::new(decoder).unpack(&self.config.root)?;
        self.db.refresh()?;
        Ok(())
    }

    /// Tear down the cgroup and the environment. Idempotent; every error
    /// past the kill protocol is reported but does not stop teardown.
    pub fn stop(&mut self) -> Result<()> {
        if let Err(e) = self.cgroup.killall(STAGE_KILL_WINDOW) {
            warn!("cgroup sweep incomplete: {}", e);
        }
        if let Err(e) = self.cgroup.clone().destroy() {
            warn!("cgroup removal failed: {}", e);
        }
        self.env.stop()
    }
}

/// Compose the full environment-variable set for stage execution. Nothing
/// here touches the calling process's environment.
fn compose_env(recipe: &BuildRecipe, config: &BuildConfig) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "PATH".to_string(),
        "/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
    );
    env.insert("HOME".to_string(), "/root".to_string());
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env.insert("TERM".to_string(), "dumb".to_string());
    env.insert("MAKEFLAGS".to_string(), format!("-j{}", config.jobs.max(1)));
    env.insert("DESTDIR".to_string(), format!("/{}", RESULT_DIR));
    env.insert("QUERN_TARGET_ARCH".to_string(), config.target_arch.clone());

    if config.ccache_dir.is_some() {
        env.insert(
            "CCACHE_DIR".to_string(),
            "/var/cache/quern-ccache".to_string(),
        );
        env.insert(
            "PATH".to_string(),
            "/usr/lib/ccache:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        );
    }

    for (k, v) in &recipe.environment {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Gzip every uncompressed man page under `usr/share/man`, removing the
/// originals. Returns the number of pages compressed.
fn compress_man_pages(result: &Path) -> Result<usize> {
    let man_root = result.join("usr/share/man");
    if !man_root.is_dir() {
        return Ok(0);
    }

    let mut compressed = 0;
    for entry in WalkDir::new(&man_root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file()
            || path.extension().is_some_and(|e| e == "gz")
        {
            continue;
        }

        let data = fs::read(path)?;
        let out = File::create(path.with_extension(match path.extension() {
            Some(ext) => format!("{}.gz", ext.to_string_lossy()),
            None => "gz".to_string(),
        }))?;
        let mut encoder = flate2::write::GzEncoder::new(out, flate2::Compression::default());
        encoder.write_all(&data)?;
        encoder.finish()?;
        fs::remove_file(path)?;
        compressed += 1;
    }
    Ok(compressed)
}

/// Delete staged static libraries not matched by the keep-list. Returns
/// the number of libraries removed.
fn prune_static_libs(result: &Path, keep: &[Pattern]) -> Result<usize> {
    let mut pruned = 0;
    for entry in WalkDir::new(result).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|e| e != "a") {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if keep.iter().any(|p| p.matches(&name)) {
            debug!("keeping static library {}", name);
            continue;
        }
        fs::remove_file(path)?;
        pruned += 1;
    }
    Ok(pruned)
}

/// Staged ELF objects eligible for debug-info extraction: executable
/// regular files or shared objects, identified by magic.
fn elf_objects(result: &Path) -> Result<Vec<PathBuf>> {
    let mut objects = Vec::new();
    for entry in WalkDir::new(result).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = entry.metadata().map_err(io::Error::from)?;
        let executable = meta.permissions().mode() & 0o111 != 0;
        let shared = path.to_string_lossy().contains(".so");
        if !executable && !shared {
            continue;
        }

        let mut magic = [0u8; 4];
        let mut f = File::open(path)?;
        if f.read(&mut magic)? == 4 && magic == ELF_MAGIC {
            objects.push(path.to_path_buf());
        }
    }
    Ok(objects)
}

/// Mountpoints from a `/proc/mounts` view that live under `root`.
fn mountpoints_under(root: &Path, mounts: &str) -> Vec<PathBuf> {
    let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .map(PathBuf::from)
        .filter(|p| p.starts_with(&canonical))
        .collect()
}

/// /proc/mounts octal-escapes spaces and tabs in mountpoint paths.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let code: String = chars.by_ref().take(3).collect();
            if let Ok(byte) = u8::from_str_radix(&code, 8) {
                out.push(byte as char);
                continue;
            }
            out.push(c);
            out.push_str(&code);
        } else {
            out.push(c);
        }
    }
    out
}

/// Tar+zstd a directory tree into `dest`, skipping `skip` subtrees and
/// the root lock file. Returns the total size of archived regular files.
fn archive_tree(tree: &Path, dest: &Path, skip: &[PathBuf]) -> Result<u64> {
    let canonical_skip: Vec<PathBuf> = skip
        .iter()
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
        .collect();
    let canonical_tree = tree.canonicalize().unwrap_or_else(|_| tree.to_path_buf());

    let file = File::create(dest)?;
    let encoder = zstd::Encoder::new(file, 0)?.auto_finish();
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut total = 0u64;
    let walker = WalkDir::new(&canonical_tree)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !canonical_skip.iter().any(|s| e.path() == s));
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        let path = entry.path();
        let rel = path
            .strip_prefix(&canonical_tree)
            .map_err(|_| Error::Build(format!("{} escapes the tree", path.display())))?;
        if rel == Path::new(LOCK_FILE) {
            continue;
        }

        builder.append_path_with_name(path, rel)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    builder.into_inner()?;
    Ok(total)
}
