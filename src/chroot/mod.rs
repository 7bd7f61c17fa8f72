// src/chroot/mod.rs

//! Disposable chroot build environments
//!
//! A `ChrootEnvironment` owns the mount table, device population, composed
//! environment variables, and the exclusive lock of one build root. Mounts
//! are applied in table order and torn down in exact reverse order;
//! `stop()` terminates any process still rooted in the environment before
//! unmounting, then deletes the tree. Teardown is idempotent and safe
//! against a partially-initialized environment.

use crate::cgroup::{CGroup, signal_for};
use crate::error::{Error, Result};
use fs2::FileExt;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::signal;
use nix::sys::stat::{Mode, SFlag, mknod, stat};
use nix::unistd::{Pid, getpid};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

/// Lock file name at the environment root.
pub const LOCK_FILE: &str = ".lock";

/// Window for terminating processes still rooted in the environment.
const ORPHAN_KILL_TIMEOUT: Duration = Duration::from_secs(10);
const ORPHAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Device nodes cloned (mode and device numbers) from the host.
const DEVICE_NODES: &[&str] = &[
    "null", "zero", "full", "random", "urandom", "tty", "console", "ptmx",
];

/// Symlinks created under `/dev`: (link name, target).
const DEVICE_SYMLINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// DNS resolution files copied from the host.
const DNS_FILES: &[&str] = &["etc/resolv.conf", "etc/hosts"];

/// One entry of the ordered mount table.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    /// Root-relative destination, e.g. `dev/pts`
    pub target: String,
    pub fstype: Option<&'static str>,
    pub flags: MsFlags,
    pub data: Option<String>,
    /// Bind mounts that get an extra read-only remount pass
    pub readonly_remount: bool,
    /// Skipped silently when the host source does not exist
    pub optional: bool,
}

impl MountSpec {
    fn fs(source: &str, target: &str, fstype: &'static str, data: Option<&str>) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            fstype: Some(fstype),
            flags: MsFlags::empty(),
            data: data.map(str::to_string),
            readonly_remount: false,
            optional: false,
        }
    }

    fn bind(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            fstype: None,
            flags: MsFlags::MS_BIND,
            data: None,
            readonly_remount: false,
            optional: false,
        }
    }
}

/// Configuration for one chroot environment.
#[derive(Debug, Clone)]
pub struct ChrootConfig {
    pub root: PathBuf,
    /// Composed environment-variable map for commands run inside
    pub env: HashMap<String, String>,
    /// Mount selinuxfs when the host has it
    pub selinux: bool,
    /// Host directory bind-mounted as a shared compiler cache
    pub cache_dir: Option<PathBuf>,
}

impl ChrootConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            env: HashMap::new(),
            selinux: Path::new("/sys/fs/selinux").exists(),
            cache_dir: None,
        }
    }
}

/// Fixed, ordered mount table for a build root.
fn mount_table(config: &ChrootConfig) -> Vec<MountSpec> {
    let mut table = vec![
        MountSpec::fs("proc", "proc", "proc", None),
        MountSpec {
            readonly_remount: true,
            ..MountSpec::bind("/sys", "sys")
        },
        MountSpec::fs("tmpfs", "dev", "tmpfs", Some("mode=0755")),
        MountSpec::bind("/dev/pts", "dev/pts"),
        MountSpec::fs("tmpfs", "run", "tmpfs", Some("mode=0755")),
    ];
    if config.selinux {
        table.push(MountSpec {
            optional: true,
            ..MountSpec::bind("/sys/fs/selinux", "sys/fs/selinux")
        });
    }
    if let Some(cache) = &config.cache_dir {
        table.push(MountSpec {
            optional: true,
            ..MountSpec::bind(&cache.to_string_lossy(), "var/cache/quern-ccache")
        });
    }
    table
}

/// A build root with its mount lifecycle and exclusive lock.
pub struct ChrootEnvironment {
    config: ChrootConfig,
    mounts: Vec<MountSpec>,
    /// Absolute targets actually mounted, in mount order
    mounted: Vec<PathBuf>,
    lock: Option<File>,
}

impl ChrootEnvironment {
    /// Acquire the root exclusively and prepare the mount plan. Fails fast
    /// with `BuildRootLocked` when another operation holds the root.
    pub fn new(config: ChrootConfig) -> Result<Self> {
        fs::create_dir_all(&config.root)?;

        let lock_file = File::create(config.root.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::BuildRootLocked(config.root.clone()))?;

        let mounts = mount_table(&config);
        Ok(Self {
            config,
            mounts,
            mounted: Vec::new(),
            lock: Some(lock_file),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.config.env
    }

    pub fn mount_table(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Targets that would be unmounted right now, in teardown order
    /// (exact reverse of mount order).
    pub fn teardown_order(&self) -> Vec<&Path> {
        self.mounted.iter().rev().map(PathBuf::as_path).collect()
    }

    /// Mount the special filesystems, populate `/dev`, and copy DNS files.
    pub fn start(&mut self) -> Result<()> {
        info!("starting build environment at {}", self.config.root.display());

        for spec in &self.mounts.clone() {
            if spec.optional && !Path::new(&spec.source).exists() {
                debug!("skipping optional mount {}", spec.source);
                continue;
            }

            let target = self.config.root.join(&spec.target);
            fs::create_dir_all(&target)?;

            mount(
                Some(spec.source.as_str()),
                &target,
                spec.fstype,
                spec.flags,
                spec.data.as_deref(),
            )?;
            self.mounted.push(target.clone());

            if spec.readonly_remount {
                mount(
                    None::<&str>,
                    &target,
                    None::<&str>,
                    MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
                    None::<&str>,
                )?;
            }
        }

        self.populate_dev()?;
        self.copy_dns_files()?;
        Ok(())
    }

    /// Clone the fixed device-node set from the host and create the
    /// standard descriptor symlinks.
    fn populate_dev(&self) -> Result<()> {
        let dev = self.config.root.join("dev");

        for node in DEVICE_NODES {
            let host = Path::new("/dev").join(node);
            let st = match stat(&host) {
                Ok(st) => st,
                Err(e) => {
                    debug!("host device {} unavailable: {}", host.display(), e);
                    continue;
                }
            };
            let kind = SFlag::from_bits_truncate(st.st_mode & libc::S_IFMT);
            let perm = Mode::from_bits_truncate(st.st_mode & 0o7777);
            match mknod(&dev.join(node), kind, perm, st.st_rdev) {
                Ok(()) => {}
                Err(Errno::EEXIST) => {}
                Err(e) => return Err(e.into()),
            }
        }

        for (link, dest) in DEVICE_SYMLINKS {
            let path = dev.join(link);
            if !path.exists() {
                symlink(dest, &path)?;
            }
        }
        Ok(())
    }

    fn copy_dns_files(&self) -> Result<()> {
        for rel in DNS_FILES {
            let host = Path::new("/").join(rel);
            if !host.exists() {
                continue;
            }
            let dest = self.config.root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&host, &dest)?;
        }
        Ok(())
    }

    /// Terminate orphans, unmount everything in reverse, delete the tree.
    /// Safe to call repeatedly and against a partially-initialized
    /// environment.
    pub fn stop(&mut self) -> Result<()> {
        info!("stopping build environment at {}", self.config.root.display());

        if let Err(e) = self.kill_orphans() {
            warn!("orphan termination incomplete: {}", e);
        }

        while let Some(target) = self.mounted.pop() {
            if let Err(e) = umount2(&target, MntFlags::MNT_DETACH) {
                // Busy or already-gone mounts are a best-effort concern
                warn!("unmount {} failed: {}", target.display(), e);
            }
        }

        if self.config.root.exists() {
            fs::remove_dir_all(&self.config.root)?;
        }
        self.lock = None;
        Ok(())
    }

    /// Find host processes whose root resolves into this environment and
    /// terminate them with the escalating signal schedule.
    fn kill_orphans(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let orphans = processes_rooted_in(&self.config.root)?;
            if orphans.is_empty() {
                return Ok(());
            }
            if start.elapsed() >= ORPHAN_KILL_TIMEOUT {
                return Err(Error::Build(format!(
                    "{} processes still rooted in {}",
                    orphans.len(),
                    self.config.root.display()
                )));
            }

            let sig = signal_for(start.elapsed(), ORPHAN_KILL_TIMEOUT);
            for pid in orphans {
                match signal::kill(pid, sig) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            thread::sleep(ORPHAN_POLL_INTERVAL);
        }
    }
}

/// Live PIDs whose `/proc/<pid>/root` resolves to the given root.
fn processes_rooted_in(root: &Path) -> Result<Vec<Pid>> {
    let canonical = match root.canonicalize() {
        Ok(p) => p,
        // Root already deleted: nothing can be rooted in it
        Err(_) => return Ok(Vec::new()),
    };
    let own_pid = getpid();

    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        if Pid::from_raw(pid) == own_pid {
            continue;
        }
        // Processes may vanish mid-scan
        if let Ok(proc_root) = fs::read_link(entry.path().join("root"))
            && proc_root == canonical
        {
            pids.push(Pid::from_raw(pid));
        }
    }
    Ok(pids)
}

/// Output of a command executed inside a root.
#[derive(Debug)]
pub struct RootOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RootOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run a program chrooted into `root` with a cleared, explicitly composed
/// environment and a hard deadline. The child gets its own session so the
/// whole process group can be killed on expiry; `Ok(None)` means the
/// deadline fired and the tree was force-terminated.
pub fn run_in_root(
    root: &Path,
    program: &str,
    args: &[&str],
    envs: &HashMap<String, String>,
    cgroup: Option<&CGroup>,
    timeout: Duration,
) -> Result<Option<RootOutput>> {
    let root_c = CString::new(root.as_os_str().as_bytes())
        .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            if libc::chroot(root_c.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::chdir(c"/".as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let child_pid = Pid::from_raw(child.id() as i32);

    if let Some(cg) = cgroup
        && let Err(e) = cg.attach(child_pid)
    {
        debug!("could not attach {} to {}: {}", child_pid, cg.path().display(), e);
    }

    match child.wait_timeout(timeout)? {
        Some(_) => {
            let output = child.wait_with_output()?;
            Ok(Some(RootOutput {
                code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }))
        }
        None => {
            // Deadline expired: kill the whole session, then reap
            let _ = signal::killpg(child_pid, signal::Signal::SIGKILL);
            let _ = child.kill();
            let _ = child.wait();
            Ok(None)
        }
    }
}

/// A script staged into `<root>/tmp` with owner-only permissions, removed
/// on every exit path via `Drop`.
pub(crate) struct StagedScript {
    host_path: PathBuf,
    inner_path: String,
}

impl StagedScript {
    pub fn create(root: &Path, prefix: &str, contents: &[u8]) -> Result<Self> {
        let dir = root.join("tmp");
        fs::create_dir_all(&dir)?;

        let name = format!("{}-{}", prefix, Uuid::new_v4().simple());
        let host_path = dir.join(&name);
        fs::write(&host_path, contents)?;
        fs::set_permissions(&host_path, fs::Permissions::from_mode(0o700))?;

        Ok(Self {
            host_path,
            inner_path: format!("/tmp/{}", name),
        })
    }

    /// Path of the script as seen from inside the root.
    pub fn inner_path(&self) -> &str {
        &self.inner_path
    }

    #[cfg(test)]
    pub fn host_path(&self) -> &Path {
        &self.host_path
    }
}

impl Drop for StagedScript {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.host_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mount_table_order() {
        let config = ChrootConfig {
            selinux: false,
            cache_dir: None,
            ..ChrootConfig::new("/var/lib/quern/root")
        };
        let table = mount_table(&config);
        let targets: Vec<&str> = table.iter().map(|m| m.target.as_str()).collect();
        // /dev must come before /dev/pts
        assert_eq!(targets, vec!["proc", "sys", "dev", "dev/pts", "run"]);
        assert!(table[1].readonly_remount);
    }

    #[test]
    fn test_mount_table_with_cache() {
        let config = ChrootConfig {
            selinux: false,
            cache_dir: Some(PathBuf::from("/var/cache/ccache")),
            ..ChrootConfig::new("/var/lib/quern/root")
        };
        let table = mount_table(&config);
        let last = table.last().unwrap();
        assert_eq!(last.target, "var/cache/quern-ccache");
        assert!(last.optional);
    }

    #[test]
    fn test_teardown_order_is_reverse_of_mount_order() {
        let dir = TempDir::new().unwrap();
        let mut env = ChrootEnvironment::new(ChrootConfig::new(dir.path().join("root"))).unwrap();

        // Simulate a completed start without privileged mounts
        env.mounted = vec![
            dir.path().join("root/proc"),
            dir.path().join("root/sys"),
            dir.path().join("root/dev"),
            dir.path().join("root/dev/pts"),
            dir.path().join("root/run"),
        ];

        let order = env.teardown_order();
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], dir.path().join("root/run"));
        assert_eq!(order[1], dir.path().join("root/dev/pts"));
        assert_eq!(order[4], dir.path().join("root/proc"));
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");

        let first = ChrootEnvironment::new(ChrootConfig::new(&root)).unwrap();
        let second = ChrootEnvironment::new(ChrootConfig::new(&root));
        match second {
            Err(Error::BuildRootLocked(p)) => assert_eq!(p, root),
            other => panic!("expected BuildRootLocked, got {:?}", other.map(|_| ())),
        }
        // The first environment is unaffected
        assert!(first.root().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_lock_released_after_drop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");

        drop(ChrootEnvironment::new(ChrootConfig::new(&root)).unwrap());
        assert!(ChrootEnvironment::new(ChrootConfig::new(&root)).is_ok());
    }

    #[test]
    fn test_stop_is_idempotent_without_start() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");

        let mut env = ChrootEnvironment::new(ChrootConfig::new(&root)).unwrap();
        env.stop().unwrap();
        assert!(!root.exists());
        // Second stop on an already-deleted environment
        env.stop().unwrap();
    }

    #[test]
    fn test_staged_script_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let host_path;
        {
            let script = StagedScript::create(dir.path(), "qs", b"#!/bin/sh\nexit 0\n").unwrap();
            host_path = script.host_path().to_path_buf();
            assert!(host_path.exists());
            assert!(script.inner_path().starts_with("/tmp/qs-"));

            let mode = fs::metadata(&host_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
        assert!(!host_path.exists());
    }

    #[test]
    fn test_processes_rooted_in_missing_root() {
        assert!(processes_rooted_in(Path::new("/nonexistent/quern-root"))
            .unwrap()
            .is_empty());
    }

    // Requires CAP_SYS_ADMIN for mount/mknod/chroot.
    #[test]
    #[ignore = "requires root privileges"]
    fn test_start_stop_full_lifecycle() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");

        let mut env = ChrootEnvironment::new(ChrootConfig::new(&root)).unwrap();
        env.start().unwrap();
        assert!(root.join("proc/self").exists());
        assert!(root.join("dev/null").exists());
        assert!(root.join("dev/stdin").exists());

        env.stop().unwrap();
        assert!(!root.exists());
    }
}
