// src/cgroup/mod.rs

//! Hierarchical process containment
//!
//! One `CGroup` is a node under a controller root. The build sandbox puts
//! every spawned process tree in a per-build subgroup so that teardown can
//! account for, migrate, and kill orphans without scanning the whole
//! system. Signaling follows an escalating protocol: SIGTERM for most of
//! the timeout window, SIGKILL for the remainder.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, getpid};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Membership file inside each cgroup directory.
const PROCS_FILE: &str = "cgroup.procs";

/// Polling interval for the kill protocol.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fraction of the kill window spent on SIGTERM before escalating.
const TERM_FRACTION: f64 = 0.9;

/// Migration rounds allowed before declaring no progress.
const MAX_MIGRATE_ROUNDS: usize = 16;

/// Pick the signal for the escalation schedule: SIGTERM for roughly the
/// first 90% of the window, SIGKILL thereafter.
pub(crate) fn signal_for(elapsed: Duration, timeout: Duration) -> Signal {
    if elapsed < timeout.mul_f64(TERM_FRACTION) {
        Signal::SIGTERM
    } else {
        Signal::SIGKILL
    }
}

/// One node of a controller-rooted cgroup hierarchy.
#[derive(Debug, Clone)]
pub struct CGroup {
    path: PathBuf,
}

impl CGroup {
    /// Open (creating if needed) the controller root node.
    pub fn new(controller_root: impl Into<PathBuf>) -> Result<Self> {
        let path = controller_root.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a child node. Idempotent: an existing directory is reused.
    pub fn create_subgroup(&self, name: &str) -> Result<CGroup> {
        let path = self.path.join(name);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("cgroup {} already exists", path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(CGroup { path })
    }

    fn parent(&self) -> Option<CGroup> {
        self.path.parent().map(|p| CGroup {
            path: p.to_path_buf(),
        })
    }

    fn procs_path(&self) -> PathBuf {
        self.path.join(PROCS_FILE)
    }

    /// Move a PID into this group.
    pub fn attach(&self, pid: Pid) -> Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .open(self.procs_path())?;
        writeln!(f, "{}", pid)?;
        Ok(())
    }

    /// Move the calling process out of this group into the parent. The
    /// kill protocol runs this first so the caller never signals itself.
    pub fn detach_self(&self) -> Result<()> {
        match self.parent() {
            Some(parent) => parent.attach(getpid()),
            None => Ok(()),
        }
    }

    /// PIDs currently attached to this node. A missing membership file
    /// reads as empty: the group is gone, so it has no members.
    pub fn pids(&self) -> Result<Vec<Pid>> {
        let content = match fs::read_to_string(self.procs_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|l| l.trim().parse::<i32>().ok())
            .map(Pid::from_raw)
            .collect())
    }

    /// Move every member to `target`, looping because members may spawn
    /// children mid-migration. Bounded: a round that moves nothing while
    /// members remain terminates the attempt.
    pub fn migrate(&self, target: &CGroup) -> Result<()> {
        for _ in 0..MAX_MIGRATE_ROUNDS {
            let members = self.pids()?;
            if members.is_empty() {
                return Ok(());
            }

            let mut moved = 0usize;
            for pid in &members {
                match target.attach(*pid) {
                    Ok(()) => moved += 1,
                    // Exited between listing and writing: progress, not failure
                    Err(Error::Io(e)) if e.raw_os_error() == Some(libc::ESRCH) => moved += 1,
                    Err(e) => return Err(e),
                }
            }

            if moved == 0 {
                return Err(Error::CGroup {
                    path: self.path.clone(),
                    message: format!(
                        "no progress migrating {} members to {}",
                        members.len(),
                        target.path.display()
                    ),
                });
            }
        }

        Err(Error::CGroup {
            path: self.path.clone(),
            message: format!("migration did not converge after {MAX_MIGRATE_ROUNDS} rounds"),
        })
    }

    /// Migrate remaining members to the parent, then remove the directory.
    /// A busy removal is tolerated: the kernel will reap the empty node.
    pub fn destroy(self) -> Result<()> {
        if let Some(parent) = self.parent() {
            self.migrate(&parent)?;
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                warn!("cgroup {} busy on removal, leaving it", self.path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Escalating kill of every member: detach self, then SIGTERM for
    /// roughly the first 90% of the window and SIGKILL thereafter, polling
    /// until no members remain. ESRCH races are ignored. The window always
    /// closes with a SIGKILL pass, even when it is shorter than one polling
    /// interval; members that survive it are reported, not retried further.
    pub fn killall(&self, timeout: Duration) -> Result<()> {
        self.detach_self()?;
        let start = Instant::now();

        loop {
            let members = self.pids()?;
            if members.is_empty() {
                return Ok(());
            }

            if start.elapsed() >= timeout {
                // The window may expire before the schedule ever reached
                // SIGKILL; one last pass before declaring survivors
                for pid in &members {
                    match signal::kill(*pid, Signal::SIGKILL) {
                        Ok(()) => {}
                        Err(Errno::ESRCH) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                thread::sleep(KILL_POLL_INTERVAL);

                let survivors = self.pids()?;
                if survivors.is_empty() {
                    return Ok(());
                }
                return Err(Error::CGroup {
                    path: self.path.clone(),
                    message: format!(
                        "{} processes survived the kill protocol",
                        survivors.len()
                    ),
                });
            }

            let sig = signal_for(start.elapsed(), timeout);
            debug!(
                "signaling {} members of {} with {:?}",
                members.len(),
                self.path.display(),
                sig
            );
            for pid in members {
                match signal::kill(pid, sig) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            thread::sleep(KILL_POLL_INTERVAL);
        }
    }
}
