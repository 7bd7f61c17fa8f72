// src/transaction/mod.rs

//! Transaction engine
//!
//! Turns the dependency resolver's ordered decision list into a
//! phase-partitioned sequence of [`Action`]s. Each resolver step expands
//! through a fixed template table; the resulting actions are partitioned
//! into an immediate list and a deferred (post-transaction) list, each
//! preserving step order. Final execution order is immediate followed by
//! deferred, so every package's core filesystem work completes before any
//! package's post-transaction hooks run.
//!
//! A `Transaction` is built once, read-only afterwards (downloads only
//! materialize artifacts in place), and discarded after execution.

mod action;
mod executor;

pub use action::{Action, ActionKind};
pub use executor::{ActionFailure, ExecutionReport, TransactionExecutor};

use crate::db::PackageDb;
use crate::error::Result;
use crate::packages::{ArchiveLoader, PackageRef, ScriptPhase};
use crate::repository::Repository;
use std::path::PathBuf;
use std::time::Duration;
use strum_macros::Display;
use tracing::debug;

/// Default execution window for one scriptlet.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Kind of one resolver decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StepKind {
    Install,
    Reinstall,
    Update,
    Downgrade,
    Erase,
    Cleanup,
    Change,
}

/// One resolved decision handed over by the external dependency resolver.
#[derive(Debug, Clone)]
pub struct ResolverStep {
    pub kind: StepKind,
    pub package: PackageRef,
}

impl ResolverStep {
    pub fn new(kind: StepKind, package: PackageRef) -> Self {
        Self { kind, package }
    }
}

use ScriptPhase::{PostIn, PostTransIn, PostTransUn, PostTransUp, PostUn, PostUp, PreIn, PreUn, PreUp};

/// Ordered action template for each step kind. Scriptlet hooks bracket the
/// filesystem work; cleanup and change steps carry no hooks of their own
/// because the update that displaced the package already ran them.
pub fn template(kind: StepKind) -> &'static [ActionKind] {
    match kind {
        StepKind::Install => &[
            ActionKind::Script(PreIn),
            ActionKind::Install,
            ActionKind::Script(PostIn),
            ActionKind::Script(PostTransIn),
        ],
        StepKind::Reinstall => &[
            ActionKind::Script(PreIn),
            ActionKind::Reinstall,
            ActionKind::Script(PostIn),
            ActionKind::Script(PostTransIn),
        ],
        StepKind::Update => &[
            ActionKind::Script(PreUp),
            ActionKind::Update,
            ActionKind::Script(PostUp),
            ActionKind::Script(PostTransUp),
        ],
        StepKind::Downgrade => &[
            ActionKind::Script(PreUp),
            ActionKind::Downgrade,
            ActionKind::Script(PostUp),
            ActionKind::Script(PostTransUp),
        ],
        StepKind::Erase => &[
            ActionKind::Script(PreUn),
            ActionKind::Remove,
            ActionKind::Script(PostUn),
            ActionKind::Script(PostTransUn),
        ],
        StepKind::Cleanup => &[ActionKind::Cleanup],
        StepKind::Change => &[ActionKind::Change],
    }
}

/// Collaborators every action runs against.
pub struct TransactionContext<'a> {
    /// Target root the transaction mutates
    pub root: PathBuf,
    pub db: &'a PackageDb,
    pub repository: &'a dyn Repository,
    pub loader: &'a dyn ArchiveLoader,
    pub script_timeout: Duration,
}

impl<'a> TransactionContext<'a> {
    pub fn new(
        root: impl Into<PathBuf>,
        db: &'a PackageDb,
        repository: &'a dyn Repository,
        loader: &'a dyn ArchiveLoader,
    ) -> Self {
        Self {
            root: root.into(),
            db,
            repository,
            loader,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

/// An ordered, finalized plan of actions.
pub struct Transaction {
    immediate: Vec<Action>,
    deferred: Vec<Action>,
    install_size_delta: i64,
}

impl Transaction {
    pub fn immediate(&self) -> &[Action] {
        &self.immediate
    }

    pub fn deferred(&self) -> &[Action] {
        &self.deferred
    }

    /// Net change in installed bytes this transaction will cause.
    pub fn install_size_delta(&self) -> i64 {
        self.install_size_delta
    }

    /// All actions in execution order: immediate first, then deferred.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.immediate.iter().chain(self.deferred.iter())
    }

    pub(crate) fn actions_mut(&mut self) -> impl Iterator<Item = &mut Action> {
        self.immediate.iter_mut().chain(self.deferred.iter_mut())
    }

    pub fn len(&self) -> usize {
        self.immediate.len() + self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.immediate.is_empty() && self.deferred.is_empty()
    }
}

/// Expands resolver steps through the template table into a `Transaction`.
pub struct TransactionBuilder<'a> {
    repository: &'a dyn Repository,
    loader: &'a dyn ArchiveLoader,
    db: &'a PackageDb,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(
        repository: &'a dyn Repository,
        loader: &'a dyn ArchiveLoader,
        db: &'a PackageDb,
    ) -> Self {
        Self {
            repository,
            loader,
            db,
        }
    }

    pub fn build(&self, steps: &[ResolverStep]) -> Result<Transaction> {
        let mut immediate = Vec::new();
        let mut deferred = Vec::new();
        let mut install_size_delta = 0i64;

        for step in steps {
            install_size_delta += self.size_delta(step)?;

            for kind in template(step.kind) {
                let action = Action::new(*kind, step.package.clone(), self.repository);
                if action.is_deferred() {
                    deferred.push(action);
                } else {
                    immediate.push(action);
                }
            }
        }

        debug!(
            "built transaction: {} immediate, {} deferred, {:+} bytes",
            immediate.len(),
            deferred.len(),
            install_size_delta
        );
        Ok(Transaction {
            immediate,
            deferred,
            install_size_delta,
        })
    }

    fn size_delta(&self, step: &ResolverStep) -> Result<i64> {
        match step.kind {
            StepKind::Install | StepKind::Reinstall | StepKind::Update | StepKind::Downgrade => {
                if step.package.is_binary() {
                    Ok(self.loader.open(&step.package)?.install_size() as i64)
                } else {
                    // Not yet fetched: the transfer size is the best estimate
                    Ok(self.repository.download_size(&step.package) as i64)
                }
            }
            StepKind::Erase | StepKind::Cleanup => Ok(self
                .db
                .lookup(&step.package.name)?
                .map(|p| -p.install_size)
                .unwrap_or(0)),
            StepKind::Change => Ok(0),
        }
    }
}
