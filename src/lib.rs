// src/lib.rs

//! Quern package transaction engine and build sandbox
//!
//! Two tightly coupled subsystems:
//!
//! - The **transaction engine** turns a dependency resolver's decision
//!   list into an ordered, phase-partitioned plan of actions and executes
//!   it against a target root, isolating per-action failures.
//! - The **build sandbox** constructs a locked, disposable chroot with a
//!   full mount lifecycle and cgroup-based process containment, drives
//!   multi-stage recipe builds inside it, and packages the results.
//!
//! Dependency resolution, archive binary formats, and repository metadata
//! are external collaborators consumed through traits.

pub mod build;
pub mod cgroup;
pub mod chroot;
pub mod db;
mod error;
pub mod packages;
pub mod progress;
pub mod repository;
pub mod transaction;

pub use build::{BuildArtifacts, BuildConfig, BuildOrchestrator, BuildRecipe, BuildStage};
pub use cgroup::CGroup;
pub use chroot::{ChrootConfig, ChrootEnvironment, MountSpec, RootOutput, run_in_root};
pub use db::{InstalledPackage, PackageDb};
pub use error::{Error, Result};
pub use packages::{
    ArchiveLoader, FileEntry, FileKind, PackageArchive, PackageRef, Provenance, ScriptPhase,
};
pub use progress::{CliProgress, LogProgress, ProgressTracker, SilentProgress};
pub use repository::{HttpRepository, Repository};
pub use transaction::{
    Action, ActionKind, ExecutionReport, ResolverStep, StepKind, Transaction, TransactionBuilder,
    TransactionContext, TransactionExecutor,
};
