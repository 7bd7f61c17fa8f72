// tests/transaction_order.rs

//! End-to-end transaction properties with mock collaborators: ordering of
//! the immediate/deferred partitions, download idempotence, and per-action
//! failure isolation.

use quern::{
    Action, ActionKind, ArchiveLoader, Error, FileEntry, PackageArchive, PackageDb, PackageRef,
    ProgressTracker, Repository, ResolverStep, Result, ScriptPhase, SilentProgress, StepKind,
    TransactionBuilder, TransactionContext, TransactionExecutor,
};
use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

type OpLog = Rc<RefCell<Vec<String>>>;

/// Route executor logging through the test harness; honors RUST_LOG.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct MockRepository {
    cache: PathBuf,
    fetches: Cell<usize>,
}

impl MockRepository {
    fn new(cache: &Path) -> Self {
        Self {
            cache: cache.to_path_buf(),
            fetches: Cell::new(0),
        }
    }
}

impl Repository for MockRepository {
    fn exists(&self, filename: &str) -> bool {
        self.cache.join(filename).exists()
    }

    fn abspath(&self, filename: &str) -> PathBuf {
        self.cache.join(filename)
    }

    fn verify(&self, _path: &Path, _checksum: &str) -> Result<bool> {
        Ok(true)
    }

    fn download_size(&self, _package: &PackageRef) -> u64 {
        100
    }

    fn download(&self, package: &PackageRef, progress: &dyn ProgressTracker) -> Result<PathBuf> {
        self.fetches.set(self.fetches.get() + 1);
        let dest = self.abspath(&package.filename());
        fs::write(&dest, b"artifact")?;
        progress.increment(100);
        Ok(dest)
    }
}

struct MockArchive {
    name: String,
    files: Vec<FileEntry>,
    log: OpLog,
    fail_remove: bool,
}

impl PackageArchive for MockArchive {
    fn install_size(&self) -> u64 {
        1000
    }

    fn files(&self) -> &[FileEntry] {
        &self.files
    }

    fn extract(&self, _root: &Path) -> Result<()> {
        self.log.borrow_mut().push(format!("extract {}", self.name));
        Ok(())
    }

    fn remove(&self, _root: &Path) -> Result<()> {
        if self.fail_remove {
            return Err(Error::Action(format!("cannot remove {}", self.name)));
        }
        self.log.borrow_mut().push(format!("remove {}", self.name));
        Ok(())
    }

    fn cleanup(&self, _root: &Path) -> Result<()> {
        self.log.borrow_mut().push(format!("cleanup {}", self.name));
        Ok(())
    }

    fn scriptlet(&self, _phase: ScriptPhase) -> Option<Vec<u8>> {
        None
    }
}

struct MockLoader {
    log: OpLog,
    fail_remove_of: Option<String>,
}

impl MockLoader {
    fn new(log: &OpLog) -> Self {
        Self {
            log: Rc::clone(log),
            fail_remove_of: None,
        }
    }
}

impl ArchiveLoader for MockLoader {
    fn open(&self, package: &PackageRef) -> Result<Box<dyn PackageArchive>> {
        Ok(Box::new(MockArchive {
            name: package.name.clone(),
            files: Vec::new(),
            log: Rc::clone(&self.log),
            fail_remove: self.fail_remove_of.as_deref() == Some(&package.name),
        }))
    }
}

fn pkg(name: &str) -> PackageRef {
    PackageRef::resolved(name, 0, "1.0", "1", "x86_64")
}

fn erase_then_install(db: &PackageDb) -> Vec<ResolverStep> {
    db.add_package(&pkg("a"), 1000).unwrap();
    vec![
        ResolverStep::new(StepKind::Erase, pkg("a")),
        ResolverStep::new(StepKind::Install, pkg("b")),
    ]
}

#[test]
fn erase_then_install_runs_core_work_before_deferred_hooks() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = MockRepository::new(dir.path());
    let log: OpLog = Rc::new(RefCell::new(Vec::new()));
    let loader = MockLoader::new(&log);
    let db = PackageDb::in_memory().unwrap();

    let steps = erase_then_install(&db);
    let mut tx = TransactionBuilder::new(&repo, &loader, &db)
        .build(&steps)
        .unwrap();

    // Immediate partition carries all of A's lifecycle before B's
    let immediate: Vec<ActionKind> = tx.immediate().iter().map(Action::kind).collect();
    assert_eq!(
        immediate,
        vec![
            ActionKind::Script(ScriptPhase::PreUn),
            ActionKind::Remove,
            ActionKind::Script(ScriptPhase::PostUn),
            ActionKind::Script(ScriptPhase::PreIn),
            ActionKind::Install,
            ActionKind::Script(ScriptPhase::PostIn),
        ]
    );
    let deferred: Vec<ActionKind> = tx.deferred().iter().map(Action::kind).collect();
    assert_eq!(
        deferred,
        vec![
            ActionKind::Script(ScriptPhase::PostTransUn),
            ActionKind::Script(ScriptPhase::PostTransIn),
        ]
    );

    let ctx = TransactionContext::new(dir.path().join("root"), &db, &repo, &loader);
    let report = TransactionExecutor::run(&mut tx, &ctx, &SilentProgress::new()).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.attempted, 8);
    assert_eq!(*log.borrow(), vec!["remove a", "extract b"]);
    assert!(db.lookup("a").unwrap().is_none());
    assert!(db.lookup("b").unwrap().is_some());
}

#[test]
fn second_download_fetches_nothing() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = MockRepository::new(dir.path());
    let log: OpLog = Rc::new(RefCell::new(Vec::new()));
    let loader = MockLoader::new(&log);
    let db = PackageDb::in_memory().unwrap();

    let steps = vec![ResolverStep::new(StepKind::Install, pkg("b"))];
    let mut tx = TransactionBuilder::new(&repo, &loader, &db)
        .build(&steps)
        .unwrap();
    assert!(tx.actions().any(|a| a.needs_download()));

    let ctx = TransactionContext::new(dir.path().join("root"), &db, &repo, &loader);
    TransactionExecutor::download(&mut tx, &ctx, &SilentProgress::new()).unwrap();
    assert_eq!(repo.fetches.get(), 1);
    assert!(tx.actions().all(|a| !a.needs_download()));

    TransactionExecutor::download(&mut tx, &ctx, &SilentProgress::new()).unwrap();
    assert_eq!(repo.fetches.get(), 1);
}

#[test]
fn one_failing_action_does_not_abort_the_rest() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = MockRepository::new(dir.path());
    let log: OpLog = Rc::new(RefCell::new(Vec::new()));
    let mut loader = MockLoader::new(&log);
    loader.fail_remove_of = Some("a".to_string());
    let db = PackageDb::in_memory().unwrap();

    let steps = erase_then_install(&db);
    let mut tx = TransactionBuilder::new(&repo, &loader, &db)
        .build(&steps)
        .unwrap();

    let ctx = TransactionContext::new(dir.path().join("root"), &db, &repo, &loader);
    let report = TransactionExecutor::run(&mut tx, &ctx, &SilentProgress::new()).unwrap();

    // Every action was attempted despite the failure
    assert_eq!(report.attempted, 8);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].action, "remove");
    assert_eq!(report.failures[0].package, "a-1.0-1.x86_64");

    // B's install still happened after A's failure
    assert_eq!(*log.borrow(), vec!["extract b"]);
    assert!(db.lookup("b").unwrap().is_some());
}

#[test]
fn cached_artifact_is_substituted_at_build_time() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let repo = MockRepository::new(dir.path());
    let log: OpLog = Rc::new(RefCell::new(Vec::new()));
    let loader = MockLoader::new(&log);
    let db = PackageDb::in_memory().unwrap();

    fs::write(dir.path().join(pkg("b").filename()), b"cached").unwrap();

    let steps = vec![ResolverStep::new(StepKind::Install, pkg("b"))];
    let mut tx = TransactionBuilder::new(&repo, &loader, &db)
        .build(&steps)
        .unwrap();
    assert!(tx.actions().all(|a| !a.needs_download()));

    let ctx = TransactionContext::new(dir.path().join("root"), &db, &repo, &loader);
    TransactionExecutor::download(&mut tx, &ctx, &SilentProgress::new()).unwrap();
    assert_eq!(repo.fetches.get(), 0);
}
