// src/transaction/executor.rs

//! Transaction execution with per-action failure isolation
//!
//! The executor fetches every missing artifact up front, then attempts
//! every action in transaction order. A failing action is recorded and
//! logged; execution always continues to the next action, and the report
//! is produced only after every action has been attempted.

use super::{Transaction, TransactionContext};
use crate::error::Result;
use crate::progress::ProgressTracker;
use tracing::{debug, error, info};

/// One recorded action failure.
#[derive(Debug)]
pub struct ActionFailure {
    pub action: String,
    pub package: String,
    pub error: String,
}

/// Outcome of one transaction run.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub attempted: usize,
    pub failures: Vec<ActionFailure>,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct TransactionExecutor;

impl TransactionExecutor {
    /// Fetch every pending artifact sequentially with aggregate progress.
    /// A transaction with nothing to fetch is a silent no-op.
    pub fn download(
        transaction: &mut Transaction,
        ctx: &TransactionContext<'_>,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        let pending: Vec<_> = transaction
            .actions()
            .filter(|a| a.needs_download())
            .map(|a| a.package().clone())
            .collect();
        if pending.is_empty() {
            debug!("nothing to download");
            return Ok(());
        }

        let total: u64 = pending.iter().map(|p| ctx.repository.download_size(p)).sum();
        info!("downloading {} packages, {} bytes", pending.len(), total);
        progress.set_length(total);

        for action in transaction.actions_mut() {
            action.download(ctx.repository, progress)?;
        }
        progress.finish_with_message("downloads complete");
        Ok(())
    }

    /// Download, then attempt every action in order. Per-action failures
    /// never abort the transaction.
    pub fn run(
        transaction: &mut Transaction,
        ctx: &TransactionContext<'_>,
        progress: &dyn ProgressTracker,
    ) -> Result<ExecutionReport> {
        Self::download(transaction, ctx, progress)?;

        let mut report = ExecutionReport::default();
        for action in transaction.actions() {
            report.attempted += 1;
            if let Err(e) = action.run(ctx) {
                error!("{} failed: {}", action, e);
                report.failures.push(ActionFailure {
                    action: action.kind().to_string(),
                    package: action.package().nevra(),
                    error: e.to_string(),
                });
            }
        }

        if report.succeeded() {
            info!("transaction complete: {} actions", report.attempted);
        } else {
            info!(
                "transaction complete: {} actions, {} failed",
                report.attempted,
                report.failures.len()
            );
        }
        Ok(report)
    }
}
