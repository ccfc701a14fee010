//! Drive a user program against a run
//!
//! The program receives the root [`Scope`] and declares resources on it.
//! When it returns `Ok` the run is finished (orphans deleted); when it
//! fails, or the process receives Ctrl-C, the run is aborted and shutdown
//! cleanups execute.

use anyhow::{Context, Result};
use declarative::{Run, RunReport, Scope};
use std::future::Future;

/// Run `program` to completion, aborting on Ctrl-C
pub async fn run_program<F, Fut>(run: Run, program: F) -> Result<RunReport>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    run_program_until(run, program, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Could not listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    })
    .await
}

/// Like [`run_program`], with an arbitrary interrupt signal
pub async fn run_program_until<F, Fut, S>(run: Run, program: F, interrupt: S) -> Result<RunReport>
where
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<()>>,
    S: Future<Output = ()>,
{
    let stage = run.stage().to_string();
    let root = run.root().clone();

    let outcome = tokio::select! {
        result = program(root) => Some(result),
        () = interrupt => None,
    };

    match outcome {
        Some(Ok(())) => run
            .finish()
            .await
            .with_context(|| format!("Failed to finish run for {stage}")),
        Some(Err(e)) => {
            let report = run.abort().await;
            log::error!(
                "Program failed for {stage}; aborted after {} change(s)",
                report.summary.total_changes()
            );
            Err(e.context(format!("Program failed for {stage}")))
        }
        None => {
            let report = run.abort().await;
            log::warn!(
                "Interrupted; aborted run for {stage} after {} change(s)",
                report.summary.total_changes()
            );
            Err(declarative::Error::Aborted(format!("run for {stage} was interrupted")).into())
        }
    }
}
