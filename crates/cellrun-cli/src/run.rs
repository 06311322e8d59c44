//! Run command implementation for cellrun CLI.
//!
//! Starts a unit, submits the code and streams its output to stdout. Ctrl-C
//! interrupts the execution rather than killing the CLI; the unit's own
//! watchdog takes over if the code does not stop.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use cellrun_core::{
    CancellationOutcome, ExecutionHost, ExecutionResult, ExecutionState, HostConfig,
    InterruptStatus,
};

use crate::UnitOptions;
use crate::colors;

/// Exit code for interrupted executions (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

/// Run a script file.
pub async fn execute_file(
    path: &Path,
    config: &HostConfig,
    unit: &UnitOptions,
) -> anyhow::Result<ExitCode> {
    let code = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    execute(&code, &path.display().to_string(), config, unit).await
}

/// Run `code`, labelled `source` in logs.
pub async fn execute(
    code: &str,
    source: &str,
    config: &HostConfig,
    unit: &UnitOptions,
) -> anyhow::Result<ExitCode> {
    let start = Instant::now();

    let host = ExecutionHost::new(unit.spawner()?, config.clone());
    host.initialize().await?;
    tracing::debug!("Running {} with {} interrupts", source, host.strategy());

    let printed = Arc::new(AtomicUsize::new(0));
    let echo = Arc::clone(&printed);
    let mut pending = host.submit_with(code, move |output: &[String], _: Option<&str>| {
        // Callbacks carry the whole output so far; print only what is new.
        let already = echo.swap(output.len(), Ordering::SeqCst).min(output.len());
        let mut stdout = std::io::stdout().lock();
        for fragment in &output[already..] {
            let _ = stdout.write_all(fragment.as_bytes());
        }
        let _ = stdout.flush();
    });

    let result = tokio::select! {
        result = &mut pending => result,
        _ = tokio::signal::ctrl_c() => {
            match host.interrupt_current() {
                InterruptStatus::Signaled(strategy) => eprintln!(
                    "\n{}Interrupting{} via {}",
                    colors::YELLOW,
                    colors::RESET,
                    strategy
                ),
                other => tracing::debug!("Interrupt had no effect: {:?}", other),
            }
            (&mut pending).await
        }
    };

    host.shutdown();
    Ok(report(&result, start.elapsed()))
}

fn report(result: &ExecutionResult, elapsed: Duration) -> ExitCode {
    if result.output.last().is_some_and(|last| !last.ends_with('\n')) {
        println!();
    }

    match result.state {
        ExecutionState::Complete => {
            eprintln!(
                "{}Completed{} in {:.2}s",
                colors::GREEN,
                colors::RESET,
                elapsed.as_secs_f64()
            );
            ExitCode::SUCCESS
        }
        ExecutionState::Cancelled => {
            let detail = match result.cancellation {
                Some(CancellationOutcome::Acknowledged) | None => "",
                Some(CancellationOutcome::Assumed) => " (unconfirmed)",
                Some(CancellationOutcome::Forced) => " (unit was reset)",
            };
            eprintln!(
                "{}Cancelled{}{} after {:.2}s",
                colors::YELLOW,
                colors::RESET,
                detail,
                elapsed.as_secs_f64()
            );
            ExitCode::from(EXIT_INTERRUPTED)
        }
        _ => {
            eprintln!(
                "{}Error:{} {}",
                colors::RED,
                colors::RESET,
                result.error.as_deref().unwrap_or("unknown error")
            );
            ExitCode::FAILURE
        }
    }
}
