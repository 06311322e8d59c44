//! Worker process for cellrun.
//!
//! Hosts one execution unit. Envelopes arrive as JSON lines on stdin and
//! replies go out as JSON lines on stdout, so all logging goes to stderr.
//! The process exits when the host closes stdin or kills it.

use cellrun_core::ScriptInterpreter;
use cellrun_core::runtime::serve_stdio;

fn main() -> anyhow::Result<()> {
    // Stdout carries the protocol, logs must stay on stderr
    let filter = if std::env::var_os("CELLRUN_WORKER_DEBUG").is_some() {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!("cellrun-worker started (pid {})", std::process::id());
    serve_stdio(ScriptInterpreter::new())?;
    tracing::debug!("cellrun-worker exiting");
    Ok(())
}
