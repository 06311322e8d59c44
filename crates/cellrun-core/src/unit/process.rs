//! Process-isolated unit speaking JSON lines over stdio.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{UnitEvent, UnitEventSender, UnitHandle, UnitSpawner};
use crate::error::{Error, Result};
use crate::ipc::{HostMessage, UnitMessage, decode_line, encode_line};

/// Spawns units as child processes.
///
/// The child must speak the envelope protocol on stdin/stdout; its stderr is
/// inherited so worker logs stay visible.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl ProcessSpawner {
    /// Spawn `program` for every unit.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Spawn the bundled `cellrun-worker` binary.
    pub fn worker() -> Result<Self> {
        Ok(Self::new(find_worker_binary()?))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl UnitSpawner for ProcessSpawner {
    fn spawn(&self, events: UnitEventSender) -> Result<Box<dyn UnitHandle>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;
        let pid = child.id();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_commands(stdin, command_rx));
        let reader = tokio::spawn(read_events(stdout, events.clone()));
        tokio::spawn(monitor_child(child, kill_rx, events));

        tracing::debug!("Spawned worker process {:?} ({})", pid, self.program.display());
        Ok(Box::new(ProcessUnit {
            pid,
            commands: Some(commands),
            kill: Some(kill_tx),
            reader,
        }))
    }

    fn supports_shared_memory(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        format!("worker process {}", self.program.display())
    }
}

/// Handle to a worker process.
struct ProcessUnit {
    pid: Option<u32>,
    commands: Option<mpsc::UnboundedSender<HostMessage>>,
    kill: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
}

impl UnitHandle for ProcessUnit {
    fn post(&mut self, message: HostMessage) -> Result<()> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::Ipc("Worker has been killed".to_string()))?;
        commands
            .send(message)
            .map_err(|_| Error::Ipc("Worker stdin is closed".to_string()))
    }

    fn terminate(&mut self) {
        if self.kill.is_none() {
            return;
        }
        tracing::debug!("Killing worker process {:?}", self.pid);
        self.commands = None;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.reader.abort();
    }
}

impl Drop for ProcessUnit {
    fn drop(&mut self) {
        // Ensure worker is killed when handle is dropped
        self.terminate();
    }
}

async fn write_commands(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<HostMessage>) {
    while let Some(message) = rx.recv().await {
        if let HostMessage::SetInterruptBuffer { .. } = message {
            tracing::warn!("Worker processes cannot map the interrupt segment, not sending it");
            continue;
        }
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Dropping {} envelope: {}", message.kind(), e);
                continue;
            }
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!("Failed to write to worker stdin: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!("Failed to flush worker stdin: {}", e);
            break;
        }
    }
}

async fn read_events(stdout: ChildStdout, events: UnitEventSender) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<UnitMessage>(&line) {
                    Ok(message) => {
                        if events.send(UnitEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!("Skipping unparseable worker output: {}", e),
                }
            }
            Ok(None) => {
                let _ = events.send(UnitEvent::Exited {
                    reason: "worker closed its stdout".to_string(),
                });
                return;
            }
            Err(e) => {
                let _ = events.send(UnitEvent::Exited {
                    reason: format!("failed to read worker stdout: {}", e),
                });
                return;
            }
        }
    }
}

async fn monitor_child(mut child: Child, kill: oneshot::Receiver<()>, events: UnitEventSender) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("worker exited with {}", status),
                Err(e) => format!("failed to wait for worker: {}", e),
            };
            let _ = events.send(UnitEvent::Exited { reason });
        }
        // Resolves on an explicit kill and when the handle is dropped.
        _ = kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("Worker already gone: {}", e);
            }
            let _ = child.wait().await;
        }
    }
}

/// Locate the `cellrun-worker` binary.
///
/// Looks in the following order:
/// 1. `CELLRUN_WORKER_PATH` environment variable
/// 2. Same directory as the current executable (and its parent, for test binaries)
/// 3. System PATH
/// 4. `target/debug` or `target/release` of this workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    let worker_name = if cfg!(windows) {
        "cellrun-worker.exe"
    } else {
        "cellrun-worker"
    };

    // 1. Check environment variable
    if let Ok(path) = std::env::var("CELLRUN_WORKER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!("CELLRUN_WORKER_PATH points to missing file {}", path.display());
    }

    // 2. Look next to current executable
    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let worker_path = dir.join(worker_name);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    // 3. Try system PATH via which
    if let Ok(path) = which::which(worker_name) {
        return Ok(path);
    }

    // 4. For development: try target/debug or target/release
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(worker_name);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Ipc(
        "Could not find cellrun-worker binary. Set CELLRUN_WORKER_PATH or ensure it's in PATH."
            .to_string(),
    ))
}
