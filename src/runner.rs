//! Companion runner: process spawning and the per-call write/read cycle.
//!
//! [`start`] spawns the companion with its three standard streams piped and
//! the dispatcher tasks attached. [`Companion::call`] performs one strictly
//! synchronous exchange: write one request line, await exactly one matching
//! response. [`Companion::shutdown`] is the explicit teardown path -
//! kill-then-wait, bounded by the configured grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::codec;
use crate::dispatcher::{spawn_output_reader, spawn_stderr_drain, StderrBuffer};
use crate::error::{BridgeError, Result};
use crate::guard::{self, ProcGuard};

/// How long a stream-closure report waits for the stderr drain to reach
/// EOF before composing the failure, so late diagnostics still land in it.
const STDERR_SETTLE: Duration = Duration::from_millis(200);

/// Everything needed to spawn one companion process.
#[derive(Debug, Clone)]
pub(crate) struct CompanionSpec {
    /// Interpreter or executable. A bare name is resolved on PATH; anything
    /// with a path separator is used as-is.
    pub program: String,
    /// Entry script, passed as the first argument when present.
    pub entry: Option<PathBuf>,
    /// Extra arguments after the entry script.
    pub args: Vec<String>,
    /// Working directory. Defaults to the entry script's parent directory.
    pub cwd: Option<PathBuf>,
    /// Environment overrides; everything else passes through.
    pub env: Vec<(String, String)>,
}

impl CompanionSpec {
    fn spawn_error(&self, source: std::io::Error) -> BridgeError {
        BridgeError::Spawn {
            program: self.program.clone(),
            source,
        }
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        let as_path = Path::new(&self.program);
        if as_path.components().count() > 1 {
            if as_path.exists() {
                return Ok(as_path.to_path_buf());
            }
            return Err(self.spawn_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such executable: {}", self.program),
            )));
        }
        which::which(&self.program).map_err(|e| {
            self.spawn_error(std::io::Error::new(std::io::ErrorKind::NotFound, e))
        })
    }

    fn working_dir(&self) -> Option<PathBuf> {
        self.cwd.clone().or_else(|| {
            self.entry
                .as_ref()
                .and_then(|entry| entry.parent())
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
    }
}

/// A live companion process: pid, streams, dispatcher tasks, and the armed
/// cleanup guard. Exclusively owned by one bridge.
#[derive(Debug)]
pub(crate) struct Companion {
    pid: u32,
    guard: ProcGuard,
    child: Child,
    stdin: ChildStdin,
    responses: UnboundedReceiver<String>,
    stderr: StderrBuffer,
    stderr_task: Option<JoinHandle<()>>,
    _output_task: JoinHandle<()>,
    next_id: u64,
}

/// Spawn the companion described by `spec`.
///
/// # Errors
///
/// [`BridgeError::Spawn`] if the program cannot be resolved, the entry
/// script does not exist, or the OS refuses to fork/exec.
pub(crate) fn start(spec: &CompanionSpec) -> Result<Companion> {
    let program = spec.resolve_program()?;

    if let Some(entry) = &spec.entry {
        if !entry.exists() {
            return Err(spec.spawn_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("entry script not found: {}", entry.display()),
            )));
        }
    }

    let mut cmd = Command::new(&program);
    if let Some(entry) = &spec.entry {
        cmd.arg(entry);
    }
    cmd.args(&spec.args);
    if let Some(dir) = spec.working_dir() {
        cmd.current_dir(dir);
    }
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // No kill_on_drop here: tokio's drop-kill carries no owner-pid check,
    // so a forked descendant dropping its copy of the handle would signal
    // the parent's companion. ProcGuard is the fork-safe replacement.

    let mut child = cmd.spawn().map_err(|e| spec.spawn_error(e))?;

    let pid = child.id().ok_or_else(|| {
        spec.spawn_error(std::io::Error::other(
            "companion exited before its pid could be read",
        ))
    })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spec.spawn_error(std::io::Error::other("failed to capture stdin")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spec.spawn_error(std::io::Error::other("failed to capture stdout")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| spec.spawn_error(std::io::Error::other("failed to capture stderr")))?;

    let (responses, output_task) = spawn_output_reader(stdout);
    let (stderr_buf, stderr_task) = spawn_stderr_drain(stderr);

    tracing::info!(pid, program = %program.display(), "companion spawned");

    Ok(Companion {
        pid,
        guard: ProcGuard::new(pid),
        child,
        stdin,
        responses,
        stderr: stderr_buf,
        stderr_task: Some(stderr_task),
        _output_task: output_task,
        next_id: 0,
    })
}

impl Companion {
    /// OS process id of the companion.
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Perform one call: write the encoded request, then await exactly one
    /// response for it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Companion`] if the remote function raised
    /// - [`BridgeError::StreamClosed`] if the output stream closed first
    /// - [`BridgeError::Timeout`] if `timeout` elapsed
    /// - [`BridgeError::Protocol`] on an undecodable response line
    pub(crate) async fn call(
        &mut self,
        path: &str,
        args: &[Value],
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;

        let mut line = codec::encode_request(id, path, args)?;
        line.push('\n');

        tracing::debug!(id, path, "dispatching call");
        if let Err(e) = self.write_request(line.as_bytes()).await {
            return Err(match e.kind() {
                std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                    self.stream_closed().await
                }
                _ => BridgeError::Io(e),
            });
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.responses.recv()).await {
                    Ok(received) => received,
                    Err(_) => return Err(BridgeError::Timeout(timeout.unwrap_or_default())),
                },
                None => self.responses.recv().await,
            };

            let raw = match received {
                Some(raw) => raw,
                None => return Err(self.stream_closed().await),
            };

            let response = codec::decode_response(&raw)?;
            if response.id != id {
                tracing::warn!(expected = id, got = response.id, "dropping stale response");
                continue;
            }
            return match response.into_result() {
                Ok(value) => Ok(value),
                Err(fault) => Err(BridgeError::Companion {
                    message: fault.message,
                    stack: fault.stack,
                    stderr: self.stderr.take(),
                }),
            };
        }
    }

    async fn write_request(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(bytes).await?;
        self.stdin.flush().await
    }

    /// Compose the stream-closed failure, letting the stderr drain settle
    /// first so the companion's last words are attached.
    async fn stream_closed(&mut self) -> BridgeError {
        if let Some(mut task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_SETTLE, &mut task).await;
        }
        BridgeError::StreamClosed {
            stderr: self.stderr.take(),
        }
    }

    /// Tear the companion down: unconditional kill, then collect the exit
    /// status, bounded by `grace`. Never raises; failures are logged.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        self.guard.disarm();
        guard::terminate(self.pid);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(pid = self.pid, %status, "companion exited"),
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "failed to collect companion exit status");
            }
            Err(_) => {
                tracing::warn!(pid = self.pid, "companion not reaped within {:?}", grace);
            }
        }
    }

    /// Disarm the guard without signaling. Used when a forked descendant
    /// closes its copy of a bridge it does not own.
    pub(crate) fn disown(mut self) {
        self.guard.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(program: &str) -> CompanionSpec {
        CompanionSpec {
            program: program.to_string(),
            entry: None,
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    #[test]
    fn test_resolve_program_on_path() {
        let resolved = spec("sleep").resolve_program().unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn test_resolve_missing_program() {
        let err = spec("definitely-not-a-real-binary").resolve_program().unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    #[test]
    fn test_resolve_missing_path_program() {
        let err = spec("/nonexistent/bin/thing").resolve_program().unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    #[test]
    fn test_working_dir_defaults_to_entry_parent() {
        let mut s = spec("node");
        s.entry = Some(PathBuf::from("/opt/app/main.js"));
        assert_eq!(s.working_dir(), Some(PathBuf::from("/opt/app")));

        // A bare filename has no usable parent.
        s.entry = Some(PathBuf::from("main.js"));
        assert_eq!(s.working_dir(), None);

        s.cwd = Some(PathBuf::from("/somewhere/else"));
        assert_eq!(s.working_dir(), Some(PathBuf::from("/somewhere/else")));
    }

    #[tokio::test]
    async fn test_missing_entry_script_fails_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = spec("sleep");
        s.entry = Some(dir.path().join("missing.js"));

        let err = start(&s).unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }));
    }

    /// `cat` echoes each request line back; the echo decodes as a response
    /// with the same id and no result, i.e. null.
    #[tokio::test]
    async fn test_call_cycle_against_cat() {
        let mut companion = start(&spec("cat")).unwrap();

        let value = companion
            .call("anything", &[json!(1)], Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);

        companion.shutdown(Duration::from_secs(5)).await;
    }

    /// A companion that never writes a response trips the deadline.
    #[tokio::test]
    async fn test_call_timeout() {
        let mut s = spec("sleep");
        s.args = vec!["30".to_string()];
        let mut companion = start(&s).unwrap();

        let err = companion
            .call("void", &[], Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));

        companion.shutdown(Duration::from_secs(5)).await;
    }

    /// A companion that exits immediately closes its output stream before
    /// any response arrives.
    #[tokio::test]
    async fn test_call_against_exited_companion() {
        let mut companion = start(&spec("true")).unwrap();

        let err = companion
            .call("void", &[], Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StreamClosed { .. }));

        companion.shutdown(Duration::from_secs(5)).await;
    }
}
