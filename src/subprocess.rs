use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::ExitError;

/// Default cap on captured output per stream.
pub const DEFAULT_TAIL_BYTES: usize = 64 * 1024;

/// How long to keep draining pipes after the process is gone. Background
/// grandchildren can hold a pipe open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Result of running a subprocess.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 when the process was killed or died from a signal.
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
}

impl RunOutput {
    /// Returns true if the process exited successfully.
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {tool}")]
    NotFound { tool: String },

    #[error("{tool} timed out after {}s", after.as_secs())]
    Timeout { tool: String, after: Duration },

    #[error("{tool} failed (exit {code}): {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<ToolError> for ExitError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotFound { tool } => Self::ToolNotFound { tool },
            ToolError::Timeout { tool, after } => Self::Timeout {
                tool,
                timeout_secs: after.as_secs(),
            },
            ToolError::Failed { tool, code, stderr } => Self::ToolFailed {
                tool,
                code,
                message: stderr,
            },
            other @ ToolError::Io { .. } => Self::Other(other.to_string()),
        }
    }
}

/// Builder for running external programs.
///
/// A timed-out process is killed and reported through `RunOutput::timed_out`
/// by `run`, or as `ToolError::Timeout` by `run_ok`.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    current_dir: Option<PathBuf>,
    envs: HashMap<String, String>,
    stdin: Option<Vec<u8>>,
    tail_bytes: usize,
}

impl Tool {
    /// Create a new tool invocation.
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            timeout: None,
            current_dir: None,
            envs: HashMap::new(),
            stdin: None,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

    /// Add a single argument.
    #[must_use]
    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Add multiple arguments.
    #[must_use]
    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| (*s).to_string()));
        self
    }

    /// Set a timeout for the subprocess.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.insert(key.to_string(), value.to_string());
        self
    }

    /// Bytes written to the child's stdin, which is then closed.
    #[must_use]
    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    /// Keep only the last `bytes` of each output stream.
    #[must_use]
    pub const fn tail_bytes(mut self, bytes: usize) -> Self {
        self.tail_bytes = bytes;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the tool, capturing bounded stdout and stderr tails.
    pub async fn run(&self) -> Result<RunOutput, ToolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.envs);
        // Own process group, so a kill reaches everything the child started.
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let mut group = ProcessGroup::of(&child);
        tracing::debug!(tool = %self.program, args = ?self.args, "spawned");

        if let (Some(mut pipe), Some(bytes)) = (child.stdin.take(), self.stdin.clone()) {
            tokio::spawn(async move {
                // A child that exits without reading its input is not an error here.
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            });
        }

        let stdout = TailBuffer::shared(self.tail_bytes);
        let stderr = TailBuffer::shared(self.tail_bytes);
        let readers = [
            spawn_reader(child.stdout.take(), Arc::clone(&stdout)),
            spawn_reader(child.stderr.take(), Arc::clone(&stderr)),
        ];

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let (exit_code, timed_out) = match waited {
            Some(status) => {
                let status = status.map_err(|e| self.io_error(e))?;
                (status.code().unwrap_or(-1), false)
            }
            None => {
                tracing::debug!(tool = %self.program, "timed out, killing");
                group.kill();
                let _ = child.kill().await;
                (-1, true)
            }
        };
        group.disarm();

        for mut reader in readers {
            if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
                tracing::debug!(tool = %self.program, "output pipe still open after exit");
                reader.abort();
            }
        }

        Ok(RunOutput {
            stdout: TailBuffer::snapshot(&stdout),
            stderr: TailBuffer::snapshot(&stderr),
            exit_code,
            timed_out,
            duration: start.elapsed(),
        })
    }

    /// Run the tool and return an error if it fails or times out.
    pub async fn run_ok(&self) -> Result<RunOutput, ToolError> {
        let output = self.run().await?;
        if output.timed_out {
            return Err(ToolError::Timeout {
                tool: self.program.clone(),
                after: self.timeout.unwrap_or_default(),
            });
        }
        if output.success() {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                tool: self.program.clone(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> ToolError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::NotFound {
                tool: self.program.clone(),
            }
        } else {
            self.io_error(e)
        }
    }

    fn io_error(&self, source: std::io::Error) -> ToolError {
        ToolError::Io {
            tool: self.program.clone(),
            source,
        }
    }
}

/// The process group of a spawned child. Dropped while armed (the run was
/// cancelled or timed out), it kills every process left in the group.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &tokio::process::Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pgid) = self.pgid.take()
            && let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL)
        {
            tracing::debug!(pgid, error = %e, "process group already gone");
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }

    /// The child exited on its own; leave the group alone.
    const fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Keeps the last `limit` bytes written to it.
#[derive(Debug)]
struct TailBuffer {
    buf: VecDeque<u8>,
    limit: usize,
    dropped: usize,
}

impl TailBuffer {
    fn shared(limit: usize) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            buf: VecDeque::with_capacity(limit.min(DEFAULT_TAIL_BYTES)),
            limit,
            dropped: 0,
        }))
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend(chunk);
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    fn snapshot(shared: &Mutex<Self>) -> String {
        let tail = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let bytes: Vec<u8> = tail.buf.iter().copied().collect();
        let text = String::from_utf8_lossy(&bytes);
        if tail.dropped > 0 {
            format!("[truncated {} bytes]\n{text}", tail.dropped)
        } else {
            text.into_owned()
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>, sink: Arc<Mutex<TailBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(&chunk[..n]),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_echo() {
        let output = Tool::new("echo").arg("hello").run().await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_false_fails() {
        let output = Tool::new("false").run().await.unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 1);
    }

    #[tokio::test]
    async fn run_ok_returns_error_on_failure() {
        let err = Tool::new("sh")
            .args(&["-c", "echo broken >&2; exit 3"])
            .run_ok()
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_not_found() {
        let err = Tool::new("nonexistent-tool-xyz").run().await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
        let exit: ExitError = err.into();
        assert!(matches!(exit, ExitError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let output = Tool::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(100))
            .run()
            .await
            .unwrap();
        assert!(output.timed_out);
        assert_eq!(output.exit_code, -1);
        assert!(output.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn run_ok_reports_timeout() {
        let err = Tool::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(50))
            .run_ok()
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn stdin_is_forwarded() {
        let output = Tool::new("cat").stdin("from stdin").run().await.unwrap();
        assert_eq!(output.stdout, "from stdin");
    }

    #[tokio::test]
    async fn output_is_truncated_to_tail() {
        let output = Tool::new("sh")
            .args(&["-c", "printf 'aaaaaaaaaabbbbb'"])
            .tail_bytes(5)
            .run()
            .await
            .unwrap();
        assert!(output.stdout.starts_with("[truncated 10 bytes]"));
        assert!(output.stdout.ends_with("bbbbb"));
    }

    #[tokio::test]
    async fn runs_in_current_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let output = Tool::new("ls").current_dir(dir.path()).run().await.unwrap();
        assert!(output.stdout.contains("marker.txt"));
    }

    /// True once `pid` is gone or only a zombie.
    #[cfg(target_os = "linux")]
    async fn exited(pid: u32) -> bool {
        for _ in 0..100 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => return true,
                Ok(stat) if stat.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')) => {
                    return true;
                }
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        false
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_background_children() {
        let output = Tool::new("sh")
            .args(&["-c", "sleep 41 & echo $!; wait"])
            .timeout(Duration::from_millis(300))
            .run()
            .await
            .unwrap();
        assert!(output.timed_out);
        let pid: u32 = output.stdout.trim().parse().unwrap();
        assert!(exited(pid).await, "background sleep {pid} outlived the timeout");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancelled_run_kills_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("bg.pid");
        let script = format!("sleep 43 & echo $! > {}; wait", pidfile.display());
        let tool = Tool::new("sh").args(&["-c", &script]);
        let run = tool.run();
        assert!(tokio::time::timeout(Duration::from_millis(300), run).await.is_err());
        let pid: u32 = std::fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
        assert!(exited(pid).await, "background sleep {pid} outlived the cancelled run");
    }
}
