//! Sandboxed execution of validated commands in the host namespaces.
//!
//! The command text is run as
//!
//! ```text
//! nsenter --target 1 --mount --uts --ipc --net --pid su - <role> -c <command>
//! ```
//!
//! so it sees the host's filesystem, network and process table, but runs
//! under a restricted role account. Stdout and stderr are pumped
//! concurrently into bounded channels as byte chunks.
//!
//! The OS process sits behind [`HostProcess`] / [`ProcessLauncher`] so the
//! executor can be driven by a fake process in tests.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::context::{CallContext, ContextError};

/// Exit code reported alongside any [`ExecError`].
pub const FAILED_TO_RUN: i32 = -1;

/// Role account used when the request does not name one.
pub const DEFAULT_ROLE_ACCOUNT: &str = "admin";

/// Read buffer size when no chunk limit is requested.
pub const DEFAULT_CHUNK_BYTES: usize = 32 * 1024;

/// Errors that prevent a command from running or being observed to the end.
///
/// A command that runs and exits non-zero is *not* an error; its exit code is
/// returned as a value.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Could not obtain a stdout/stderr pipe
    #[error("failed to create output pipe: {0}")]
    Pipe(#[source] io::Error),
    /// The process could not be started
    #[error("failed to start process: {0}")]
    Start(#[source] io::Error),
    /// Waiting for the process failed for a reason other than its exit status
    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),
    /// The call was cancelled or timed out; the process was killed
    #[error("execution interrupted: {0}")]
    Cancelled(#[source] ContextError),
}

/// Boxed reader for one of the child's output streams.
pub type OutputPipe = Box<dyn AsyncRead + Send + Unpin>;

/// A process that can be started, observed and killed.
#[async_trait]
pub trait HostProcess: Send {
    /// Start the process.
    fn start(&mut self) -> io::Result<()>;

    /// Take the stdout pipe. Only valid once after [`start`](Self::start).
    fn stdout_pipe(&mut self) -> io::Result<OutputPipe>;

    /// Take the stderr pipe. Only valid once after [`start`](Self::start).
    fn stderr_pipe(&mut self) -> io::Result<OutputPipe>;

    /// Wait for the process to exit.
    async fn wait(&mut self) -> io::Result<ExitStatus>;

    /// Kill the process and reap it.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Creates [`HostProcess`]es from an argument vector.
pub trait ProcessLauncher: Send + Sync {
    /// Prepare (but do not start) `program` with `args`.
    fn launch(&self, program: &str, args: &[String]) -> Box<dyn HostProcess>;
}

/// [`HostProcess`] backed by `tokio::process`.
#[derive(Debug)]
pub struct TokioProcess {
    command: Command,
    child: Option<Child>,
}

impl TokioProcess {
    /// Prepare `program` with `args`, with both output streams piped.
    pub fn new(program: &str, args: &[String]) -> Self {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a kill also reaches what nsenter forks.
        #[cfg(unix)]
        command.process_group(0);
        Self {
            command,
            child: None,
        }
    }

    fn child(&mut self) -> io::Result<&mut Child> {
        self.child
            .as_mut()
            .ok_or_else(|| io::Error::other("process not started"))
    }
}

#[async_trait]
impl HostProcess for TokioProcess {
    fn start(&mut self) -> io::Result<()> {
        if self.child.is_some() {
            return Err(io::Error::other("process already started"));
        }
        self.child = Some(self.command.spawn()?);
        Ok(())
    }

    fn stdout_pipe(&mut self) -> io::Result<OutputPipe> {
        let stdout = self
            .child()?
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout pipe unavailable"))?;
        Ok(Box::new(stdout))
    }

    fn stderr_pipe(&mut self) -> io::Result<OutputPipe> {
        let stderr = self
            .child()?
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr pipe unavailable"))?;
        Ok(Box::new(stderr))
    }

    async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child()?.wait().await
    }

    async fn kill(&mut self) -> io::Result<()> {
        let child = self.child()?;
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            kill_process_group(pid)?;
        }
        child.kill().await
    }
}

/// SIGKILL every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
    // SAFETY: kill(2) takes no pointers; a negative pid addresses the group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == -1 {
        let err = io::Error::last_os_error();
        // ESRCH: the whole group is already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Launches real processes through [`TokioProcess`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, program: &str, args: &[String]) -> Box<dyn HostProcess> {
        Box::new(TokioProcess::new(program, args))
    }
}

/// What to run and how to stream it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionSpec {
    /// Validated command text, passed to the shell verbatim
    pub command: String,
    /// Account to run as; empty means [`DEFAULT_ROLE_ACCOUNT`]
    pub role_account: String,
    /// Maximum bytes per output chunk; 0 means [`DEFAULT_CHUNK_BYTES`]
    pub chunk_byte_limit: usize,
}

impl ExecutionSpec {
    /// Spec for `command` with default account and chunking.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            role_account: String::new(),
            chunk_byte_limit: 0,
        }
    }

    /// Set the role account.
    pub fn role_account(mut self, account: impl Into<String>) -> Self {
        self.role_account = account.into();
        self
    }

    /// Set the chunk byte limit.
    pub fn chunk_byte_limit(mut self, limit: usize) -> Self {
        self.chunk_byte_limit = limit;
        self
    }
}

/// Executor configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Namespace-entry tool
    pub namespace_tool: String,
    /// PID whose namespaces are joined
    pub target_pid: u32,
    /// Account used when a spec names none
    pub default_role_account: String,
    /// Upper bound on the read buffer, whatever the requested chunk limit
    pub max_chunk_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            namespace_tool: "nsenter".to_string(),
            target_pid: 1,
            default_role_account: DEFAULT_ROLE_ACCOUNT.to_string(),
            max_chunk_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

/// Runs an [`ExecutionSpec`] and streams its output.
///
/// The two senders are closed when the corresponding stream ends; that is
/// the only end-of-stream signal receivers get.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command until it exits or `ctx` is done.
    ///
    /// Returns the exit code on completion, including non-zero codes.
    async fn run(
        &self,
        ctx: &CallContext,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
        spec: &ExecutionSpec,
    ) -> Result<i32, ExecError>;
}

/// Runs commands in the host namespaces as a role account.
#[derive(Clone)]
pub struct SandboxExecutor {
    config: ExecutorConfig,
    launcher: Arc<dyn ProcessLauncher>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl SandboxExecutor {
    /// Executor spawning real processes.
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_launcher(config, Arc::new(TokioLauncher))
    }

    /// Executor spawning processes through a custom launcher.
    pub fn with_launcher(config: ExecutorConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { config, launcher }
    }

    /// The executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Arguments passed to the namespace tool for `spec`.
    pub fn build_args(&self, spec: &ExecutionSpec) -> Vec<String> {
        let account = if spec.role_account.is_empty() {
            self.config.default_role_account.as_str()
        } else {
            spec.role_account.as_str()
        };
        let target = self.config.target_pid.to_string();
        [
            "--target",
            target.as_str(),
            "--mount",
            "--uts",
            "--ipc",
            "--net",
            "--pid",
            "su",
            "-",
            account,
            "-c",
            spec.command.as_str(),
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    fn chunk_size(&self, spec: &ExecutionSpec) -> usize {
        let requested = if spec.chunk_byte_limit == 0 {
            DEFAULT_CHUNK_BYTES
        } else {
            spec.chunk_byte_limit
        };
        requested.clamp(1, self.config.max_chunk_bytes.max(1))
    }
}

#[async_trait]
impl CommandRunner for SandboxExecutor {
    async fn run(
        &self,
        ctx: &CallContext,
        stdout: mpsc::Sender<Vec<u8>>,
        stderr: mpsc::Sender<Vec<u8>>,
        spec: &ExecutionSpec,
    ) -> Result<i32, ExecError> {
        if let Some(reason) = ctx.err() {
            return Err(ExecError::Cancelled(reason));
        }

        let args = self.build_args(spec);
        let mut process = self.launcher.launch(&self.config.namespace_tool, &args);

        process.start().map_err(ExecError::Start)?;
        let (out_pipe, err_pipe) = match (process.stdout_pipe(), process.stderr_pipe()) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                if let Err(kill_err) = process.kill().await {
                    tracing::warn!("Failed to kill process after pipe error: {}", kill_err);
                }
                return Err(ExecError::Pipe(e));
            }
        };

        let chunk_size = self.chunk_size(spec);
        let out_pump = tokio::spawn(pump(out_pipe, stdout, chunk_size));
        let err_pump = tokio::spawn(pump(err_pipe, stderr, chunk_size));
        let pumps = [out_pump.abort_handle(), err_pump.abort_handle()];

        let finished = {
            let completion = async {
                for (name, pump) in [("stdout", out_pump), ("stderr", err_pump)] {
                    match pump.await {
                        Ok(Ok(bytes)) => tracing::debug!(stream = name, bytes, "Output pump finished"),
                        Ok(Err(e)) => tracing::debug!(stream = name, "Output pump stopped: {}", e),
                        Err(e) => tracing::debug!(stream = name, "Output pump task failed: {}", e),
                    }
                }
                process.wait().await
            };
            tokio::select! {
                status = completion => Ok(status),
                reason = ctx.done() => Err(reason),
            }
        };

        match finished {
            Ok(Ok(status)) => {
                let code = status.code().unwrap_or(FAILED_TO_RUN);
                tracing::debug!(code, "Command exited");
                Ok(code)
            }
            Ok(Err(e)) => Err(ExecError::Wait(e)),
            Err(reason) => {
                tracing::debug!("Killing command: {}", reason);
                for pump in &pumps {
                    pump.abort();
                }
                if let Err(e) = process.kill().await {
                    tracing::warn!("Failed to kill cancelled command: {}", e);
                }
                Err(ExecError::Cancelled(reason))
            }
        }
    }
}

/// Copy `reader` into `tx` in chunks of at most `chunk_size` bytes.
///
/// Stops at EOF, on a read error, or when the receiver is gone. Dropping
/// `tx` on return closes the channel.
async fn pump(
    mut reader: OutputPipe,
    tx: mpsc::Sender<Vec<u8>>,
    chunk_size: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
        if tx.send(buf[..n].to_vec()).await.is_err() {
            return Ok(total);
        }
    }
}
