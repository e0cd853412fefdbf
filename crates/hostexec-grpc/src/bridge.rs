//! Request handling for the Debug RPC.
//!
//! A call moves through pre-flight (argument checks and command validation),
//! execution, and draining. Frames go out in this order:
//!
//! - `Request`: exactly one, first, echoing the inbound request
//! - `Data`: zero or more, stdout and stderr chunks as they arrive
//! - `Status`: exactly one, last, carrying the exit code
//!
//! If the command cannot be run at all the call fails with an RPC error
//! instead of a `Status` frame.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::Status;

use hostexec::{
    AccessLevel, CallContext, CommandRunner, ContextError, ExecError, ExecutionSpec, Whitelists,
    validate,
};

use crate::proto::{
    DebugRequest, DebugResponse, DebugStatus, debug_request::Mode,
    debug_response::Response as Frame,
};

/// Capacity of each output channel between the pumps and the drainer.
const OUTPUT_BUFFER: usize = 100;

/// The response stream was closed by the client.
#[derive(Debug, thiserror::Error)]
#[error("response stream closed")]
pub struct SinkClosed;

/// Where response frames go.
///
/// Single writer: the bridge holds `&mut` while it sends.
#[async_trait]
pub trait ResponseSink: Send {
    /// Context of the call; done when the client goes away or the server
    /// shuts down.
    fn context(&self) -> &CallContext;

    /// Send one frame.
    async fn send(&mut self, response: DebugResponse) -> Result<(), SinkClosed>;
}

/// A request that passed pre-flight and is ready to execute.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    request: DebugRequest,
    spec: ExecutionSpec,
    timeout: Option<Duration>,
}

impl ExecutionPlan {
    /// What will be executed.
    pub fn spec(&self) -> &ExecutionSpec {
        &self.spec
    }

    /// Extra deadline requested by the caller.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Binds the validator and a [`CommandRunner`] to the response framing.
#[derive(Clone)]
pub struct ExecutionBridge {
    whitelists: Arc<Whitelists>,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for ExecutionBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionBridge")
            .field("whitelists", &self.whitelists)
            .finish_non_exhaustive()
    }
}

impl ExecutionBridge {
    /// Create a bridge running validated commands through `runner`.
    pub fn new(whitelists: Arc<Whitelists>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { whitelists, runner }
    }

    /// Check the request and validate its command for a caller with
    /// `access`. Every execution path goes through here.
    pub fn prepare(
        &self,
        request: DebugRequest,
        access: AccessLevel,
    ) -> Result<ExecutionPlan, Status> {
        let Some(command) = request.command.as_deref() else {
            return Err(Status::invalid_argument("command cannot be nil"));
        };

        match Mode::try_from(request.mode) {
            Ok(Mode::Cli) => {}
            Ok(Mode::Shell) => {
                return Err(Status::unimplemented("mode SHELL is currently unimplemented"));
            }
            Ok(Mode::Unspecified) => {
                return Err(Status::invalid_argument("mode cannot be UNSPECIFIED"));
            }
            Err(_) => {
                return Err(Status::invalid_argument(format!(
                    "unknown mode {}",
                    request.mode
                )));
            }
        }

        let text = std::str::from_utf8(command)
            .map_err(|_| Status::invalid_argument("command must be valid UTF-8"))?;
        let validated = validate(text, self.whitelists.for_access(access)).map_err(|e| {
            tracing::warn!(?access, kind = ?e.kind(), "Rejected command {:?}: {}", text, e.reason());
            Status::permission_denied(e.to_string())
        })?;

        let spec = ExecutionSpec::new(validated.into_raw())
            .role_account(request.role_account.clone())
            .chunk_byte_limit(usize::try_from(request.byte_limit).unwrap_or(0));
        let timeout = u64::try_from(request.timeout)
            .ok()
            .filter(|&nanos| nanos > 0)
            .map(Duration::from_nanos);

        Ok(ExecutionPlan {
            request,
            spec,
            timeout,
        })
    }

    /// Execute a prepared plan, streaming frames into `sink`.
    ///
    /// A non-zero exit code is not an error: it is reported in the `Status`
    /// frame and `Ok(())` is returned.
    pub async fn run<S>(&self, plan: ExecutionPlan, sink: &mut S) -> Result<(), Status>
    where
        S: ResponseSink + ?Sized,
    {
        let ExecutionPlan {
            request,
            spec,
            timeout,
        } = plan;
        let ctx = match timeout {
            Some(timeout) => sink.context().with_timeout(timeout),
            None => sink.context().clone(),
        };

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(OUTPUT_BUFFER);

        // Joining both sides is the barrier that keeps Status behind every
        // Data frame.
        let ((), result) = tokio::join!(
            drain(&mut *sink, &ctx, request, out_rx, err_rx),
            self.runner.run(&ctx, out_tx, err_tx, &spec),
        );

        let code = result.map_err(|e| status_for(&spec.command, e))?;
        tracing::info!(code, "Command completed");
        if sink.send(status_frame(code)).await.is_err() {
            tracing::debug!("Client went away before the status frame");
        }
        Ok(())
    }

    /// [`prepare`](Self::prepare) then [`run`](Self::run).
    pub async fn handle_execution_request<S>(
        &self,
        request: DebugRequest,
        access: AccessLevel,
        sink: &mut S,
    ) -> Result<(), Status>
    where
        S: ResponseSink + ?Sized,
    {
        let plan = self.prepare(request, access)?;
        self.run(plan, sink).await
    }
}

/// Send the request echo, then forward output chunks until both channels
/// close, the context is done, or the client stream breaks.
async fn drain<S>(
    sink: &mut S,
    ctx: &CallContext,
    request: DebugRequest,
    mut out_rx: mpsc::Receiver<Vec<u8>>,
    mut err_rx: mpsc::Receiver<Vec<u8>>,
) where
    S: ResponseSink + ?Sized,
{
    if sink.send(request_frame(request)).await.is_err() {
        tracing::debug!("Client went away before the request frame");
        return;
    }

    let mut out_open = true;
    let mut err_open = true;
    while out_open || err_open {
        let chunk = tokio::select! {
            biased;
            reason = ctx.done() => {
                tracing::debug!("Stopped draining output: {}", reason);
                return;
            }
            chunk = out_rx.recv(), if out_open => match chunk {
                Some(chunk) => chunk,
                None => {
                    out_open = false;
                    continue;
                }
            },
            chunk = err_rx.recv(), if err_open => match chunk {
                Some(chunk) => chunk,
                None => {
                    err_open = false;
                    continue;
                }
            },
        };

        if sink.send(data_frame(chunk)).await.is_err() {
            // The process keeps running server side; cancellation of the call
            // context takes care of it.
            tracing::debug!("Client stream broken, stopped draining output");
            return;
        }
    }
}

fn status_for(command: &str, err: ExecError) -> Status {
    match err {
        ExecError::Cancelled(ContextError::DeadlineExceeded) => {
            tracing::warn!("Command {:?} timed out", command);
            Status::deadline_exceeded(format!("command '{command}' timed out"))
        }
        ExecError::Cancelled(ContextError::Canceled) => {
            tracing::debug!("Command {:?} cancelled", command);
            Status::cancelled(format!("command '{command}' cancelled"))
        }
        err => {
            tracing::error!("Failed to run command {:?}: {}", command, err);
            Status::failed_precondition(format!("Failed to run command '{command}': '{err}'"))
        }
    }
}

fn request_frame(request: DebugRequest) -> DebugResponse {
    DebugResponse {
        response: Some(Frame::Request(request)),
    }
}

fn data_frame(data: Vec<u8>) -> DebugResponse {
    DebugResponse {
        response: Some(Frame::Data(data)),
    }
}

fn status_frame(code: i32) -> DebugResponse {
    DebugResponse {
        response: Some(Frame::Status(DebugStatus { code })),
    }
}
