//! gRPC server implementation for the Debug service.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status};

use hostexec::{AccessLevel, CallContext, CommandRunner, SandboxExecutor, Whitelists};

use crate::bridge::{ExecutionBridge, ExecutionPlan, ResponseSink, SinkClosed};
use crate::proto::{self, DebugRequest, DebugResponse};

/// Frames buffered between the execution task and the transport.
const DEFAULT_RESPONSE_BUFFER: usize = 32;

/// The Debug gRPC service implementation.
///
/// The caller's [`AccessLevel`] is read from the request extensions, where an
/// interceptor may place it after authenticating the peer. Without one the
/// service default applies.
#[derive(Clone, Debug)]
pub struct DebugService {
    bridge: Arc<ExecutionBridge>,
    default_access: AccessLevel,
    response_buffer: usize,
}

impl DebugService {
    /// Create a service running commands through a [`SandboxExecutor`].
    pub fn new(whitelists: Whitelists, default_access: AccessLevel) -> Self {
        Self::with_runner(
            whitelists,
            Arc::new(SandboxExecutor::default()),
            default_access,
        )
    }

    /// Create a service running commands through `runner`.
    pub fn with_runner(
        whitelists: Whitelists,
        runner: Arc<dyn CommandRunner>,
        default_access: AccessLevel,
    ) -> Self {
        Self {
            bridge: Arc::new(ExecutionBridge::new(Arc::new(whitelists), runner)),
            default_access,
            response_buffer: DEFAULT_RESPONSE_BUFFER,
        }
    }

    /// Set how many frames may queue up for a slow client.
    pub fn response_buffer(mut self, frames: usize) -> Self {
        self.response_buffer = frames.max(1);
        self
    }
}

type DebugStream = Pin<Box<dyn Stream<Item = Result<DebugResponse, Status>> + Send>>;

#[tonic::async_trait]
impl proto::debug_server::Debug for DebugService {
    type DebugStream = DebugStream;

    async fn debug(
        &self,
        request: Request<DebugRequest>,
    ) -> Result<Response<Self::DebugStream>, Status> {
        let access = request
            .extensions()
            .get::<AccessLevel>()
            .copied()
            .unwrap_or(self.default_access);
        let request = request.into_inner();

        tracing::info!(
            mode = request.mode,
            role_account = %request.role_account,
            byte_limit = request.byte_limit,
            timeout = request.timeout,
            ?access,
            "Debug called with command {:?}",
            String::from_utf8_lossy(request.command.as_deref().unwrap_or_default())
        );

        // Pre-flight failures surface as the call's status, with no frames.
        let plan = self.bridge.prepare(request, access)?;

        let (tx, rx) = mpsc::channel(self.response_buffer);
        tokio::spawn(run_call(self.bridge.clone(), plan, tx));

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::DebugStream
        ))
    }
}

/// Sink writing frames into the response channel.
struct ChannelSink {
    tx: mpsc::Sender<Result<DebugResponse, Status>>,
    ctx: CallContext,
}

#[async_trait]
impl ResponseSink for ChannelSink {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    async fn send(&mut self, response: DebugResponse) -> Result<(), SinkClosed> {
        self.tx.send(Ok(response)).await.map_err(|_| SinkClosed)
    }
}

/// Drive one call. The call context is cancelled as soon as the client drops
/// the response stream.
async fn run_call(
    bridge: Arc<ExecutionBridge>,
    plan: ExecutionPlan,
    tx: mpsc::Sender<Result<DebugResponse, Status>>,
) {
    let (canceller, ctx) = CallContext::new();
    let closed = tx.clone();
    let mut sink = ChannelSink { tx, ctx };

    let result = {
        let run = bridge.run(plan, &mut sink);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            () = closed.closed() => {
                tracing::debug!("Client disconnected, cancelling command");
                canceller.cancel();
                run.await
            }
        }
    };
    drop(closed);

    if let Err(status) = result {
        // Nobody to tell if the client is already gone.
        let _ = sink.tx.send(Err(status)).await;
    }
}

/// Server configuration and runner.
#[derive(Debug)]
pub struct DebugServer {
    addr: SocketAddr,
    service: DebugService,
}

impl DebugServer {
    /// Create a new server bound to the given address.
    pub fn new(addr: SocketAddr, service: DebugService) -> Self {
        Self { addr, service }
    }

    /// Run the server until shutdown signal.
    pub async fn run(self) -> Result<(), tonic::transport::Error> {
        tracing::info!("Starting gRPC server on {}", self.addr);

        tonic::transport::Server::builder()
            .add_service(proto::debug_server::DebugServer::new(self.service))
            .serve_with_shutdown(self.addr, shutdown_signal())
            .await?;

        tracing::info!("gRPC server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
