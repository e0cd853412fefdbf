//! Hostexec: whitelisted diagnostic commands on the host of a network device
//!
//! Hostexec lets a trusted operator run a constrained set of shell commands
//! in the host namespaces of a device from inside a management container.
//! A command goes through two stages:
//!
//! 1. [`validate`] parses the untrusted text with a bash grammar and accepts
//!    it only if it is a plain call (or a `|` pipeline of plain calls) whose
//!    command names are all in a [`Whitelist`].
//! 2. [`SandboxExecutor`] runs the accepted text verbatim through
//!    `nsenter` + `su`, streaming stdout and stderr as byte chunks.
//!
//! Nothing here touches the transport; the gRPC binding lives in the
//! `hostexec-grpc` crate.

mod context;
mod executor;
mod validator;
mod whitelist;

pub use context::{CallContext, Canceller, ContextError};
pub use executor::{
    CommandRunner, DEFAULT_CHUNK_BYTES, DEFAULT_ROLE_ACCOUNT, ExecError, ExecutionSpec,
    ExecutorConfig, FAILED_TO_RUN, HostProcess, OutputPipe, ProcessLauncher, SandboxExecutor,
    TokioLauncher, TokioProcess,
};
pub use validator::{PipelineStage, RejectKind, ValidatedCommand, ValidationError, validate};
pub use whitelist::{
    AccessLevel, DEFAULT_WHITELIST_PATH, Whitelist, WhitelistConfig, Whitelists,
};
