//! Hostexec gRPC Server
//!
//! Exposes whitelisted host command execution as a server-streaming `Debug`
//! RPC. One request carries one command; the response stream echoes the
//! request, then streams output, then reports the exit code.
//!
//! # Example Flow
//!
//! ```text
//! Client                                    Server
//! │                                           │
//! │  DebugRequest{command: "show version"}    │
//! │ ─────────────────────────────────────────>│
//! │                                           │  validate + nsenter/su
//! │       Request{...echo...}                 │
//! │<───────────────────────────────────────── │
//! │       Data{"SONiC Software Version..."}   │
//! │<───────────────────────────────────────── │
//! │       Status{code: 0}                     │
//! │<───────────────────────────────────────── │
//! ```
//!
//! Rejected or unrunnable commands end the call with an RPC error instead of
//! a `Status` frame.

pub mod proto {
    #![allow(missing_docs)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("hostexec.v1");
}

mod bridge;
mod server;

pub use bridge::{ExecutionBridge, ExecutionPlan, ResponseSink, SinkClosed};
pub use server::{DebugServer, DebugService};

// Re-export proto types for convenience
pub use proto::{
    DebugRequest, DebugResponse, DebugStatus, debug_client::DebugClient,
    debug_server::DebugServer as DebugGrpcServer,
};
