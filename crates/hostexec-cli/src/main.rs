//! Hostexec CLI - run one whitelisted command on a device
//!
//! Usage:
//!   hostexec show version
//!   hostexec --timeout 30 -- show logging | grep bgp
//!
//! Output is written to stdout as it arrives; the remote exit code becomes
//! the local one. Call errors print `error: <code>: <message>` and exit 2.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tonic::{Status, Streaming};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use hostexec::FAILED_TO_RUN;
use hostexec_grpc::DebugClient;
use hostexec_grpc::proto::{
    DebugRequest, DebugResponse, debug_request::Mode, debug_response::Response as Frame,
};

/// Exit code used when the call itself fails.
const CALL_FAILED: u8 = 2;

/// Hostexec CLI - whitelisted command execution on a device
#[derive(Parser, Debug)]
#[command(name = "hostexec")]
#[command(about = "Run a whitelisted command in the host namespaces of a device")]
struct Args {
    /// Server address
    #[arg(long, default_value = "http://[::1]:50051")]
    addr: String,

    /// Account to run the command as (server default when empty)
    #[arg(long, default_value = "")]
    role_account: String,

    /// Maximum bytes per output chunk (server default when 0)
    #[arg(long, default_value_t = 0)]
    byte_limit: i64,

    /// Seconds before the command is stopped (no limit when 0)
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    timeout: f64,

    /// Request interactive shell mode
    #[arg(long)]
    shell: bool,

    /// Command to run; the words are joined with single spaces
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

impl Args {
    fn request(&self) -> DebugRequest {
        let mode = if self.shell { Mode::Shell } else { Mode::Cli };
        let timeout = Duration::try_from_secs_f64(self.timeout)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        DebugRequest {
            mode: mode as i32,
            command: Some(self.command.join(" ").into_bytes()),
            byte_limit: self.byte_limit,
            timeout,
            role_account: self.role_account.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let args = Args::parse();
    let request = args.request();

    let mut client = DebugClient::connect(args.addr.clone())
        .await
        .with_context(|| format!("failed to connect to {}", args.addr))?;
    tracing::debug!("Connected to {}", args.addr);

    match client.debug(request).await {
        Ok(response) => render(response.into_inner()).await,
        Err(status) => Ok(report(&status)),
    }
}

/// Copy data frames to stdout and turn the status frame into an exit code.
async fn render(mut stream: Streaming<DebugResponse>) -> anyhow::Result<ExitCode> {
    let mut stdout = tokio::io::stdout();
    let mut code = None;

    loop {
        match stream.message().await {
            Ok(Some(msg)) => match msg.response {
                Some(Frame::Data(data)) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(Frame::Status(status)) => code = Some(status.code),
                Some(Frame::Request(_)) | None => {}
            },
            Ok(None) => break,
            Err(status) => return Ok(report(&status)),
        }
    }

    if code.is_none() {
        tracing::warn!("Stream ended without a status frame");
    }
    Ok(exit_code(code.unwrap_or(FAILED_TO_RUN)))
}

fn report(status: &Status) -> ExitCode {
    eprintln!("error: {}: {}", status.code(), status.message());
    ExitCode::from(CALL_FAILED)
}

/// Map a remote exit code to a local one: negative codes become 1, codes
/// above 255 saturate.
fn exit_code(code: i32) -> ExitCode {
    if code < 0 {
        return ExitCode::from(1);
    }
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("hostexec").chain(argv.iter().copied()))
            .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_request_from_args() {
        let args = parse(&[
            "--role-account",
            "test-admin",
            "--byte-limit",
            "1024",
            "--timeout",
            "1.5",
            "show",
            "version",
        ]);
        let req = args.request();
        assert_eq!(req.mode, Mode::Cli as i32);
        assert_eq!(req.command.as_deref(), Some(&b"show version"[..]));
        assert_eq!(req.role_account, "test-admin");
        assert_eq!(req.byte_limit, 1024);
        assert_eq!(req.timeout, 1_500_000_000);
    }

    #[test]
    fn test_trailing_args_keep_hyphens() {
        let req = parse(&["--", "ls", "-la", "/tmp"]).request();
        assert_eq!(req.command.as_deref(), Some(&b"ls -la /tmp"[..]));
    }

    #[test]
    fn test_shell_mode_and_bad_timeout() {
        let req = parse(&["--shell", "--timeout", "-3", "ls"]).request();
        assert_eq!(req.mode, Mode::Shell as i32);
        assert_eq!(req.timeout, 0);
    }

    #[test]
    fn test_command_required() {
        assert!(Args::try_parse_from(["hostexec"]).is_err());
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(0), ExitCode::SUCCESS);
        assert_eq!(exit_code(127), ExitCode::from(127));
        assert_eq!(exit_code(300), ExitCode::from(255));
        assert_eq!(exit_code(-1), ExitCode::from(1));
    }
}
