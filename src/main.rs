//! winrm-exec
//!
//! Runs one PowerShell command on a Windows host over WinRM and prints a
//! single JSON line on stdout. Exits 0 whenever a report was produced and 1
//! only when the arguments could not be parsed.

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use winrm_exec::cli::{Cli, ExecutionReport};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            ExecutionReport::usage_error(e.to_string().trim_end()).print()?;
            std::process::exit(1);
        }
    };

    init_logging(cli.verbosity());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, closing the remote shell");
            on_signal.cancel();
        }
    });

    let report = cli.execute(cancel).await;
    report.print()?;
    Ok(())
}

/// Initialize logging on stderr based on verbosity level
fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 3),
        )
        .with(env_filter)
        .init();
}
