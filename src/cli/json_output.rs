//! JSON report printed on stdout.
//!
//! Every invocation that gets past argument parsing prints exactly one line:
//! `{"success":bool,"stdout":str,"stderr":str,"exitCode":int}`.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

use crate::connection::executor::ExecutionResult;
use crate::error::{WinRmError, WinRmResult};

/// Single-line JSON report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    /// Whether the remote command exited with 0
    pub success: bool,
    /// Remote stdout
    pub stdout: String,
    /// Remote stderr, or the error message on failure
    pub stderr: String,
    /// Remote exit code, 1 on failure
    pub exit_code: i64,
}

impl ExecutionReport {
    /// Report for a command that ran to completion. Cleanup warnings are
    /// appended to stderr without changing `success`.
    pub fn from_result(result: ExecutionResult) -> Self {
        let mut stderr = result.stderr;
        for warning in &result.cleanup_warnings {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str("warning: ");
            stderr.push_str(warning);
        }

        Self {
            success: result.success,
            stdout: result.stdout,
            stderr,
            exit_code: result.exit_code,
        }
    }

    /// Report for a failed invocation.
    pub fn from_error(error: &WinRmError) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: 1,
        }
    }

    /// Report for an argument-parsing failure.
    pub fn usage_error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: 1,
        }
    }

    /// Report for either outcome.
    pub fn from_outcome(outcome: WinRmResult<ExecutionResult>) -> Self {
        match outcome {
            Ok(result) => Self::from_result(result),
            Err(e) => Self::from_error(&e),
        }
    }

    /// Compact single-line JSON
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Write the report to stdout and flush.
    pub fn print(&self) -> io::Result<()> {
        let line = self.to_json_line().map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        stdout.flush()
    }
}
