//! # winrm-exec
//!
//! Runs a single PowerShell command on a remote Windows host over WinRM
//! (WS-Management) and reports the outcome as one line of JSON.
//!
//! ## Architecture Overview
//!
//! ```text
//! CLI args ─► Endpoint Resolver ─► Auth Strategy ─► Transport Session
//!                                                        │
//!                 Result Decoder ◄── Command Executor ◄──┘
//!                       │           (CreateShell, Command,
//!                       ▼            Receive*, Signal, DeleteShell)
//!                 JSON report
//! ```
//!
//! The library can be used without the CLI through [`WinRmSession`].

pub mod cli;
pub mod config;
pub mod connection;
pub mod error;

pub use config::Config;
pub use connection::{
    AuthMethod, ConnectionConfig, Credentials, ExecutionResult, WinRmSession,
};
pub use error::{WinRmError, WinRmResult};
