//! Shared test utilities for the winrm-exec test suite.
//!
//! This module provides:
//! - `ScriptedTransport`: replays canned replies per action and records calls
//! - `FakeShellServer`: a stateful in-memory listener for concurrency tests
//! - XML builders for WS-Management responses
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;

use winrm_exec::connection::endpoint::{Endpoint, Scheme};
use winrm_exec::connection::soap::{Action, Envelope};
use winrm_exec::connection::transport::Transport;
use winrm_exec::error::{TransportErrorKind, WinRmError, WinRmResult, WSMAN_OPERATION_TIMEOUT};

// ============================================================================
// Response XML
// ============================================================================

const ENVELOPE_OPEN: &str = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Header/><s:Body>"#;
const ENVELOPE_CLOSE: &str = "</s:Body></s:Envelope>";
const STATE_RUNNING: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running";
const STATE_DONE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

fn wrap(body: &str) -> String {
    format!("{}{}{}", ENVELOPE_OPEN, body, ENVELOPE_CLOSE)
}

/// CreateShell response carrying `shell_id`.
pub fn shell_created(shell_id: &str) -> String {
    wrap(&format!(
        "<rsp:Shell><rsp:ShellId>{}</rsp:ShellId></rsp:Shell>",
        shell_id
    ))
}

/// Command response carrying `command_id`.
pub fn command_started(command_id: &str) -> String {
    wrap(&format!(
        "<rsp:CommandResponse><rsp:CommandId>{}</rsp:CommandId></rsp:CommandResponse>",
        command_id
    ))
}

fn streams(stdout: &str, stderr: &str) -> String {
    let mut xml = String::new();
    if !stdout.is_empty() {
        xml.push_str(&format!(
            r#"<rsp:Stream Name="stdout" CommandId="C1">{}</rsp:Stream>"#,
            BASE64.encode(stdout)
        ));
    }
    if !stderr.is_empty() {
        xml.push_str(&format!(
            r#"<rsp:Stream Name="stderr" CommandId="C1">{}</rsp:Stream>"#,
            BASE64.encode(stderr)
        ));
    }
    xml
}

/// Receive response with output while the command is still running.
pub fn receive_running(stdout: &str) -> String {
    wrap(&format!(
        r#"<rsp:ReceiveResponse>{}<rsp:CommandState CommandId="C1" State="{}"/></rsp:ReceiveResponse>"#,
        streams(stdout, ""),
        STATE_RUNNING
    ))
}

/// Final Receive response.
pub fn receive_done(stdout: &str, stderr: &str, exit_code: i64) -> String {
    wrap(&format!(
        r#"<rsp:ReceiveResponse>{}<rsp:CommandState CommandId="C1" State="{}"><rsp:ExitCode>{}</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse>"#,
        streams(stdout, stderr),
        STATE_DONE,
        exit_code
    ))
}

/// SOAP fault.
pub fn fault(subcode: &str, wsman_code: u32, reason: &str) -> String {
    wrap(&format!(
        r#"<s:Fault><s:Code><s:Value>s:Receiver</s:Value><s:Subcode><s:Value>{}</s:Value></s:Subcode></s:Code><s:Reason><s:Text xml:lang="en-US">{}</s:Text></s:Reason><s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="{}" Machine="winhost"><f:Message>{}</f:Message></f:WSManFault></s:Detail></s:Fault>"#,
        subcode, reason, wsman_code, reason
    ))
}

/// The fault a Receive returns when no output arrived within the operation timeout.
pub fn operation_timeout_fault() -> String {
    fault(
        "w:TimedOut",
        WSMAN_OPERATION_TIMEOUT,
        "The WS-Management service cannot complete the operation within the time specified in OperationTimeout.",
    )
}

/// Empty success body (Signal, DeleteShell).
pub fn empty_response() -> String {
    wrap("")
}

/// Default endpoint used by in-memory transports.
pub fn test_endpoint() -> Endpoint {
    Endpoint::resolve("winhost", 5985, Scheme::Http).unwrap()
}

// ============================================================================
// Scripted Transport
// ============================================================================

/// A canned reply.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Response body
    Body(String),
    /// Per-request timeout
    Timeout,
    /// Connection refused
    Refused,
}

impl Reply {
    fn into_result(self) -> WinRmResult<String> {
        match self {
            Reply::Body(body) => Ok(body),
            Reply::Timeout => Err(WinRmError::transport(
                TransportErrorKind::Timeout,
                "operation timed out",
            )),
            Reply::Refused => Err(WinRmError::transport(
                TransportErrorKind::Connect,
                "connection refused",
            )),
        }
    }
}

impl From<String> for Reply {
    fn from(body: String) -> Self {
        Reply::Body(body)
    }
}

/// Shared record of the actions a transport was asked to send.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Action>>>);

impl CallLog {
    /// All actions in order.
    pub fn actions(&self) -> Vec<Action> {
        self.0.lock().clone()
    }

    /// Number of times `action` was sent.
    pub fn count(&self, action: Action) -> usize {
        self.0.lock().iter().filter(|a| **a == action).count()
    }

    fn push(&self, action: Action) {
        self.0.lock().push(action);
    }
}

/// Transport that replays per-action reply queues.
///
/// The last reply queued for an action repeats forever. Signal and DeleteShell
/// succeed with an empty body unless scripted otherwise.
pub struct ScriptedTransport {
    endpoint: Endpoint,
    replies: HashMap<Action, VecDeque<Reply>>,
    delays: HashMap<Action, Duration>,
    log: CallLog,
}

impl ScriptedTransport {
    /// Create an empty script.
    pub fn new() -> Self {
        Self {
            endpoint: test_endpoint(),
            replies: HashMap::new(),
            delays: HashMap::new(),
            log: CallLog::default(),
        }
    }

    /// Script for the standard happy path: shell "S1", command "C1", then `receives`.
    pub fn with_command<R: Into<Reply>>(receives: impl IntoIterator<Item = R>) -> Self {
        let mut script = Self::new()
            .reply(Action::CreateShell, shell_created("S1"))
            .reply(Action::Command, command_started("C1"));
        for reply in receives {
            script = script.reply(Action::Receive, reply);
        }
        script
    }

    /// Queue a reply for `action`.
    pub fn reply(mut self, action: Action, reply: impl Into<Reply>) -> Self {
        self.replies
            .entry(action)
            .or_default()
            .push_back(reply.into());
        self
    }

    /// Delay every `action` by `delay` before replying.
    pub fn delay(mut self, action: Action, delay: Duration) -> Self {
        self.delays.insert(action, delay);
        self
    }

    /// Handle to the call log.
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn next_reply(&mut self, action: Action) -> Reply {
        match self.replies.get_mut(&action) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => match action {
                Action::Signal | Action::DeleteShell => Reply::Body(empty_response()),
                _ => Reply::Body(fault("w:InternalError", 1, "no scripted reply")),
            },
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, envelope: &Envelope) -> WinRmResult<String> {
        self.log.push(envelope.action);
        if let Some(delay) = self.delays.get(&envelope.action) {
            tokio::time::sleep(*delay).await;
        }
        self.next_reply(envelope.action).into_result()
    }
}

// ============================================================================
// Fake Shell Server
// ============================================================================

#[derive(Debug, Default)]
struct ServerState {
    next_shell: u32,
    open_shells: HashSet<String>,
    created: Vec<String>,
}

/// In-memory listener shared by several transports. Each CreateShell gets a
/// fresh id; commands echo the shell they ran in.
#[derive(Debug, Clone, Default)]
pub struct FakeShellServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeShellServer {
    /// Create a server with no shells.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client connection to this server.
    pub fn connect(&self) -> FakeShellTransport {
        FakeShellTransport {
            endpoint: test_endpoint(),
            server: self.clone(),
        }
    }

    /// Shell ids created so far.
    pub fn created(&self) -> Vec<String> {
        self.state.lock().created.clone()
    }

    /// Shells not yet deleted.
    pub fn open_shells(&self) -> usize {
        self.state.lock().open_shells.len()
    }

    fn handle(&self, envelope: &Envelope) -> String {
        let mut state = self.state.lock();
        let shell_id = selected_shell(&envelope.xml);

        match envelope.action {
            Action::CreateShell => {
                state.next_shell += 1;
                let id = format!("SHELL-{}", state.next_shell);
                state.open_shells.insert(id.clone());
                state.created.push(id.clone());
                shell_created(&id)
            }
            _ if !shell_id
                .as_ref()
                .is_some_and(|id| state.open_shells.contains(id)) =>
            {
                fault("w:InvalidSelectors", 2150858843, "unknown shell")
            }
            Action::Command => command_started("C1"),
            Action::Receive => {
                receive_done(&format!("ran in {}\n", shell_id.unwrap_or_default()), "", 0)
            }
            Action::Signal => empty_response(),
            Action::DeleteShell => {
                if let Some(id) = shell_id {
                    state.open_shells.remove(&id);
                }
                empty_response()
            }
        }
    }
}

/// One client's view of a [`FakeShellServer`].
pub struct FakeShellTransport {
    endpoint: Endpoint,
    server: FakeShellServer,
}

#[async_trait]
impl Transport for FakeShellTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, envelope: &Envelope) -> WinRmResult<String> {
        tokio::task::yield_now().await;
        Ok(self.server.handle(envelope))
    }
}

/// The ShellId selector of a request envelope.
pub fn selected_shell(xml: &str) -> Option<String> {
    let marker = r#"<w:Selector Name="ShellId">"#;
    let start = xml.find(marker)? + marker.len();
    let end = xml[start..].find("</w:Selector>")? + start;
    Some(xml[start..end].to_string())
}
