//! Command executor.
//!
//! Drives one command through the WinRM shell lifecycle as an explicit state
//! machine:
//!
//! ```text
//! Idle -> ShellCreating -> ShellOpen -> CommandRunning -> Draining -> ShellClosing -> Done
//!                 \             \              \                           /
//!                  +-------------+--------------+------------------> Error
//! ```
//!
//! Every exchange is bounded by the invocation deadline and can be cancelled.
//! Once a shell exists, Signal(terminate) and DeleteShell are attempted on
//! every exit path under a separate cleanup budget that ignores cancellation.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::decoder::{self, OutputChunk};
use super::retry::RetryPolicy;
use super::soap::{Action, CommandLine, Envelope, EnvelopeBuilder, ShellOptions};
use super::transport::Transport;
use crate::error::{WinRmError, WinRmResult};

/// Default overall invocation deadline
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(600);

/// Default budget for Signal + DeleteShell after the command finished or failed
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Executor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Nothing sent yet
    Idle,
    /// CreateShell in flight
    ShellCreating,
    /// Shell acquired, command not started
    ShellOpen,
    /// Command started; polling Receive
    CommandRunning,
    /// Command reported Done; output complete
    Draining,
    /// Signal / DeleteShell in flight
    ShellClosing,
    /// Finished with a result
    Done,
    /// Finished with an error
    Error,
}

impl ExecutorState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutorState::Done | ExecutorState::Error)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Executor timing and retry options.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Overall bound on all exchanges of the invocation
    pub deadline: Duration,
    /// Bound on the cleanup exchanges
    pub cleanup_timeout: Duration,
    /// Policy for re-issuing Receive after transport timeouts
    pub receive_retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            receive_retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorOptions {
    /// Set the overall deadline
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the cleanup budget
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Set the Receive retry policy
    pub fn with_receive_retry(mut self, policy: RetryPolicy) -> Self {
        self.receive_retry = policy;
        self
    }
}

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// `exit_code == 0`
    pub success: bool,
    /// Concatenated stdout
    pub stdout: String,
    /// Concatenated stderr (CLIXML cleaned for PowerShell)
    pub stderr: String,
    /// Remote exit code as reported by the server
    pub exit_code: i64,
    /// Cleanup failures that did not affect the result
    pub cleanup_warnings: Vec<String>,
}

/// Raw output collected while polling.
struct CollectedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: i64,
}

/// Runs a single command over a [`Transport`].
pub struct CommandExecutor<T: Transport> {
    transport: T,
    builder: EnvelopeBuilder,
    options: ExecutorOptions,
    cancel: CancellationToken,
    state: ExecutorState,
    history: Vec<ExecutorState>,
}

impl<T: Transport> CommandExecutor<T> {
    /// Create an executor addressing the transport's endpoint.
    pub fn new(transport: T, shell: ShellOptions, options: ExecutorOptions) -> Self {
        let builder = EnvelopeBuilder::new(transport.endpoint().url(), shell);
        Self {
            transport,
            builder,
            options,
            cancel: CancellationToken::new(),
            state: ExecutorState::Idle,
            history: vec![ExecutorState::Idle],
        }
    }

    /// Use `token` to cancel the invocation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Current state
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Every state visited, in order
    pub fn history(&self) -> &[ExecutorState] {
        &self.history
    }

    /// Give the transport back
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Run `command` to completion.
    ///
    /// Errors raised after the shell exists are returned only after cleanup
    /// was attempted.
    pub async fn run(&mut self, command: &CommandLine) -> WinRmResult<ExecutionResult> {
        if self.state != ExecutorState::Idle {
            return Err(WinRmError::Unexpected(format!(
                "executor already used (state {})",
                self.state
            )));
        }

        let deadline = instant_after(self.options.deadline);

        self.transition(ExecutorState::ShellCreating);
        let shell_id = match self.create_shell(deadline).await {
            Ok(id) => id,
            Err(e) => {
                self.transition(ExecutorState::Error);
                return Err(wrap_unless_terminal(e, WinRmError::ShellCreationFailed));
            }
        };
        debug!(shell_id = %shell_id, "shell created");
        self.transition(ExecutorState::ShellOpen);

        let mut command_id = None;
        let outcome = self
            .execute(&shell_id, &mut command_id, command, deadline)
            .await;

        self.transition(ExecutorState::ShellClosing);
        let cleanup_warnings = self.cleanup(&shell_id, command_id.as_deref()).await;

        match outcome {
            Ok(output) => {
                self.transition(ExecutorState::Done);
                Ok(finalize(output, command.is_powershell(), cleanup_warnings))
            }
            Err(e) => {
                self.transition(ExecutorState::Error);
                Err(e)
            }
        }
    }

    async fn create_shell(&mut self, deadline: Instant) -> WinRmResult<String> {
        let envelope = self.builder.create_shell();
        let body = self.exchange(&envelope, deadline).await?;
        decoder::decode_shell_created(&body)
    }

    async fn execute(
        &mut self,
        shell_id: &str,
        command_id: &mut Option<String>,
        command: &CommandLine,
        deadline: Instant,
    ) -> WinRmResult<CollectedOutput> {
        let envelope = self.builder.command(shell_id, command);
        let id = self
            .exchange(&envelope, deadline)
            .await
            .and_then(|body| decoder::decode_command_started(&body))
            .map_err(|e| wrap_unless_terminal(e, WinRmError::CommandDispatchFailed))?;
        debug!(command_id = %id, "command started");
        *command_id = Some(id.clone());
        self.transition(ExecutorState::CommandRunning);

        let output = self.poll(shell_id, &id, deadline).await?;
        self.transition(ExecutorState::Draining);
        Ok(output)
    }

    /// Receive until the command reports Done.
    async fn poll(
        &mut self,
        shell_id: &str,
        command_id: &str,
        deadline: Instant,
    ) -> WinRmResult<CollectedOutput> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut consecutive_failures = 0u32;
        let mut polls = 0u32;

        loop {
            let envelope = self.builder.receive(shell_id, command_id);
            polls += 1;

            let body = match self.exchange(&envelope, deadline).await {
                Ok(body) => {
                    consecutive_failures = 0;
                    body
                }
                Err(e) if self.options.receive_retry.is_retryable(&e) => {
                    let policy = &self.options.receive_retry;
                    if consecutive_failures >= policy.max_retries {
                        return Err(if e.is_transport_timeout() {
                            WinRmError::ExecutionTimeout(format!(
                                "Receive timed out {} times in a row: {}",
                                consecutive_failures + 1,
                                e
                            ))
                        } else {
                            e
                        });
                    }
                    let delay = policy.delay_for_attempt(consecutive_failures);
                    consecutive_failures += 1;
                    warn!(
                        attempt = consecutive_failures,
                        max_retries = policy.max_retries,
                        delay = ?delay,
                        error = %e,
                        "Receive failed, retrying"
                    );
                    self.pause(delay, deadline).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let output = match decoder::decode_receive(&body) {
                Ok(output) => output,
                Err(e) if e.is_operation_timeout() => {
                    trace!(polls, "no output within operation timeout, command still running");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut exit_code = None;
            for chunk in output.chunks {
                match chunk {
                    OutputChunk::Stdout(bytes) => stdout.extend_from_slice(&bytes),
                    OutputChunk::Stderr(bytes) => stderr.extend_from_slice(&bytes),
                    OutputChunk::Exit { code, state } => {
                        trace!(?state, ?code, "command state");
                        if state == decoder::CommandState::Done {
                            exit_code = code;
                        }
                    }
                }
            }

            if let Some(exit_code) = exit_code {
                debug!(exit_code, polls, "command finished");
                return Ok(CollectedOutput {
                    stdout,
                    stderr,
                    exit_code,
                });
            }
        }
    }

    /// One bounded, cancellable exchange.
    async fn exchange(&mut self, envelope: &Envelope, deadline: Instant) -> WinRmResult<String> {
        let limit = self.options.deadline;
        if self.cancel.is_cancelled() {
            return Err(WinRmError::Cancelled);
        }
        // timeout_at polls the inner future once even when already expired
        if Instant::now() >= deadline {
            return Err(deadline_exceeded(limit, envelope.action));
        }

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WinRmError::Cancelled),
            result = tokio::time::timeout_at(deadline, self.transport.send(envelope)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(deadline_exceeded(limit, envelope.action)),
                }
            }
        };

        if let Err(e) = &result {
            debug!(action = %envelope.action, error = %e, "exchange failed");
        }
        result
    }

    /// Sleep before a retry without outliving the deadline.
    async fn pause(&mut self, delay: Duration, deadline: Instant) -> WinRmResult<()> {
        let wake = instant_after(delay).min(deadline);
        let cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WinRmError::Cancelled),
            _ = tokio::time::sleep_until(wake) => Ok(()),
        }
    }

    /// Best-effort Signal(terminate) + DeleteShell. Never fails; returns warnings.
    async fn cleanup(&mut self, shell_id: &str, command_id: Option<&str>) -> Vec<String> {
        let budget = instant_after(self.options.cleanup_timeout);
        let mut warnings = Vec::new();

        if let Some(command_id) = command_id {
            let envelope = self.builder.terminate(shell_id, command_id);
            if let Err(e) = self.cleanup_exchange(&envelope, budget).await {
                warn!(shell_id, command_id, error = %e, "failed to terminate command");
                warnings.push(format!("Signal(terminate) failed: {}", e));
            }
        }

        let envelope = self.builder.delete_shell(shell_id);
        match self.cleanup_exchange(&envelope, budget).await {
            Ok(()) => debug!(shell_id, "shell deleted"),
            Err(e) => {
                warn!(shell_id, error = %e, "failed to delete shell");
                warnings.push(format!("DeleteShell failed: {}", e));
            }
        }

        warnings
    }

    async fn cleanup_exchange(&mut self, envelope: &Envelope, budget: Instant) -> WinRmResult<()> {
        let result = tokio::time::timeout_at(budget, self.transport.send(envelope)).await;
        match result {
            Ok(Ok(body)) => decoder::check_fault(&body),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(WinRmError::ExecutionTimeout(format!(
                "{} exceeded the cleanup budget of {:?}",
                envelope.action, self.options.cleanup_timeout
            ))),
        }
    }

    fn transition(&mut self, next: ExecutorState) {
        trace!(from = %self.state, to = %next, "executor transition");
        self.state = next;
        self.history.push(next);
    }
}

/// `now + budget`, saturating at a far-future instant for budgets the clock
/// cannot represent.
fn instant_after(budget: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn deadline_exceeded(limit: Duration, action: Action) -> WinRmError {
    WinRmError::ExecutionTimeout(format!(
        "invocation deadline of {:?} elapsed during {}",
        limit, action
    ))
}

/// Wrap `error` with `wrap` unless it is reported as-is.
fn wrap_unless_terminal(
    error: WinRmError,
    wrap: fn(Box<WinRmError>) -> WinRmError,
) -> WinRmError {
    if error.is_terminal() {
        error
    } else {
        wrap(Box::new(error))
    }
}

fn finalize(
    output: CollectedOutput,
    powershell: bool,
    cleanup_warnings: Vec<String>,
) -> ExecutionResult {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if powershell {
        stderr = decoder::clean_clixml(&stderr);
    }

    ExecutionResult {
        success: output.exit_code == 0,
        stdout,
        stderr,
        exit_code: output.exit_code,
        cleanup_warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unless_terminal() {
        let wrapped = wrap_unless_terminal(
            WinRmError::Unexpected("x".into()),
            WinRmError::ShellCreationFailed,
        );
        assert!(matches!(wrapped, WinRmError::ShellCreationFailed(_)));

        let kept = wrap_unless_terminal(WinRmError::Cancelled, WinRmError::ShellCreationFailed);
        assert!(matches!(kept, WinRmError::Cancelled));
    }

    #[test]
    fn test_finalize_cleans_powershell_stderr() {
        let output = CollectedOutput {
            stdout: b"ok\r\n".to_vec(),
            stderr: b"#< CLIXML\r\n<Objs><S S=\"Error\">boom_x000D__x000A_</S></Objs>".to_vec(),
            exit_code: 1,
        };
        let result = finalize(output, true, vec!["DeleteShell failed: x".into()]);
        assert!(!result.success);
        assert_eq!(result.stdout, "ok\r\n");
        assert_eq!(result.stderr, "boom");
        assert_eq!(result.cleanup_warnings.len(), 1);
    }

    #[test]
    fn test_finalize_lossy_utf8() {
        let output = CollectedOutput {
            stdout: vec![b'a', 0xff, b'b'],
            stderr: Vec::new(),
            exit_code: 0,
        };
        let result = finalize(output, false, Vec::new());
        assert!(result.success);
        assert_eq!(result.stdout, "a\u{fffd}b");
    }

    #[test]
    fn test_instant_after_saturates() {
        let now = Instant::now();
        assert!(instant_after(Duration::MAX) > now + Duration::from_secs(86_400 * 365));
        assert!(instant_after(Duration::from_secs(1)) <= Instant::now() + Duration::from_secs(1));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecutorState::Done.is_terminal());
        assert!(ExecutorState::Error.is_terminal());
        assert!(!ExecutorState::ShellClosing.is_terminal());
    }
}
