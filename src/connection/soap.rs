//! SOAP envelope builder.
//!
//! Produces the five WS-Management envelopes a single command needs:
//! CreateShell, Command, Receive, Signal and DeleteShell. All functions are
//! pure; each call stamps a fresh `MessageID`.

use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use uuid::Uuid;

// Namespaces
const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const MS_WSMAN_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const ANONYMOUS_ADDRESS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// Resource URI of the cmd shell
pub const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

/// Signal code that terminates a running command
pub const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Default `MaxEnvelopeSize` in bytes
pub const DEFAULT_MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Default server-side Receive wait
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(20);

/// UTF-8 console code page
pub const DEFAULT_CODEPAGE: u32 = 65001;

/// Default message locale
pub const DEFAULT_LOCALE: &str = "en-US";

/// WS-Management action of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// WS-Transfer Create on the shell resource
    CreateShell,
    /// Start a command inside a shell
    Command,
    /// Poll command output
    Receive,
    /// Send a signal to a command
    Signal,
    /// WS-Transfer Delete on the shell resource
    DeleteShell,
}

impl Action {
    /// The `wsa:Action` URI.
    pub fn uri(self) -> &'static str {
        match self {
            Action::CreateShell => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create",
            Action::Command => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command",
            Action::Receive => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive",
            Action::Signal => "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal",
            Action::DeleteShell => "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::CreateShell => "CreateShell",
            Action::Command => "Command",
            Action::Receive => "Receive",
            Action::Signal => "Signal",
            Action::DeleteShell => "DeleteShell",
        };
        f.write_str(name)
    }
}

/// A ready-to-send SOAP envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Action this envelope performs
    pub action: Action,
    /// `uuid:...` message id
    pub message_id: String,
    /// Serialized XML
    pub xml: String,
}

/// Shell and header options shared by every envelope of an invocation.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Console code page (`WINRS_CODEPAGE`)
    pub codepage: u32,
    /// Server-side wait bound for each request
    pub operation_timeout: Duration,
    /// Maximum SOAP envelope size in bytes
    pub max_envelope_size: u32,
    /// Message and data locale
    pub locale: String,
    /// Skip loading the user profile
    pub no_profile: bool,
    /// Initial working directory of the shell
    pub working_directory: Option<String>,
    /// Environment variables set in the shell
    pub environment: Vec<(String, String)>,
    /// Shell idle timeout
    pub idle_timeout: Option<Duration>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            codepage: DEFAULT_CODEPAGE,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            locale: DEFAULT_LOCALE.to_string(),
            no_profile: false,
            working_directory: None,
            environment: Vec::new(),
            idle_timeout: None,
        }
    }
}

impl ShellOptions {
    /// Set the operation timeout
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the working directory
    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((name.into(), value.into()));
        self
    }

    /// Set the shell idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// How a command line was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A PowerShell script run through `powershell -encodedcommand`
    PowerShell,
    /// A plain cmd.exe command line
    Cmd,
}

/// Command text and arguments for the Command envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    command: String,
    arguments: Vec<String>,
    kind: CommandKind,
}

impl CommandLine {
    /// Run `script` through PowerShell as an encoded command.
    pub fn powershell(script: &str) -> Self {
        Self {
            command: format!("powershell -encodedcommand {}", encode_powershell(script)),
            arguments: Vec::new(),
            kind: CommandKind::PowerShell,
        }
    }

    /// Run a cmd.exe command with arguments.
    pub fn cmd<I, S>(command: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            kind: CommandKind::Cmd,
        }
    }

    /// The command text
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Arguments
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Whether this runs a PowerShell script
    pub fn is_powershell(&self) -> bool {
        self.kind == CommandKind::PowerShell
    }
}

/// Base64 of the UTF-16LE script, as expected by `-EncodedCommand`.
pub fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    BASE64.encode(utf16)
}

/// Builds envelopes addressed to one endpoint.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    to: String,
    options: ShellOptions,
}

impl EnvelopeBuilder {
    /// Create a builder for the endpoint URL `to`.
    pub fn new(to: impl Into<String>, options: ShellOptions) -> Self {
        Self {
            to: to.into(),
            options,
        }
    }

    /// Options in use
    pub fn options(&self) -> &ShellOptions {
        &self.options
    }

    /// CreateShell envelope.
    pub fn create_shell(&self) -> Envelope {
        let codepage = self.options.codepage.to_string();
        let no_profile = if self.options.no_profile { "TRUE" } else { "FALSE" };
        let options = [("WINRS_NOPROFILE", no_profile), ("WINRS_CODEPAGE", codepage.as_str())];

        let mut body = String::from(
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
        );
        if let Some(dir) = &self.options.working_directory {
            body.push_str(&format!(
                "<rsp:WorkingDirectory>{}</rsp:WorkingDirectory>",
                xml_escape(dir)
            ));
        }
        if let Some(idle) = self.options.idle_timeout {
            body.push_str(&format!(
                "<rsp:IdleTimeOut>{}</rsp:IdleTimeOut>",
                format_duration(idle)
            ));
        }
        if !self.options.environment.is_empty() {
            body.push_str("<rsp:Environment>");
            for (name, value) in &self.options.environment {
                body.push_str(&format!(
                    r#"<rsp:Variable Name="{}">{}</rsp:Variable>"#,
                    xml_escape(name),
                    xml_escape(value)
                ));
            }
            body.push_str("</rsp:Environment>");
        }
        body.push_str("</rsp:Shell>");

        self.envelope(Action::CreateShell, None, &options, &body)
    }

    /// Command envelope.
    pub fn command(&self, shell_id: &str, command: &CommandLine) -> Envelope {
        let options = [
            ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
            ("WINRS_SKIP_CMD_SHELL", "FALSE"),
        ];
        let arguments: String = command
            .arguments()
            .iter()
            .map(|arg| format!("<rsp:Arguments>{}</rsp:Arguments>", xml_escape(arg)))
            .collect();
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command>{}</rsp:CommandLine>",
            xml_escape(command.command()),
            arguments
        );

        self.envelope(Action::Command, Some(shell_id), &options, &body)
    }

    /// Receive envelope for `command_id`.
    pub fn receive(&self, shell_id: &str, command_id: &str) -> Envelope {
        let options = [("WSMAN_CMDSHELL_OPTION_KEEPALIVE", "TRUE")];
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            xml_escape(command_id)
        );

        self.envelope(Action::Receive, Some(shell_id), &options, &body)
    }

    /// Signal envelope carrying `code`.
    pub fn signal(&self, shell_id: &str, command_id: &str, code: &str) -> Envelope {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            xml_escape(command_id),
            xml_escape(code)
        );

        self.envelope(Action::Signal, Some(shell_id), &[], &body)
    }

    /// Signal(terminate) envelope.
    pub fn terminate(&self, shell_id: &str, command_id: &str) -> Envelope {
        self.signal(shell_id, command_id, SIGNAL_TERMINATE)
    }

    /// DeleteShell envelope.
    pub fn delete_shell(&self, shell_id: &str) -> Envelope {
        self.envelope(Action::DeleteShell, Some(shell_id), &[], "")
    }

    fn envelope(
        &self,
        action: Action,
        shell_id: Option<&str>,
        option_set: &[(&str, &str)],
        body: &str,
    ) -> Envelope {
        let message_id = format!("uuid:{}", Uuid::new_v4().to_string().to_uppercase());
        let locale = xml_escape(&self.options.locale);

        let selector = shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    xml_escape(id)
                )
            })
            .unwrap_or_default();

        let options = if option_set.is_empty() {
            String::new()
        } else {
            let items: String = option_set
                .iter()
                .map(|(name, value)| {
                    format!(r#"<w:Option Name="{}">{}</w:Option>"#, name, xml_escape(value))
                })
                .collect();
            format!(
                r#"<w:OptionSet xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">{}</w:OptionSet>"#,
                items
            )
        };

        let body = if body.is_empty() {
            "<s:Body/>".to_string()
        } else {
            format!("<s:Body>{}</s:Body>", body)
        };

        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:p="{MS_WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
<s:Header>
<a:To>{to}</a:To>
<w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
<a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS_ADDRESS}</a:Address></a:ReplyTo>
<a:Action s:mustUnderstand="true">{action}</a:Action>
<w:MaxEnvelopeSize s:mustUnderstand="true">{max_size}</w:MaxEnvelopeSize>
<a:MessageID>{message_id}</a:MessageID>
<w:Locale xml:lang="{locale}" s:mustUnderstand="false"/>
<p:DataLocale xml:lang="{locale}" s:mustUnderstand="false"/>
<w:OperationTimeout>{timeout}</w:OperationTimeout>
{selector}{options}
</s:Header>
{body}
</s:Envelope>"#,
            to = xml_escape(&self.to),
            action = action.uri(),
            max_size = self.options.max_envelope_size,
            timeout = format_duration(self.options.operation_timeout),
        );

        Envelope {
            action,
            message_id,
            xml,
        }
    }
}

/// Format a duration as an `xs:duration` (`PT20S`, `PT1.500S`).
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.subsec_millis();
    if millis == 0 {
        format!("PT{}S", duration.as_secs())
    } else {
        format!("PT{}.{:03}S", duration.as_secs(), millis)
    }
}

/// XML escape helper
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
