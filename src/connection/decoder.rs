//! Result decoder.
//!
//! Parses WS-Management responses: shell and command ids, Receive output
//! streams, command state and exit code, and SOAP faults. Elements are matched
//! on their local name so no particular namespace prefix is assumed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::error::{WinRmError, WinRmResult};

/// Remote command state reported by Receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Queued, not started yet
    Pending,
    /// Running; more output may follow
    Running,
    /// Finished; the exit code is final
    Done,
    /// Unrecognised state URI
    Other,
}

impl CommandState {
    /// Map a `CommandState/@State` URI.
    pub fn from_uri(uri: &str) -> Self {
        match uri.rsplit('/').next().unwrap_or(uri) {
            "Done" => CommandState::Done,
            "Running" => CommandState::Running,
            "Pending" => CommandState::Pending,
            _ => CommandState::Other,
        }
    }
}

/// One decoded piece of Receive output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Bytes written to stdout
    Stdout(Vec<u8>),
    /// Bytes written to stderr
    Stderr(Vec<u8>),
    /// Command state, with the exit code once known
    Exit {
        /// Exit code, present when the command is done. WinRM reports it as an
        /// unsigned 32-bit value, so `exit -1` arrives as 4294967295.
        code: Option<i64>,
        /// Reported state
        state: CommandState,
    },
}

/// Decoded Receive response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveOutput {
    /// Chunks in document order; at most one trailing `Exit`
    pub chunks: Vec<OutputChunk>,
}

impl ReceiveOutput {
    /// Exit code if this response reports the command as done.
    pub fn exit_code(&self) -> Option<i64> {
        self.chunks.iter().find_map(|chunk| match chunk {
            OutputChunk::Exit {
                code,
                state: CommandState::Done,
            } => *code,
            _ => None,
        })
    }

    /// Whether the command is done.
    pub fn is_done(&self) -> bool {
        self.chunks.iter().any(|chunk| {
            matches!(
                chunk,
                OutputChunk::Exit {
                    state: CommandState::Done,
                    ..
                }
            )
        })
    }
}

/// Fail with [`WinRmError::SoapFault`] if `xml` carries a SOAP fault.
pub fn check_fault(xml: &str) -> WinRmResult<()> {
    let Some(fault) = find_first(xml, "Fault") else {
        return Ok(());
    };
    let body = fault.inner();

    let code_value = find_first(body, "Code")
        .and_then(|code| find_first(code.inner(), "Value"))
        .map(|v| v.text());
    let subcode_value = find_first(body, "Subcode")
        .and_then(|sub| find_first(sub.inner(), "Value"))
        .map(|v| v.text());
    let reason = find_first(body, "Reason")
        .map(|r| {
            find_first(r.inner(), "Text")
                .map(|t| t.text())
                .unwrap_or_else(|| r.text())
        })
        .filter(|r| !r.is_empty());

    let wsman = find_first(body, "WSManFault");
    let wsman_code = wsman
        .as_ref()
        .and_then(|f| f.attr("Code"))
        .and_then(|c| c.trim().parse::<u32>().ok());
    let wsman_message = wsman
        .as_ref()
        .and_then(|f| find_first(f.inner(), "Message"))
        .map(|m| strip_tags(m.inner()))
        .filter(|m| !m.is_empty());

    Err(WinRmError::SoapFault {
        code: subcode_value
            .or(code_value)
            .unwrap_or_else(|| "unknown".to_string()),
        wsman_code,
        reason: reason
            .or(wsman_message)
            .unwrap_or_else(|| "no fault reason given".to_string()),
    })
}

/// Extract the shell id from a CreateShell response.
pub fn decode_shell_created(xml: &str) -> WinRmResult<String> {
    check_fault(xml)?;

    if let Some(id) = find_first(xml, "ShellId").map(|e| e.text()) {
        if !id.is_empty() {
            return Ok(id);
        }
    }

    find_all(xml, "Selector")
        .into_iter()
        .find(|s| s.attr("Name").as_deref() == Some("ShellId"))
        .map(|s| s.text())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            WinRmError::Unexpected("CreateShell response carries no ShellId".to_string())
        })
}

/// Extract the command id from a Command response.
pub fn decode_command_started(xml: &str) -> WinRmResult<String> {
    check_fault(xml)?;

    find_first(xml, "CommandId")
        .map(|e| e.text())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            WinRmError::Unexpected("Command response carries no CommandId".to_string())
        })
}

/// Decode a Receive response into output chunks.
pub fn decode_receive(xml: &str) -> WinRmResult<ReceiveOutput> {
    check_fault(xml)?;

    let mut chunks = Vec::new();

    for stream in find_all(xml, "Stream") {
        let encoded: String = stream
            .inner()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if encoded.is_empty() {
            continue;
        }
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
            WinRmError::Unexpected(format!("invalid base64 in output stream: {}", e))
        })?;

        match stream.attr("Name").as_deref() {
            Some("stdout") => chunks.push(OutputChunk::Stdout(bytes)),
            Some("stderr") => chunks.push(OutputChunk::Stderr(bytes)),
            _ => {}
        }
    }

    if let Some(state) = find_first(xml, "CommandState") {
        let state_uri = state.attr("State").unwrap_or_default();
        let state_kind = CommandState::from_uri(&state_uri);

        let code = match find_first(state.inner(), "ExitCode") {
            Some(exit) => {
                let text = exit.text();
                Some(text.trim().parse::<i64>().map_err(|_| {
                    WinRmError::Unexpected(format!("invalid exit code '{}'", text))
                })?)
            }
            None => None,
        };

        if state_kind == CommandState::Done && code.is_none() {
            return Err(WinRmError::Unexpected(
                "command reported Done without an exit code".to_string(),
            ));
        }

        chunks.push(OutputChunk::Exit {
            code,
            state: state_kind,
        });
    }

    Ok(ReceiveOutput { chunks })
}

/// Turn a PowerShell CLIXML error stream into plain text.
///
/// Text that is not CLIXML is returned unchanged.
pub fn clean_clixml(text: &str) -> String {
    let Some(rest) = text.strip_prefix("#< CLIXML") else {
        return text.to_string();
    };

    let cleaned: String = find_all(rest, "S")
        .into_iter()
        .filter(|s| s.attr("S").as_deref() == Some("Error"))
        .map(|s| decode_clixml_escapes(&unescape(s.inner())))
        .collect();

    if cleaned.is_empty() {
        text.to_string()
    } else {
        cleaned.trim().to_string()
    }
}

// ============================================================================
// Element scanner
// ============================================================================

struct Element<'a> {
    attrs: &'a str,
    inner: &'a str,
}

impl<'a> Element<'a> {
    fn inner(&self) -> &'a str {
        self.inner
    }

    /// Unescaped, trimmed text content.
    fn text(&self) -> String {
        unescape(self.inner.trim())
    }

    /// Attribute value by local name.
    fn attr(&self, name: &str) -> Option<String> {
        let mut rest = self.attrs;
        loop {
            let eq = rest.find('=')?;
            let key = rest[..eq].trim();
            let after = rest[eq + 1..].trim_start();
            let quote = after.chars().next()?;
            if quote != '"' && quote != '\'' {
                return None;
            }
            let value_end = after[1..].find(quote)?;
            let value = &after[1..1 + value_end];
            if local_name(key) == name {
                return Some(unescape(value));
            }
            rest = &after[value_end + 2..];
        }
    }
}

fn local_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

fn find_first<'a>(xml: &'a str, local: &str) -> Option<Element<'a>> {
    scan(xml, local, true).into_iter().next()
}

fn find_all<'a>(xml: &'a str, local: &str) -> Vec<Element<'a>> {
    scan(xml, local, false)
}

fn scan<'a>(xml: &'a str, local: &str, first_only: bool) -> Vec<Element<'a>> {
    let mut found = Vec::new();
    let mut pos = 0;

    while let Some(offset) = xml[pos..].find('<') {
        let start = pos + offset + 1;
        let Some(tag_end) = find_tag_end(xml, start) else {
            break;
        };
        pos = tag_end + 1;

        let tag = &xml[start..tag_end];
        if tag.starts_with(['/', '?', '!']) {
            continue;
        }

        let self_closing = tag.ends_with('/');
        let tag = tag.trim_end_matches('/');
        let name_end = tag
            .find(|c: char| c.is_whitespace())
            .unwrap_or(tag.len());
        let qname = &tag[..name_end];
        if local_name(qname) != local {
            continue;
        }
        let attrs = &tag[name_end..];

        let inner = if self_closing {
            ""
        } else {
            let close = format!("</{}", qname);
            match xml[pos..].find(&close) {
                Some(close_at) => {
                    let inner = &xml[pos..pos + close_at];
                    pos += close_at;
                    inner
                }
                None => &xml[pos..],
            }
        };

        found.push(Element { attrs, inner });
        if first_only {
            break;
        }
    }

    found
}

/// Index of the `>` closing the tag that starts at `start`, skipping quoted
/// attribute values.
fn find_tag_end(xml: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in xml.as_bytes()[start..].iter().enumerate() {
        match (quote, *b) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(*b),
            (None, b'>') => return Some(start + i),
            (None, _) => {}
        }
    }
    None
}

fn strip_tags(xml: &str) -> String {
    let mut out = String::with_capacity(xml.len());
    let mut in_tag = false;
    for c in xml.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    unescape(out.trim())
}

/// Unescape the predefined XML entities and character references.
fn unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            break;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Decode CLIXML `_xHHHH_` escapes (`_x000D__x000A_` is CRLF, shown as `\n`).
fn decode_clixml_escapes(s: &str) -> String {
    let s = s.replace("_x000D__x000A_", "\n");
    let mut out = String::with_capacity(s.len());
    let mut rest = s.as_str();
    while let Some(at) = rest.find("_x") {
        out.push_str(&rest[..at]);
        let candidate = &rest[at..];
        let decoded = candidate
            .get(2..6)
            .filter(|_| candidate.as_bytes().get(6) == Some(&b'_'))
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
            .and_then(char::from_u32);
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &candidate[7..];
            }
            None => {
                out.push_str("_x");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}
