//! Implements the command framing and sequencing of the SMTP protocol.
//!
//! `SmtpProtocol` reads command lines, answers the commands it can handle on
//! its own (greetings, NOOP, syntax and sequence errors) and hands everything
//! that touches the envelope back to the connection handler as an
//! `SmtpCommandResult`, which consults the session and then confirms the
//! transition with one of the `accept_*` methods.

use crate::config::ServerConfig;
use crate::smtp::data_reader::DotReader;
use crate::smtp::error::Reply;
use crate::smtp::session::{MailOptions, RcptOptions};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, warn};
use mailparse::{addrparse, MailAddr};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Longest command line accepted, CRLF included.
const MAX_LINE_LENGTH: u64 = 4096;

/// Represents the possible states during an SMTP session.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SmtpState {
    /// Connected, waiting for HELO/EHLO.
    Initial,
    /// Greeted; no mail transaction in progress.
    Greeted,
    /// A sender has been accepted. Client should send RCPT TO.
    MailFrom,
    /// At least one recipient has been accepted. Client can send more RCPT TO or DATA.
    RcptTo,
    /// DATA acknowledged with 354; message content follows.
    Data,
}

/// Manages the state and I/O for a single SMTP client connection.
///
/// Generic over the reader and writer so tests can drive it with in-memory
/// buffers.
pub struct SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
    state: SmtpState,
    authenticated: bool,
    config: Arc<ServerConfig>,
}

impl<R, W> SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W, config: Arc<ServerConfig>) -> Self {
        SmtpProtocol {
            reader,
            writer,
            state: SmtpState::Initial,
            authenticated: false,
            config,
        }
    }

    /// Sends the initial 220 greeting.
    pub async fn send_greeting(&mut self) -> Result<()> {
        let greeting = format!("220 {} ESMTP Service Ready", self.config.domain);
        self.write_line(&greeting).await
    }

    /// Processes a single command line received from the client.
    ///
    /// Commands fully handled here have already been answered when this
    /// returns. For `Auth`, `MailFrom`, `RcptTo` and `DataStart` no reply
    /// has been written yet except the 354 for DATA.
    pub async fn process_command(&mut self, line: &str) -> Result<SmtpCommandResult> {
        debug!("SMTP({:?}): Processing command: {:?}", self.state, line);

        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
            None => (line.trim().to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" | "EHLO" => {
                if arg.is_empty() {
                    self.write_line(&format!("501 5.5.4 Syntax: {} hostname", verb))
                        .await?;
                    return Ok(SmtpCommandResult::Continue);
                }
                if verb == "EHLO" {
                    self.write_line(&format!("250-{} Hello {}", self.config.domain, arg))
                        .await?;
                    self.write_line("250-8BITMIME").await?;
                    self.write_line(&format!("250-SIZE {}", self.config.max_message_bytes))
                        .await?;
                    self.write_line("250 AUTH PLAIN").await?;
                } else {
                    self.write_line(&format!("250 {} Hello {}", self.config.domain, arg))
                        .await?;
                }
                self.state = SmtpState::Greeted;
                Ok(SmtpCommandResult::Reset)
            }
            "AUTH" => self.process_auth(arg).await,
            "MAIL" => {
                if self.state == SmtpState::Initial {
                    self.write_line("503 5.5.1 Please introduce yourself first").await?;
                    return Ok(SmtpCommandResult::Continue);
                }
                if self.state != SmtpState::Greeted {
                    self.write_line("503 5.5.1 Nested MAIL command").await?;
                    return Ok(SmtpCommandResult::Continue);
                }
                let Some(path) = strip_prefix_ignore_case(arg, "FROM:") else {
                    self.write_line("501 5.5.4 Syntax: MAIL FROM:<address>").await?;
                    return Ok(SmtpCommandResult::Continue);
                };
                let Some((address, params)) = split_path(path) else {
                    self.write_line("501 5.1.7 Bad sender address syntax").await?;
                    return Ok(SmtpCommandResult::Continue);
                };
                let address = if address.is_empty() {
                    String::new()
                } else if let Some(addr) = self.extract_email(address) {
                    addr
                } else {
                    self.write_line("501 5.1.7 Bad sender address syntax").await?;
                    return Ok(SmtpCommandResult::Continue);
                };
                match self.parse_mail_options(params) {
                    Ok(options) => Ok(SmtpCommandResult::MailFrom { address, options }),
                    Err(reply) => {
                        self.reply(&reply).await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                }
            }
            "RCPT" => {
                if !matches!(self.state, SmtpState::MailFrom | SmtpState::RcptTo) {
                    self.write_line("503 5.5.1 Bad sequence of commands (MAIL FROM required first)")
                        .await?;
                    return Ok(SmtpCommandResult::Continue);
                }
                let parsed = strip_prefix_ignore_case(arg, "TO:")
                    .and_then(split_path)
                    .and_then(|(address, params)| {
                        self.extract_email(address).map(|addr| (addr, params))
                    });
                match parsed {
                    Some((address, params)) => Ok(SmtpCommandResult::RcptTo {
                        address,
                        options: RcptOptions {
                            params: params.split_whitespace().map(str::to_string).collect(),
                        },
                    }),
                    None => {
                        self.write_line("501 5.1.3 Syntax: RCPT TO:<address>").await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                }
            }
            "DATA" => {
                match self.state {
                    SmtpState::RcptTo => {
                        self.write_line("354 Start mail input; end with <CRLF>.<CRLF>")
                            .await?;
                        self.state = SmtpState::Data;
                        Ok(SmtpCommandResult::DataStart)
                    }
                    SmtpState::MailFrom => {
                        self.write_line("554 5.5.1 No valid recipients").await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                    _ => {
                        self.write_line("503 5.5.1 Bad sequence of commands (MAIL FROM and RCPT TO required first)")
                            .await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                }
            }
            "RSET" => {
                if self.state != SmtpState::Initial {
                    self.state = SmtpState::Greeted;
                }
                self.write_line("250 2.0.0 OK").await?;
                Ok(SmtpCommandResult::Reset)
            }
            "NOOP" => {
                self.write_line("250 2.0.0 OK").await?;
                Ok(SmtpCommandResult::Continue)
            }
            "QUIT" => {
                self.write_line("221 2.0.0 Bye").await?;
                Ok(SmtpCommandResult::Quit)
            }
            "STARTTLS" => {
                self.write_line("502 5.5.1 STARTTLS not supported").await?;
                Ok(SmtpCommandResult::Continue)
            }
            _ => {
                self.write_line("500 5.5.2 Command not recognized").await?;
                Ok(SmtpCommandResult::Continue)
            }
        }
    }

    async fn process_auth(&mut self, arg: &str) -> Result<SmtpCommandResult> {
        if self.state == SmtpState::Initial {
            self.write_line("503 5.5.1 Please introduce yourself first").await?;
            return Ok(SmtpCommandResult::Continue);
        }
        if self.state != SmtpState::Greeted {
            self.write_line("503 5.5.1 AUTH not allowed during a mail transaction").await?;
            return Ok(SmtpCommandResult::Continue);
        }
        if self.authenticated {
            self.write_line("503 5.5.1 Already authenticated").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        let (mechanism, initial) = match arg.split_once(' ') {
            Some((mechanism, initial)) => (mechanism, Some(initial.trim().to_string())),
            None => (arg, None),
        };
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            self.write_line("504 5.5.4 Unrecognized authentication type").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        let response = match initial {
            Some(response) => response,
            None => {
                self.write_line("334 ").await?;
                match self.read_line().await? {
                    Some(line) => line,
                    None => return Ok(SmtpCommandResult::Quit),
                }
            }
        };
        if response == "*" {
            self.write_line("501 5.0.0 Authentication cancelled").await?;
            return Ok(SmtpCommandResult::Continue);
        }

        match decode_plain_response(&response) {
            Some((username, password)) => Ok(SmtpCommandResult::Auth { username, password }),
            None => {
                self.write_line("501 5.5.2 Invalid AUTH PLAIN response").await?;
                Ok(SmtpCommandResult::Continue)
            }
        }
    }

    fn parse_mail_options(&self, params: &str) -> std::result::Result<MailOptions, Reply> {
        let mut options = MailOptions::default();
        for param in params.split_whitespace() {
            let (key, value) = match param.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (param, None),
            };
            if key.eq_ignore_ascii_case("SIZE") {
                let size = value
                    .and_then(|v| v.parse::<usize>().ok())
                    .ok_or_else(|| Reply::new(501, "5.5.4", "Invalid SIZE parameter"))?;
                if size > self.config.max_message_bytes {
                    return Err(Reply::new(552, "5.3.4", "Message size exceeds fixed limit"));
                }
                options.size = Some(size);
            } else if key.eq_ignore_ascii_case("BODY") {
                options.body = value.map(str::to_ascii_uppercase);
            } else {
                debug!("Ignoring unsupported MAIL parameter: {}", param);
            }
        }
        Ok(options)
    }

    /// Records that the session accepted the AUTH credentials.
    pub fn accept_auth(&mut self) {
        self.authenticated = true;
    }

    /// Records that the session accepted the sender.
    pub fn accept_mail(&mut self) {
        self.state = SmtpState::MailFrom;
    }

    /// Records that the session accepted a recipient.
    pub fn accept_rcpt(&mut self) {
        self.state = SmtpState::RcptTo;
    }

    /// Returns a reader over the message content of the current DATA phase.
    pub fn data_reader(&mut self) -> DotReader<'_, R> {
        DotReader::new(&mut self.reader, self.config.read_timeout)
    }

    /// Ends the DATA phase; the next message starts from scratch.
    pub fn end_data(&mut self) {
        self.state = SmtpState::Greeted;
    }

    /// Reads a single command line, without its line terminator.
    ///
    /// Returns `None` when the peer closed the connection. A line that is not
    /// valid UTF-8 is answered with `500` and skipped.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let read_timeout = self.config.read_timeout;
        loop {
            let mut buffer = Vec::new();
            let bytes_read = {
                let mut limited = (&mut self.reader).take(MAX_LINE_LENGTH);
                tokio::time::timeout(read_timeout, limited.read_until(b'\n', &mut buffer))
                    .await
                    .map_err(|_| anyhow!("timed out waiting for a command"))??
            };

            if bytes_read == 0 {
                return Ok(None);
            }
            if !buffer.ends_with(b"\n") {
                if bytes_read as u64 >= MAX_LINE_LENGTH {
                    self.write_line("500 5.5.2 Line too long").await?;
                    return Err(anyhow!("command line exceeded {} bytes", MAX_LINE_LENGTH));
                }
                return Ok(None);
            }

            match String::from_utf8(buffer) {
                Ok(buffer) => {
                    let line = buffer.trim_end_matches(['\r', '\n']).to_string();
                    debug!("SMTP Read: {}", line);
                    return Ok(Some(line));
                }
                Err(e) => {
                    debug!("SMTP Read: {} bytes of non-UTF-8 input", e.as_bytes().len());
                    self.write_line("500 5.5.2 Command is not valid UTF-8").await?;
                }
            }
        }
    }

    /// Writes a single line (appending CRLF) and flushes it.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("SMTP Write: {}", line);
        let write_timeout = self.config.write_timeout;
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
            writer.flush().await
        };
        tokio::time::timeout(write_timeout, write)
            .await
            .map_err(|_| anyhow!("timed out writing a reply"))??;
        Ok(())
    }

    pub async fn reply(&mut self, reply: &Reply) -> Result<()> {
        self.write_line(&reply.to_string()).await
    }

    /// Extracts the bare address from a path, accepting a display name
    /// form such as `John Doe <john@example.com>`.
    fn extract_email(&self, spec: &str) -> Option<String> {
        match addrparse(spec) {
            Ok(addrs) => addrs.iter().next().and_then(|mail_addr| match mail_addr {
                MailAddr::Single(info) if !info.addr.is_empty() => Some(info.addr.clone()),
                MailAddr::Single(_) => None,
                MailAddr::Group(_) => {
                    warn!("Unexpected group address found in MAIL FROM/RCPT TO: {}", spec);
                    None
                }
            }),
            Err(e) => {
                warn!("Failed to parse address spec '{}': {}", spec, e);
                None
            }
        }
    }

    pub fn get_state(&self) -> SmtpState {
        self.state
    }
}

/// Represents the outcome of processing a single SMTP command line.
#[derive(Debug, PartialEq)]
pub enum SmtpCommandResult {
    /// Command fully handled, read the next one.
    Continue,
    /// Client quit or vanished; close the connection.
    Quit,
    /// The envelope must be discarded (RSET, HELO, EHLO).
    Reset,
    /// AUTH PLAIN credentials, not yet answered.
    Auth { username: String, password: String },
    /// MAIL FROM, not yet answered. An empty address is the null reverse path.
    MailFrom { address: String, options: MailOptions },
    /// RCPT TO, not yet answered.
    RcptTo { address: String, options: RcptOptions },
    /// DATA accepted with 354; message content follows.
    DataStart,
}

fn strip_prefix_ignore_case<'a>(arg: &'a str, prefix: &str) -> Option<&'a str> {
    let head = arg.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| arg[prefix.len()..].trim_start())
}

/// Splits `<address> PARAMS` into the address inside the brackets and the
/// parameter string. A bare address without brackets is accepted too.
fn split_path(path: &str) -> Option<(&str, &str)> {
    if let Some(inner) = path.strip_prefix('<') {
        let mut depth = 1;
        for (idx, c) in inner.char_indices() {
            match c {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some((inner[..idx].trim(), inner[idx + 1..].trim()));
                    }
                }
                _ => {}
            }
        }
        None
    } else {
        let (address, params) = path.split_once(' ').unwrap_or((path, ""));
        (!address.is_empty()).then(|| (address, params.trim()))
    }
}

/// Decodes an AUTH PLAIN response: base64 of `authzid NUL authcid NUL passwd`.
fn decode_plain_response(response: &str) -> Option<(String, String)> {
    let decoded = if response == "=" {
        Vec::new()
    } else {
        BASE64.decode(response.trim()).ok()?
    };
    let decoded = String::from_utf8(decoded).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    let username = parts.next()?.to_string();
    let password = parts.next()?.to_string();
    if parts.next().is_some() || username.is_empty() {
        return None;
    }
    Some((username, password))
}
