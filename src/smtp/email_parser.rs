//! Turns the raw bytes of a DATA phase into the `From`, `To` and `Subject`
//! header values plus the undecoded body.

use crate::smtp::error::SessionError;
use log::debug;
use mailparse::{parse_headers, MailHeader, MailHeaderMap};

/// The fields of a received message that are forwarded to the webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A namespace struct for message parsing logic.
///
/// Only single-part messages are understood: a multipart body is passed
/// through as opaque text, boundaries included.
pub struct EmailParser;

impl EmailParser {
    /// Parses `raw_data` as a header block followed by a body.
    ///
    /// Header lookups are case-insensitive and a missing header yields an
    /// empty string. The line terminator ending the DATA stream is not part
    /// of the body.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Parse`] when the data is empty or the header
    /// block is malformed (a continuation line with nothing to continue, or
    /// a line that is not `name: value`).
    pub fn parse(raw_data: &[u8]) -> Result<DecodedMessage, SessionError> {
        if raw_data.is_empty() {
            return Err(SessionError::Parse("empty message".to_string()));
        }

        let (headers, body_offset) =
            parse_headers(raw_data).map_err(|e| SessionError::Parse(e.to_string()))?;

        if let Some(bad) = headers.iter().find(|h| !is_valid_field_name(h)) {
            return Err(SessionError::Parse(format!(
                "malformed header line: {:?}",
                bad.get_key()
            )));
        }

        let header_value = |name: &str| {
            headers
                .get_first_header(name)
                .map(|h| unfold(h.get_value_raw()))
                .unwrap_or_default()
        };

        let from = header_value("From");
        let to = header_value("To");
        let subject = header_value("Subject");
        debug!("Extracted headers: from={:?} to={:?} subject={:?}", from, to, subject);

        let raw_body = &raw_data[body_offset..];
        let raw_body = raw_body
            .strip_suffix(b"\r\n")
            .or_else(|| raw_body.strip_suffix(b"\n"))
            .unwrap_or(raw_body);
        let body = String::from_utf8_lossy(raw_body).into_owned();

        Ok(DecodedMessage {
            from,
            to,
            subject,
            body,
        })
    }
}

/// Joins folded header lines with a single space. Encoded words are left
/// as they arrived.
fn unfold(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Field names are printable ASCII without spaces or colons.
fn is_valid_field_name(header: &MailHeader<'_>) -> bool {
    let key = header.get_key();
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}
