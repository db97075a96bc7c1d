//! Per-message error taxonomy and its mapping onto SMTP replies.

use thiserror::Error;

/// Protocol-level policy violations on the current envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("too many recipients")]
    TooManyRecipients { max: usize },

    #[error("message too large")]
    MessageTooLarge { max: usize },

    #[error("no valid recipients")]
    NoRecipients,

    #[error("no sender specified")]
    MissingSender,
}

/// Errors recovered at the session boundary. Each rejects the current
/// command or message only; the connection stays usable.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("malformed message: {0}")]
    Parse(String),

    #[error("webhook delivery failed: {0}")]
    Delivery(String),

    #[error("authentication failed")]
    Auth,
}

/// An SMTP reply: basic status code, enhanced status code and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub enhanced: &'static str,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, enhanced: &'static str, text: impl Into<String>) -> Self {
        Reply {
            code,
            enhanced,
            text: text.into(),
        }
    }

    /// Temporary failures invite the sending agent to retry later.
    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.code, self.enhanced, self.text)
    }
}

impl SessionError {
    pub fn to_reply(&self) -> Reply {
        match self {
            SessionError::Config(_) => {
                Reply::new(451, "4.3.0", "Requested action aborted: local configuration error")
            }
            SessionError::Delivery(_) => {
                Reply::new(451, "4.3.0", "Requested action aborted: delivery failed, try again later")
            }
            SessionError::Envelope(EnvelopeError::TooManyRecipients { max }) => {
                Reply::new(452, "4.5.3", format!("Too many recipients (max {max})"))
            }
            SessionError::Envelope(EnvelopeError::MessageTooLarge { max }) => {
                Reply::new(552, "5.3.4", format!("Message size exceeds fixed limit ({max} bytes)"))
            }
            SessionError::Envelope(EnvelopeError::NoRecipients) => {
                Reply::new(503, "5.5.1", "Bad sequence of commands: RCPT TO required first")
            }
            SessionError::Envelope(EnvelopeError::MissingSender) => {
                Reply::new(503, "5.5.1", "Bad sequence of commands: MAIL FROM required first")
            }
            SessionError::Parse(_) => Reply::new(554, "5.6.0", "Message could not be parsed"),
            SessionError::Auth => Reply::new(535, "5.7.8", "Authentication credentials invalid"),
        }
    }
}
