//! The per-connection envelope lifecycle.
//!
//! The protocol engine calls into a [`Session`] in command order. The
//! [`WebhookSession`] implementation accumulates the envelope and, on DATA,
//! decodes the message and forwards it to the webhook before answering.

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::smtp::email_parser::EmailParser;
use crate::smtp::error::{EnvelopeError, SessionError};
use crate::webhook::{WebhookDispatcher, WebhookPayload};
use async_trait::async_trait;
use log::{debug, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

/// ESMTP parameters given with MAIL FROM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailOptions {
    /// Declared message size (`SIZE=`).
    pub size: Option<usize>,
    /// Declared body type (`BODY=7BIT` or `BODY=8BITMIME`).
    pub body: Option<String>,
}

/// ESMTP parameters given with RCPT TO, kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RcptOptions {
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticated,
    SenderSet,
    RecipientsSet,
    Receiving,
    Closed,
}

/// Callbacks the protocol engine invokes for one connection.
#[async_trait]
pub trait Session: Send {
    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SessionError>;

    /// Starts a new envelope. An empty `from` is the null reverse path.
    async fn mail(&mut self, from: &str, options: &MailOptions) -> Result<(), SessionError>;

    async fn rcpt(&mut self, to: &str, options: &RcptOptions) -> Result<(), SessionError>;

    /// Consumes the message content. `stream` yields the unstuffed bytes
    /// and reports EOF at the end-of-data marker.
    async fn data(&mut self, stream: &mut (dyn AsyncRead + Unpin + Send))
        -> Result<(), SessionError>;

    /// Discards the envelope. Authentication survives.
    async fn reset(&mut self);

    /// Ends the session. Calling it again is a no-op.
    async fn logout(&mut self) -> Result<(), SessionError>;
}

/// Creates one session per accepted connection.
pub trait Backend: Send + Sync + 'static {
    type Session: Session + 'static;

    fn new_session(&self, peer: SocketAddr) -> Self::Session;
}

/// Forwards every received message to the configured webhook.
#[derive(Clone)]
pub struct WebhookBackend {
    config: Arc<ServerConfig>,
    dispatcher: Arc<WebhookDispatcher>,
    authenticator: Arc<dyn Authenticator>,
}

impl WebhookBackend {
    pub fn new(
        config: Arc<ServerConfig>,
        dispatcher: Arc<WebhookDispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        WebhookBackend {
            config,
            dispatcher,
            authenticator,
        }
    }
}

impl Backend for WebhookBackend {
    type Session = WebhookSession;

    fn new_session(&self, peer: SocketAddr) -> WebhookSession {
        WebhookSession {
            peer,
            state: SessionState::New,
            authenticated: false,
            sender: None,
            recipients: Vec::new(),
            config: Arc::clone(&self.config),
            dispatcher: Arc::clone(&self.dispatcher),
            authenticator: Arc::clone(&self.authenticator),
        }
    }
}

pub struct WebhookSession {
    peer: SocketAddr,
    state: SessionState,
    authenticated: bool,
    sender: Option<String>,
    recipients: Vec<String>,
    config: Arc<ServerConfig>,
    dispatcher: Arc<WebhookDispatcher>,
    authenticator: Arc<dyn Authenticator>,
}

impl WebhookSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    fn idle_state(&self) -> SessionState {
        if self.authenticated {
            SessionState::Authenticated
        } else {
            SessionState::New
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Config("session already closed".to_string()));
        }
        Ok(())
    }

    /// Reads at most `max_message_bytes`; one byte more means the message is
    /// too large.
    async fn read_bounded(
        &self,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<Vec<u8>, SessionError> {
        let max = self.config.max_message_bytes;
        let mut raw = Vec::new();
        (&mut *stream)
            .take((max as u64).saturating_add(1))
            .read_to_end(&mut raw)
            .await
            .map_err(|e| SessionError::Delivery(format!("failed to read message data: {e}")))?;
        if raw.len() > max {
            return Err(EnvelopeError::MessageTooLarge { max }.into());
        }
        Ok(raw)
    }
}

#[async_trait]
impl Session for WebhookSession {
    async fn auth_plain(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !self.authenticator.authenticate(username, password) {
            info!("AUTH PLAIN rejected for user {} from {}", username, self.peer);
            return Err(SessionError::Auth);
        }
        info!("AUTH PLAIN accepted for user {} from {}", username, self.peer);
        self.authenticated = true;
        if self.state == SessionState::New {
            self.state = SessionState::Authenticated;
        }
        Ok(())
    }

    async fn mail(&mut self, from: &str, options: &MailOptions) -> Result<(), SessionError> {
        self.ensure_open()?;
        let max = self.config.max_message_bytes;
        if options.size.is_some_and(|size| size > max) {
            return Err(EnvelopeError::MessageTooLarge { max }.into());
        }
        info!("Mail from: {:?}", from);
        self.sender = Some(from.to_string());
        self.recipients.clear();
        self.state = SessionState::SenderSet;
        Ok(())
    }

    async fn rcpt(&mut self, to: &str, _options: &RcptOptions) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.sender.is_none() {
            return Err(EnvelopeError::MissingSender.into());
        }
        let max = self.config.max_recipients;
        if self.recipients.len() >= max {
            return Err(EnvelopeError::TooManyRecipients { max }.into());
        }
        info!("Rcpt to: {:?}", to);
        self.recipients.push(to.to_string());
        self.state = SessionState::RecipientsSet;
        Ok(())
    }

    async fn data(
        &mut self,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.recipients.is_empty() {
            return Err(EnvelopeError::NoRecipients.into());
        }

        self.state = SessionState::Receiving;
        let result = async {
            let raw = self.read_bounded(stream).await?;
            debug!("Received {} bytes of message data", raw.len());
            let message = EmailParser::parse(&raw)?;
            info!(
                "Decoded message from={:?} to={:?} subject={:?}",
                message.from, message.to, message.subject
            );
            self.dispatcher
                .dispatch(&WebhookPayload::from(message))
                .await
        }
        .await;
        self.state = SessionState::RecipientsSet;
        result
    }

    async fn reset(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!("Resetting envelope for {}", self.peer);
        self.sender = None;
        self.recipients.clear();
        self.state = self.idle_state();
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Closed {
            info!("Logout from {}", self.peer);
            self.sender = None;
            self.recipients.clear();
            self.state = SessionState::Closed;
        }
        Ok(())
    }
}
