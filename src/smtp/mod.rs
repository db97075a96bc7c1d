pub mod data_reader;
pub mod email_parser;
pub mod error;
pub mod session;
pub mod smtp_protocol;

use crate::config::ServerConfig;
use anyhow::{anyhow, Result};
use log::{debug, info, trace, warn};
use smtp_protocol::{SmtpCommandResult, SmtpProtocol};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use error::{EnvelopeError, Reply, SessionError};
pub use session::{Backend, Session, WebhookBackend, WebhookSession};

/// Fatal listener failures. The process exits when one occurs.
#[derive(Error, Debug)]
pub enum ListenError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    #[error("failed to read local address: {0}")]
    LocalAddr(std::io::Error),
}

/// The bound SMTP listener.
pub struct SmtpServer<B: Backend> {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    backend: Arc<B>,
    tls: Option<TlsAcceptor>,
}

impl<B: Backend> SmtpServer<B> {
    /// Binds the configured address. With a `TlsAcceptor` every connection
    /// starts with a TLS handshake.
    pub async fn bind(
        config: Arc<ServerConfig>,
        backend: B,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self, ListenError> {
        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| ListenError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;
        Ok(SmtpServer {
            listener,
            config,
            backend: Arc::new(backend),
            tls,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ListenError> {
        self.listener.local_addr().map_err(ListenError::LocalAddr)
    }

    /// Accepts connections until `shutdown` is cancelled, spawning one task
    /// per connection.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ListenError> {
        tracing::info!(
            "SMTP server listening on {} ({})",
            self.local_addr()?,
            if self.tls.is_some() { "TLS" } else { "plaintext" }
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (stream, remote_addr) = result.map_err(|e| {
                        tracing::error!("Error accepting connection: {:?}", e);
                        ListenError::Accept(e)
                    })?;
                    tracing::info!("New connection from: {}", remote_addr);

                    let session = self.backend.new_session(remote_addr);
                    let config = Arc::clone(&self.config);
                    let tls = self.tls.clone();
                    let span = tracing::info_span!(
                        "smtp_session",
                        peer = %remote_addr,
                        id = %uuid::Uuid::new_v4()
                    );

                    tokio::spawn(
                        async move {
                            let result = match tls {
                                Some(acceptor) => {
                                    match tokio::time::timeout(config.read_timeout, acceptor.accept(stream)).await {
                                        Ok(Ok(tls_stream)) => {
                                            debug!("TLS handshake completed");
                                            handle_connection(tls_stream, session, config).await
                                        }
                                        Ok(Err(e)) => Err(anyhow!("TLS handshake failed: {}", e)),
                                        Err(_) => Err(anyhow!("TLS handshake timed out")),
                                    }
                                }
                                None => handle_connection(stream, session, config).await,
                            };
                            if let Err(e) = result {
                                tracing::warn!("Error handling SMTP connection from {}: {:#}", remote_addr, e);
                            }
                        }
                        .instrument(span),
                    );
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("SMTP listener shutting down gracefully");
                    return Ok(());
                }
            }
        }
    }
}

/// Runs one SMTP conversation to completion. The session is always logged
/// out, whether the client quit, vanished or timed out.
pub async fn handle_connection<S, T>(stream: T, mut session: S, config: Arc<ServerConfig>) -> Result<()>
where
    S: Session,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let result = drive_session(stream, &mut session, config).await;
    if let Err(e) = session.logout().await {
        warn!("Logout failed: {}", e);
    }
    result
}

async fn drive_session<S, T>(stream: T, session: &mut S, config: Arc<ServerConfig>) -> Result<()>
where
    S: Session,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = tokio::io::BufReader::new(read_half);
    let writer = tokio::io::BufWriter::new(write_half);
    let mut protocol = SmtpProtocol::new(reader, writer, config);

    protocol.send_greeting().await?;

    loop {
        trace!("SMTP({:?}): Waiting for command...", protocol.get_state());
        let Some(line) = protocol.read_line().await? else {
            info!("Connection closed by client (EOF). State: {:?}", protocol.get_state());
            return Ok(());
        };

        match protocol.process_command(&line).await? {
            SmtpCommandResult::Continue => {}
            SmtpCommandResult::Quit => {
                info!("Client quit.");
                return Ok(());
            }
            SmtpCommandResult::Reset => session.reset().await,
            SmtpCommandResult::Auth { username, password } => {
                match session.auth_plain(&username, &password).await {
                    Ok(()) => {
                        protocol.accept_auth();
                        protocol.write_line("235 2.7.0 Authentication successful").await?;
                    }
                    Err(e) => protocol.reply(&e.to_reply()).await?,
                }
            }
            SmtpCommandResult::MailFrom { address, options } => {
                match session.mail(&address, &options).await {
                    Ok(()) => {
                        protocol.accept_mail();
                        protocol.write_line("250 2.1.0 OK").await?;
                    }
                    Err(e) => protocol.reply(&e.to_reply()).await?,
                }
            }
            SmtpCommandResult::RcptTo { address, options } => {
                match session.rcpt(&address, &options).await {
                    Ok(()) => {
                        protocol.accept_rcpt();
                        protocol.write_line("250 2.1.5 OK").await?;
                    }
                    Err(e) => protocol.reply(&e.to_reply()).await?,
                }
            }
            SmtpCommandResult::DataStart => {
                let outcome = {
                    let mut data = protocol.data_reader();
                    let outcome = session.data(&mut data).await;
                    if !data.is_finished() {
                        // Skip whatever the session left unread so the next
                        // line is a command again.
                        tokio::io::copy(&mut data, &mut tokio::io::sink()).await?;
                    }
                    outcome
                };
                protocol.end_data();

                match outcome {
                    Ok(()) => protocol.write_line("250 2.0.0 OK: message accepted").await?,
                    Err(e) => {
                        warn!("Message rejected: {}", e);
                        protocol.reply(&e.to_reply()).await?;
                    }
                }
                session.reset().await;
            }
        }
    }
}
