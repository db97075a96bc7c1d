//! End-to-end tests: a real SMTP conversation over TCP against a bound
//! `SmtpServer`, with the webhook served by mockito.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use girouette::auth::AllowAll;
use girouette::config::ServerConfig;
use girouette::smtp::{SmtpServer, WebhookBackend};
use girouette::webhook::WebhookDispatcher;
use mockito::Matcher;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn test_config(webhook_url: Option<String>) -> ServerConfig {
    ServerConfig {
        listen_address: "127.0.0.1:0".to_string(),
        domain: "mx.test".to_string(),
        webhook_url,
        webhook_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

/// Binds a server on an ephemeral port and serves it in the background.
async fn start_server(
    config: ServerConfig,
    tls: Option<tokio_rustls::TlsAcceptor>,
) -> (SocketAddr, CancellationToken) {
    girouette::tls::install_crypto_provider();
    let config = Arc::new(config);
    let dispatcher = Arc::new(WebhookDispatcher::new(&config).unwrap());
    let backend = WebhookBackend::new(Arc::clone(&config), dispatcher, Arc::new(AllowAll));

    let server = SmtpServer::bind(config, backend, tls).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    (addr, shutdown)
}

/// A line-oriented SMTP client good enough for tests.
struct SmtpClient<S> {
    reader: BufReader<tokio::io::ReadHalf<S>>,
    writer: tokio::io::WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpClient<S> {
    async fn new(stream: S) -> (Self, String) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut client = SmtpClient {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        let greeting = client.read_reply().await;
        (client, greeting)
    }

    /// Reads a possibly multiline reply and returns its last line.
    async fn read_reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return line;
            }
        }
    }

    async fn command(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
        self.writer.flush().await.unwrap();
        self.read_reply().await
    }

    async fn send_message(&mut self, from: &str, to: &str, subject: &str, body: &str) -> String {
        assert!(self.command(&format!("MAIL FROM:<{}>", from)).await.starts_with("250"));
        assert!(self.command(&format!("RCPT TO:<{}>", to)).await.starts_with("250"));
        assert!(self.command("DATA").await.starts_with("354"));
        let content = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}\r\n.",
            from, to, subject, body
        );
        self.command(&content).await
    }
}

async fn connect(addr: SocketAddr) -> SmtpClient<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut client, greeting) = SmtpClient::new(stream).await;
    assert_eq!(greeting, "220 mx.test ESMTP Service Ready\r\n");
    assert!(client.command("EHLO client.test").await.starts_with("250 "));
    client
}

#[tokio::test]
async fn test_message_is_forwarded_to_webhook() {
    let mut webhook = mockito::Server::new_async().await;
    let mock = webhook
        .mock("POST", "/inbound")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Exact(
            r#"{"from":"alice@example.com","to":"bob@example.com","subject":"Hi","body":"hello"}"#
                .to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let (addr, shutdown) = start_server(test_config(Some(format!("{}/inbound", webhook.url()))), None).await;
    let mut client = connect(addr).await;

    let reply = client
        .send_message("alice@example.com", "bob@example.com", "Hi", "hello")
        .await;
    assert!(reply.starts_with("250 "), "got {reply}");
    assert!(client.command("QUIT").await.starts_with("221"));

    mock.assert_async().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_webhook_failure_is_temporary_rejection() {
    let mut webhook = mockito::Server::new_async().await;
    let mock = webhook
        .mock("POST", "/inbound")
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let (addr, shutdown) = start_server(test_config(Some(format!("{}/inbound", webhook.url()))), None).await;
    let mut client = connect(addr).await;

    let reply = client
        .send_message("alice@example.com", "bob@example.com", "Hi", "hello")
        .await;
    assert!(reply.starts_with("451 4.3.0"), "got {reply}");
    // The connection survives a rejected message.
    assert!(client.command("NOOP").await.starts_with("250"));

    mock.assert_async().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_missing_webhook_makes_no_request() {
    let (addr, shutdown) = start_server(test_config(None), None).await;
    let mut client = connect(addr).await;

    let reply = client
        .send_message("alice@example.com", "bob@example.com", "Hi", "hello")
        .await;
    assert!(reply.starts_with("451"), "got {reply}");
    shutdown.cancel();
}

#[tokio::test]
async fn test_rset_and_second_message_on_same_connection() {
    let mut webhook = mockito::Server::new_async().await;
    let mock = webhook
        .mock("POST", "/inbound")
        .match_body(Matcher::PartialJsonString(
            r#"{"from":"carol@example.com"}"#.to_string(),
        ))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let (addr, shutdown) = start_server(test_config(Some(format!("{}/inbound", webhook.url()))), None).await;
    let mut client = connect(addr).await;

    assert!(client.command("MAIL FROM:<dave@example.com>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<erin@example.com>").await.starts_with("250"));
    assert!(client.command("RSET").await.starts_with("250"));
    // The abandoned envelope is gone: DATA needs a fresh MAIL/RCPT.
    assert!(client.command("DATA").await.starts_with("503"));

    for _ in 0..2 {
        let reply = client
            .send_message("carol@example.com", "bob@example.com", "Again", "body")
            .await;
        assert!(reply.starts_with("250 "), "got {reply}");
    }

    mock.assert_async().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_recipient_limit() {
    let config = ServerConfig {
        max_recipients: 2,
        ..test_config(None)
    };
    let (addr, shutdown) = start_server(config, None).await;
    let mut client = connect(addr).await;

    assert!(client.command("MAIL FROM:<a@example.com>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<b1@example.com>").await.starts_with("250"));
    assert!(client.command("RCPT TO:<b2@example.com>").await.starts_with("250"));
    let reply = client.command("RCPT TO:<b3@example.com>").await;
    assert!(reply.starts_with("452 4.5.3"), "got {reply}");
    shutdown.cancel();
}

#[tokio::test]
async fn test_oversized_message_is_rejected_before_webhook() {
    let mut webhook = mockito::Server::new_async().await;
    let mock = webhook
        .mock("POST", Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let config = ServerConfig {
        max_message_bytes: 128,
        ..test_config(Some(webhook.url()))
    };
    let (addr, shutdown) = start_server(config, None).await;
    let mut client = connect(addr).await;

    let body = "x".repeat(500);
    let reply = client
        .send_message("alice@example.com", "bob@example.com", "Big", &body)
        .await;
    assert!(reply.starts_with("552 5.3.4"), "got {reply}");
    assert!(client.command("QUIT").await.starts_with("221"));

    mock.assert_async().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_declared_size_over_limit_is_rejected_early() {
    let (addr, shutdown) = start_server(test_config(None), None).await;
    let mut client = connect(addr).await;

    let reply = client
        .command("MAIL FROM:<alice@example.com> SIZE=999999999")
        .await;
    assert!(reply.starts_with("552"), "got {reply}");
    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_connections() {
    let mut webhook = mockito::Server::new_async().await;
    let mock = webhook
        .mock("POST", "/inbound")
        .with_status(200)
        .expect(5)
        .create_async()
        .await;

    let (addr, shutdown) = start_server(test_config(Some(format!("{}/inbound", webhook.url()))), None).await;

    let tasks: Vec<_> = (0..5)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = connect(addr).await;
                client
                    .send_message(&format!("user{i}@example.com"), "bob@example.com", "Hi", "hello")
                    .await
            })
        })
        .collect();
    for task in tasks {
        let reply = task.await.unwrap();
        assert!(reply.starts_with("250 "), "got {reply}");
    }

    mock.assert_async().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    girouette::tls::install_crypto_provider();
    let config = Arc::new(test_config(None));
    let dispatcher = Arc::new(WebhookDispatcher::new(&config).unwrap());
    let backend = WebhookBackend::new(Arc::clone(&config), dispatcher, Arc::new(AllowAll));
    let server = SmtpServer::bind(config, backend, None).await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.serve(shutdown.clone()));
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("listener should stop promptly")
        .unwrap();
    assert!(result.is_ok());
}

mod tls {
    use super::*;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct};

    /// Trusts whatever certificate the server presents.
    #[derive(Debug)]
    struct NoCertificateVerification(Arc<CryptoProvider>);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    #[tokio::test]
    async fn test_implicit_tls_session() {
        girouette::tls::install_crypto_provider();
        let config = ServerConfig {
            tls_enabled: true,
            tls_self_signed: true,
            ..test_config(None)
        };
        let acceptor = girouette::tls::acceptor_from_config(&config).unwrap();
        let (addr, shutdown) = start_server(config, Some(acceptor)).await;

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .unwrap()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth();
        client_config.alpn_protocols = vec![b"smtp".to_vec()];
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("mx.test").unwrap();
        let tls_stream = connector.connect(server_name, tcp).await.unwrap();
        assert_eq!(tls_stream.get_ref().1.alpn_protocol(), Some(b"smtp".as_slice()));

        let (mut client, greeting) = SmtpClient::new(tls_stream).await;
        assert!(greeting.starts_with("220 mx.test"));
        assert!(client.command("EHLO client.test").await.starts_with("250 "));
        assert!(client.command("QUIT").await.starts_with("221"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_plaintext_client_cannot_talk_to_tls_listener() {
        girouette::tls::install_crypto_provider();
        let config = ServerConfig {
            tls_enabled: true,
            tls_self_signed: true,
            read_timeout: Duration::from_millis(500),
            ..test_config(None)
        };
        let acceptor = girouette::tls::acceptor_from_config(&config).unwrap();
        let (addr, shutdown) = start_server(config, Some(acceptor)).await;

        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(b"EHLO plain\r\n").await.unwrap();
        let mut buf = Vec::new();
        // The read ends in EOF or a reset; only the bytes matter.
        let _ = tokio::time::timeout(
            Duration::from_secs(3),
            tokio::io::AsyncReadExt::read_to_end(&mut tcp, &mut buf),
        )
        .await
        .expect("server should drop the connection");
        // Either a TLS alert or nothing, never an SMTP greeting.
        assert!(!buf.starts_with(b"220"));
        shutdown.cancel();
    }
}
