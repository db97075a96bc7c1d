use crate::config::ServerConfig;
use crate::smtp::email_parser::DecodedMessage;
use crate::smtp::error::SessionError;
use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Request, StatusCode, Uri};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
type WebhookHttpClient = Client<HttpsConn, Full<Bytes>>;

/// The JSON body posted to the webhook: exactly these four fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl From<DecodedMessage> for WebhookPayload {
    fn from(message: DecodedMessage) -> Self {
        WebhookPayload {
            from: message.from,
            to: message.to,
            subject: message.subject,
            body: message.body,
        }
    }
}

/// Posts decoded messages to the configured webhook.
///
/// One dispatcher is built at startup and shared by every connection; the
/// underlying hyper client pools connections internally.
pub struct WebhookDispatcher {
    webhook_url: Option<String>,
    client: WebhookHttpClient,
    user_agent: String,
    timeout: Duration,
    max_retries: u32,
}

impl WebhookDispatcher {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let connector = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(connector) => connector,
            Err(e) => {
                warn!(
                    "Failed to load native root certificates ({}), using bundled webpki roots",
                    e
                );
                HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let https = connector.https_or_http().enable_http1().build();

        let client: WebhookHttpClient = Client::builder(TokioExecutor::new()).build(https);

        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            client,
            user_agent,
            timeout: config.webhook_timeout,
            max_retries: config.webhook_max_retries,
        })
    }

    /// Delivers `payload` and waits for the outcome.
    ///
    /// Without a webhook URL this fails with [`SessionError::Config`] before
    /// any request is made. Only a `200 OK` response counts as delivered;
    /// any other status, a transport error or a timeout is a
    /// [`SessionError::Delivery`]. Failed attempts are retried only when
    /// `webhook_max_retries` is non-zero.
    pub async fn dispatch(&self, payload: &WebhookPayload) -> Result<(), SessionError> {
        let url = match self.webhook_url.as_deref() {
            Some(url) if !url.is_empty() => url,
            _ => {
                error!("No webhook endpoint configured, cannot forward message");
                return Err(SessionError::Config(
                    "webhook endpoint is not set".to_string(),
                ));
            }
        };
        let uri: Uri = url
            .parse()
            .map_err(|e| SessionError::Config(format!("invalid webhook endpoint {url}: {e}")))?;

        let json_body = serde_json::to_vec(payload)
            .map(Bytes::from)
            .map_err(|e| SessionError::Delivery(e.to_string()))?;

        info!(
            "Forwarding email from '{}' with subject '{}' to {}",
            payload.from, payload.subject, url
        );

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
                info!("Retry attempt {} for email from {}", attempt, payload.from);
            }

            match self.send_once(&uri, json_body.clone()).await {
                Ok(()) => {
                    info!("Email successfully forwarded to webhook {}", url);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Webhook attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SessionError::Delivery("no delivery attempt made".to_string())))
    }

    async fn send_once(&self, uri: &Uri, body: Bytes) -> Result<(), SessionError> {
        let request = Request::builder()
            .method(hyper::Method::POST)
            .uri(uri.clone())
            .header("content-type", "application/json")
            .header("user-agent", &self.user_agent)
            .body(Full::new(body))
            .map_err(|e| SessionError::Delivery(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| {
                SessionError::Delivery(format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| SessionError::Delivery(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SessionError::Delivery(format!(
                "webhook {} responded with status {}",
                uri, status
            )));
        }
        Ok(())
    }
}

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Delay before retry number `attempt` (1-based): doubles from 100ms, capped at 10s.
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    RETRY_BASE_DELAY
        .saturating_mul(factor)
        .min(RETRY_MAX_DELAY)
}
