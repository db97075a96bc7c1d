use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = ":25";
pub const DEFAULT_DOMAIN: &str = "localhost";
pub const DEFAULT_ADMIN_EMAIL: &str = "contact@localhost";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_RECIPIENTS: usize = 50;
pub const DEFAULT_CERT_DIR: &str = "certs";
pub const DEFAULT_CERT_RELOAD_SECS: u64 = 12 * 60 * 60;
pub const MAX_WEBHOOK_RETRIES: u32 = 10;

/// Immutable server configuration, resolved once at startup and shared
/// read-only by every connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:25`.
    pub listen_address: String,

    /// Domain used in the SMTP greeting and as the TLS certificate subject.
    pub domain: String,

    /// Serve TLS-terminated connections instead of plaintext.
    pub tls_enabled: bool,

    /// Contact address for the certificate authority account.
    pub admin_email: String,

    /// Target for message forwarding. Checked when a message is delivered,
    /// not at startup.
    pub webhook_url: Option<String>,

    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub webhook_timeout: Duration,

    /// Extra delivery attempts after a failed one. Zero keeps the
    /// single-attempt contract.
    pub webhook_max_retries: u32,

    /// When both are set, AUTH PLAIN must present exactly these credentials.
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,

    pub tls_cert_dir: PathBuf,
    pub tls_self_signed: bool,
    pub tls_reload_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_address: normalize_listen_address(DEFAULT_LISTEN_ADDRESS),
            domain: DEFAULT_DOMAIN.to_string(),
            tls_enabled: false,
            admin_email: DEFAULT_ADMIN_EMAIL.to_string(),
            webhook_url: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: DEFAULT_MAX_RECIPIENTS,
            read_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            webhook_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            webhook_max_retries: 0,
            auth_username: None,
            auth_password: None,
            tls_cert_dir: PathBuf::from(DEFAULT_CERT_DIR),
            tls_self_signed: false,
            tls_reload_interval: Duration::from_secs(DEFAULT_CERT_RELOAD_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let defaults = ServerConfig::default();

        let listen_address = normalize_listen_address(&string_var("SMTP_ADDR", DEFAULT_LISTEN_ADDRESS));
        log::info!("Config: Using listen_address: {}", listen_address);

        let domain = string_var("SMTP_DOMAIN", DEFAULT_DOMAIN);
        log::info!("Config: Using domain: {}", domain);

        let tls_enabled = bool_var("SMTP_ENABLE_TLS", false)?;
        log::info!("Config: Using tls_enabled: {}", tls_enabled);

        let admin_email = string_var("SMTP_ADMIN_EMAIL", DEFAULT_ADMIN_EMAIL);
        log::info!("Config: Using admin_email: {}", admin_email);

        let webhook_url = optional_var("WEBHOOK_ENDPOINT");
        match &webhook_url {
            Some(url) => log::info!("Config: Using webhook_url: {}", url),
            None => log::warn!(
                "Config: WEBHOOK_ENDPOINT is not set; messages will be rejected until it is"
            ),
        }

        let max_message_bytes = parsed_var("SMTP_MAX_MESSAGE_BYTES", defaults.max_message_bytes)?;
        let max_recipients = parsed_var("SMTP_MAX_RECIPIENTS", defaults.max_recipients)?;
        let read_timeout = Duration::from_secs(parsed_var("SMTP_READ_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?);
        let write_timeout = Duration::from_secs(parsed_var("SMTP_WRITE_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?);
        let webhook_timeout = Duration::from_secs(parsed_var("WEBHOOK_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?);
        let webhook_max_retries = parsed_var("WEBHOOK_MAX_RETRIES", 0u32)?;
        if webhook_max_retries > MAX_WEBHOOK_RETRIES {
            let err_msg = format!(
                "WEBHOOK_MAX_RETRIES ('{}') must be at most {}",
                webhook_max_retries, MAX_WEBHOOK_RETRIES
            );
            log::error!("{}", err_msg);
            return Err(anyhow!(err_msg));
        }
        log::info!(
            "Config: Using limits: max_message_bytes={}, max_recipients={}, read_timeout={:?}, write_timeout={:?}",
            max_message_bytes, max_recipients, read_timeout, write_timeout
        );
        log::info!(
            "Config: Using webhook_timeout={:?}, webhook_max_retries={}",
            webhook_timeout, webhook_max_retries
        );

        let auth_username = optional_var("SMTP_AUTH_USERNAME");
        let auth_password = optional_var("SMTP_AUTH_PASSWORD");
        if auth_username.is_some() != auth_password.is_some() {
            let err_msg = "SMTP_AUTH_USERNAME and SMTP_AUTH_PASSWORD must be set together";
            log::error!("{}", err_msg);
            return Err(anyhow!(err_msg));
        }
        if let Some(user) = &auth_username {
            log::info!("Config: AUTH PLAIN restricted to user: {}", user);
        }

        let tls_cert_dir = PathBuf::from(string_var("SMTP_TLS_CERT_DIR", DEFAULT_CERT_DIR));
        let tls_self_signed = bool_var("SMTP_TLS_SELF_SIGNED", false)?;
        let tls_reload_interval =
            Duration::from_secs(parsed_var("SMTP_TLS_RELOAD_SECS", DEFAULT_CERT_RELOAD_SECS)?);
        if tls_enabled {
            log::info!(
                "Config: Using tls_cert_dir: {} (self_signed: {}, reload every {:?})",
                tls_cert_dir.display(),
                tls_self_signed,
                tls_reload_interval
            );
        }

        Ok(ServerConfig {
            listen_address,
            domain,
            tls_enabled,
            admin_email,
            webhook_url,
            max_message_bytes,
            max_recipients,
            read_timeout,
            write_timeout,
            webhook_timeout,
            webhook_max_retries,
            auth_username,
            auth_password,
            tls_cert_dir,
            tls_self_signed,
            tls_reload_interval,
        })
    }
}

/// Returns the variable's value, treating an empty value as unset.
fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|val| !val.is_empty())
}

fn string_var(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| {
            let err_msg = format!("{} ('{}') must be a valid number", name, raw);
            log::error!("{}: {}", err_msg, e);
            anyhow!(e).context(err_msg)
        }),
    }
}

fn bool_var(name: &str, default: bool) -> Result<bool> {
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => {
                let err_msg = format!("{} ('{}') must be true or false", name, raw);
                log::error!("{}", err_msg);
                Err(anyhow!(err_msg))
            }
        },
    }
}

/// Expands the `:port` shorthand to an all-interfaces socket address.
pub fn normalize_listen_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}
