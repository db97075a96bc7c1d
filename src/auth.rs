//! Credential checks for AUTH PLAIN.

use crate::config::ServerConfig;
use std::sync::Arc;

/// Decides whether an AUTH PLAIN username/password pair is accepted.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Accepts any credentials. Authentication is informational only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _username: &str, _password: &str) -> bool {
        true
    }
}

/// Accepts exactly one configured username/password pair.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        StaticCredentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        // Compare every byte so the reply time does not leak the match length.
        let user_ok = constant_time_eq(self.username.as_bytes(), username.as_bytes());
        let pass_ok = constant_time_eq(self.password.as_bytes(), password.as_bytes());
        user_ok & pass_ok
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Picks the authenticator for the configured credentials.
pub fn from_config(config: &ServerConfig) -> Arc<dyn Authenticator> {
    match (&config.auth_username, &config.auth_password) {
        (Some(username), Some(password)) => {
            log::info!("AUTH PLAIN restricted to configured user {}", username);
            Arc::new(StaticCredentials::new(username, password))
        }
        _ => Arc::new(AllowAll),
    }
}
