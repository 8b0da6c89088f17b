use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use rendezvous_proto::Role;

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_INITIATOR_ROLE: &str = "robotino";
pub const DEFAULT_RESPONDER_ROLE: &str = "answerClient";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rendezvous url {value:?}: {source}")]
    Url {
        value: String,
        source: url::ParseError,
    },
    #[error("rendezvous url must use ws or wss, got {0:?}")]
    Scheme(String),
    #[error("role must not be empty")]
    EmptyRole,
    #[error("invalid negotiation timeout {0:?}: expected a positive number of seconds")]
    Timeout(String),
}

/// Peer settings, read from the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: Url,
    pub role: Role,
    /// `None` waits for the peer indefinitely.
    pub negotiation_timeout: Option<Duration>,
    pub stun_urls: Vec<String>,
}

impl ClientConfig {
    pub fn from_env(default_role: &str) -> Result<Self, ConfigError> {
        let url = env::var("RENDEZVOUS_URL").unwrap_or_else(|_| DEFAULT_URL.into());
        let role = env::var("RENDEZVOUS_ROLE").unwrap_or_else(|_| default_role.into());
        let timeout = env::var("RENDEZVOUS_NEGOTIATION_TIMEOUT_SECS").ok();
        let stun = env::var("RENDEZVOUS_STUN_URLS").unwrap_or_else(|_| DEFAULT_STUN_URL.into());

        Ok(Self {
            url: parse_url(&url)?,
            role: parse_role(&role)?,
            negotiation_timeout: timeout.as_deref().map(parse_timeout).transpose()?,
            stun_urls: parse_stun_urls(&stun),
        })
    }
}

pub fn parse_url(value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.trim()).map_err(|source| ConfigError::Url {
        value: value.to_string(),
        source,
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::Scheme(other.to_string())),
    }
}

fn parse_role(value: &str) -> Result<Role, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::EmptyRole);
    }
    Ok(Role::new(trimmed))
}

pub fn parse_timeout(value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ConfigError::Timeout(value.to_string())),
    }
}

/// Comma separated; an empty value disables STUN.
pub fn parse_stun_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn url_must_be_a_websocket() {
        assert!(parse_url(DEFAULT_URL).is_ok());
        assert!(parse_url("wss://signal.example.org/ws").is_ok());
        assert!(matches!(
            parse_url("http://127.0.0.1:8080/ws"),
            Err(ConfigError::Scheme(s)) if s == "http"
        ));
        assert!(matches!(parse_url("not a url"), Err(ConfigError::Url { .. })));
    }

    #[test_timeout::timeout]
    fn timeout_is_positive_seconds() {
        assert_eq!(parse_timeout(" 30 ").unwrap(), Duration::from_secs(30));
        assert!(parse_timeout("0").is_err());
        assert!(parse_timeout("soon").is_err());
    }

    #[test_timeout::timeout]
    fn stun_list_may_be_empty() {
        assert!(parse_stun_urls("").is_empty());
        assert_eq!(
            parse_stun_urls("stun:a:1, stun:b:2,"),
            vec!["stun:a:1".to_string(), "stun:b:2".to_string()]
        );
    }

    #[test_timeout::timeout]
    fn blank_role_is_rejected() {
        assert!(matches!(parse_role("  "), Err(ConfigError::EmptyRole)));
        assert_eq!(parse_role(" responder ").unwrap(), Role::new("responder"));
    }
}
