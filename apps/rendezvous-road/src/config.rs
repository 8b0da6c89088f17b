use std::env;
use std::net::SocketAddr;
use thiserror::Error;

use crate::registry::{ConflictPolicy, PairingRule};
use rendezvous_proto::Role;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_PAIRING_RULES: &str = "browser+robotino;answerClient+robotino";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {value:?}: {source}")]
    ListenAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid pairing rule {0:?}: expected roles joined by `+`, optionally `=>` notify roles")]
    PairingRule(String),
    #[error("no pairing rules configured")]
    NoPairingRules,
    #[error("unknown role conflict policy {0:?} (expected `replace` or `reject`)")]
    ConflictPolicy(String),
}

/// Server settings, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Evaluated in order; earlier rules win when a role matches several.
    pub pairing_rules: Vec<PairingRule>,
    pub role_conflict: ConflictPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen =
            env::var("RENDEZVOUS_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.into());
        let listen_addr = listen.parse().map_err(|source| ConfigError::ListenAddr {
            value: listen.clone(),
            source,
        })?;
        let rules = env::var("RENDEZVOUS_PAIRING_RULES")
            .unwrap_or_else(|_| DEFAULT_PAIRING_RULES.into());
        let role_conflict = match env::var("RENDEZVOUS_ROLE_CONFLICT") {
            Ok(value) => value.parse()?,
            Err(_) => ConflictPolicy::default(),
        };

        Ok(Self {
            listen_addr,
            pairing_rules: parse_pairing_rules(&rules)?,
            role_conflict,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            pairing_rules: default_pairing_rules(),
            role_conflict: ConflictPolicy::default(),
        }
    }
}

/// The robot camera pairs with either a browser viewer or the answering
/// recorder client.
pub fn default_pairing_rules() -> Vec<PairingRule> {
    vec![
        PairingRule::symmetric([Role::new("browser"), Role::new("robotino")]),
        PairingRule::symmetric([Role::new("answerClient"), Role::new("robotino")]),
    ]
}

/// Parses `a+b;c+d=>d` style rule lists. A rule without `=>` notifies every
/// required role.
pub fn parse_pairing_rules(list: &str) -> Result<Vec<PairingRule>, ConfigError> {
    let mut rules = Vec::new();
    for raw in list.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (required, notify) = match raw.split_once("=>") {
            Some((required, notify)) => (parse_roles(required), parse_roles(notify)),
            None => (parse_roles(raw), parse_roles(raw)),
        };
        let rule = PairingRule::new(required, notify)
            .ok_or_else(|| ConfigError::PairingRule(raw.to_string()))?;
        rules.push(rule);
    }
    if rules.is_empty() {
        return Err(ConfigError::NoPairingRules);
    }
    Ok(rules)
}

fn parse_roles(list: &str) -> Vec<Role> {
    list.split('+')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Role::new)
        .collect()
}
