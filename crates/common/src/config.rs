/*
 * SPDX-FileCopyrightText: 2020 Fannst B.V. <hello@fannst.nl>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Process configuration: the environment-variable surface plus the typed
//! sub-configs each subsystem is handed at construction. Loading happens
//! once, in `main`; everything downstream takes an `Arc<Configuration>`
//! (or one of its pieces) rather than touching the environment itself.

use std::{path::PathBuf, sync::Arc, time::Duration};

use authentication::crypto::{Algorithm, SigningKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStrategy {
    Disable,
    Relaxed,
    Strict,
}

impl VerifyStrategy {
    #[inline(always)]
    pub fn verify(&self) -> bool {
        matches!(self, VerifyStrategy::Strict | VerifyStrategy::Relaxed)
    }

    #[inline(always)]
    pub fn is_strict(&self) -> bool {
        matches!(self, VerifyStrategy::Strict)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "disable" | "disabled" | "off" => Some(VerifyStrategy::Disable),
            "relaxed" => Some(VerifyStrategy::Relaxed),
            "strict" => Some(VerifyStrategy::Strict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MailAuthConfig {
    pub spf: VerifyStrategy,
    pub dkim: VerifyStrategy,
    pub dmarc: VerifyStrategy,
}

impl Default for MailAuthConfig {
    fn default() -> Self {
        MailAuthConfig {
            spf: VerifyStrategy::Relaxed,
            dkim: VerifyStrategy::Relaxed,
            dmarc: VerifyStrategy::Relaxed,
        }
    }
}

/// Outbound signing key for mail originated or relayed by this node.
pub struct DkimSigner {
    pub domain: String,
    pub selector: String,
    pub signing_key: SigningKey,
    pub signed_headers: Vec<String>,
}

impl DkimSigner {
    pub fn from_pkcs1_pem_file(domain: String, selector: String, path: &std::path::Path, algorithm: Algorithm) -> std::io::Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        let signing_key = SigningKey::from_rsa_pkcs1_pem(&pem, algorithm)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        Ok(DkimSigner {
            domain,
            selector,
            signing_key,
            signed_headers: default_signed_headers(),
        })
    }
}

fn default_signed_headers() -> Vec<String> {
    ["from", "to", "subject", "date", "message-id"].iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_message_size: usize,
    pub session_timeout: Duration,
    pub connection_max_lifetime: Duration,
    pub auth_require_for_local_sender: bool,
    pub rcpt_max: usize,
    pub greeting_domain: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_message_size: 25 * 1024 * 1024,
            session_timeout: Duration::from_secs(300),
            connection_max_lifetime: Duration::from_secs(600),
            auth_require_for_local_sender: true,
            rcpt_max: 100,
            greeting_domain: "localhost".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub relay_retry_max: u32,
    pub relay_retry_backoff: Duration,
    /// Bounces are sent from this address; a bounce whose computed recipient
    /// equals this address is dropped instead of sent, preventing a bounce
    /// loop against the delivery subsystem's own mailbox.
    pub bounce_sender: String,
    pub worker_queue_high_water_mark: usize,
    pub worker_drain_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            relay_retry_max: 3,
            relay_retry_backoff: Duration::from_secs(60),
            bounce_sender: "delivery@localhost".into(),
            worker_queue_high_water_mark: 10_000,
            worker_drain_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub id: String,
    pub bind: String,
    pub implicit_tls: bool,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Top-level configuration, assembled once from the process environment.
pub struct Configuration {
    pub node_name: String,
    pub server_domain: String,
    pub tls: Option<TlsConfig>,
    pub cassandra_contact_points: Vec<String>,
    pub redis_addr: Option<String>,
    pub dkim_signer: Option<Arc<DkimSigner>>,
    pub mail_auth: MailAuthConfig,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "missing required environment variable {name}"),
            ConfigError::Invalid(name, value) => write!(f, "invalid value for {name}: {value}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Configuration {
    /// Loads configuration from environment variables, falling back to
    /// development-friendly defaults for everything except the server
    /// domain and node name.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_domain = env_or("FANNST_DOMAIN", "localhost".into());
        let node_name = env_or("FANNST_NODE_NAME", "fannst-mta-1".into());

        let tls = match (std::env::var("FANNST_TLS_CERT"), std::env::var("FANNST_TLS_KEY")) {
            (Ok(cert), Ok(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            _ => None,
        };

        let cassandra_contact_points = std::env::var("FANNST_CASSANDRA_CONTACT_POINTS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();

        let redis_addr = std::env::var("FANNST_REDIS_HOST")
            .ok()
            .map(|host| format!("{host}:{}", env_or("FANNST_REDIS_PORT", "6379".into())));

        let mail_auth = MailAuthConfig {
            spf: env_strategy("FANNST_VERIFY_SPF", VerifyStrategy::Relaxed)?,
            dkim: env_strategy("FANNST_VERIFY_DKIM", VerifyStrategy::Relaxed)?,
            dmarc: env_strategy("FANNST_VERIFY_DMARC", VerifyStrategy::Relaxed)?,
        };

        let dkim_signer = match (
            std::env::var("FANNST_DKIM_SELECTOR"),
            std::env::var("FANNST_DKIM_PRIVATE_KEY_PATH"),
        ) {
            (Ok(selector), Ok(path)) => Some(Arc::new(
                DkimSigner::from_pkcs1_pem_file(server_domain.clone(), selector, std::path::Path::new(&path), Algorithm::RsaSha256)
                    .map_err(|e| ConfigError::Invalid("FANNST_DKIM_PRIVATE_KEY_PATH", e.to_string()))?,
            )),
            _ => None,
        };

        let mut session = SessionConfig::default();
        if let Ok(v) = std::env::var("FANNST_MAX_MESSAGE_SIZE") {
            session.max_message_size = v
                .parse()
                .map_err(|_| ConfigError::Invalid("FANNST_MAX_MESSAGE_SIZE", v))?;
        }
        session.greeting_domain = server_domain.clone();

        let mut queue = QueueConfig::default();
        queue.bounce_sender = format!("delivery@{server_domain}");

        let listeners = vec![
            ListenerConfig {
                id: "smtp".into(),
                bind: env_or("FANNST_SMTP_BIND", "0.0.0.0:25".into()),
                implicit_tls: false,
            },
            ListenerConfig {
                id: "submission".into(),
                bind: env_or("FANNST_SUBMISSION_BIND", "0.0.0.0:587".into()),
                implicit_tls: false,
            },
            ListenerConfig {
                id: "smtps".into(),
                bind: env_or("FANNST_SMTPS_BIND", "0.0.0.0:465".into()),
                implicit_tls: true,
            },
        ];

        Ok(Configuration {
            node_name,
            server_domain,
            tls,
            cassandra_contact_points,
            redis_addr,
            dkim_signer,
            mail_auth,
            session,
            queue,
            listeners,
        })
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_strategy(name: &'static str, default: VerifyStrategy) -> Result<VerifyStrategy, ConfigError> {
    match std::env::var(name) {
        Ok(v) => VerifyStrategy::parse(&v).ok_or(ConfigError::Invalid(name, v)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_strategy_parses_known_values() {
        assert_eq!(VerifyStrategy::parse("strict"), Some(VerifyStrategy::Strict));
        assert_eq!(VerifyStrategy::parse("Relaxed"), Some(VerifyStrategy::Relaxed));
        assert_eq!(VerifyStrategy::parse("off"), Some(VerifyStrategy::Disable));
        assert_eq!(VerifyStrategy::parse("bogus"), None);
    }

    #[test]
    fn disable_does_not_verify_but_strict_and_relaxed_do() {
        assert!(!VerifyStrategy::Disable.verify());
        assert!(VerifyStrategy::Relaxed.verify());
        assert!(VerifyStrategy::Strict.verify());
        assert!(VerifyStrategy::Strict.is_strict());
        assert!(!VerifyStrategy::Relaxed.is_strict());
    }
}
