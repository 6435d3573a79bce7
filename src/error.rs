//! Error types for the MQTT link
//!
//! Transport failures never escape the connection manager; they are logged
//! and turned into state transitions. The types here describe what went
//! wrong at each boundary so the log line is useful.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors raised by a tunnel implementation
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("SSH connection to {host}:{port} failed: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },

    #[error("SSH authentication rejected for user {username}")]
    Authentication { username: String },

    #[error("Failed to bind local tunnel endpoint: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Tunnel channel error: {message}")]
    Channel { message: String },

    #[error("Tunnel is not active")]
    NotActive,

    #[error("Tunnel operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Errors raised by a broker client implementation
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription to {topic} failed")]
    SubscriptionFailed {
        topic: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Disconnect failed")]
    DisconnectFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Broker did not acknowledge the connection within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Broker client is not connected")]
    NotConnected,
}

/// Top-level error type for fallible public operations
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|passwd|pass|token|secret)[=:]\s*\S+")
        .expect("secret pattern is a valid regex")
});

static SSH_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh)/[a-zA-Z0-9._/-]+")
        .expect("ssh path pattern is a valid regex")
});

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Strip credentials and key paths from error text before it reaches the logs
///
/// Transport libraries occasionally echo connection parameters back in their
/// error messages; SSH and broker passwords must not end up in log sinks.
pub fn redact_secrets(message: &str) -> String {
    let mut redacted = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    redacted = SSH_PATH_PATTERN
        .replace_all(&redacted, "/***REDACTED***/")
        .to_string();

    if redacted.len() > MAX_LOGGED_ERROR_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - suffix.len();
        while !redacted.is_char_boundary(cut) {
            cut -= 1;
        }
        redacted.truncate(cut);
        redacted.push_str(suffix);
    }

    redacted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_passwords() {
        let redacted = redact_secrets("auth failed: password=hunter2 token: abc");
        assert!(!redacted.contains("hunter2"));
        assert!(!redacted.contains("abc"));
        assert!(redacted.contains("password=***"));
        assert!(redacted.contains("token=***"));
    }

    #[test]
    fn test_redacts_case_insensitive() {
        let redacted = redact_secrets("PASS=letmein Secret=xyz");
        assert!(!redacted.contains("letmein"));
        assert!(!redacted.contains("xyz"));
    }

    #[test]
    fn test_redacts_ssh_key_paths() {
        let redacted = redact_secrets("could not read /home/pi/.ssh/id_ed25519");
        assert!(redacted.contains("/***REDACTED***/"));
        assert!(!redacted.contains("id_ed25519"));
    }

    #[test]
    fn test_leaves_plain_messages_alone() {
        assert_eq!(
            redact_secrets("Connection refused (os error 111)"),
            "Connection refused (os error 111)"
        );
        assert_eq!(redact_secrets(""), "");
    }

    #[test]
    fn test_truncates_long_messages() {
        let redacted = redact_secrets(&"x".repeat(800));
        assert!(redacted.len() <= MAX_LOGGED_ERROR_LEN);
        assert!(redacted.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let redacted = redact_secrets(&"ü".repeat(400));
        assert!(redacted.len() <= MAX_LOGGED_ERROR_LEN);
        assert!(redacted.ends_with("...[truncated]"));
    }

    #[test]
    fn test_error_display() {
        let errors: Vec<LinkError> = vec![
            TunnelError::Authentication {
                username: "pi".to_string(),
            }
            .into(),
            TunnelError::NotActive.into(),
            BrokerError::ConnectionFailed("refused".to_string()).into(),
            BrokerError::NotConnected.into(),
            BrokerError::Timeout(std::time::Duration::from_secs(5)).into(),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
