//! Recipient definitions: where a fired job delivers its notification.
//!
//! The set of recipient kinds is closed: dispatch is a match over this enum,
//! not an open-ended type lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{ErrorCode, PulseError, Result};

/// Delivery target of a fired job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    /// HTTP callback to a caller-provided endpoint.
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// Event published on a message-broker channel.
    Broker {
        channel: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// Event delivered to the serverless sink resolved from the runtime
    /// environment at dispatch time.
    Sink {
        #[serde(default)]
        content_mode: SinkContentMode,
    },
}

/// How the sink event payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkContentMode {
    /// Attributes as headers, payload as raw body.
    #[default]
    Binary,
    /// Single JSON envelope carrying attributes and payload.
    Structured,
}

/// Recipient kind tag, used by the executor resolver and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientKind {
    Http,
    Broker,
    Sink,
}

impl fmt::Display for RecipientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Broker => write!(f, "broker"),
            Self::Sink => write!(f, "sink"),
        }
    }
}

fn default_method() -> String {
    "POST".to_string()
}

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH"];

impl Recipient {
    /// Get the kind tag for this recipient.
    pub fn kind(&self) -> RecipientKind {
        match self {
            Self::Http { .. } => RecipientKind::Http,
            Self::Broker { .. } => RecipientKind::Broker,
            Self::Sink { .. } => RecipientKind::Sink,
        }
    }

    /// Validate the recipient at job-creation time.
    ///
    /// A malformed recipient is a configuration error: the job is rejected
    /// synchronously and never persisted.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Http { url, method, .. } => {
                reqwest::Url::parse(url).map_err(|e| {
                    PulseError::with_internal(
                        ErrorCode::InvalidRecipient,
                        format!("Invalid recipient URL: {}", url),
                        e.to_string(),
                    )
                })?;
                let method = method.to_ascii_uppercase();
                if !ALLOWED_METHODS.contains(&method.as_str()) {
                    return Err(PulseError::new(
                        ErrorCode::InvalidRecipient,
                        format!("Unsupported HTTP method: {}", method),
                    ));
                }
                Ok(())
            }
            Self::Broker { channel, .. } => {
                if channel.trim().is_empty() {
                    return Err(PulseError::new(
                        ErrorCode::InvalidRecipient,
                        "Broker channel cannot be empty",
                    ));
                }
                Ok(())
            }
            // Sink URL is resolved from the environment at dispatch time and
            // checked by the readiness probe.
            Self::Sink { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_recipient_validation() {
        let ok = Recipient::Http {
            url: "https://example.com/callback".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            payload: None,
        };
        assert!(ok.validate().is_ok());

        let bad_url = Recipient::Http {
            url: "not a url".to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            payload: None,
        };
        assert_eq!(
            bad_url.validate().unwrap_err().code(),
            ErrorCode::InvalidRecipient
        );

        let bad_method = Recipient::Http {
            url: "https://example.com".to_string(),
            method: "TRACE".to_string(),
            headers: HashMap::new(),
            payload: None,
        };
        assert_eq!(
            bad_method.validate().unwrap_err().code(),
            ErrorCode::InvalidRecipient
        );
    }

    #[test]
    fn test_broker_recipient_validation() {
        let ok = Recipient::Broker {
            channel: "job-events".to_string(),
            payload: Some(serde_json::json!({"k": "v"})),
        };
        assert!(ok.validate().is_ok());

        let empty = Recipient::Broker {
            channel: "  ".to_string(),
            payload: None,
        };
        assert_eq!(
            empty.validate().unwrap_err().code(),
            ErrorCode::InvalidRecipient
        );
    }

    #[test]
    fn test_kind_tags() {
        let sink = Recipient::Sink {
            content_mode: SinkContentMode::Binary,
        };
        assert_eq!(sink.kind(), RecipientKind::Sink);
        assert!(sink.validate().is_ok());
        assert_eq!(RecipientKind::Broker.to_string(), "broker");
    }

    #[test]
    fn test_serde_tagged_representation() {
        let recipient = Recipient::Http {
            url: "https://example.com".to_string(),
            method: "PUT".to_string(),
            headers: HashMap::new(),
            payload: None,
        };
        let json = serde_json::to_value(&recipient).unwrap();
        assert_eq!(json["type"], "http");

        // Method defaults to POST when omitted.
        let parsed: Recipient =
            serde_json::from_value(serde_json::json!({"type": "http", "url": "https://x.io"}))
                .unwrap();
        match parsed {
            Recipient::Http { method, .. } => assert_eq!(method, "POST"),
            _ => panic!("expected http recipient"),
        }
    }
}
