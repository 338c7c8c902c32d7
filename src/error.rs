//! Error types for the proxy.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Invalid request: {message}")]
    Validation { message: String },

    #[error("Translation error: {message}")]
    Translation { message: String },

    #[error("Provider {provider} rejected the credential (status {status})")]
    Authentication {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Provider {provider} is rate limiting requests")]
    RateLimit { provider: String, body: String },

    #[error("Provider {provider} unavailable: {message}")]
    ServiceUnavailable { provider: String, message: String },

    #[error("Provider {provider} returned status {status}")]
    Provider {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("No route for model '{model}'")]
    RouteNotFound { model: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Vendor-independent error category, rendered into each vendor's envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    InvalidRequest,
    Authentication,
    RateLimit,
    NotFound,
    Unavailable,
    Upstream,
    Internal,
}

impl ProxyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unavailable(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Classify a non-2xx backend status into the proxy taxonomy.
    pub fn from_status(provider: &str, status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimit {
                provider: provider.to_string(),
                body,
            },
            401 | 403 => Self::Authentication {
                provider: provider.to_string(),
                status,
                body,
            },
            _ => Self::Provider {
                provider: provider.to_string(),
                status,
                body,
            },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation { .. } | Self::Translation { .. } => ErrorClass::InvalidRequest,
            Self::Authentication { .. } => ErrorClass::Authentication,
            Self::RateLimit { .. } => ErrorClass::RateLimit,
            Self::RouteNotFound { .. } => ErrorClass::NotFound,
            Self::ServiceUnavailable { .. } | Self::Http(_) => ErrorClass::Unavailable,
            Self::Provider { .. } => ErrorClass::Upstream,
            Self::Config { .. } | Self::Io(_) | Self::Json(_) | Self::Toml(_) => {
                ErrorClass::Internal
            }
        }
    }

    /// HTTP status returned to the caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::Translation { .. } => 400,
            Self::Authentication { .. } => 401,
            Self::RateLimit { .. } => 429,
            Self::RouteNotFound { .. } => 404,
            Self::ServiceUnavailable { .. } => 503,
            Self::Provider { status, .. } if (400..=599).contains(status) => *status,
            Self::Provider { .. } | Self::Http(_) => 502,
            Self::Config { .. } | Self::Io(_) | Self::Json(_) | Self::Toml(_) => 500,
        }
    }

    /// Message safe to show the client. Backend error bodies are mined for
    /// their `error.message`, which all three vendors place at the same path.
    pub fn client_message(&self) -> String {
        match self {
            Self::Authentication { body, .. }
            | Self::RateLimit { body, .. }
            | Self::Provider { body, .. } => match backend_message(body) {
                Some(msg) => format!("{self}: {msg}"),
                None if body.trim().is_empty() => self.to_string(),
                None => format!("{self}: {}", truncate(body, 500)),
            },
            other => other.to_string(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimit { .. })
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }
}

fn backend_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
}

/// Truncate on a char boundary.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProxyError::from_status("openai", 429, String::new()).is_rate_limit());
        assert!(ProxyError::from_status("openai", 401, String::new()).is_authentication());
        assert!(ProxyError::from_status("openai", 403, String::new()).is_authentication());

        let err = ProxyError::from_status("openai", 500, "boom".to_string());
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.class(), ErrorClass::Upstream);
    }

    #[test]
    fn test_provider_status_outside_error_range_becomes_bad_gateway() {
        let err = ProxyError::Provider {
            provider: "gemini".to_string(),
            status: 302,
            body: String::new(),
        };
        assert_eq!(err.status_code(), 502);
    }

    #[test]
    fn test_client_message_extracts_backend_error() {
        let err = ProxyError::from_status(
            "anthropic",
            400,
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"max_tokens too large"}}"#
                .to_string(),
        );
        assert!(err.client_message().ends_with("max_tokens too large"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
