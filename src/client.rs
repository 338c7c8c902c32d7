//! HTTP calls to vendor backends.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::error::{truncate, ProxyError, Result};
use crate::keys::Credential;
use crate::translate::Format;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// A resolved backend: provider, its wire format, base URL and model.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub provider: String,
    pub format: Format,
    pub base_url: String,
    pub model: String,
}

impl Upstream {
    pub fn url(&self, stream: bool) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.format {
            Format::OpenAi => format!("{base}/chat/completions"),
            Format::Claude => format!("{base}/v1/messages"),
            Format::Gemini if stream => {
                format!("{base}/models/{}:streamGenerateContent?alt=sse", self.model)
            }
            Format::Gemini => format!("{base}/models/{}:generateContent", self.model),
        }
    }
}

/// Header name and value presenting `credential` to a backend of `format`.
pub fn auth_header(format: Format, credential: &Credential) -> (String, String) {
    let name = credential.auth_header.clone().unwrap_or_else(|| {
        match format {
            Format::OpenAi => "Authorization",
            Format::Claude => "x-api-key",
            Format::Gemini => "x-goog-api-key",
        }
        .to_string()
    });

    let secret = &credential.secret;
    let value = match credential.auth_format.as_deref() {
        Some(template) if template.contains("{api_key}") || template.contains("{key}") => {
            template.replace("{api_key}", secret).replace("{key}", secret)
        }
        _ => match format {
            Format::OpenAi => format!("Bearer {secret}"),
            Format::Claude | Format::Gemini => secret.clone(),
        },
    };
    (name, value)
}

pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>;

/// An open 2xx streaming response.
pub struct BackendStream {
    pub content_type: Option<String>,
    pub body: ByteStream,
}

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    request_timeout: Duration,
}

impl ProviderClient {
    /// `request_timeout` bounds a whole non-streaming call, and the wait for
    /// response headers on a streaming one.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            request_timeout,
        })
    }

    fn request(&self, upstream: &Upstream, body: Bytes, credential: &Credential, stream: bool) -> reqwest::RequestBuilder {
        let (name, value) = auth_header(upstream.format, credential);
        let mut builder = self
            .http
            .post(upstream.url(stream))
            .header(name.as_str(), value)
            .header("Content-Type", "application/json");
        if upstream.format == Format::Claude {
            builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        }
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        builder.body(body)
    }

    /// Non-streaming call; returns the 2xx body.
    pub async fn send(&self, upstream: &Upstream, body: Bytes, credential: &Credential) -> Result<Bytes> {
        let url = upstream.url(false);
        tracing::info!(provider = %upstream.provider, model = %upstream.model, %url, "POST");

        let response = self
            .request(upstream, body, credential, false)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| transport_error(&upstream.provider, &e))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(&upstream.provider, &e))?;

        tracing::debug!(status, body_len = bytes.len(), "backend response");

        if !(200..300).contains(&status) {
            return Err(status_error(&upstream.provider, status, &bytes));
        }
        Ok(bytes)
    }

    /// Streaming call; returns once the backend has answered 2xx.
    pub async fn send_stream(
        &self,
        upstream: &Upstream,
        body: Bytes,
        credential: &Credential,
    ) -> Result<BackendStream> {
        let url = upstream.url(true);
        tracing::info!(provider = %upstream.provider, model = %upstream.model, %url, "POST (streaming)");

        let response = tokio::time::timeout(
            self.request_timeout,
            self.request(upstream, body, credential, true).send(),
        )
        .await
        .map_err(|_| {
            ProxyError::unavailable(
                &upstream.provider,
                format!("no response within {}s", self.request_timeout.as_secs()),
            )
        })?
        .map_err(|e| transport_error(&upstream.provider, &e))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let bytes = response.bytes().await.unwrap_or_default();
            return Err(status_error(&upstream.provider, status, &bytes));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(BackendStream {
            content_type,
            body: response.bytes_stream().boxed(),
        })
    }
}

fn transport_error(provider: &str, e: &reqwest::Error) -> ProxyError {
    let what = if e.is_timeout() {
        "request timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    ProxyError::unavailable(provider, format!("{what}: {e}"))
}

fn status_error(provider: &str, status: u16, body: &[u8]) -> ProxyError {
    let body = String::from_utf8_lossy(body);
    tracing::warn!(provider, status, body = %truncate(&body, 300), "backend error");
    ProxyError::from_status(provider, status, body.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(format: Format, base: &str) -> Upstream {
        Upstream {
            provider: "p".to_string(),
            format,
            base_url: base.to_string(),
            model: "m-1".to_string(),
        }
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(
            upstream(Format::OpenAi, "https://api.openai.com/v1/").url(true),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            upstream(Format::Claude, "https://api.anthropic.com").url(false),
            "https://api.anthropic.com/v1/messages"
        );
        let g = upstream(Format::Gemini, "https://generativelanguage.googleapis.com/v1beta");
        assert_eq!(
            g.url(false),
            "https://generativelanguage.googleapis.com/v1beta/models/m-1:generateContent"
        );
        assert_eq!(
            g.url(true),
            "https://generativelanguage.googleapis.com/v1beta/models/m-1:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_default_auth_headers() {
        let cred = Credential::new("k", "secret");
        assert_eq!(
            auth_header(Format::OpenAi, &cred),
            ("Authorization".to_string(), "Bearer secret".to_string())
        );
        assert_eq!(
            auth_header(Format::Claude, &cred),
            ("x-api-key".to_string(), "secret".to_string())
        );
        assert_eq!(
            auth_header(Format::Gemini, &cred),
            ("x-goog-api-key".to_string(), "secret".to_string())
        );
    }

    #[test]
    fn test_auth_templates() {
        let mut cred = Credential::new("k", "secret");
        cred.auth_header = Some("Authorization".to_string());
        cred.auth_format = Some("Token {key}".to_string());
        assert_eq!(auth_header(Format::Claude, &cred).1, "Token secret");

        cred.auth_format = Some("Bearer {api_key}".to_string());
        assert_eq!(auth_header(Format::Gemini, &cred).1, "Bearer secret");

        // No placeholder: vendor default value.
        cred.auth_format = Some("Bearer".to_string());
        assert_eq!(auth_header(Format::OpenAi, &cred).1, "Bearer secret");
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let client = ProviderClient::new(Duration::from_secs(2)).unwrap();
        let up = upstream(Format::OpenAi, "http://127.0.0.1:9");
        let err = client
            .send(&up, Bytes::from_static(b"{}"), &Credential::new("k", "s"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 503);
    }
}
