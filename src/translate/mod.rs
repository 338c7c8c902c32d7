//! API translation between the OpenAI, Anthropic and Gemini formats.
//!
//! Every vendor body is normalized into the types in [`neutral`] and rebuilt
//! from them, so any inbound format can reach any backend format. All
//! translation functions are pure (no I/O).

pub mod anthropic;
pub mod anthropic_types;
pub mod gemini;
pub mod gemini_types;
pub mod neutral;
pub mod openai;
pub mod openai_types;
pub mod streaming;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use neutral::{NeutralRequest, NeutralResponse, ToolChoice, ToolSpec};
use streaming::{StreamDecoder, StreamEncoder};

/// Wire format spoken by a client or a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(alias = "anthropic")]
    Claude,
    #[serde(alias = "google")]
    Gemini,
}

impl Format {
    pub fn as_str(self) -> &'static str {
        match self {
            Format::OpenAi => "openai",
            Format::Claude => "claude",
            Format::Gemini => "gemini",
        }
    }

    pub fn codec(self) -> &'static dyn VendorCodec {
        match self {
            Format::OpenAi => &openai::OpenAiCodec,
            Format::Claude => &anthropic::ClaudeCodec,
            Format::Gemini => &gemini::GeminiCodec,
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Format::OpenAi),
            "claude" | "anthropic" => Ok(Format::Claude),
            "gemini" | "google" => Ok(Format::Gemini),
            other => Err(ProxyError::config(format!("unknown API format '{other}'"))),
        }
    }
}

/// Target-specific knobs supplied by the route.
#[derive(Debug, Clone)]
pub struct RouteParams {
    pub supports_tools: bool,
}

impl Default for RouteParams {
    fn default() -> Self {
        Self {
            supports_tools: true,
        }
    }
}

/// A backend-native request body plus anything lossy that happened on the way.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
    pub body: serde_json::Value,
    pub warnings: Vec<String>,
}

/// Everything one vendor format knows how to do.
pub trait VendorCodec: Send + Sync {
    fn format(&self) -> Format;

    /// Validate an inbound body and normalize it.
    fn to_neutral(&self, raw: &[u8]) -> Result<NeutralRequest>;

    /// Build the backend-native request body.
    fn build_request(&self, req: &NeutralRequest, params: &RouteParams) -> Result<BuiltRequest>;

    /// Normalize a backend's non-streaming response body.
    fn parse_response(&self, raw: &[u8]) -> Result<NeutralResponse>;

    /// Render a neutral response in this format for the client.
    fn build_response(&self, resp: &NeutralResponse) -> Result<serde_json::Value>;

    /// Render an error in this format's envelope.
    fn error_body(&self, err: &ProxyError) -> serde_json::Value;

    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder>;
}

pub fn to_neutral(format: Format, raw: &[u8]) -> Result<NeutralRequest> {
    format.codec().to_neutral(raw)
}

pub fn from_neutral(format: Format, resp: &NeutralResponse) -> Result<serde_json::Value> {
    format.codec().build_response(resp)
}

pub fn build_request(
    target: Format,
    req: &NeutralRequest,
    params: &RouteParams,
) -> Result<BuiltRequest> {
    let built = target.codec().build_request(req, params)?;
    for warning in &built.warnings {
        tracing::warn!(target_format = %target, model = %req.model, "{warning}");
    }
    Ok(built)
}

pub fn parse_response(source: Format, raw: &[u8]) -> Result<NeutralResponse> {
    source.codec().parse_response(raw)
}

/// Tools and tool choice after applying the route's tool support, with a
/// warning when they had to be dropped.
pub(crate) fn effective_tools<'a>(
    req: &'a NeutralRequest,
    params: &RouteParams,
    warnings: &mut Vec<String>,
) -> (Option<&'a [ToolSpec]>, Option<&'a ToolChoice>) {
    let tools = req.tools.as_deref().filter(|t| !t.is_empty());
    if tools.is_some() && !params.supports_tools {
        warnings.push(format!(
            "model '{}' does not support tools; dropped {} tool definition(s)",
            req.model,
            tools.map_or(0, <[ToolSpec]>::len)
        ));
        return (None, None);
    }
    (tools, req.tool_choice.as_ref())
}

/// Deserialize an inbound body, mapping failure to a validation error.
pub(crate) fn parse_inbound<T: serde::de::DeserializeOwned>(raw: &[u8], what: &str) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|e| ProxyError::validation(format!("malformed {what} request: {e}")))
}

/// Deserialize a backend body, mapping failure to a provider error.
pub(crate) fn parse_backend<T: serde::de::DeserializeOwned>(raw: &[u8], format: Format) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| ProxyError::Provider {
        provider: format.to_string(),
        status: 502,
        body: format!(
            "unparseable {format} response ({e}): {}",
            crate::error::truncate(&String::from_utf8_lossy(raw), 200)
        ),
    })
}
