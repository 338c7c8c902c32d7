//! Vendor-neutral intermediate form shared by every codec.
//!
//! Requests are normalized into [`NeutralRequest`], responses into
//! [`NeutralResponse`], and streamed deltas into [`StreamEvent`]. Each vendor
//! module only knows how to get into and out of these types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// Inline base64 payload.
    Base64 { media_type: String, data: String },
    /// Remote reference; the media type is not always known.
    Url {
        url: String,
        media_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Short label used in translation errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Text { .. } => "text block".to_string(),
            Self::Image {
                source: ImageSource::Base64 { media_type, .. },
            } => format!("inline image ({media_type})"),
            Self::Image {
                source: ImageSource::Url { url, .. },
            } => format!("image url {url}"),
            Self::ToolResult { call_id, .. } => format!("tool_result for call {call_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON text, exactly as the vendor produced it.
    pub arguments: String,
}

impl ToolCall {
    /// Parse the arguments for vendors that carry structured JSON.
    pub fn arguments_value(&self) -> crate::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments).map_err(|e| {
            crate::ProxyError::translation(format!(
                "tool call '{}' ({}) has malformed arguments: {e}",
                self.name, self.id
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeutralMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl NeutralMessage {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
        }
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NeutralRequest {
    /// Routed target model once the dispatcher has resolved the route;
    /// the client's model string before that.
    pub model: String,
    pub messages: Vec<NeutralMessage>,
    pub system_prompt: Option<String>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Vec<String>,
    pub stream: bool,
    pub tools: Option<Vec<ToolSpec>>,
    pub tool_choice: Option<ToolChoice>,
}

impl NeutralRequest {
    /// Text of the last user turn, used for keyword routing.
    pub fn prompt_hint(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(NeutralMessage::text)
            .filter(|t| !t.is_empty())
    }

    /// Push stop sequences keeping first-seen order and dropping duplicates.
    pub fn add_stop(&mut self, stops: impl IntoIterator<Item = String>) {
        for stop in stops {
            if !self.stop.contains(&stop) {
                self.stop.push(stop);
            }
        }
    }

    /// Name of the function a tool result answers, looked up among earlier
    /// assistant tool calls.
    pub fn tool_name_for(&self, call_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .filter_map(|m| m.tool_calls.as_ref())
            .flatten()
            .find(|c| c.id == call_id)
            .map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

/// Wire value for [`FinishReason::Error`] in a target vendor's vocabulary.
///
/// The raw backend reason is kept only when the target vendor defines it
/// too (a same-vendor round trip); anything else becomes `fallback` and the
/// raw value goes to the log.
pub fn error_finish_reason(details: Option<&str>, native: &[&str], fallback: &str) -> String {
    match details {
        Some(raw) if native.contains(&raw) => raw.to_string(),
        Some(raw) => {
            tracing::warn!(finish_reason = raw, mapped = fallback, "unmapped finish reason");
            fallback.to_string()
        }
        None => fallback.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Build usage, computing the total when the vendor left it out.
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: Option<u64>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total_tokens
                .filter(|t| *t > 0)
                .unwrap_or(prompt_tokens.saturating_add(completion_tokens)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeutralResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    /// Original vendor reason when it had no neutral counterpart.
    pub finish_details: Option<String>,
    pub usage: Usage,
}

impl NeutralResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// One neutral delta decoded from a backend stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    ToolCallStart {
        index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        index: usize,
        arguments: String,
    },
    Usage(Usage),
    Finish {
        reason: FinishReason,
        details: Option<String>,
    },
    /// Backend reported an error inside the stream.
    Error(String),
    /// Backend signalled end-of-stream.
    Done,
}

impl StreamEvent {
    /// Whether the event carries generated content (moves a stream out of `Init`).
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            Self::Text(_) | Self::ToolCallStart { .. } | Self::ToolCallDelta { .. }
        )
    }
}

/// Generate an id with the given prefix and a compact uuid.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

/// Split a `data:` URI into (media type, base64 payload).
pub fn split_data_uri(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

/// Guess an image media type from a URL's extension.
pub fn guess_media_type(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    let ext = path.rsplit('.').next()?;
    match ext {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        _ => None,
    }
}

/// Clamp an optional value into `[lo, hi]`.
pub fn clamp(value: Option<f64>, lo: f64, hi: f64) -> Option<f64> {
    value.map(|v| if v.is_nan() { lo } else { v.clamp(lo, hi) })
}
