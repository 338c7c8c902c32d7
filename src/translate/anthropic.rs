//! Anthropic Messages codec.

use super::anthropic_types::{
    ContentBlock as ClaudeBlock, ErrorResponse, ImageSource as ClaudeImage, Message,
    MessageContent, MessagesRequest, MessagesResponse, ResponseContentBlock, Role as ClaudeRole,
    SystemContent, Tool, ToolChoice as ClaudeToolChoice, ToolChoiceAuto, ToolChoiceSpecific,
    ToolResultContent, Usage as ClaudeUsage, DEFAULT_MAX_TOKENS,
};
use super::neutral::{
    clamp, error_finish_reason, guess_media_type, new_id, ContentBlock, FinishReason, ImageSource,
    NeutralMessage, NeutralRequest, NeutralResponse, Role, ToolCall, ToolChoice, ToolSpec, Usage,
};
use super::streaming::anthropic::{ClaudeStreamDecoder, ClaudeStreamEncoder};
use super::streaming::{StreamDecoder, StreamEncoder};
use super::{effective_tools, parse_backend, parse_inbound, BuiltRequest, Format, RouteParams, VendorCodec};
use crate::error::{ErrorClass, ProxyError, Result};

pub struct ClaudeCodec;

impl VendorCodec for ClaudeCodec {
    fn format(&self) -> Format {
        Format::Claude
    }

    fn to_neutral(&self, raw: &[u8]) -> Result<NeutralRequest> {
        let req: MessagesRequest = parse_inbound(raw, "Anthropic")?;
        request_to_neutral(req)
    }

    fn build_request(&self, req: &NeutralRequest, params: &RouteParams) -> Result<BuiltRequest> {
        let mut warnings = Vec::new();
        let body = neutral_to_request(req, params, &mut warnings)?;
        Ok(BuiltRequest {
            body: serde_json::to_value(body)?,
            warnings,
        })
    }

    fn parse_response(&self, raw: &[u8]) -> Result<NeutralResponse> {
        let resp: MessagesResponse = parse_backend(raw, Format::Claude)?;
        response_to_neutral(resp)
    }

    fn build_response(&self, resp: &NeutralResponse) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(neutral_to_response(resp)?)?)
    }

    fn error_body(&self, err: &ProxyError) -> serde_json::Value {
        let error_type = match err.class() {
            ErrorClass::InvalidRequest => "invalid_request_error",
            ErrorClass::Authentication => "authentication_error",
            ErrorClass::RateLimit => "rate_limit_error",
            ErrorClass::NotFound => "not_found_error",
            ErrorClass::Unavailable => "overloaded_error",
            ErrorClass::Upstream | ErrorClass::Internal => "api_error",
        };
        serde_json::to_value(ErrorResponse::new(error_type, err.client_message()))
            .unwrap_or_default()
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(ClaudeStreamDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(ClaudeStreamEncoder::new(model))
    }
}

// ---------------------------------------------------------------------------
// Inbound: Claude request -> neutral
// ---------------------------------------------------------------------------

pub fn request_to_neutral(req: MessagesRequest) -> Result<NeutralRequest> {
    if req.messages.is_empty() {
        return Err(ProxyError::validation("'messages' must not be empty"));
    }

    let mut messages = Vec::with_capacity(req.messages.len());
    for (i, msg) in req.messages.iter().enumerate() {
        let mut content = Vec::new();
        let mut tool_calls = Vec::new();

        for block in msg.content.blocks() {
            match block {
                ClaudeBlock::Text { text } => content.push(ContentBlock::Text { text }),
                ClaudeBlock::Image { source } => content.push(ContentBlock::Image {
                    source: image_to_neutral(source, i)?,
                }),
                ClaudeBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: serde_json::to_string(&input)?,
                }),
                ClaudeBlock::ToolResult {
                    tool_use_id,
                    content: result,
                    is_error,
                } => content.push(ContentBlock::ToolResult {
                    call_id: tool_use_id,
                    content: tool_result_text(result.as_ref()),
                    is_error: is_error.unwrap_or(false),
                }),
                ClaudeBlock::Thinking { .. } | ClaudeBlock::RedactedThinking { .. } => {}
            }
        }

        let role = match msg.role {
            ClaudeRole::User => Role::User,
            ClaudeRole::Assistant => Role::Assistant,
        };
        messages.push(NeutralMessage {
            role,
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        });
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            })
            .collect()
    });

    let tool_choice = req.tool_choice.map(|tc| match tc {
        ClaudeToolChoice::Specific(ToolChoiceSpecific { name, .. }) => ToolChoice::Tool(name),
        ClaudeToolChoice::Auto(ToolChoiceAuto { choice_type }) => match choice_type.as_str() {
            "any" => ToolChoice::Required,
            "none" => ToolChoice::None,
            _ => ToolChoice::Auto,
        },
    });

    let mut neutral = NeutralRequest {
        model: req.model,
        messages,
        system_prompt: req
            .system
            .as_ref()
            .map(SystemContent::as_text)
            .filter(|s| !s.is_empty()),
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: Vec::new(),
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice,
    };
    neutral.add_stop(req.stop_sequences.unwrap_or_default());
    Ok(neutral)
}

fn image_to_neutral(source: ClaudeImage, index: usize) -> Result<ImageSource> {
    match (source.source_type.as_str(), source.data, source.url) {
        ("base64", Some(data), _) => Ok(ImageSource::Base64 {
            media_type: source.media_type.unwrap_or_else(|| "image/png".to_string()),
            data,
        }),
        ("url", _, Some(url)) => Ok(ImageSource::Url {
            media_type: source
                .media_type
                .or_else(|| guess_media_type(&url).map(str::to_string)),
            url,
        }),
        (other, _, _) => Err(ProxyError::validation(format!(
            "messages[{index}]: unsupported image source type '{other}'"
        ))),
    }
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                ClaudeBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Outbound: neutral -> Claude request
// ---------------------------------------------------------------------------

pub fn neutral_to_request(
    req: &NeutralRequest,
    params: &RouteParams,
    warnings: &mut Vec<String>,
) -> Result<MessagesRequest> {
    let mut system_parts: Vec<String> = req.system_prompt.iter().cloned().collect();
    let mut messages: Vec<Message> = Vec::new();

    for msg in &req.messages {
        let (role, blocks) = match msg.role {
            Role::System => {
                system_parts.push(msg.text());
                continue;
            }
            Role::User | Role::Tool => (ClaudeRole::User, user_blocks(&msg.content)),
            Role::Assistant => (ClaudeRole::Assistant, assistant_blocks(msg)?),
        };
        if blocks.is_empty() {
            continue;
        }
        push_merged(&mut messages, role, blocks);
    }

    let (tools, tool_choice) = effective_tools(req, params, warnings);
    let tools: Option<Vec<Tool>> = tools.map(|tools| {
        tools
            .iter()
            .map(|t| Tool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    });
    let tool_choice = tools.as_ref().and(tool_choice).map(|tc| match tc {
        ToolChoice::Auto => auto_choice("auto"),
        ToolChoice::None => auto_choice("none"),
        ToolChoice::Required => auto_choice("any"),
        ToolChoice::Tool(name) => ClaudeToolChoice::Specific(ToolChoiceSpecific {
            choice_type: "tool".to_string(),
            name: name.clone(),
        }),
    });

    let temperature = clamp(req.temperature, 0.0, 1.0);
    if temperature != req.temperature {
        tracing::debug!(requested = ?req.temperature, clamped = ?temperature, "temperature clamped for Claude");
    }

    let system = system_parts.join("\n");

    Ok(MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system.is_empty()).then_some(SystemContent::Text(system)),
        stream: req.stream.then_some(true),
        temperature,
        top_p: clamp(req.top_p, 0.0, 1.0),
        top_k: None,
        tools,
        tool_choice,
        metadata: None,
        stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
        thinking: None,
    })
}

fn auto_choice(kind: &str) -> ClaudeToolChoice {
    ClaudeToolChoice::Auto(ToolChoiceAuto {
        choice_type: kind.to_string(),
    })
}

/// Append a turn, folding it into the previous one when the role repeats.
fn push_merged(messages: &mut Vec<Message>, role: ClaudeRole, blocks: Vec<ClaudeBlock>) {
    if let Some(last) = messages.last_mut() {
        if last.role == role {
            if let MessageContent::Blocks(existing) = &mut last.content {
                existing.extend(blocks);
                return;
            }
        }
    }
    messages.push(Message {
        role,
        content: MessageContent::Blocks(blocks),
    });
}

fn user_blocks(content: &[ContentBlock]) -> Vec<ClaudeBlock> {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if text.is_empty() => None,
            ContentBlock::Text { text } => Some(ClaudeBlock::Text { text: text.clone() }),
            ContentBlock::Image { source } => Some(ClaudeBlock::Image {
                source: image_from_neutral(source),
            }),
            ContentBlock::ToolResult {
                call_id,
                content,
                is_error,
            } => Some(ClaudeBlock::ToolResult {
                tool_use_id: call_id.clone(),
                content: Some(ToolResultContent::Text(content.clone())),
                is_error: is_error.then_some(true),
            }),
        })
        .collect()
}

fn assistant_blocks(msg: &NeutralMessage) -> Result<Vec<ClaudeBlock>> {
    let mut blocks = Vec::new();
    for block in &msg.content {
        match block {
            ContentBlock::Text { text } if text.is_empty() => {}
            ContentBlock::Text { text } => blocks.push(ClaudeBlock::Text { text: text.clone() }),
            other => {
                return Err(ProxyError::translation(format!(
                    "Claude assistant turns cannot carry a {}",
                    other.describe()
                )))
            }
        }
    }
    for call in msg.tool_calls.iter().flatten() {
        blocks.push(ClaudeBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments_value()?,
        });
    }
    Ok(blocks)
}

fn image_from_neutral(source: &ImageSource) -> ClaudeImage {
    match source {
        ImageSource::Base64 { media_type, data } => ClaudeImage {
            source_type: "base64".to_string(),
            media_type: Some(media_type.clone()),
            data: Some(data.clone()),
            url: None,
        },
        ImageSource::Url { url, .. } => ClaudeImage {
            source_type: "url".to_string(),
            media_type: None,
            data: None,
            url: Some(url.clone()),
        },
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn response_to_neutral(resp: MessagesResponse) -> Result<NeutralResponse> {
    let mut content = Vec::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            ResponseContentBlock::Text { text } => content.push(ContentBlock::Text { text }),
            ResponseContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: serde_json::to_string(&input)?,
            }),
            ResponseContentBlock::Thinking { .. } | ResponseContentBlock::RedactedThinking { .. } => {}
        }
    }

    let (finish_reason, finish_details) = match resp.stop_reason.as_deref() {
        Some(reason) => map_stop_reason(reason),
        None if !tool_calls.is_empty() => (FinishReason::ToolCalls, None),
        None => (FinishReason::Stop, None),
    };

    Ok(NeutralResponse {
        id: resp.id,
        model: resp.model,
        content,
        tool_calls,
        finish_reason,
        finish_details,
        usage: Usage::new(resp.usage.input_tokens, resp.usage.output_tokens, None),
    })
}

pub fn neutral_to_response(resp: &NeutralResponse) -> Result<MessagesResponse> {
    let mut content = Vec::new();
    for block in &resp.content {
        match block {
            ContentBlock::Text { text } if text.is_empty() => {}
            ContentBlock::Text { text } => {
                content.push(ResponseContentBlock::Text { text: text.clone() });
            }
            other => {
                return Err(ProxyError::translation(format!(
                    "Claude responses cannot carry a {}",
                    other.describe()
                )))
            }
        }
    }
    for call in &resp.tool_calls {
        content.push(ResponseContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments_value()?,
        });
    }

    // Clients expect at least one content block
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    Ok(MessagesResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: resp.model.clone(),
        stop_reason: Some(stop_reason_str(
            resp.finish_reason,
            resp.finish_details.as_deref(),
        )),
        stop_sequence: None,
        usage: ClaudeUsage {
            input_tokens: resp.usage.prompt_tokens,
            output_tokens: resp.usage.completion_tokens,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    })
}

/// Reuse a backend id, prefixed to look like an Anthropic message id.
pub(crate) fn message_id(id: &str) -> String {
    if id.starts_with("msg_") {
        id.to_string()
    } else if id.is_empty() {
        new_id("msg_")
    } else {
        format!("msg_{}", id.trim_start_matches("chatcmpl-"))
    }
}

/// Map a Claude `stop_reason` to the neutral reason.
pub fn map_stop_reason(reason: &str) -> (FinishReason, Option<String>) {
    match reason {
        "end_turn" | "stop_sequence" => (FinishReason::Stop, None),
        "max_tokens" => (FinishReason::Length, None),
        "tool_use" => (FinishReason::ToolCalls, None),
        "refusal" => (FinishReason::ContentFilter, None),
        other => (FinishReason::Error, Some(other.to_string())),
    }
}

/// Claude stop reasons with no neutral counterpart.
const CLAUDE_ONLY_STOP_REASONS: &[&str] = &["pause_turn"];

/// Map a neutral reason to a Claude `stop_reason`.
pub fn stop_reason_str(reason: FinishReason, details: Option<&str>) -> String {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Error => return error_finish_reason(details, CLAUDE_ONLY_STOP_REASONS, "error"),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(text: &str) -> NeutralMessage {
        NeutralMessage::new(Role::User, vec![ContentBlock::text(text)])
    }

    #[test]
    fn test_request_carries_null_system_and_block_content() {
        let req = NeutralRequest {
            model: "claude-3-opus-20240229".to_string(),
            messages: vec![user("hi")],
            ..NeutralRequest::default()
        };
        let body = ClaudeCodec
            .build_request(&req, &RouteParams::default())
            .unwrap()
            .body;
        assert!(body.get("system").unwrap().is_null());
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["model"], "claude-3-opus-20240229");
        assert_eq!(
            body["messages"],
            json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
        );
    }

    #[test]
    fn test_consecutive_turns_merge_and_tool_results_join_user() {
        let req = NeutralRequest {
            model: "claude-3-5-sonnet".to_string(),
            system_prompt: Some("Be terse".to_string()),
            messages: vec![
                user("weather?"),
                NeutralMessage {
                    role: Role::Assistant,
                    content: vec![ContentBlock::text("Checking.")],
                    tool_calls: Some(vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "get_weather".to_string(),
                        arguments: "{\"city\":\"Oslo\"}".to_string(),
                    }]),
                },
                NeutralMessage::new(
                    Role::Tool,
                    vec![ContentBlock::ToolResult {
                        call_id: "call_1".to_string(),
                        content: "-3C".to_string(),
                        is_error: false,
                    }],
                ),
                user("and tomorrow?"),
            ],
            temperature: Some(1.8),
            ..NeutralRequest::default()
        };
        let body = ClaudeCodec
            .build_request(&req, &RouteParams::default())
            .unwrap()
            .body;
        assert_eq!(body["system"], "Be terse");
        assert_eq!(body["temperature"], 1.0);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[1]["content"][1]["input"]["city"], "Oslo");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][1]["text"], "and tomorrow?");
    }

    #[test]
    fn test_malformed_tool_arguments_is_translation_error() {
        let req = NeutralRequest {
            model: "claude".to_string(),
            messages: vec![NeutralMessage {
                role: Role::Assistant,
                content: Vec::new(),
                tool_calls: Some(vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "f".to_string(),
                    arguments: "{\"city\":".to_string(),
                }]),
            }],
            ..NeutralRequest::default()
        };
        let err = ClaudeCodec
            .build_request(&req, &RouteParams::default())
            .unwrap_err();
        assert!(matches!(err, ProxyError::Translation { .. }));
    }

    #[test]
    fn test_to_neutral_drops_thinking_and_maps_tool_use() {
        let raw = json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 1024,
            "system": [{"type": "text", "text": "A"}, {"type": "text", "text": "B"}],
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                    {"type": "text", "text": "Looking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "rust"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "found"}], "is_error": true}
                ]}
            ],
            "tool_choice": {"type": "any"},
            "stop_sequences": ["x", "x", "y"]
        });
        let req = ClaudeCodec.to_neutral(raw.to_string().as_bytes()).unwrap();
        assert_eq!(req.system_prompt.as_deref(), Some("A\nB"));
        assert_eq!(req.messages[1].content, vec![ContentBlock::text("Looking")]);
        let calls = req.messages[1].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].arguments, "{\"q\":\"rust\"}");
        assert_eq!(
            req.messages[2].content[0],
            ContentBlock::ToolResult {
                call_id: "toolu_1".to_string(),
                content: "found".to_string(),
                is_error: true
            }
        );
        assert_eq!(req.tool_choice, Some(ToolChoice::Required));
        assert_eq!(req.stop, vec!["x", "y"]);
    }

    #[test]
    fn test_parse_response_maps_stop_reasons() {
        let raw = json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-opus-20240229",
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 3, "output_tokens": 2}
        });
        let resp = ClaudeCodec.parse_response(raw.to_string().as_bytes()).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.usage.total_tokens, 5);

        assert_eq!(map_stop_reason("stop_sequence").0, FinishReason::Stop);
        assert_eq!(map_stop_reason("refusal").0, FinishReason::ContentFilter);
        assert_eq!(
            map_stop_reason("pause_turn"),
            (FinishReason::Error, Some("pause_turn".to_string()))
        );
        assert_eq!(stop_reason_str(FinishReason::Error, Some("pause_turn")), "pause_turn");
        assert_eq!(stop_reason_str(FinishReason::Error, Some("MALFORMED_FUNCTION_CALL")), "error");
    }

    #[test]
    fn test_build_response_with_tool_use() {
        let resp = NeutralResponse {
            id: "chatcmpl-xyz".to_string(),
            model: "gpt-4o".to_string(),
            content: Vec::new(),
            tool_calls: vec![ToolCall {
                id: "call_abc".to_string(),
                name: "get_weather".to_string(),
                arguments: "{\"city\":\"London\"}".to_string(),
            }],
            finish_reason: FinishReason::ToolCalls,
            finish_details: None,
            usage: Usage::new(10, 20, None),
        };
        let body = ClaudeCodec.build_response(&resp).unwrap();
        assert_eq!(body["id"], "msg_xyz");
        assert_eq!(body["stop_reason"], "tool_use");
        assert_eq!(body["content"][0]["type"], "tool_use");
        assert_eq!(body["content"][0]["input"]["city"], "London");
        assert_eq!(body["usage"]["input_tokens"], 10);
    }

    #[test]
    fn test_error_body_envelope() {
        let err = ProxyError::RateLimit {
            provider: "anthropic".to_string(),
            body: String::new(),
        };
        let body = ClaudeCodec.error_body(&err);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }
}
