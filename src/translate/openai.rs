//! OpenAI Chat Completions codec.
//!
//! A single neutral message can expand into several OpenAI messages: tool
//! results leave the user turn and become separate `tool`-role messages.

use super::neutral::{
    clamp, error_finish_reason, guess_media_type, split_data_uri, ContentBlock, FinishReason, ImageSource,
    NeutralMessage, NeutralRequest, NeutralResponse, Role, ToolCall, ToolChoice, ToolSpec, Usage,
};
use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatErrorResponse, ChatFunction,
    ChatMessage, ChatTool, ChatToolCall, ChatToolCallFunction, ChatToolChoice,
    ChatToolChoiceFunction, ChatToolChoiceSpecific, ChatUsage, Choice, ChoiceMessage,
    ContentPart, ImageUrlDetail, StopSequences, StreamOptions,
};
use super::streaming::openai::{OpenAiStreamDecoder, OpenAiStreamEncoder};
use super::streaming::{StreamDecoder, StreamEncoder};
use super::{effective_tools, parse_backend, parse_inbound, BuiltRequest, Format, RouteParams, VendorCodec};
use crate::error::{ErrorClass, ProxyError, Result};

pub struct OpenAiCodec;

impl VendorCodec for OpenAiCodec {
    fn format(&self) -> Format {
        Format::OpenAi
    }

    fn to_neutral(&self, raw: &[u8]) -> Result<NeutralRequest> {
        let req: ChatCompletionRequest = parse_inbound(raw, "OpenAI")?;
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
        let resp: ChatCompletionResponse = parse_backend(raw, Format::OpenAi)?;
        response_to_neutral(resp)
    }

    fn build_response(&self, resp: &NeutralResponse) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(neutral_to_response(resp)?)?)
    }

    fn error_body(&self, err: &ProxyError) -> serde_json::Value {
        let (error_type, code) = match err.class() {
            ErrorClass::InvalidRequest => ("invalid_request_error", "invalid_request"),
            ErrorClass::Authentication => ("authentication_error", "invalid_api_key"),
            ErrorClass::RateLimit => ("rate_limit_error", "rate_limit_exceeded"),
            ErrorClass::NotFound => ("invalid_request_error", "model_not_found"),
            ErrorClass::Unavailable => ("api_error", "service_unavailable"),
            ErrorClass::Upstream => ("api_error", "upstream_error"),
            ErrorClass::Internal => ("api_error", "internal_error"),
        };
        serde_json::to_value(ChatErrorResponse::new(error_type, code, err.client_message()))
            .unwrap_or_default()
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(OpenAiStreamEncoder::new(model))
    }
}

// ---------------------------------------------------------------------------
// Inbound: OpenAI request -> neutral
// ---------------------------------------------------------------------------

pub fn request_to_neutral(req: ChatCompletionRequest) -> Result<NeutralRequest> {
    if req.messages.is_empty() {
        return Err(ProxyError::validation("'messages' must not be empty"));
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for (i, msg) in req.messages.into_iter().enumerate() {
        match msg.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = msg.content {
                    system_parts.push(content_text(&content));
                }
            }
            "user" => {
                let content = match msg.content {
                    Some(c) => content_to_blocks(c),
                    None => Vec::new(),
                };
                messages.push(NeutralMessage::new(Role::User, content));
            }
            "assistant" => {
                let content = match msg.content {
                    Some(c) => content_to_blocks(c),
                    None => Vec::new(),
                };
                let tool_calls = msg
                    .tool_calls
                    .filter(|calls| !calls.is_empty())
                    .map(|calls| {
                        calls
                            .into_iter()
                            .map(|c| ToolCall {
                                id: c.id,
                                name: c.function.name,
                                arguments: c.function.arguments,
                            })
                            .collect()
                    });
                messages.push(NeutralMessage {
                    role: Role::Assistant,
                    content,
                    tool_calls,
                });
            }
            "tool" | "function" => {
                let call_id = msg.tool_call_id.or(msg.name).ok_or_else(|| {
                    ProxyError::validation(format!("messages[{i}]: tool message without tool_call_id"))
                })?;
                let content = msg.content.as_ref().map(content_text).unwrap_or_default();
                messages.push(NeutralMessage::new(
                    Role::Tool,
                    vec![ContentBlock::ToolResult {
                        call_id,
                        content,
                        is_error: false,
                    }],
                ));
            }
            other => {
                return Err(ProxyError::validation(format!(
                    "messages[{i}]: unknown role '{other}'"
                )))
            }
        }
    }

    let tools = req.tools.map(|tools| {
        tools
            .into_iter()
            .map(|t| ToolSpec {
                name: t.function.name,
                description: t.function.description,
                parameters: t.function.parameters,
            })
            .collect()
    });

    let mut neutral = NeutralRequest {
        model: req.model,
        messages,
        system_prompt: (!system_parts.is_empty()).then(|| system_parts.join("\n")),
        max_tokens: req.max_tokens.or(req.max_completion_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: Vec::new(),
        stream: req.stream.unwrap_or(false),
        tools,
        tool_choice: req.tool_choice.map(tool_choice_to_neutral),
    };
    neutral.add_stop(req.stop.map(StopSequences::into_vec).unwrap_or_default());
    Ok(neutral)
}

fn content_text(content: &ChatContent) -> String {
    match content {
        ChatContent::Text(t) => t.clone(),
        ChatContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn content_to_blocks(content: ChatContent) -> Vec<ContentBlock> {
    match content {
        ChatContent::Text(t) => vec![ContentBlock::Text { text: t }],
        ChatContent::Parts(parts) => parts
            .into_iter()
            .map(|p| match p {
                ContentPart::Text { text } => ContentBlock::Text { text },
                ContentPart::ImageUrl { image_url } => ContentBlock::Image {
                    source: image_source_from_url(image_url.url),
                },
            })
            .collect(),
    }
}

fn image_source_from_url(url: String) -> ImageSource {
    match split_data_uri(&url) {
        Some((media_type, data)) => ImageSource::Base64 { media_type, data },
        None => ImageSource::Url {
            media_type: guess_media_type(&url).map(str::to_string),
            url,
        },
    }
}

fn tool_choice_to_neutral(tc: ChatToolChoice) -> ToolChoice {
    match tc {
        ChatToolChoice::String(s) => match s.as_str() {
            "none" => ToolChoice::None,
            "required" => ToolChoice::Required,
            _ => ToolChoice::Auto,
        },
        ChatToolChoice::Specific(s) => ToolChoice::Tool(s.function.name),
    }
}

// ---------------------------------------------------------------------------
// Outbound: neutral -> OpenAI request
// ---------------------------------------------------------------------------

pub fn neutral_to_request(
    req: &NeutralRequest,
    params: &RouteParams,
    warnings: &mut Vec<String>,
) -> Result<ChatCompletionRequest> {
    let mut messages = Vec::new();

    if let Some(ref system) = req.system_prompt {
        messages.push(ChatMessage::text("system", system.clone()));
    }

    for msg in &req.messages {
        match msg.role {
            Role::System => messages.push(ChatMessage::text("system", msg.text())),
            Role::User | Role::Tool => messages.extend(translate_user_message(&msg.content)),
            Role::Assistant => messages.push(translate_assistant_message(msg)?),
        }
    }

    let (tools, tool_choice) = effective_tools(req, params, warnings);
    let tools = tools.map(|tools| {
        tools
            .iter()
            .map(|t| ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    });
    let tool_choice = tools
        .as_ref()
        .and(tool_choice)
        .map(translate_tool_choice);

    let temperature = clamp(req.temperature, 0.0, 2.0);
    if temperature != req.temperature {
        tracing::debug!(requested = ?req.temperature, clamped = ?temperature, "temperature clamped for OpenAI");
    }

    Ok(ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        temperature,
        top_p: clamp(req.top_p, 0.0, 1.0),
        stream: req.stream.then_some(true),
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        tools,
        tool_choice,
        stop: (!req.stop.is_empty()).then(|| StopSequences::Many(req.stop.clone())),
        user: None,
    })
}

fn translate_user_message(blocks: &[ContentBlock]) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source } => {
                let url = match source {
                    ImageSource::Base64 { media_type, data } => {
                        format!("data:{media_type};base64,{data}")
                    }
                    ImageSource::Url { url, .. } => url.clone(),
                };
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail { url, detail: None },
                });
            }
            ContentBlock::ToolResult {
                call_id,
                content,
                is_error,
            } => {
                // Flush any accumulated content parts as a user message first
                if !content_parts.is_empty() {
                    messages.push(user_message(&content_parts));
                    content_parts.clear();
                }

                let text = if *is_error {
                    format!("ERROR: {content}")
                } else {
                    content.clone()
                };
                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::Text(text)),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                    name: None,
                });
            }
        }
    }

    if !content_parts.is_empty() {
        messages.push(user_message(&content_parts));
    }

    if messages.is_empty() {
        messages.push(ChatMessage::text("user", String::new()));
    }

    messages
}

fn user_message(parts: &[ContentPart]) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content: Some(collapse_content_parts(parts)),
        tool_calls: None,
        tool_call_id: None,
        name: None,
    }
}

fn translate_assistant_message(msg: &NeutralMessage) -> Result<ChatMessage> {
    let mut text = String::new();
    for block in &msg.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            other => {
                return Err(ProxyError::translation(format!(
                    "OpenAI assistant messages cannot carry a {}",
                    other.describe()
                )))
            }
        }
    }

    let tool_calls: Option<Vec<ChatToolCall>> = msg
        .tool_calls
        .as_ref()
        .filter(|calls| !calls.is_empty())
        .map(|calls| calls.iter().map(to_chat_tool_call).collect());

    let content = if text.is_empty() && tool_calls.is_some() {
        None
    } else {
        Some(ChatContent::Text(text))
    };

    Ok(ChatMessage {
        role: "assistant".to_string(),
        content,
        tool_calls,
        tool_call_id: None,
        name: None,
    })
}

fn to_chat_tool_call(call: &ToolCall) -> ChatToolCall {
    ChatToolCall {
        id: call.id.clone(),
        call_type: "function".to_string(),
        function: ChatToolCallFunction {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

fn collapse_content_parts(parts: &[ContentPart]) -> ChatContent {
    if let [ContentPart::Text { text }] = parts {
        return ChatContent::Text(text.clone());
    }
    ChatContent::Parts(parts.to_vec())
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto => ChatToolChoice::String("auto".to_string()),
        ToolChoice::None => ChatToolChoice::String("none".to_string()),
        ToolChoice::Required => ChatToolChoice::String("required".to_string()),
        ToolChoice::Tool(name) => ChatToolChoice::Specific(ChatToolChoiceSpecific {
            choice_type: "function".to_string(),
            function: ChatToolChoiceFunction { name: name.clone() },
        }),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn response_to_neutral(resp: ChatCompletionResponse) -> Result<NeutralResponse> {
    let choice = resp.choices.into_iter().next().ok_or_else(|| ProxyError::Provider {
        provider: Format::OpenAi.to_string(),
        status: 502,
        body: "response contained no choices".to_string(),
    })?;

    // Reasoning text precedes the answer, as it does when streamed.
    let content: Vec<ContentBlock> = [choice.message.reasoning_content, choice.message.content]
        .into_iter()
        .flatten()
        .filter(|t| !t.is_empty())
        .map(|text| ContentBlock::Text { text })
        .collect();

    let tool_calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            name: c.function.name,
            arguments: c.function.arguments,
        })
        .collect();

    let (finish_reason, finish_details) = match choice.finish_reason.as_deref() {
        Some(reason) => map_finish_reason(reason),
        None if !tool_calls.is_empty() => (FinishReason::ToolCalls, None),
        None => (FinishReason::Stop, None),
    };

    let usage = resp.usage.map_or_else(Usage::default, |u| {
        Usage::new(u.prompt_tokens, u.completion_tokens, Some(u.total_tokens))
    });

    Ok(NeutralResponse {
        id: resp.id,
        model: resp.model,
        content,
        tool_calls,
        finish_reason,
        finish_details,
        usage,
    })
}

pub fn neutral_to_response(resp: &NeutralResponse) -> Result<ChatCompletionResponse> {
    for block in &resp.content {
        if !matches!(block, ContentBlock::Text { .. }) {
            return Err(ProxyError::translation(format!(
                "OpenAI assistant messages cannot carry a {}",
                block.describe()
            )));
        }
    }

    let text = resp.text();
    let tool_calls: Option<Vec<ChatToolCall>> = (!resp.tool_calls.is_empty())
        .then(|| resp.tool_calls.iter().map(to_chat_tool_call).collect());
    let content = if text.is_empty() && tool_calls.is_some() {
        None
    } else {
        Some(text)
    };

    Ok(ChatCompletionResponse {
        id: completion_id(&resp.id),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content,
                reasoning_content: None,
                tool_calls,
            },
            finish_reason: Some(finish_reason_str(
                resp.finish_reason,
                resp.finish_details.as_deref(),
            )),
        }],
        usage: Some(ChatUsage {
            prompt_tokens: resp.usage.prompt_tokens,
            completion_tokens: resp.usage.completion_tokens,
            total_tokens: resp.usage.total_tokens,
        }),
    })
}

/// Reuse a backend id, prefixed to look like an OpenAI completion id.
pub(crate) fn completion_id(id: &str) -> String {
    if id.starts_with("chatcmpl-") {
        id.to_string()
    } else if id.is_empty() {
        super::neutral::new_id("chatcmpl-")
    } else {
        format!("chatcmpl-{}", id.trim_start_matches("msg_"))
    }
}

pub(crate) fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Map an OpenAI `finish_reason` to the neutral reason.
pub fn map_finish_reason(reason: &str) -> (FinishReason, Option<String>) {
    match reason {
        "stop" => (FinishReason::Stop, None),
        "length" => (FinishReason::Length, None),
        "tool_calls" | "function_call" => (FinishReason::ToolCalls, None),
        "content_filter" => (FinishReason::ContentFilter, None),
        other => (FinishReason::Error, Some(other.to_string())),
    }
}

/// Map a neutral reason to an OpenAI `finish_reason`.
pub fn finish_reason_str(reason: FinishReason, details: Option<&str>) -> String {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Error => return error_finish_reason(details, &[], "error"),
    }
    .to_string()
}
