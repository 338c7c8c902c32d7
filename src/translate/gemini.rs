//! Google Gemini `generateContent` codec.
//!
//! Gemini has no tool-call ids on older models and answers tool calls by
//! function name, so ids are synthesized on the way in and names are looked
//! up from earlier calls on the way out.

use super::gemini_types::{
    Candidate, Content, ErrorResponse, FileData, FunctionCall, FunctionCallingConfig,
    FunctionDeclaration, FunctionResponse, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, InboundGeminiRequest, InlineData, Part, Tool, ToolConfig, UsageMetadata,
};
use super::neutral::{
    clamp, error_finish_reason, guess_media_type, new_id, ContentBlock, FinishReason, ImageSource,
    NeutralMessage, NeutralRequest, NeutralResponse, Role, ToolCall, ToolChoice, ToolSpec, Usage,
};
use super::streaming::gemini::{GeminiStreamDecoder, GeminiStreamEncoder};
use super::streaming::{StreamDecoder, StreamEncoder};
use super::{effective_tools, parse_backend, parse_inbound, BuiltRequest, Format, RouteParams, VendorCodec};
use crate::error::{ErrorClass, ProxyError, Result};

pub struct GeminiCodec;

impl VendorCodec for GeminiCodec {
    fn format(&self) -> Format {
        Format::Gemini
    }

    fn to_neutral(&self, raw: &[u8]) -> Result<NeutralRequest> {
        let req: InboundGeminiRequest = parse_inbound(raw, "Gemini")?;
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
        let resp: GenerateContentResponse = parse_backend(raw, Format::Gemini)?;
        Ok(response_to_neutral(resp))
    }

    fn build_response(&self, resp: &NeutralResponse) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(neutral_to_response(resp)?)?)
    }

    fn error_body(&self, err: &ProxyError) -> serde_json::Value {
        serde_json::to_value(ErrorResponse::new(
            err.status_code(),
            error_status(err.class()),
            err.client_message(),
        ))
        .unwrap_or_default()
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GeminiStreamDecoder::default())
    }

    fn stream_encoder(&self, model: &str) -> Box<dyn StreamEncoder> {
        Box::new(GeminiStreamEncoder::new(model))
    }
}

/// Google RPC status string for an error class.
pub fn error_status(class: ErrorClass) -> &'static str {
    match class {
        ErrorClass::InvalidRequest => "INVALID_ARGUMENT",
        ErrorClass::Authentication => "UNAUTHENTICATED",
        ErrorClass::RateLimit => "RESOURCE_EXHAUSTED",
        ErrorClass::NotFound => "NOT_FOUND",
        ErrorClass::Unavailable => "UNAVAILABLE",
        ErrorClass::Upstream | ErrorClass::Internal => "INTERNAL",
    }
}

/// Id for a function call that arrived without one.
pub(crate) fn synthesize_call_id(name: &str, ordinal: usize) -> String {
    format!("call_{name}_{ordinal}")
}

// ---------------------------------------------------------------------------
// Inbound: Gemini request -> neutral
// ---------------------------------------------------------------------------

struct PendingCall {
    id: String,
    name: String,
    answered: bool,
}

pub fn request_to_neutral(inbound: InboundGeminiRequest) -> Result<NeutralRequest> {
    let req = inbound.request;
    if req.contents.is_empty() {
        return Err(ProxyError::validation("'contents' must not be empty"));
    }

    let mut calls: Vec<PendingCall> = Vec::new();
    let mut messages = Vec::with_capacity(req.contents.len());

    for (i, content) in req.contents.into_iter().enumerate() {
        let role = match content.role.as_deref() {
            None | Some("user") | Some("function") | Some("tool") => Role::User,
            Some("model") | Some("assistant") => Role::Assistant,
            Some(other) => {
                return Err(ProxyError::validation(format!(
                    "contents[{i}]: unknown role '{other}'"
                )))
            }
        };

        let mut blocks = Vec::new();
        let mut tool_calls = Vec::new();

        for part in content.parts {
            if let Some(text) = part.text {
                if part.thought != Some(true) {
                    blocks.push(ContentBlock::Text { text });
                }
            } else if let Some(inline) = part.inline_data {
                blocks.push(ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: inline.mime_type,
                        data: inline.data,
                    },
                });
            } else if let Some(file) = part.file_data {
                blocks.push(ContentBlock::Image {
                    source: ImageSource::Url {
                        media_type: file
                            .mime_type
                            .or_else(|| guess_media_type(&file.file_uri).map(str::to_string)),
                        url: file.file_uri,
                    },
                });
            } else if let Some(call) = part.function_call {
                let id = call
                    .id
                    .unwrap_or_else(|| synthesize_call_id(&call.name, calls.len()));
                calls.push(PendingCall {
                    id: id.clone(),
                    name: call.name.clone(),
                    answered: false,
                });
                tool_calls.push(ToolCall {
                    id,
                    name: call.name,
                    arguments: serde_json::to_string(&call.args)?,
                });
            } else if let Some(result) = part.function_response {
                let call_id = bind_response(&mut calls, result.id.as_deref(), &result.name)
                    .unwrap_or_else(|| {
                        result
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("call_{}", result.name))
                    });
                let (content, is_error) = response_payload(&result.response);
                blocks.push(ContentBlock::ToolResult {
                    call_id,
                    content,
                    is_error,
                });
            }
        }

        messages.push(NeutralMessage {
            role,
            content: blocks,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        });
    }

    let system_prompt = req
        .system_instruction
        .map(|c| parts_text(&c.parts))
        .filter(|s| !s.is_empty());

    let config = req.generation_config.unwrap_or_default();

    let tools: Option<Vec<ToolSpec>> = req.tools.map(|tools| {
        tools
            .into_iter()
            .flat_map(|t| t.function_declarations)
            .map(|d| ToolSpec {
                name: d.name,
                description: d.description,
                parameters: d.parameters.unwrap_or(serde_json::Value::Null),
            })
            .collect()
    });

    let tool_choice = req.tool_config.map(|tc| {
        let cfg = tc.function_calling_config;
        match cfg.mode.to_ascii_uppercase().as_str() {
            "NONE" => ToolChoice::None,
            "ANY" => match cfg.allowed_function_names.as_deref() {
                Some([only]) => ToolChoice::Tool(only.clone()),
                _ => ToolChoice::Required,
            },
            _ => ToolChoice::Auto,
        }
    });

    let mut neutral = NeutralRequest {
        model: inbound.model,
        messages,
        system_prompt,
        max_tokens: config.max_output_tokens,
        temperature: config.temperature,
        top_p: config.top_p,
        stop: Vec::new(),
        stream: inbound.stream.unwrap_or(false),
        tools,
        tool_choice,
    };
    neutral.add_stop(config.stop_sequences.unwrap_or_default());
    Ok(neutral)
}

/// Bind a function response to the earliest unanswered call it can answer.
fn bind_response(calls: &mut [PendingCall], id: Option<&str>, name: &str) -> Option<String> {
    let position = id
        .and_then(|id| calls.iter().position(|c| c.id == id))
        .or_else(|| calls.iter().position(|c| !c.answered && c.name == name))?;
    let call = &mut calls[position];
    call.answered = true;
    Some(call.id.clone())
}

/// Text payload of a `functionResponse.response` object.
fn response_payload(response: &serde_json::Value) -> (String, bool) {
    if let Some(obj) = response.as_object() {
        if obj.len() == 1 {
            for key in ["result", "output", "content"] {
                if let Some(serde_json::Value::String(s)) = obj.get(key) {
                    return (s.clone(), false);
                }
            }
            if let Some(err) = obj.get("error") {
                let text = err.as_str().map_or_else(|| err.to_string(), str::to_string);
                return (text, true);
            }
        }
    }
    match response {
        serde_json::Value::String(s) => (s.clone(), false),
        serde_json::Value::Null => (String::new(), false),
        other => (other.to_string(), false),
    }
}

fn parts_text(parts: &[Part]) -> String {
    parts
        .iter()
        .filter(|p| p.thought != Some(true))
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Outbound: neutral -> Gemini request
// ---------------------------------------------------------------------------

pub fn neutral_to_request(
    req: &NeutralRequest,
    params: &RouteParams,
    warnings: &mut Vec<String>,
) -> Result<GenerateContentRequest> {
    let mut system_parts: Vec<String> = req.system_prompt.iter().cloned().collect();
    let mut contents: Vec<Content> = Vec::new();

    for msg in &req.messages {
        let (role, mut parts) = match msg.role {
            Role::System => {
                system_parts.push(msg.text());
                continue;
            }
            Role::User | Role::Tool => ("user", content_parts(req, &msg.content)?),
            Role::Assistant => ("model", content_parts(req, &msg.content)?),
        };
        for call in msg.tool_calls.iter().flatten() {
            parts.push(Part {
                function_call: Some(FunctionCall {
                    id: None,
                    name: call.name.clone(),
                    args: call.arguments_value()?,
                }),
                ..Part::default()
            });
        }
        if parts.is_empty() {
            continue;
        }
        if let Some(last) = contents
            .last_mut()
            .filter(|c| c.role.as_deref() == Some(role))
        {
            last.parts.extend(parts);
        } else {
            contents.push(Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    let (tools, tool_choice) = effective_tools(req, params, warnings);
    let tools: Option<Vec<Tool>> = tools.map(|tools| {
        vec![Tool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: (!t.parameters.is_null()).then(|| strip_schema_meta(&t.parameters)),
                })
                .collect(),
        }]
    });
    let tool_config = tools.as_ref().and(tool_choice).map(|tc| {
        let (mode, allowed) = match tc {
            ToolChoice::Auto => ("AUTO", None),
            ToolChoice::None => ("NONE", None),
            ToolChoice::Required => ("ANY", None),
            ToolChoice::Tool(name) => ("ANY", Some(vec![name.clone()])),
        };
        ToolConfig {
            function_calling_config: FunctionCallingConfig {
                mode: mode.to_string(),
                allowed_function_names: allowed,
            },
        }
    });

    let temperature = clamp(req.temperature, 0.0, 2.0);
    if temperature != req.temperature {
        tracing::debug!(requested = ?req.temperature, clamped = ?temperature, "temperature clamped for Gemini");
    }
    let config = GenerationConfig {
        temperature,
        top_p: clamp(req.top_p, 0.0, 1.0),
        top_k: None,
        max_output_tokens: req.max_tokens,
        stop_sequences: (!req.stop.is_empty()).then(|| req.stop.clone()),
        candidate_count: None,
    };
    let has_config = config.temperature.is_some()
        || config.top_p.is_some()
        || config.max_output_tokens.is_some()
        || config.stop_sequences.is_some();

    let system = system_parts.join("\n");

    Ok(GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content {
            role: None,
            parts: vec![Part::text(system)],
        }),
        generation_config: has_config.then_some(config),
        tools,
        tool_config,
        safety_settings: None,
    })
}

fn content_parts(req: &NeutralRequest, blocks: &[ContentBlock]) -> Result<Vec<Part>> {
    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        let part = match block {
            ContentBlock::Text { text } if text.is_empty() => continue,
            ContentBlock::Text { text } => Part::text(text.clone()),
            ContentBlock::Image {
                source: ImageSource::Base64 { media_type, data },
            } => Part {
                inline_data: Some(InlineData {
                    mime_type: media_type.clone(),
                    data: data.clone(),
                }),
                ..Part::default()
            },
            ContentBlock::Image {
                source: ImageSource::Url { url, media_type },
            } => {
                let mime = media_type
                    .clone()
                    .or_else(|| guess_media_type(url).map(str::to_string))
                    .ok_or_else(|| {
                        ProxyError::translation(format!(
                            "Gemini needs a media type for {}",
                            block.describe()
                        ))
                    })?;
                Part {
                    file_data: Some(FileData {
                        mime_type: Some(mime),
                        file_uri: url.clone(),
                    }),
                    ..Part::default()
                }
            }
            ContentBlock::ToolResult {
                call_id,
                content,
                is_error,
            } => {
                let name = req.tool_name_for(call_id).ok_or_else(|| {
                    ProxyError::translation(format!(
                        "Gemini needs the function name for {}, but no earlier tool call has that id",
                        block.describe()
                    ))
                })?;
                Part {
                    function_response: Some(FunctionResponse {
                        id: None,
                        name: name.to_string(),
                        response: result_object(content, *is_error),
                    }),
                    ..Part::default()
                }
            }
        };
        parts.push(part);
    }
    Ok(parts)
}

/// `functionResponse.response` must be an object.
fn result_object(content: &str, is_error: bool) -> serde_json::Value {
    if is_error {
        return serde_json::json!({ "error": content });
    }
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => serde_json::json!({ "result": content }),
    }
}

/// Gemini rejects JSON-schema meta keys it does not understand.
fn strip_schema_meta(schema: &serde_json::Value) -> serde_json::Value {
    match schema {
        serde_json::Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !matches!(k.as_str(), "$schema" | "additionalProperties"))
            .map(|(k, v)| (k.clone(), strip_schema_meta(v)))
            .collect::<serde_json::Map<_, _>>()
            .into(),
        serde_json::Value::Array(items) => items.iter().map(strip_schema_meta).collect(),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

pub fn response_to_neutral(resp: GenerateContentResponse) -> NeutralResponse {
    let usage = resp.usage_metadata.as_ref().map_or_else(Usage::default, usage_to_neutral);
    let id = resp.response_id.clone().unwrap_or_default();
    let model = resp.model_version.clone().unwrap_or_default();

    let Some(candidate) = resp.candidates.into_iter().next() else {
        let (finish_reason, finish_details) = match resp
            .prompt_feedback
            .and_then(|f| f.block_reason)
        {
            Some(reason) => (FinishReason::ContentFilter, Some(reason)),
            None => (FinishReason::Error, Some("no candidates".to_string())),
        };
        return NeutralResponse {
            id,
            model,
            content: Vec::new(),
            tool_calls: Vec::new(),
            finish_reason,
            finish_details,
            usage,
        };
    };

    let mut content = Vec::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.parts {
        if let Some(text) = part.text {
            if part.thought != Some(true) && !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        } else if let Some(call) = part.function_call {
            let id = call
                .id
                .unwrap_or_else(|| synthesize_call_id(&call.name, tool_calls.len()));
            tool_calls.push(ToolCall {
                id,
                arguments: call.args.to_string(),
                name: call.name,
            });
        }
    }

    let (finish_reason, finish_details) = match candidate.finish_reason.as_deref() {
        Some(reason) => map_finish_reason(reason, !tool_calls.is_empty()),
        None if !tool_calls.is_empty() => (FinishReason::ToolCalls, None),
        None => (FinishReason::Stop, None),
    };

    NeutralResponse {
        id,
        model,
        content,
        tool_calls,
        finish_reason,
        finish_details,
        usage,
    }
}

pub(crate) fn usage_to_neutral(u: &UsageMetadata) -> Usage {
    Usage::new(
        u.prompt_token_count,
        u.candidates_token_count,
        Some(u.total_token_count),
    )
}

pub(crate) fn usage_metadata(u: &Usage) -> UsageMetadata {
    UsageMetadata {
        prompt_token_count: u.prompt_tokens,
        candidates_token_count: u.completion_tokens,
        total_token_count: u.total_tokens,
    }
}

pub fn neutral_to_response(resp: &NeutralResponse) -> Result<GenerateContentResponse> {
    let mut parts = Vec::new();
    for block in &resp.content {
        match block {
            ContentBlock::Text { text } if text.is_empty() => {}
            ContentBlock::Text { text } => parts.push(Part::text(text.clone())),
            other => {
                return Err(ProxyError::translation(format!(
                    "Gemini responses cannot carry a {}",
                    other.describe()
                )))
            }
        }
    }
    for call in &resp.tool_calls {
        parts.push(Part {
            function_call: Some(FunctionCall {
                id: Some(call.id.clone()),
                name: call.name.clone(),
                args: call.arguments_value()?,
            }),
            ..Part::default()
        });
    }

    Ok(GenerateContentResponse {
        candidates: vec![Candidate {
            content: Content {
                role: Some("model".to_string()),
                parts,
            },
            finish_reason: Some(finish_reason_str(
                resp.finish_reason,
                resp.finish_details.as_deref(),
            )),
            index: Some(0),
        }],
        usage_metadata: Some(usage_metadata(&resp.usage)),
        model_version: Some(resp.model.clone()),
        response_id: Some(if resp.id.is_empty() {
            new_id("")
        } else {
            resp.id.clone()
        }),
        prompt_feedback: None,
    })
}

/// Map a Gemini `finishReason`. `STOP` on a candidate that called functions
/// means the model is waiting for tool results.
pub fn map_finish_reason(reason: &str, has_tool_calls: bool) -> (FinishReason, Option<String>) {
    match reason {
        "STOP" if has_tool_calls => (FinishReason::ToolCalls, None),
        "STOP" => (FinishReason::Stop, None),
        "MAX_TOKENS" => (FinishReason::Length, None),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => (FinishReason::ContentFilter, None),
        other => (FinishReason::Error, Some(other.to_string())),
    }
}

/// Gemini finish reasons with no neutral counterpart.
const GEMINI_ONLY_FINISH_REASONS: &[&str] = &[
    "OTHER",
    "LANGUAGE",
    "MALFORMED_FUNCTION_CALL",
    "FINISH_REASON_UNSPECIFIED",
];

/// Map a neutral reason to a Gemini `finishReason`.
pub fn finish_reason_str(reason: FinishReason, details: Option<&str>) -> String {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Error => return error_finish_reason(details, GEMINI_ONLY_FINISH_REASONS, "OTHER"),
    }
    .to_string()
}
