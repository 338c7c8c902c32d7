//! Gemini `streamGenerateContent` streams: every frame is a complete
//! `GenerateContentResponse` carrying a slice of the candidate.

use super::{SseFrame, StreamDecoder, StreamEncoder};
use crate::error::{ProxyError, Result};
use crate::translate::gemini::{
    finish_reason_str, map_finish_reason, synthesize_call_id, usage_metadata, usage_to_neutral,
};
use crate::translate::gemini_types::{
    Candidate, Content, ErrorResponse, FunctionCall, GenerateContentResponse, Part,
};
use crate::translate::neutral::{FinishReason, StreamEvent, Usage};

#[derive(Debug, Default)]
pub struct GeminiStreamDecoder {
    next_tool: usize,
    saw_tool_calls: bool,
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(&frame.data)
            .map_err(|e| ProxyError::translation(format!("malformed Gemini stream chunk: {e}")))?;
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map_or_else(|| err.to_string(), str::to_string);
            return Ok(vec![StreamEvent::Error(message)]);
        }
        let chunk: GenerateContentResponse = serde_json::from_value(value)
            .map_err(|e| ProxyError::translation(format!("malformed Gemini stream chunk: {e}")))?;

        let mut events = Vec::new();

        match chunk.candidates.into_iter().next() {
            Some(candidate) => {
                for part in candidate.content.parts {
                    if let Some(text) = part.text {
                        if part.thought != Some(true) && !text.is_empty() {
                            events.push(StreamEvent::Text(text));
                        }
                    } else if let Some(call) = part.function_call {
                        let index = self.next_tool;
                        self.next_tool += 1;
                        self.saw_tool_calls = true;
                        let id = call
                            .id
                            .unwrap_or_else(|| synthesize_call_id(&call.name, index));
                        events.push(StreamEvent::ToolCallStart {
                            index,
                            id,
                            name: call.name,
                        });
                        // Gemini sends whole calls, never argument fragments.
                        events.push(StreamEvent::ToolCallDelta {
                            index,
                            arguments: call.args.to_string(),
                        });
                    }
                }
                if let Some(reason) = candidate.finish_reason {
                    let (reason, details) = map_finish_reason(&reason, self.saw_tool_calls);
                    events.push(StreamEvent::Finish { reason, details });
                }
            }
            None => {
                if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
                    events.push(StreamEvent::Finish {
                        reason: FinishReason::ContentFilter,
                        details: Some(reason),
                    });
                }
            }
        }

        if let Some(ref u) = chunk.usage_metadata {
            events.push(StreamEvent::Usage(usage_to_neutral(u)));
        }

        Ok(events)
    }

    /// Gemini has no end-of-stream marker; closing the connection ends it.
    fn clean_eof(&self) -> bool {
        true
    }
}

struct BufferedCall {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

/// Text goes out as it arrives. Tool calls are held until the end, since a
/// Gemini `functionCall` must carry complete arguments.
pub struct GeminiStreamEncoder {
    model: String,
    calls: Vec<BufferedCall>,
    finish: Option<(FinishReason, Option<String>)>,
    usage: Option<Usage>,
}

impl GeminiStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            calls: Vec::new(),
            finish: None,
            usage: None,
        }
    }

    fn chunk(&self, parts: Vec<Part>, finish_reason: Option<String>, usage: Option<Usage>) -> SseFrame {
        SseFrame::json(
            None,
            &GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Content {
                        role: Some("model".to_string()),
                        parts,
                    },
                    finish_reason,
                    index: Some(0),
                }],
                usage_metadata: usage.as_ref().map(usage_metadata),
                model_version: Some(self.model.clone()),
                response_id: None,
                prompt_feedback: None,
            },
        )
    }
}

impl StreamEncoder for GeminiStreamEncoder {
    fn start(&mut self) -> Vec<SseFrame> {
        Vec::new()
    }

    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        match event {
            StreamEvent::Text(text) => {
                return vec![self.chunk(vec![Part::text(text.clone())], None, None)];
            }
            StreamEvent::ToolCallStart { index, id, name } => self.calls.push(BufferedCall {
                index: *index,
                id: id.clone(),
                name: name.clone(),
                arguments: String::new(),
            }),
            StreamEvent::ToolCallDelta { index, arguments } => {
                if let Some(call) = self.calls.iter_mut().find(|c| c.index == *index) {
                    call.arguments.push_str(arguments);
                }
            }
            StreamEvent::Usage(usage) => self.usage = Some(*usage),
            StreamEvent::Finish { reason, details } => {
                self.finish = Some((*reason, details.clone()));
            }
            StreamEvent::Error(_) | StreamEvent::Done => {}
        }
        Vec::new()
    }

    fn finish(&mut self) -> Result<Vec<SseFrame>> {
        let mut parts = Vec::with_capacity(self.calls.len());
        for call in self.calls.drain(..) {
            let args = if call.arguments.trim().is_empty() {
                serde_json::Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&call.arguments).map_err(|e| {
                    ProxyError::translation(format!(
                        "tool call '{}' streamed malformed arguments: {e}",
                        call.name
                    ))
                })?
            };
            parts.push(Part {
                function_call: Some(FunctionCall {
                    id: Some(call.id),
                    name: call.name,
                    args,
                }),
                ..Part::default()
            });
        }

        let reason = match self.finish.take() {
            Some((reason, details)) => finish_reason_str(reason, details.as_deref()),
            None => finish_reason_str(FinishReason::Stop, None),
        };
        Ok(vec![self.chunk(parts, Some(reason), self.usage)])
    }

    fn fail(&mut self, message: &str) -> Vec<SseFrame> {
        vec![SseFrame::json(
            None,
            &ErrorResponse::new(500, "INTERNAL", message),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decoder_synthesizes_call_ids() {
        let mut dec = GeminiStreamDecoder::default();
        let data = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"functionCall": {"name": "search", "args": {"q": "rust"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7}
        });
        let events = dec.decode(&SseFrame::data(data.to_string())).unwrap();
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart {
                    index: 0,
                    id: "call_search_0".to_string(),
                    name: "search".to_string()
                },
                StreamEvent::ToolCallDelta {
                    index: 0,
                    arguments: "{\"q\":\"rust\"}".to_string()
                },
                StreamEvent::Finish {
                    reason: FinishReason::ToolCalls,
                    details: None
                },
                StreamEvent::Usage(Usage::new(5, 2, Some(7))),
            ]
        );
    }

    #[test]
    fn test_decoder_blocked_prompt() {
        let mut dec = GeminiStreamDecoder::default();
        let data = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let events = dec.decode(&SseFrame::data(data.to_string())).unwrap();
        assert_eq!(
            events,
            vec![StreamEvent::Finish {
                reason: FinishReason::ContentFilter,
                details: Some("SAFETY".to_string())
            }]
        );
    }

    #[test]
    fn test_encoder_buffers_tool_calls_until_finish() {
        let mut enc = GeminiStreamEncoder::new("gemini-2.0-flash");
        assert!(enc.start().is_empty());
        assert!(enc
            .encode(&StreamEvent::ToolCallStart {
                index: 0,
                id: "toolu_1".to_string(),
                name: "search".to_string(),
            })
            .is_empty());
        enc.encode(&StreamEvent::ToolCallDelta {
            index: 0,
            arguments: "{\"q\":".to_string(),
        });
        enc.encode(&StreamEvent::ToolCallDelta {
            index: 0,
            arguments: "\"rust\"}".to_string(),
        });
        enc.encode(&StreamEvent::Finish {
            reason: FinishReason::ToolCalls,
            details: None,
        });

        let frames = enc.finish().unwrap();
        let body: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        let part = &body["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["functionCall"]["args"], json!({"q": "rust"}));
        assert_eq!(body["candidates"][0]["finishReason"], "STOP");
    }

    #[test]
    fn test_encoder_rejects_malformed_arguments() {
        let mut enc = GeminiStreamEncoder::new("gemini-2.0-flash");
        enc.encode(&StreamEvent::ToolCallStart {
            index: 0,
            id: "toolu_1".to_string(),
            name: "search".to_string(),
        });
        enc.encode(&StreamEvent::ToolCallDelta {
            index: 0,
            arguments: "{\"q\":".to_string(),
        });
        assert!(enc.finish().is_err());
    }
}
