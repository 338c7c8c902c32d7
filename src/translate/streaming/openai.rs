//! OpenAI `chat.completion.chunk` streams.

use super::{SseFrame, StreamDecoder, StreamEncoder};
use crate::error::{ProxyError, Result};
use crate::translate::neutral::{new_id, FinishReason, StreamEvent, Usage};
use crate::translate::openai::{finish_reason_str, map_finish_reason, unix_now};
use crate::translate::openai_types::{
    ChatCompletionChunk, ChatErrorResponse, ChatUsage, ChunkChoice, ChunkDelta, ChunkToolCall,
    ChunkToolCallFunction,
};

#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    saw_finish: bool,
    started_tools: Vec<u64>,
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        if frame.is_done() {
            return Ok(vec![StreamEvent::Done]);
        }
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(&frame.data)
            .map_err(|e| ProxyError::translation(format!("malformed OpenAI stream chunk: {e}")))?;
        if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .map_or_else(|| err.to_string(), str::to_string);
            return Ok(vec![StreamEvent::Error(message)]);
        }
        let chunk: ChatCompletionChunk = serde_json::from_value(value)
            .map_err(|e| ProxyError::translation(format!("malformed OpenAI stream chunk: {e}")))?;

        let mut events = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            // Reasoning models stream chain-of-thought in `reasoning_content`
            // and the answer in `content`; both reach the client as text,
            // reasoning first.
            let delta = choice.delta;
            for text in [delta.reasoning_content, delta.content].into_iter().flatten() {
                if !text.is_empty() {
                    events.push(StreamEvent::Text(text));
                }
            }

            for tc in delta.tool_calls.unwrap_or_default() {
                let index = tc.index;
                let function = tc.function;
                if let Some(id) = tc.id {
                    if !self.started_tools.contains(&index) {
                        self.started_tools.push(index);
                        events.push(StreamEvent::ToolCallStart {
                            index: index as usize,
                            id,
                            name: function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                        });
                    }
                }
                if let Some(arguments) = function.and_then(|f| f.arguments).filter(|a| !a.is_empty()) {
                    events.push(StreamEvent::ToolCallDelta {
                        index: index as usize,
                        arguments,
                    });
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.saw_finish = true;
                let (reason, details) = map_finish_reason(&reason);
                events.push(StreamEvent::Finish { reason, details });
            }
        }

        if let Some(u) = chunk.usage {
            events.push(StreamEvent::Usage(Usage::new(
                u.prompt_tokens,
                u.completion_tokens,
                Some(u.total_tokens),
            )));
        }

        Ok(events)
    }

    fn clean_eof(&self) -> bool {
        self.saw_finish
    }
}

pub struct OpenAiStreamEncoder {
    id: String,
    model: String,
    created: u64,
    saw_tool_calls: bool,
    finish: Option<(FinishReason, Option<String>)>,
    usage: Option<Usage>,
}

impl OpenAiStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: new_id("chatcmpl-"),
            model: model.to_string(),
            created: unix_now(),
            saw_tool_calls: false,
            finish: None,
            usage: None,
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>, usage: Option<ChatUsage>) -> SseFrame {
        SseFrame::json(
            None,
            &ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta,
                    finish_reason,
                }],
                usage,
            },
        )
    }

    fn tool_chunk(&self, call: ChunkToolCall) -> SseFrame {
        self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![call]),
                ..ChunkDelta::default()
            },
            None,
            None,
        )
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn start(&mut self) -> Vec<SseFrame> {
        vec![self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
                ..ChunkDelta::default()
            },
            None,
            None,
        )]
    }

    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        match event {
            StreamEvent::Text(text) => vec![self.chunk(
                ChunkDelta {
                    content: Some(text.clone()),
                    ..ChunkDelta::default()
                },
                None,
                None,
            )],
            StreamEvent::ToolCallStart { index, id, name } => {
                self.saw_tool_calls = true;
                vec![self.tool_chunk(ChunkToolCall {
                    index: *index as u64,
                    id: Some(id.clone()),
                    call_type: Some("function".to_string()),
                    function: Some(ChunkToolCallFunction {
                        name: Some(name.clone()),
                        arguments: Some(String::new()),
                    }),
                })]
            }
            StreamEvent::ToolCallDelta { index, arguments } => vec![self.tool_chunk(ChunkToolCall {
                index: *index as u64,
                id: None,
                call_type: None,
                function: Some(ChunkToolCallFunction {
                    name: None,
                    arguments: Some(arguments.clone()),
                }),
            })],
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
                Vec::new()
            }
            StreamEvent::Finish { reason, details } => {
                self.finish = Some((*reason, details.clone()));
                Vec::new()
            }
            StreamEvent::Error(_) | StreamEvent::Done => Vec::new(),
        }
    }

    fn finish(&mut self) -> Result<Vec<SseFrame>> {
        let reason = match self.finish.take() {
            Some((reason, details)) => finish_reason_str(reason, details.as_deref()),
            None if self.saw_tool_calls => finish_reason_str(FinishReason::ToolCalls, None),
            None => finish_reason_str(FinishReason::Stop, None),
        };
        let usage = self.usage.map(|u| ChatUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });
        Ok(vec![
            self.chunk(ChunkDelta::default(), Some(reason), usage),
            SseFrame::data("[DONE]"),
        ])
    }

    fn fail(&mut self, message: &str) -> Vec<SseFrame> {
        vec![
            SseFrame::json(
                None,
                &ChatErrorResponse::new("api_error", "stream_error", message),
            ),
            SseFrame::data("[DONE]"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(dec: &mut OpenAiStreamDecoder, data: serde_json::Value) -> Vec<StreamEvent> {
        dec.decode(&SseFrame::data(data.to_string())).unwrap()
    }

    #[test]
    fn test_decode_tool_call_deltas() {
        let mut dec = OpenAiStreamDecoder::default();
        let events = decode(
            &mut dec,
            serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_abc", "type": "function", "function": {"name": "search", "arguments": "{\"q\""}}
            ]}}]}),
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart {
                    index: 0,
                    id: "call_abc".to_string(),
                    name: "search".to_string()
                },
                StreamEvent::ToolCallDelta {
                    index: 0,
                    arguments: "{\"q\"".to_string()
                },
            ]
        );

        let events = decode(
            &mut dec,
            serde_json::json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":\"rust\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
        );
        assert_eq!(events.len(), 2);
        assert!(dec.clean_eof());
    }

    #[test]
    fn test_decode_reasoning_content_as_text() {
        let mut dec = OpenAiStreamDecoder::default();
        let events = decode(
            &mut dec,
            serde_json::json!({"choices": [{"index": 0, "delta": {"reasoning_content": "Let me think"}}]}),
        );
        assert_eq!(events, vec![StreamEvent::Text("Let me think".to_string())]);
        assert!(!dec.clean_eof());

        let events = decode(
            &mut dec,
            serde_json::json!({"choices": [{"index": 0, "delta": {"reasoning_content": "...done. ", "content": "42"}}]}),
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Text("...done. ".to_string()),
                StreamEvent::Text("42".to_string())
            ]
        );
    }

    #[test]
    fn test_decode_done_and_error() {
        let mut dec = OpenAiStreamDecoder::default();
        assert_eq!(
            dec.decode(&SseFrame::data("[DONE]")).unwrap(),
            vec![StreamEvent::Done]
        );
        let events = decode(
            &mut dec,
            serde_json::json!({"error": {"message": "context too long", "type": "invalid_request_error"}}),
        );
        assert_eq!(events, vec![StreamEvent::Error("context too long".to_string())]);
    }

    #[test]
    fn test_encoder_tool_calls_finish_reason() {
        let mut enc = OpenAiStreamEncoder::new("gpt-4o");
        enc.encode(&StreamEvent::ToolCallStart {
            index: 0,
            id: "toolu_1".to_string(),
            name: "search".to_string(),
        });
        let frames = enc.finish().unwrap();
        let last: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
        assert!(frames[1].is_done());
    }
}
