//! Anthropic named-event streams (`message_start` ... `message_stop`).

use std::collections::HashMap;

use super::{SseFrame, StreamDecoder, StreamEncoder};
use crate::error::{ProxyError, Result};
use crate::translate::anthropic::{map_stop_reason, stop_reason_str};
use crate::translate::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, MessageDeltaBody, MessagesResponse, ResponseContentBlock,
    StreamEvent as ClaudeEvent, Usage as ClaudeUsage,
};
use crate::translate::neutral::{new_id, FinishReason, StreamEvent, Usage};

const KNOWN_EVENTS: [&str; 8] = [
    "message_start",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "message_delta",
    "message_stop",
    "ping",
    "error",
];

#[derive(Debug, Default)]
pub struct ClaudeStreamDecoder {
    /// Content block index -> neutral tool call index.
    tool_blocks: HashMap<usize, usize>,
    next_tool: usize,
    input_tokens: u64,
}

impl StreamDecoder for ClaudeStreamDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(&frame.data)
            .map_err(|e| ProxyError::translation(format!("malformed Anthropic stream event: {e}")))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .or(frame.event.as_deref())
            .unwrap_or_default()
            .to_string();
        if !KNOWN_EVENTS.contains(&kind.as_str()) {
            tracing::debug!(event = %kind, "ignoring unknown Anthropic stream event");
            return Ok(Vec::new());
        }
        let event: ClaudeEvent = serde_json::from_value(value).map_err(|e| {
            ProxyError::translation(format!("malformed Anthropic '{kind}' event: {e}"))
        })?;

        let mut events = Vec::new();
        match event {
            ClaudeEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
            }
            ClaudeEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseContentBlock::Text { text } => {
                    if !text.is_empty() {
                        events.push(StreamEvent::Text(text));
                    }
                }
                ResponseContentBlock::ToolUse { id, name, input } => {
                    let tool_index = self.next_tool;
                    self.next_tool += 1;
                    self.tool_blocks.insert(index, tool_index);
                    events.push(StreamEvent::ToolCallStart {
                        index: tool_index,
                        id,
                        name,
                    });
                    if input.as_object().is_some_and(|o| !o.is_empty()) {
                        events.push(StreamEvent::ToolCallDelta {
                            index: tool_index,
                            arguments: input.to_string(),
                        });
                    }
                }
                ResponseContentBlock::Thinking { .. }
                | ResponseContentBlock::RedactedThinking { .. } => {}
            },
            ClaudeEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => events.push(StreamEvent::Text(text)),
                Delta::InputJsonDelta { partial_json } => {
                    if let Some(&tool_index) = self.tool_blocks.get(&index) {
                        if !partial_json.is_empty() {
                            events.push(StreamEvent::ToolCallDelta {
                                index: tool_index,
                                arguments: partial_json,
                            });
                        }
                    }
                }
                Delta::ThinkingDelta { .. } | Delta::SignatureDelta { .. } => {}
            },
            ClaudeEvent::ContentBlockStop { .. } | ClaudeEvent::Ping => {}
            ClaudeEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    let (reason, details) = map_stop_reason(&reason);
                    events.push(StreamEvent::Finish { reason, details });
                }
                events.push(StreamEvent::Usage(Usage::new(
                    usage.input_tokens.unwrap_or(self.input_tokens),
                    usage.output_tokens,
                    None,
                )));
            }
            ClaudeEvent::MessageStop => events.push(StreamEvent::Done),
            ClaudeEvent::Error { error } => events.push(StreamEvent::Error(error.message)),
        }
        Ok(events)
    }

    fn clean_eof(&self) -> bool {
        false
    }
}

/// Renders neutral events as Anthropic SSE, opening and closing content
/// blocks as the content switches between text and tool calls.
#[derive(Debug)]
pub struct ClaudeStreamEncoder {
    model: String,
    msg_id: String,
    next_block: usize,
    /// Open block index, and whether it is a text block.
    open_block: Option<(usize, bool)>,
    /// Neutral tool call index -> content block index.
    tool_blocks: HashMap<usize, usize>,
    saw_tool_calls: bool,
    finish: Option<(FinishReason, Option<String>)>,
    usage: Option<Usage>,
}

impl ClaudeStreamEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: new_id("msg_"),
            next_block: 0,
            open_block: None,
            tool_blocks: HashMap::new(),
            saw_tool_calls: false,
            finish: None,
            usage: None,
        }
    }

    fn close_open_block(&mut self, events: &mut Vec<SseFrame>) {
        if let Some((index, _)) = self.open_block.take() {
            events.push(frame(&ClaudeEvent::ContentBlockStop { index }));
        }
    }

    fn open(&mut self, block: ResponseContentBlock, is_text: bool, events: &mut Vec<SseFrame>) -> usize {
        self.close_open_block(events);
        let index = self.next_block;
        self.next_block += 1;
        self.open_block = Some((index, is_text));
        events.push(frame(&ClaudeEvent::ContentBlockStart {
            index,
            content_block: block,
        }));
        index
    }
}

fn frame(event: &ClaudeEvent) -> SseFrame {
    SseFrame::json(Some(event.event_name()), event)
}

impl StreamEncoder for ClaudeStreamEncoder {
    fn start(&mut self) -> Vec<SseFrame> {
        let message = MessagesResponse {
            id: self.msg_id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: Vec::new(),
            model: self.model.clone(),
            stop_reason: None,
            stop_sequence: None,
            usage: ClaudeUsage {
                input_tokens: self.usage.map_or(0, |u| u.prompt_tokens),
                output_tokens: 0,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        };
        vec![
            frame(&ClaudeEvent::MessageStart { message }),
            frame(&ClaudeEvent::Ping),
        ]
    }

    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        let mut events = Vec::new();
        match event {
            StreamEvent::Text(text) => {
                let index = match self.open_block {
                    Some((index, true)) => index,
                    _ => self.open(
                        ResponseContentBlock::Text {
                            text: String::new(),
                        },
                        true,
                        &mut events,
                    ),
                };
                events.push(frame(&ClaudeEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { text: text.clone() },
                }));
            }
            StreamEvent::ToolCallStart { index, id, name } => {
                self.saw_tool_calls = true;
                let block = self.open(
                    ResponseContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                    false,
                    &mut events,
                );
                self.tool_blocks.insert(*index, block);
            }
            StreamEvent::ToolCallDelta { index, arguments } => match self.tool_blocks.get(index) {
                // A stopped block cannot be reopened, so only the open one
                // takes argument deltas.
                Some(&block) if self.open_block == Some((block, false)) => {
                    events.push(frame(&ClaudeEvent::ContentBlockDelta {
                        index: block,
                        delta: Delta::InputJsonDelta {
                            partial_json: arguments.clone(),
                        },
                    }));
                }
                Some(&block) => tracing::warn!(
                    tool_index = index,
                    block,
                    bytes = arguments.len(),
                    "skipping arguments for a tool_use block that is already closed"
                ),
                None => tracing::warn!(
                    tool_index = index,
                    bytes = arguments.len(),
                    "skipping arguments for a tool call that never started"
                ),
            },
            StreamEvent::Usage(usage) => self.usage = Some(*usage),
            StreamEvent::Finish { reason, details } => {
                self.finish = Some((*reason, details.clone()));
            }
            StreamEvent::Error(_) | StreamEvent::Done => {}
        }
        events
    }

    fn finish(&mut self) -> Result<Vec<SseFrame>> {
        let mut events = Vec::new();
        self.close_open_block(&mut events);

        let stop_reason = match self.finish.take() {
            Some((reason, details)) => stop_reason_str(reason, details.as_deref()),
            None if self.saw_tool_calls => stop_reason_str(FinishReason::ToolCalls, None),
            None => stop_reason_str(FinishReason::Stop, None),
        };

        events.push(frame(&ClaudeEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                input_tokens: self.usage.map(|u| u.prompt_tokens),
                output_tokens: self.usage.map_or(0, |u| u.completion_tokens),
            },
        }));
        events.push(frame(&ClaudeEvent::MessageStop));
        Ok(events)
    }

    fn fail(&mut self, message: &str) -> Vec<SseFrame> {
        vec![frame(&ClaudeEvent::Error {
            error: ErrorBody {
                error_type: "api_error".to_string(),
                message: message.to_string(),
            },
        })]
    }
}
