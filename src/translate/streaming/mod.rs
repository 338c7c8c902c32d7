//! Stream transcoding between vendor streaming protocols.
//!
//! A [`Transcoder`] owns one backend stream: a [`FrameDecoder`] cuts the raw
//! bytes into frames, the backend's [`StreamDecoder`] turns each frame into
//! neutral [`StreamEvent`]s, and the client's [`StreamEncoder`] renders them.
//! The transcoder enforces the lifecycle: start framing before the first
//! content, exactly one terminal frame, nothing after it.

pub mod anthropic;
pub mod frame;
pub mod gemini;
pub mod openai;

pub use frame::{FrameDecoder, FrameMode, SseFrame};

use super::neutral::{FinishReason, StreamEvent, Usage};
use super::Format;
use crate::error::Result;

/// Turns backend frames into neutral events.
pub trait StreamDecoder: Send {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>>;

    /// Whether a backend closing the connection without an explicit end
    /// marker still counts as a complete stream.
    fn clean_eof(&self) -> bool;
}

/// Renders neutral events in a client's streaming protocol.
pub trait StreamEncoder: Send {
    /// Framing sent before the first content delta.
    fn start(&mut self) -> Vec<SseFrame>;

    /// Content, usage and finish events. Usage and finish are usually held
    /// until [`StreamEncoder::finish`].
    fn encode(&mut self, event: &StreamEvent) -> Vec<SseFrame>;

    /// Terminal framing for a successful stream.
    fn finish(&mut self) -> Result<Vec<SseFrame>>;

    /// Terminal framing for a failed stream.
    fn fail(&mut self, message: &str) -> Vec<SseFrame>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Init,
    Streaming,
    Finished,
    Failed,
}

pub struct Transcoder {
    frames: FrameDecoder,
    decoder: Box<dyn StreamDecoder>,
    encoder: Box<dyn StreamEncoder>,
    state: StreamState,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
    /// Raw backend reason behind an `Error` finish.
    finish_details: Option<String>,
    error: Option<String>,
}

impl Transcoder {
    /// `model` is the name reported to the client; `content_type` is the
    /// backend's response content type, which picks the framing.
    pub fn new(backend: Format, client: Format, model: &str, content_type: Option<&str>) -> Self {
        Self {
            frames: FrameDecoder::new(FrameMode::from_content_type(content_type)),
            decoder: backend.codec().stream_decoder(),
            encoder: client.codec().stream_encoder(model),
            state: StreamState::Init,
            usage: None,
            finish_reason: None,
            finish_details: None,
            error: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, StreamState::Finished | StreamState::Failed)
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn finish_details(&self) -> Option<&str> {
        self.finish_details.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Feed one network read; returns the client frames it produced.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        if self.is_terminated() {
            return Vec::new();
        }
        match self.frames.push(bytes) {
            Ok(frames) => self.process(frames),
            Err(e) => self.fail(&e.to_string()),
        }
    }

    /// The backend closed the connection.
    pub fn close(&mut self) -> Vec<SseFrame> {
        if self.is_terminated() {
            return Vec::new();
        }
        let mut out = match self.frames.finish() {
            Ok(Some(frame)) => self.process(vec![frame]),
            Ok(None) => Vec::new(),
            Err(e) => return self.fail(&e.to_string()),
        };
        if !self.is_terminated() {
            if self.decoder.clean_eof() {
                out.extend(self.complete());
            } else {
                out.extend(self.fail("backend closed the stream without an end-of-stream marker"));
            }
        }
        out
    }

    /// Abort the stream (transport error, idle timeout).
    pub fn fail(&mut self, message: &str) -> Vec<SseFrame> {
        if self.is_terminated() {
            return Vec::new();
        }
        tracing::warn!(error = %message, "stream failed");
        self.state = StreamState::Failed;
        self.error = Some(message.to_string());
        self.encoder.fail(message)
    }

    fn process(&mut self, frames: Vec<SseFrame>) -> Vec<SseFrame> {
        let mut out = Vec::new();
        for frame in frames {
            if self.is_terminated() {
                break;
            }
            match self.decoder.decode(&frame) {
                Ok(events) => {
                    for event in events {
                        self.apply(event, &mut out);
                        if self.is_terminated() {
                            break;
                        }
                    }
                }
                Err(e) => out.extend(self.fail(&e.to_string())),
            }
        }
        out
    }

    fn apply(&mut self, event: StreamEvent, out: &mut Vec<SseFrame>) {
        match event {
            StreamEvent::Done => out.extend(self.complete()),
            StreamEvent::Error(message) => out.extend(self.fail(&message)),
            event => {
                if event.is_content() && self.state == StreamState::Init {
                    out.extend(self.encoder.start());
                    self.state = StreamState::Streaming;
                }
                match &event {
                    StreamEvent::Usage(usage) => self.usage = Some(*usage),
                    StreamEvent::Finish { reason, details } => {
                        self.finish_reason = Some(*reason);
                        self.finish_details = details.clone();
                    }
                    _ => {}
                }
                out.extend(self.encoder.encode(&event));
            }
        }
    }

    fn complete(&mut self) -> Vec<SseFrame> {
        let mut out = Vec::new();
        if self.state == StreamState::Init {
            out.extend(self.encoder.start());
            self.state = StreamState::Streaming;
        }
        match self.encoder.finish() {
            Ok(frames) => {
                out.extend(frames);
                self.state = StreamState::Finished;
            }
            Err(e) => out.extend(self.fail(&e.to_string())),
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(frames: &[SseFrame]) -> String {
        frames.iter().map(SseFrame::render).collect()
    }

    fn openai_chunk(content: &str, finish: Option<&str>) -> String {
        let chunk = serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": finish}]
        });
        format!("data: {chunk}\n\n")
    }

    /// Concatenate the text a client would see, whatever its format.
    fn client_text(client: Format, frames: &[SseFrame]) -> String {
        let mut text = String::new();
        for frame in frames {
            let Ok(v) = serde_json::from_str::<serde_json::Value>(&frame.data) else {
                continue;
            };
            match client {
                Format::OpenAi => {
                    if let Some(t) = v["choices"][0]["delta"]["content"].as_str() {
                        text.push_str(t);
                    }
                }
                Format::Claude => {
                    if let Some(t) = v["delta"]["text"].as_str() {
                        text.push_str(t);
                    }
                }
                Format::Gemini => {
                    if let Some(parts) = v["candidates"][0]["content"]["parts"].as_array() {
                        for p in parts {
                            if let Some(t) = p["text"].as_str() {
                                text.push_str(t);
                            }
                        }
                    }
                }
            }
        }
        text
    }

    fn backend_stream(backend: Format, pieces: &[&str]) -> (String, Option<&'static str>) {
        match backend {
            Format::OpenAi => {
                let mut s: String = pieces.iter().map(|p| openai_chunk(p, None)).collect();
                s.push_str(&openai_chunk("", Some("stop")));
                s.push_str("data: [DONE]\n\n");
                (s, Some("text/event-stream"))
            }
            Format::Claude => {
                let mut s = String::from(
                    "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude\",\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n\
                     event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
                );
                for p in pieces {
                    let delta = serde_json::json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": p}});
                    s.push_str(&format!("event: content_block_delta\ndata: {delta}\n\n"));
                }
                s.push_str("event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n");
                s.push_str("event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":7}}\n\n");
                s.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
                (s, Some("text/event-stream"))
            }
            Format::Gemini => {
                let chunks: Vec<String> = pieces
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let mut c = serde_json::json!({"candidates": [{"content": {"role": "model", "parts": [{"text": p}]}, "index": 0}]});
                        if i + 1 == pieces.len() {
                            c["candidates"][0]["finishReason"] = "STOP".into();
                            c["usageMetadata"] = serde_json::json!({"promptTokenCount": 5, "candidatesTokenCount": 7, "totalTokenCount": 12});
                        }
                        c.to_string()
                    })
                    .collect();
                (format!("[{}]", chunks.join(",\n")), Some("application/json"))
            }
        }
    }

    #[test]
    fn test_text_fidelity_and_single_terminal_for_all_pairs() {
        let pieces = ["Hel", "lo, ", "wörld", "!"];
        let formats = [Format::OpenAi, Format::Claude, Format::Gemini];
        for backend in formats {
            for client in formats {
                let (raw, content_type) = backend_stream(backend, &pieces);
                let mut tc = Transcoder::new(backend, client, "client-model", content_type);
                let mut frames = Vec::new();
                // Feed in small uneven slices to exercise partial frames.
                for chunk in raw.as_bytes().chunks(7) {
                    frames.extend(tc.feed(chunk));
                }
                frames.extend(tc.close());

                assert_eq!(tc.state(), StreamState::Finished, "{backend} -> {client}");
                assert_eq!(client_text(client, &frames), "Hello, wörld!", "{backend} -> {client}");

                let terminals = match client {
                    Format::OpenAi => frames.iter().filter(|f| f.is_done()).count(),
                    Format::Claude => frames
                        .iter()
                        .filter(|f| f.event.as_deref() == Some("message_stop"))
                        .count(),
                    Format::Gemini => frames
                        .iter()
                        .filter(|f| f.data.contains("finishReason"))
                        .count(),
                };
                assert_eq!(terminals, 1, "{backend} -> {client}");
                assert!(tc.close().is_empty());
                assert!(tc.feed(b"data: [DONE]\n\n").is_empty());
            }
        }
    }

    #[test]
    fn test_openai_to_openai_ends_with_done() {
        let (raw, ct) = backend_stream(Format::OpenAi, &["hi"]);
        let mut tc = Transcoder::new(Format::OpenAi, Format::OpenAi, "gpt-4o", ct);
        let mut frames = tc.feed(raw.as_bytes());
        frames.extend(tc.close());
        assert!(render(&frames).ends_with("data: [DONE]\n\n"));
        let first: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "");
    }

    #[test]
    fn test_claude_closure_without_message_stop_fails() {
        let (raw, ct) = backend_stream(Format::Claude, &["partial"]);
        let cut = raw.find("event: message_stop").unwrap();
        let mut tc = Transcoder::new(Format::Claude, Format::OpenAi, "m", ct);
        let mut frames = tc.feed(&raw.as_bytes()[..cut]);
        frames.extend(tc.close());
        assert_eq!(tc.state(), StreamState::Failed);
        let rendered = render(&frames);
        assert!(rendered.contains("\"error\""));
        assert!(rendered.ends_with("data: [DONE]\n\n"));
        assert_eq!(frames.iter().filter(|f| f.is_done()).count(), 1);
    }

    #[test]
    fn test_openai_closure_after_finish_reason_is_clean() {
        let raw = format!("{}{}", openai_chunk("ok", None), openai_chunk("", Some("length")));
        let mut tc = Transcoder::new(Format::OpenAi, Format::Claude, "m", Some("text/event-stream"));
        let mut frames = tc.feed(raw.as_bytes());
        frames.extend(tc.close());
        assert_eq!(tc.state(), StreamState::Finished);
        assert_eq!(tc.finish_reason(), Some(FinishReason::Length));
        let delta = frames
            .iter()
            .find(|f| f.event.as_deref() == Some("message_delta"))
            .unwrap();
        assert!(delta.data.contains("\"stop_reason\":\"max_tokens\""));
    }

    #[test]
    fn test_openai_closure_without_finish_fails() {
        let raw = openai_chunk("ok", None);
        let mut tc = Transcoder::new(Format::OpenAi, Format::Claude, "m", Some("text/event-stream"));
        let mut frames = tc.feed(raw.as_bytes());
        frames.extend(tc.close());
        assert_eq!(tc.state(), StreamState::Failed);
        assert_eq!(frames.last().unwrap().event.as_deref(), Some("error"));
    }

    #[test]
    fn test_backend_error_event_fails_stream() {
        let raw = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let mut tc = Transcoder::new(Format::Claude, Format::Gemini, "m", Some("text/event-stream"));
        let frames = tc.feed(raw.as_bytes());
        assert_eq!(tc.state(), StreamState::Failed);
        assert_eq!(tc.error(), Some("Overloaded"));
        assert_eq!(frames.len(), 1);
        let body: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(body["error"]["status"], "INTERNAL");
        assert!(tc.close().is_empty());
    }

    #[test]
    fn test_malformed_frame_fails_stream() {
        let mut tc = Transcoder::new(Format::OpenAi, Format::OpenAi, "m", Some("text/event-stream"));
        let frames = tc.feed(b"data: {not json\n\n");
        assert_eq!(tc.state(), StreamState::Failed);
        assert!(frames.last().unwrap().is_done());
    }

    #[test]
    fn test_explicit_fail_after_content() {
        let mut tc = Transcoder::new(Format::OpenAi, Format::Claude, "m", Some("text/event-stream"));
        let frames = tc.feed(openai_chunk("hi", None).as_bytes());
        assert_eq!(tc.state(), StreamState::Streaming);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        let frames = tc.fail("idle timeout");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("error"));
        assert!(tc.fail("again").is_empty());
    }

    #[test]
    fn test_usage_captured_from_trailing_chunk() {
        let raw = format!(
            "{}{}data: {}\n\ndata: [DONE]\n\n",
            openai_chunk("hi", None),
            openai_chunk("", Some("stop")),
            serde_json::json!({"id": "c", "object": "chat.completion.chunk", "created": 0, "model": "m", "choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}})
        );
        let mut tc = Transcoder::new(Format::OpenAi, Format::Claude, "m", Some("text/event-stream"));
        let frames = tc.feed(raw.as_bytes());
        assert_eq!(tc.usage().map(|u| u.total_tokens), Some(4));
        let delta = frames
            .iter()
            .find(|f| f.event.as_deref() == Some("message_delta"))
            .unwrap();
        assert!(delta.data.contains("\"output_tokens\":1"));
    }
}
