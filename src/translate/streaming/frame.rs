//! Byte-level framing for backend streams.
//!
//! Network reads split frames arbitrarily, including inside multi-byte UTF-8
//! sequences, so bytes are buffered raw and only converted to text once a
//! whole frame is available.

use serde::Serialize;

use crate::error::{ProxyError, Result};

/// One server-sent event, either decoded from a backend or rendered for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.to_string()),
            data: data.into(),
        }
    }

    pub fn json<T: Serialize>(event: Option<&str>, value: &T) -> Self {
        Self {
            event: event.map(str::to_string),
            data: serde_json::to_string(value).unwrap_or_default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Wire form, including the blank line that terminates the event.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(ref event) = self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// How a backend delimits its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// `text/event-stream`: frames end at a blank line.
    Sse,
    /// A JSON array or newline-delimited JSON: frames are top-level objects.
    JsonStream,
}

impl FrameMode {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type.map(str::to_ascii_lowercase) {
            Some(ct) if ct.contains("event-stream") => FrameMode::Sse,
            Some(ct) if ct.contains("json") => FrameMode::JsonStream,
            _ => FrameMode::Sse,
        }
    }
}

/// Incremental frame splitter.
#[derive(Debug)]
pub struct FrameDecoder {
    mode: FrameMode,
    buf: Vec<u8>,
    json: JsonScan,
    /// SSE: bytes of `buf` already searched for a line terminator.
    sse_scan: usize,
    /// SSE: lines of the event still being assembled.
    sse_lines: Vec<String>,
}

/// Resumable scan state for JSON streams, so a large object arriving in
/// many reads is not rescanned from the start each time.
#[derive(Debug, Default)]
struct JsonScan {
    pos: usize,
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escape: bool,
}

impl FrameDecoder {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
            json: JsonScan::default(),
            sse_scan: 0,
            sse_lines: Vec::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Buffer a read and return every frame it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseFrame>> {
        match self.mode {
            FrameMode::Sse => {
                self.buf.extend_from_slice(bytes);
                self.drain_sse()
            }
            FrameMode::JsonStream => {
                self.buf.extend_from_slice(bytes);
                self.drain_json()
            }
        }
    }

    /// Decode whatever is left once the backend has closed.
    pub fn finish(&mut self) -> Result<Option<SseFrame>> {
        let rest = std::mem::take(&mut self.buf);
        self.json = JsonScan::default();
        self.sse_scan = 0;
        match self.mode {
            FrameMode::Sse => {
                let mut lines = std::mem::take(&mut self.sse_lines);
                let tail = frame_text(&rest)?;
                let tail = tail.trim_end_matches('\r');
                if !tail.is_empty() {
                    lines.push(tail.to_string());
                }
                Ok(parse_sse_block(&lines.join("\n")))
            }
            FrameMode::JsonStream => {
                let text = frame_text(&rest)?;
                let trimmed = text
                    .trim()
                    .trim_start_matches(['[', ','])
                    .trim_end_matches([']', ','])
                    .trim();
                Ok((!trimmed.is_empty()).then(|| SseFrame::data(trimmed)))
            }
        }
    }

    /// Split complete lines off the buffer. Lines end in `\r\n`, `\n` or a
    /// bare `\r`; a blank line ends the event.
    fn drain_sse(&mut self) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        let mut start = 0;
        let mut pos = self.sse_scan;

        while pos < self.buf.len() {
            let terminator = match self.buf[pos] {
                b'\n' => 1,
                b'\r' => match self.buf.get(pos + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    // Could be the first half of a CRLF split across reads.
                    None => break,
                },
                _ => {
                    pos += 1;
                    continue;
                }
            };

            let line = frame_text(&self.buf[start..pos])?;
            if line.is_empty() {
                let lines = std::mem::take(&mut self.sse_lines);
                if let Some(frame) = parse_sse_block(&lines.join("\n")) {
                    frames.push(frame);
                }
            } else {
                self.sse_lines.push(line);
            }
            pos += terminator;
            start = pos;
        }

        self.buf.drain(..start);
        self.sse_scan = pos - start;
        Ok(frames)
    }

    fn drain_json(&mut self) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        let scan = &mut self.json;

        while scan.pos < self.buf.len() {
            let b = self.buf[scan.pos];
            scan.pos += 1;

            if scan.in_string {
                if scan.escape {
                    scan.escape = false;
                } else if b == b'\\' {
                    scan.escape = true;
                } else if b == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match b {
                b'"' if scan.depth > 0 => scan.in_string = true,
                b'{' => {
                    if scan.depth == 0 {
                        scan.start = Some(scan.pos - 1);
                    }
                    scan.depth += 1;
                }
                b'}' if scan.depth > 0 => {
                    scan.depth -= 1;
                    if scan.depth == 0 {
                        if let Some(start) = scan.start.take() {
                            let text = frame_text(&self.buf[start..scan.pos])?;
                            frames.push(SseFrame::data(text));
                        }
                    }
                }
                _ => {}
            }
        }

        // Drop everything before the object still being assembled.
        let keep_from = scan.start.unwrap_or(scan.pos);
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            scan.pos -= keep_from;
            if let Some(start) = scan.start.as_mut() {
                *start -= keep_from;
            }
        }

        Ok(frames)
    }
}

fn frame_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ProxyError::translation(format!("stream frame is not valid UTF-8: {e}")))
}

/// Parse one SSE event block. Comment-only blocks yield nothing.
fn parse_sse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_frames_split_across_reads() {
        let mut dec = FrameDecoder::new(FrameMode::Sse);
        assert!(dec.push(b"event: message_start\ndata: {\"a\"").unwrap().is_empty());
        let frames = dec.push(b":1}\n\ndata: [DONE]\n\n").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[1].is_done());
    }

    #[test]
    fn test_sse_crlf_comments_and_multiline_data() {
        let mut dec = FrameDecoder::new(FrameMode::Sse);
        let frames = dec
            .push(b": keep-alive\r\n\r\ndata: line one\r\ndata: line two\r\n\r\n")
            .unwrap();
        assert_eq!(frames, vec![SseFrame::data("line one\nline two")]);
    }

    #[test]
    fn test_sse_bare_cr_and_crlf_split_between_reads() {
        let mut dec = FrameDecoder::new(FrameMode::Sse);
        let frames = dec.push(b"event: ping\rdata: {}\r\rdata: a\r").unwrap();
        assert_eq!(frames, vec![SseFrame::named("ping", "{}")]);
        // The pending `\r` turns out to be half of a CRLF.
        let frames = dec.push(b"\n\r\n").unwrap();
        assert_eq!(frames, vec![SseFrame::data("a")]);
        assert_eq!(dec.finish().unwrap(), None);
    }

    #[test]
    fn test_large_frame_in_many_small_reads() {
        let payload = "x".repeat(64 * 1024);
        let raw = format!("data: {payload}\n\n");
        let mut dec = FrameDecoder::new(FrameMode::Sse);
        let mut frames = Vec::new();
        for chunk in raw.as_bytes().chunks(13) {
            frames.extend(dec.push(chunk).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), payload.len());
        // Only the unterminated tail is ever rescanned.
        assert_eq!(dec.sse_scan, 0);
        assert!(dec.buf.is_empty());
    }

    #[test]
    fn test_multibyte_char_split_between_reads() {
        let text = "data: {\"t\":\"héllo\"}\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = FrameDecoder::new(FrameMode::Sse);
        assert!(dec.push(&text[..split]).unwrap().is_empty());
        let frames = dec.push(&text[split..]).unwrap();
        assert_eq!(frames[0].data, "{\"t\":\"héllo\"}");
    }

    #[test]
    fn test_trailing_sse_frame_decoded_at_eof() {
        let mut dec = FrameDecoder::new(FrameMode::Sse);
        assert!(dec.push(b"data: {\"x\":1}").unwrap().is_empty());
        assert_eq!(dec.finish().unwrap(), Some(SseFrame::data("{\"x\":1}")));
        assert_eq!(dec.finish().unwrap(), None);
    }

    #[test]
    fn test_json_array_stream() {
        let mut dec = FrameDecoder::new(FrameMode::JsonStream);
        let mut frames = dec.push(b"[{\"a\":\"}{\\\"\"},\n{\"b\":").unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":\"}{\\\"\"}");
        frames = dec.push(b"{\"c\":2}}\n]").unwrap();
        assert_eq!(frames, vec![SseFrame::data("{\"b\":{\"c\":2}}")]);
        assert_eq!(dec.finish().unwrap(), None);
    }

    #[test]
    fn test_ndjson_stream() {
        let mut dec = FrameDecoder::new(FrameMode::JsonStream);
        let frames = dec.push(b"{\"n\":1}\n{\"n\":2}\n{\"n\"").unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(dec.finish().unwrap(), Some(SseFrame::data("{\"n\"")));
    }

    #[test]
    fn test_mode_from_content_type() {
        assert_eq!(
            FrameMode::from_content_type(Some("text/event-stream; charset=utf-8")),
            FrameMode::Sse
        );
        assert_eq!(
            FrameMode::from_content_type(Some("application/json")),
            FrameMode::JsonStream
        );
        assert_eq!(FrameMode::from_content_type(None), FrameMode::Sse);
    }

    #[test]
    fn test_render() {
        assert_eq!(
            SseFrame::named("ping", "{\"type\":\"ping\"}").render(),
            "event: ping\ndata: {\"type\":\"ping\"}\n\n"
        );
        assert_eq!(SseFrame::data("[DONE]").render(), "data: [DONE]\n\n");
    }
}
