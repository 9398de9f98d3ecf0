//! Incremental server-sent-events decoder.
//!
//! Network chunks split frames at arbitrary byte boundaries, so the decoder
//! carries partial input across `feed` calls and only yields frames once
//! their terminating blank line has arrived.

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// The stream-termination sentinel used by OpenAI-style endpoints.
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Default)]
pub struct SseDecoder {
    carry: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw stream bytes; returns every frame completed by them.
    ///
    /// The carry holds bytes, not text: network chunks can split a
    /// multibyte character, so conversion happens per complete frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.carry.extend_from_slice(chunk);

        let mut frames = Vec::new();
        // Frames end at a blank line. Keep whatever trails the last one.
        while let Some(end) = find_frame_end(&self.carry) {
            let raw: Vec<u8> = self.carry.drain(..end.consumed).collect();
            let text = String::from_utf8_lossy(&raw[..end.frame_len]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }
        frames
    }
}

struct FrameEnd {
    frame_len: usize,
    consumed: usize,
}

fn find_frame_end(buf: &[u8]) -> Option<FrameEnd> {
    // Accept both \n\n and \r\n\r\n separators.
    let lf = find_subslice(buf, b"\n\n").map(|i| FrameEnd {
        frame_len: i,
        consumed: i + 2,
    });
    let crlf = find_subslice(buf, b"\r\n\r\n").map(|i| FrameEnd {
        frame_len: i,
        consumed: i + 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.frame_len <= b.frame_len { a } else { b }),
        (some, None) | (None, some) => some,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data = String::new();

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
        // Comment lines (":") and unknown fields are ignored.
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame { event, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_frame_in_one_chunk() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"data: {\"x\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"x\":1}");
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"data: {\"de").is_empty());
        assert!(dec.feed(b"lta\":\"hi\"}").is_empty());
        let frames = dec.feed(b"\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"delta\":\"hi\"}");
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"data: a\n\ndata: b\n\ndata: c\n\n");
        let datas: Vec<&str> = frames.iter().map(|f| f.data.as_str()).collect();
        assert_eq!(datas, vec!["a", "b", "c"]);
    }

    #[test]
    fn event_type_is_captured() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"event: delta\ndata: payload\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("delta"));
    }

    #[test]
    fn multiline_data_joined_with_newline() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn done_sentinel_detected() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"data: [DONE]\n\n");
        assert!(frames[0].is_done());
    }

    #[test]
    fn crlf_separators_accepted() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"data: a\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a");
    }

    #[test]
    fn comment_only_frame_is_skipped() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b": keep-alive\n\n").is_empty());
    }

    #[test]
    fn multibyte_char_split_across_chunks_survives() {
        let mut dec = SseDecoder::new();
        let full = "data: {\"delta\":\"h\u{e9}llo\"}\n\n".as_bytes();
        // Cut between the two bytes of the 'é' sequence.
        let cut = full.iter().position(|&b| b == 0xC3).map_or(0, |i| i + 1);
        assert!(dec.feed(&full[..cut]).is_empty());
        let frames = dec.feed(&full[cut..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"delta\":\"h\u{e9}llo\"}");
    }

    #[test]
    fn incomplete_trailing_frame_stays_buffered() {
        let mut dec = SseDecoder::new();
        let frames = dec.feed(b"data: done\n\ndata: pend");
        assert_eq!(frames.len(), 1);
        let more = dec.feed(b"ing\n\n");
        assert_eq!(more[0].data, "pending");
    }
}
