// ── URL rewriting ──
//
// Printers embed their own address in replies and web assets. Everything
// forwarded to a client goes through a `Rewriter` so clients only ever see
// the gateway. JSON replies are rewritten value by value; streamed assets
// go through `StreamRewriter`, which holds back a tail so a pattern split
// across two chunks is still replaced.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde_json::Value;

/// Port the printer serves its MJPEG stream on.
pub const DEVICE_VIDEO_PORT: u16 = 3031;
/// Port the printer serves HTTP and WebSocket on.
pub const DEVICE_HTTP_PORT: u16 = 3030;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    from: Vec<u8>,
    to: Vec<u8>,
}

/// Where the gateway is reachable from clients.
#[derive(Debug, Clone)]
pub struct PublicAddress {
    pub host: String,
    pub http_port: u16,
    pub video_port: u16,
}

/// Ordered set of literal substitutions. At any position the first rule
/// that matches wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewriter {
    rules: Vec<Rule>,
}

impl Rewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into().into_bytes();
        if !from.is_empty() {
            self.rules.push(Rule {
                from,
                to: to.into().into_bytes(),
            });
        }
        self
    }

    /// Rules for replies from one printer: its video URL moves behind the
    /// gateway's video surface, its HTTP address behind the HTTP surface.
    pub fn for_device(
        device_id: &str,
        device_host: &str,
        device_http_port: u16,
        public: &PublicAddress,
    ) -> Self {
        let PublicAddress {
            host,
            http_port,
            video_port,
        } = public;
        Self::new()
            .rule(
                format!("http://{device_host}:{DEVICE_VIDEO_PORT}/"),
                format!("http://{host}:{video_port}/printer/{device_id}/"),
            )
            .rule(
                format!("{device_host}:{device_http_port}"),
                format!("{host}:{http_port}"),
            )
    }

    /// `for_device` plus id injection into the WebSocket endpoint, for web
    /// assets that open their own socket.
    pub fn for_assets(
        device_id: &str,
        device_host: &str,
        device_http_port: u16,
        public: &PublicAddress,
    ) -> Self {
        Self::for_device(device_id, device_host, device_http_port, public)
            .rule("/websocket\"", format!("/websocket?id={device_id}\""))
            .rule("/websocket'", format!("/websocket?id={device_id}'"))
            .rule("/websocket`", format!("/websocket?id={device_id}`"))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn longest_pattern(&self) -> usize {
        self.rules.iter().map(|r| r.from.len()).max().unwrap_or(0)
    }

    /// Leftmost match at or after `from`: (position, rule).
    fn next_match(&self, haystack: &[u8], from: usize) -> Option<(usize, &Rule)> {
        let tail = haystack.get(from..)?;
        self.rules
            .iter()
            .filter_map(|rule| {
                tail.windows(rule.from.len())
                    .position(|window| window == rule.from.as_slice())
                    .map(|pos| (from + pos, rule))
            })
            .min_by_key(|(pos, _)| *pos)
    }

    /// Rewrite a complete buffer.
    pub fn apply_bytes<'a>(&self, input: &'a [u8]) -> Cow<'a, [u8]> {
        if self.next_match(input, 0).is_none() {
            return Cow::Borrowed(input);
        }
        let mut out = Vec::with_capacity(input.len());
        let mut cursor = 0;
        while let Some((pos, rule)) = self.next_match(input, cursor) {
            out.extend_from_slice(input.get(cursor..pos).unwrap_or_default());
            out.extend_from_slice(&rule.to);
            cursor = pos + rule.from.len();
        }
        out.extend_from_slice(input.get(cursor..).unwrap_or_default());
        Cow::Owned(out)
    }

    pub fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
        match self.apply_bytes(input.as_bytes()) {
            Cow::Borrowed(_) => Cow::Borrowed(input),
            // Literal UTF-8 replacements at match boundaries keep the text valid.
            Cow::Owned(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
        }
    }

    /// Rewrite every string inside a JSON document in place. Returns
    /// whether anything changed.
    pub fn apply_json(&self, value: &mut Value) -> bool {
        match value {
            Value::String(s) => match self.apply(s) {
                Cow::Owned(rewritten) => {
                    *s = rewritten;
                    true
                }
                Cow::Borrowed(_) => false,
            },
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, item| self.apply_json(item) | changed),
            Value::Object(map) => map
                .values_mut()
                .fold(false, |changed, item| self.apply_json(item) | changed),
            _ => false,
        }
    }

    pub fn streaming(&self) -> StreamRewriter {
        StreamRewriter {
            keep: self.longest_pattern().saturating_sub(1),
            rewriter: self.clone(),
            pending: BytesMut::new(),
        }
    }
}

// ── Streaming ────────────────────────────────────────────────────────

/// Chunk-by-chunk rewriting. Each `push` emits everything that can no
/// longer be part of a match; `finish` flushes the held-back tail.
#[derive(Debug)]
pub struct StreamRewriter {
    rewriter: Rewriter,
    keep: usize,
    pending: BytesMut,
}

impl StreamRewriter {
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        self.pending.extend_from_slice(chunk);
        let buffer = &self.pending[..];
        let safe = buffer.len().saturating_sub(self.keep);

        let mut out = BytesMut::with_capacity(buffer.len());
        let mut cursor = 0;
        while let Some((pos, rule)) = self.rewriter.next_match(buffer, cursor) {
            if pos >= safe {
                break;
            }
            out.extend_from_slice(buffer.get(cursor..pos).unwrap_or_default());
            out.extend_from_slice(&rule.to);
            cursor = pos + rule.from.len();
        }
        let emit_to = safe.max(cursor);
        out.extend_from_slice(buffer.get(cursor..emit_to).unwrap_or_default());
        let _ = self.pending.split_to(emit_to);
        out.freeze()
    }

    pub fn finish(&mut self) -> Bytes {
        let rest = self.pending.split();
        Bytes::from(self.rewriter.apply_bytes(&rest).into_owned())
    }
}

/// Wrap a byte stream so every chunk passes through `rewriter`.
pub fn rewrite_stream<S, E>(stream: S, rewriter: Rewriter) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    async_stream::stream! {
        let mut state = rewriter.streaming();
        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    let out = state.push(&chunk);
                    if !out.is_empty() {
                        yield Ok(out);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        let tail = state.finish();
        if !tail.is_empty() {
            yield Ok(tail);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn public() -> PublicAddress {
        PublicAddress {
            host: "gateway.lan".into(),
            http_port: 3030,
            video_port: 3031,
        }
    }

    #[test]
    fn device_video_url_points_at_gateway() {
        let rewriter = Rewriter::for_device("MB1", "10.0.0.5", 3030, &public());
        assert_eq!(
            rewriter.apply("http://10.0.0.5:3031/video"),
            "http://gateway.lan:3031/printer/MB1/video"
        );
        assert_eq!(
            rewriter.apply("ws://10.0.0.5:3030/websocket"),
            "ws://gateway.lan:3030/websocket"
        );
        assert!(matches!(rewriter.apply("nothing here"), Cow::Borrowed(_)));
    }

    #[test]
    fn json_strings_are_rewritten_in_place() {
        let rewriter = Rewriter::for_device("MB1", "10.0.0.5", 3030, &public());
        let mut reply = json!({
            "Data": { "Ack": 0, "VideoUrl": "http://10.0.0.5:3031/video", "Other": [1, "10.0.0.5:3030"] }
        });
        assert!(rewriter.apply_json(&mut reply));
        assert_eq!(
            reply,
            json!({
                "Data": { "Ack": 0, "VideoUrl": "http://gateway.lan:3031/printer/MB1/video", "Other": [1, "gateway.lan:3030"] }
            })
        );
        assert!(!rewriter.apply_json(&mut json!({ "Ack": 0 })));
    }

    #[test]
    fn pattern_split_across_chunks_is_replaced() {
        let rewriter = Rewriter::new().rule("10.0.0.5:3030", "gw:80");
        let input = b"<a href=\"http://10.0.0.5:3030/index.html\">x</a> 10.0.0.5:3030";
        let expected = rewriter.apply_bytes(input).into_owned();

        for split in 0..=input.len() {
            let (a, b) = input.split_at(split);
            let mut state = rewriter.streaming();
            let mut out = Vec::new();
            out.extend_from_slice(&state.push(a));
            out.extend_from_slice(&state.push(b));
            out.extend_from_slice(&state.finish());
            assert_eq!(out, expected, "split at {split}");
        }
    }

    #[test]
    fn single_byte_chunks_match_whole_body() {
        let rewriter = Rewriter::for_assets("MB7", "10.0.0.5", 3030, &public());
        let input = br#"new WebSocket("ws://" + host + "/websocket"); fetch('http://10.0.0.5:3031/video')"#;
        let mut state = rewriter.streaming();
        let mut out = Vec::new();
        for byte in input {
            out.extend_from_slice(&state.push(std::slice::from_ref(byte)));
        }
        out.extend_from_slice(&state.finish());
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"new WebSocket("ws://" + host + "/websocket?id=MB7"); fetch('http://gateway.lan:3031/printer/MB7/video')"#
        );
    }

    #[tokio::test]
    async fn stream_adapter_flushes_tail() {
        let rewriter = Rewriter::new().rule("abc", "X");
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"zza")), Ok(Bytes::from_static(b"bcab")), Ok(Bytes::from_static(b"c"))];
        let out: Vec<Bytes> = rewrite_stream(futures_util::stream::iter(chunks), rewriter)
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(out.concat(), b"zzXX");
    }
}
