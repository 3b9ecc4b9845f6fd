//! Framed key/value wire protocol decoder
//!
//! The device emits newline-terminated text in which protocol frames of the
//! form `{{key;value}}` may be embedded. [WireCodec] consumes raw bytes as
//! they arrive, tolerates partial lines and partial UTF-8 sequences, and
//! separates complete frames from ordinary log output. Anything on a line
//! that is not part of a frame is handed back as "discarded" text so it can
//! still be surfaced to the user.

use std::{collections::VecDeque, sync::LazyLock};

use regex::Regex;

use crate::event::unix_now;

// `key` excludes `}` and `;`, `value` excludes `}`.
static FRAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^;}]+);([^}]*)\}\}").unwrap());

/// Encode a key/value pair as a single wire frame, newline-terminated.
pub fn encode(key: &str, value: &str) -> String {
    format!("{{{{{key};{value}}}}}\n")
}

/// Incremental decoder for the `{{key;value}}` line protocol.
///
/// The codec is restartable per connection but must be [cleared](Self::clear)
/// across a device reset, since residual buffer content from before the
/// reset could otherwise be misinterpreted as new output.
#[derive(Debug, Default)]
pub struct WireCodec {
    buffer: Vec<u8>,
    pending: VecDeque<(String, String, f64)>,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume newly-received bytes.
    ///
    /// Complete lines are scanned for frames, which are queued internally;
    /// non-protocol text is returned, one entry per fragment. Incomplete
    /// trailing data stays buffered until the terminating newline arrives.
    /// Lines are decoded leniently: invalid UTF-8 sequences become
    /// replacement characters rather than errors.
    pub fn append(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut discarded = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            self.scan_line(line, &mut discarded);
        }

        discarded
    }

    fn scan_line(&mut self, line: &str, discarded: &mut Vec<String>) {
        match FRAME.captures(line) {
            Some(caps) => {
                let whole = caps.get(0).unwrap();
                let leading = &line[..whole.start()];
                let trailing = &line[whole.end()..];

                if !leading.is_empty() {
                    discarded.push(leading.to_string());
                }

                self.pending
                    .push_back((caps[1].to_string(), caps[2].to_string(), unix_now()));

                if !trailing.is_empty() {
                    discarded.push(trailing.to_string());
                }
            }
            None => {
                if !line.is_empty() {
                    discarded.push(line.to_string());
                }
            }
        }
    }

    /// Whether at least one decoded frame is waiting to be popped.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pop the oldest decoded frame, if any.
    pub fn pop(&mut self) -> Option<(String, String, f64)> {
        self.pending.pop_front()
    }

    /// Drop the residual buffer and any queued frames.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{encode, WireCodec};

    fn drain(codec: &mut WireCodec) -> Vec<(String, String)> {
        let mut frames = Vec::new();
        while let Some((key, value, _)) = codec.pop() {
            frames.push((key, value));
        }
        frames
    }

    #[test]
    fn decodes_a_single_frame() {
        let mut codec = WireCodec::new();
        let discarded = codec.append(b"{{hello_world;Hello World}}\n");

        assert!(discarded.is_empty());
        assert_eq!(
            drain(&mut codec),
            vec![("hello_world".to_string(), "Hello World".to_string())]
        );
    }

    #[test]
    fn frame_round_trip_survives_any_chunking() {
        let pairs = [("alpha", "one"), ("beta", "two;three"), ("gamma", "")];
        let encoded: String = pairs.iter().map(|(k, v)| encode(k, v)).collect();
        let bytes = encoded.as_bytes();

        for chunk_size in 1..=bytes.len() {
            let mut codec = WireCodec::new();
            for chunk in bytes.chunks(chunk_size) {
                codec.append(chunk);
            }

            let expected: Vec<(String, String)> = pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            assert_eq!(drain(&mut codec), expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_all_at_once() {
        let stream = b"noise\n{{key;value}}\r\npartial {{k2;v2}} trailing\n";

        let mut whole = WireCodec::new();
        let whole_discarded = whole.append(stream);

        let mut single = WireCodec::new();
        let mut single_discarded = Vec::new();
        for byte in stream {
            single_discarded.extend(single.append(&[*byte]));
        }

        assert_eq!(drain(&mut whole), drain(&mut single));
        assert_eq!(whole_discarded, single_discarded);
        assert_eq!(whole_discarded, vec!["noise", "partial ", " trailing"]);
    }

    #[test]
    fn incomplete_line_stays_buffered() {
        let mut codec = WireCodec::new();
        codec.append(b"{{key;val");
        assert!(!codec.has_pending());

        codec.append(b"ue}}\n");
        assert_eq!(
            drain(&mut codec),
            vec![("key".to_string(), "value".to_string())]
        );
    }

    #[test]
    fn non_protocol_line_is_discarded_text() {
        let mut codec = WireCodec::new();
        let discarded = codec.append(b"booting firmware v1.2\n");

        assert_eq!(discarded, vec!["booting firmware v1.2"]);
        assert!(!codec.has_pending());
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut codec = WireCodec::new();
        let discarded = codec.append(b"bad \xFF bytes\n{{ok;\xFE}}\n");

        assert_eq!(discarded, vec!["bad \u{FFFD} bytes"]);
        assert_eq!(
            drain(&mut codec),
            vec![("ok".to_string(), "\u{FFFD}".to_string())]
        );
    }

    #[test]
    fn clear_drops_residual_state() {
        let mut codec = WireCodec::new();
        codec.append(b"{{stale;frame}}\n{{half;fra");
        assert!(codec.has_pending());

        codec.clear();
        assert!(!codec.has_pending());

        // The leftover `{{half;fra` must not merge with post-reset output.
        let discarded = codec.append(b"me}}\n");
        assert_eq!(discarded, vec!["me}}"]);
        assert!(!codec.has_pending());
    }
}
