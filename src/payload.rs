//! Test payloads that are described, not stored.
//!
//! A [`Payload`] is a fixed head followed by a unit repeated `repeat` times.
//! Bytes are produced on demand one window at a time, so a payload of
//! hundreds of megabytes never exists in memory at once.

/// Window size used when comparing or streaming payloads.
pub const WINDOW: usize = 256 * 1024;

/// Unit of the saturating payload.
pub const SATURATE_UNIT: &[u8] = b"hello";

const REFERENCE_HEAD: &[u8] =
    b"HTTP/1.0\r\nGET /\r\nConnection: Keep-Alive\r\n\r\nHere is a body\r\n";
const REFERENCE_UNIT: &[u8] = b"make the body longer\r\n";
const REFERENCE_REPEAT: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    head: Vec<u8>,
    unit: Vec<u8>,
    repeat: usize,
}

impl Payload {
    /// `unit` repeated `repeat` times.
    pub fn repeated(unit: &[u8], repeat: usize) -> Self {
        Self::with_head(&[], unit, repeat)
    }

    /// `head` followed by `unit` repeated `repeat` times.
    pub fn with_head(head: &[u8], unit: &[u8], repeat: usize) -> Self {
        Self {
            head: head.to_vec(),
            unit: unit.to_vec(),
            repeat: if unit.is_empty() { 0 } else { repeat },
        }
    }

    /// `b"hello"` repeated `repeat` times; large enough at the default
    /// repeat count that no socket or record buffer can absorb it.
    pub fn saturating(repeat: usize) -> Self {
        Self::repeated(SATURATE_UNIT, repeat)
    }

    /// The HTTP-looking body sent by the large-send scenario (about 220 KB).
    pub fn large_send_reference() -> Self {
        Self::with_head(REFERENCE_HEAD, REFERENCE_UNIT, REFERENCE_REPEAT)
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.unit.len() * self.repeat
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the contents of `out` with bytes `offset..offset + max`,
    /// clamped to the payload length.
    pub fn window(&self, offset: usize, max: usize, out: &mut Vec<u8>) {
        out.clear();
        let end = offset.saturating_add(max).min(self.len());
        let mut pos = offset;
        while pos < end {
            if pos < self.head.len() {
                let stop = end.min(self.head.len());
                out.extend_from_slice(&self.head[pos..stop]);
                pos = stop;
            } else {
                let rel = (pos - self.head.len()) % self.unit.len();
                let take = (self.unit.len() - rel).min(end - pos);
                out.extend_from_slice(&self.unit[rel..rel + take]);
                pos += take;
            }
        }
    }

    /// Materializes the whole payload. Only sensible for small payloads.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.window(0, self.len(), &mut out);
        out
    }

    /// Offset of the first byte of `bytes` that differs from the payload (the
    /// payload length if `bytes` runs past its end). `None` means `bytes` is a
    /// prefix of, or equal to, the payload.
    pub fn first_mismatch(&self, bytes: &[u8]) -> Option<usize> {
        let mut window = Vec::with_capacity(WINDOW);
        let mut offset = 0;
        while offset < bytes.len() {
            self.window(offset, WINDOW, &mut window);
            if window.is_empty() {
                return Some(offset);
            }
            let chunk = &bytes[offset..bytes.len().min(offset + window.len())];
            if let Some(i) = chunk.iter().zip(&window).position(|(a, b)| a != b) {
                return Some(offset + i);
            }
            offset += chunk.len();
        }
        None
    }

    pub fn is_prefix(&self, bytes: &[u8]) -> bool {
        self.first_mismatch(bytes).is_none()
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() == self.len() && self.is_prefix(bytes)
    }
}
