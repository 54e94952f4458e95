//! Bounded text history with front trimming.

use std::fmt;

/// Default cap on buffered text, in bytes.
pub const DEFAULT_MAX_SIZE: usize = 100_000;
/// Default extra amount dropped on each trim, in bytes.
pub const DEFAULT_TRIM_SLACK: usize = 10_000;

/// Size policy for an [`OutputBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct BufferLimits {
    /// Length above which an append triggers a trim.
    pub max_size: usize,
    /// Extra bytes dropped per trim so trims are not triggered on every append.
    pub trim_slack: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            trim_slack: DEFAULT_TRIM_SLACK,
        }
    }
}

impl BufferLimits {
    /// Creates a custom policy.
    pub const fn new(max_size: usize, trim_slack: usize) -> Self {
        Self {
            max_size,
            trim_slack,
        }
    }
}

/// Capped text accumulator.
///
/// Lengths are UTF-8 bytes. After any append the length is at most
/// `max_size + trim_slack`, the content is a suffix of everything ever
/// appended, and it always starts on a character boundary.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    /// Buffered text.
    text: String,
    /// Trim policy.
    limits: BufferLimits,
}

impl OutputBuffer {
    /// Creates an empty buffer with the given limits.
    pub const fn new(limits: BufferLimits) -> Self {
        Self {
            text: String::new(),
            limits,
        }
    }

    /// Appends `s`, trimming from the front first if the result would
    /// exceed `max_size`.
    pub fn append(&mut self, s: &str) {
        let total = self.text.len() + s.len();
        if total <= self.limits.max_size {
            self.text.push_str(s);
            return;
        }

        // Drop `excess` bytes from the front of `text + s`.
        let excess = (total - self.limits.max_size).saturating_add(self.limits.trim_slack);
        if excess < self.text.len() {
            let cut = ceil_char_boundary(&self.text, excess);
            self.text.drain(..cut);
            self.text.push_str(s);
        } else {
            let skip = (excess - self.text.len()).min(s.len());
            let cut = ceil_char_boundary(s, skip);
            self.text.clear();
            self.text.push_str(&s[cut..]);
        }
    }

    /// Returns the buffered text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns the buffered length in bytes.
    pub const fn len(&self) -> usize {
        self.text.len()
    }

    /// Returns `true` if nothing is buffered.
    pub const fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Discards all buffered text.
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Returns the trim policy.
    pub const fn limits(&self) -> BufferLimits {
        self.limits
    }
}

impl fmt::Display for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Smallest char boundary in `s` at or after `index`.
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    (index..=s.len())
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(s.len())
}

/// Incremental UTF-8 decoder for a byte stream split at arbitrary points.
///
/// A character split across two chunks is held back until its remaining
/// bytes arrive. Invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    /// Bytes of an incomplete trailing character (at most 3).
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes `chunk`, returning all text that is complete so far.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest = self.pending.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // `valid_up_to` guarantees this prefix is UTF-8.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end: keep for the next chunk.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Ends the stream: a truncated trailing character becomes U+FFFD.
    pub(crate) fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}
