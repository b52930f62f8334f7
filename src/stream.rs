use std::borrow::Cow;
use std::mem;

/// Per-connection accumulator that stitches partial reads back together.
///
/// The contract is a `begin`/`end` pair around every protocol-parse
/// attempt: `begin(input)` hands back everything buffered so far followed
/// by `input`, and `end(leftover)` stores whatever the parser could not
/// consume so the next `begin` prepends it again. When nothing is held,
/// `begin` returns the input slice itself without copying.
#[derive(Debug, Default)]
pub struct InputStream {
    held: Vec<u8>,
}

impl InputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the held bytes concatenated with `input`.
    pub fn begin<'a>(&mut self, input: &'a [u8]) -> Cow<'a, [u8]> {
        if self.held.is_empty() {
            Cow::Borrowed(input)
        } else {
            let mut buf = mem::take(&mut self.held);
            buf.extend_from_slice(input);
            Cow::Owned(buf)
        }
    }

    /// Stores `leftover` as the new held bytes; empty clears the buffer.
    pub fn end(&mut self, leftover: &[u8]) {
        self.held.clear();
        self.held.extend_from_slice(leftover);
    }
}
