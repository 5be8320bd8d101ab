use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Segmented inbound buffer feeding the command-frame decoder.
///
/// Reads arrive from the kernel as independent `Bytes` segments; the
/// decoder needs to peek a fixed-size command header, then extract exactly
/// `header + payload + tag` bytes. Keeping the segments instead of
/// re-concatenating lets the common case (frame fully inside one read) be
/// extracted with a refcount bump rather than a copy.
///
/// # Tradeoffs
///
/// - Fast path: frame inside the front segment is O(1), zero copy
/// - Slow path: a frame spanning segments is copied once into a
///   contiguous buffer
#[derive(Debug, Default)]
pub struct FrameBuffer {
    segments: VecDeque<Bytes>,
    total: usize,
}

impl FrameBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            total: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Append a segment read from the transport. Empty reads are ignored.
    #[inline]
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.total += segment.len();
        self.segments.push_back(segment);
    }

    /// Copy the first `dst.len()` buffered bytes into `dst` without
    /// consuming them.
    ///
    /// Returns `false` if fewer bytes are buffered.
    pub fn peek(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.total {
            return false;
        }

        let mut written = 0;
        for segment in &self.segments {
            if written == dst.len() {
                break;
            }
            let take = (dst.len() - written).min(segment.len());
            dst[written..written + take].copy_from_slice(&segment[..take]);
            written += take;
        }
        written == dst.len()
    }

    /// Drop `n` buffered bytes from the front.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn discard(&mut self, mut n: usize) {
        assert!(n <= self.total);
        self.total -= n;

        while n > 0 {
            let Some(mut front) = self.segments.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            front.advance(n);
            self.segments.push_front(front);
            break;
        }
    }

    /// Extract exactly `n` bytes from the front.
    ///
    /// Zero-copy when the front segment covers the request, otherwise the
    /// spanned segments are copied into one contiguous `Bytes`.
    pub fn extract(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.total {
            return None;
        }

        let front = self.segments.front_mut()?;
        if front.len() >= n {
            self.total -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segments.pop_front();
            }
            return Some(out);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let segment = self
                .segments
                .pop_front()
                .expect("length check guarantees enough segments");
            let take = remaining.min(segment.len());
            out.extend_from_slice(&segment[..take]);
            remaining -= take;
            self.total -= take;
            if take < segment.len() {
                let mut rest = segment;
                rest.advance(take);
                self.segments.push_front(rest);
            }
        }

        Some(out.freeze())
    }
}
