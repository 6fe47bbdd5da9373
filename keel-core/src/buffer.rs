use bytes::Bytes;
use std::ops::Deref;

/// Growth multiplier applied to the current capacity on overflow (x1.5).
const GROWTH_NUM: usize = 3;
const GROWTH_DEN: usize = 2;

/// Default cap on how far past the required size a growth step may reach.
pub const DEFAULT_MAX_HEADROOM: usize = 64 * 1024;

/// A growable byte buffer used for per-connection receive and send queues.
///
/// Bytes may be inserted at any offset, so protocol layers can prepend a
/// header to data that is already queued, and consumed from the front once
/// the interface has written or a decoder has parsed them.
///
/// # Growth
///
/// On overflow the capacity grows to `max(required, capacity * 1.5)`, but never
/// more than `max_headroom` bytes past `required`. If that reservation fails the
/// buffer retries with exactly `required` bytes before giving up.
///
/// # Failure
///
/// `append` and `insert` return `0` when the buffer cannot grow (allocation
/// failure or the configured `limit`) and leave the contents untouched. Callers
/// treat `0` as backpressure.
#[derive(Debug, Clone)]
pub struct Mbuf {
    buf: Vec<u8>,
    limit: Option<usize>,
    max_headroom: usize,
}

impl Default for Mbuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Mbuf {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            limit: None,
            max_headroom: DEFAULT_MAX_HEADROOM,
        }
    }

    /// Create a buffer with `capacity` bytes preallocated.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            ..Self::new()
        }
    }

    /// Refuse to grow past `limit` bytes of content.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_max_headroom(mut self, headroom: usize) -> Self {
        self.max_headroom = headroom;
        self
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Bytes that can still be added before the limit is hit.
    #[must_use]
    pub fn room(&self) -> usize {
        self.limit.map_or(usize::MAX, |l| l.saturating_sub(self.buf.len()))
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Append `data` at the end. Returns the number of bytes written.
    pub fn append(&mut self, data: &[u8]) -> usize {
        self.insert(self.buf.len(), data)
    }

    /// Append an owned buffer, adopting its allocation when this buffer is empty.
    pub fn append_owned(&mut self, data: Vec<u8>) -> usize {
        if self.buf.is_empty() && self.limit.map_or(true, |l| data.len() <= l) {
            let n = data.len();
            self.buf = data;
            return n;
        }
        self.append(&data)
    }

    /// Insert `data` at `offset`, shifting the tail right.
    ///
    /// Returns `0` without modifying the buffer if `offset` is past the end
    /// or the buffer cannot grow.
    pub fn insert(&mut self, offset: usize, data: &[u8]) -> usize {
        if data.is_empty() || offset > self.buf.len() {
            return 0;
        }
        if !self.reserve_for(data.len()) {
            return 0;
        }
        self.buf.extend_from_slice(data);
        self.buf[offset..].rotate_right(data.len());
        data.len()
    }

    /// Drop the first `n` bytes (or everything if `n >= len`).
    pub fn remove(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Detach the first `n` bytes as an immutable `Bytes`.
    pub fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        let out = Bytes::copy_from_slice(&self.buf[..n]);
        self.remove(n);
        out
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Change capacity to `new_capacity`. No-op below the current length.
    pub fn resize(&mut self, new_capacity: usize) {
        let len = self.buf.len();
        if new_capacity < len {
            return;
        }
        if new_capacity > self.buf.capacity() {
            // failure leaves the buffer as it was
            let _ = self.buf.try_reserve_exact(new_capacity - len);
        } else {
            self.buf.shrink_to(new_capacity);
        }
    }

    /// Shrink capacity to the used length.
    pub fn trim(&mut self) {
        self.buf.shrink_to_fit();
    }

    fn reserve_for(&mut self, extra: usize) -> bool {
        let len = self.buf.len();
        let Some(required) = len.checked_add(extra) else {
            return false;
        };
        if self.limit.is_some_and(|l| required > l) {
            return false;
        }
        let cap = self.buf.capacity();
        if required <= cap {
            return true;
        }

        let mut target = (cap / GROWTH_DEN)
            .saturating_mul(GROWTH_NUM)
            .max(required)
            .min(required.saturating_add(self.max_headroom));
        if let Some(limit) = self.limit {
            target = target.min(limit);
        }

        self.buf.try_reserve_exact(target - len).is_ok()
            || self.buf.try_reserve_exact(required - len).is_ok()
    }
}

impl Deref for Mbuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl AsRef<[u8]> for Mbuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl From<&[u8]> for Mbuf {
    fn from(data: &[u8]) -> Self {
        let mut buf = Self::with_capacity(data.len());
        buf.append(data);
        buf
    }
}
