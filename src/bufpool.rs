//! Power-of-two buffer pool.
//!
//! Recyclable byte buffers whose storage size is always a power of two,
//! selected by a shift exponent. The pool owns one sub-pool per shift in
//! `[min_shift, max_shift]`; each sub-pool keeps a small number of idle
//! buffers and drops the rest to bound memory.
//!
//! A [`Buffer`] presents a *payload view* over its storage: `get(n)` hands
//! out a buffer whose `bytes()` is exactly `n` bytes long, backed by
//! `2^ceil(log2(n))` bytes of storage. [`Buffer::shrink`] narrows the view
//! after a short read.
//!
//! # Lifecycle
//!
//! [`BufPool`] is a cheaply clonable handle to shared sub-pools; each
//! pooled buffer carries one, and returns its storage on drop, so a
//! buffer is freed exactly once by construction. Requests outside the
//! pooled shift range are served with fresh allocations that carry no
//! pool backref; dropping those is a plain deallocation.
//!
//! # Concurrency
//!
//! Each sub-pool is independently synchronized; `get` and the drop-time
//! return are safe from concurrent callers. The stream producer and the
//! frame writer share one pool this way.

use std::sync::{Arc, Mutex};

/// Maximum number of idle buffers kept per sub-pool. Returns beyond this
/// are dropped.
const SUB_POOL_CAP: usize = 10;

/// Smallest shift exponent for which a power of two fits `x`.
///
/// `fitting_shift(0) == 0`, `fitting_shift(2^k) == k`, and
/// `fitting_shift(2^k + 1) == k + 1`.
pub(crate) fn fitting_shift(x: usize) -> u32 {
    if x == 0 {
        return 0;
    }
    let blen = usize::BITS - x.leading_zeros();
    if x.is_power_of_two() {
        blen - 1
    } else {
        blen
    }
}

/// One sub-pool holding idle storage of a single size class.
#[derive(Debug)]
struct SubPool {
    shift: u32,
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl SubPool {
    fn get(&self) -> Vec<u8> {
        let mut bufs = self.bufs.lock().expect("sub-pool lock poisoned");
        bufs.pop()
            .unwrap_or_else(|| vec![0u8; 1usize << self.shift])
    }

    fn put(&self, buf: Vec<u8>) {
        assert_eq!(
            buf.len(),
            1usize << self.shift,
            "buffer of length {} returned to sub-pool of shift {}",
            buf.len(),
            self.shift
        );
        let mut bufs = self.bufs.lock().expect("sub-pool lock poisoned");
        if bufs.len() < SUB_POOL_CAP {
            bufs.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.bufs.lock().unwrap().len()
    }
}

#[derive(Debug)]
struct PoolInner {
    min_shift: u32,
    max_shift: u32,
    pools: Vec<SubPool>,
}

/// Handle to a pool of power-of-two byte buffers for the shift range
/// `[min_shift, max_shift]`. Clones share the same sub-pools.
#[derive(Clone, Debug)]
pub struct BufPool {
    inner: Arc<PoolInner>,
}

impl BufPool {
    /// Create a pool covering the closed shift range `[min_shift, max_shift]`.
    pub fn new(min_shift: u32, max_shift: u32) -> Self {
        assert!(min_shift <= max_shift, "invalid shift range");
        let pools = (min_shift..=max_shift)
            .map(|shift| SubPool {
                shift,
                bufs: Mutex::new(Vec::with_capacity(SUB_POOL_CAP)),
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                min_shift,
                max_shift,
                pools,
            }),
        }
    }

    /// Obtain a buffer whose payload view is exactly `min_size` bytes.
    ///
    /// `get(0)` returns an empty buffer with no pool backref. Sizes whose
    /// fitting shift falls outside the pooled range are served by a fresh
    /// allocation with no backref; everything else draws from (and later
    /// returns to) the matching sub-pool.
    pub fn get(&self, min_size: usize) -> Buffer {
        if min_size == 0 {
            return Buffer {
                storage: Vec::new(),
                payload_len: 0,
                pool: None,
            };
        }
        let shift = fitting_shift(min_size);
        let inner = &self.inner;
        if shift < inner.min_shift || shift > inner.max_shift {
            return Buffer {
                storage: vec![0u8; 1usize << shift],
                payload_len: min_size,
                pool: None,
            };
        }
        Buffer {
            storage: inner.pools[(shift - inner.min_shift) as usize].get(),
            payload_len: min_size,
            pool: Some(self.clone()),
        }
    }

    /// Return storage to its sub-pool. Called from `Buffer::drop` only.
    fn put(&self, storage: Vec<u8>) {
        assert!(
            storage.len().is_power_of_two(),
            "returning buffer whose length {} is not a power of two",
            storage.len()
        );
        let inner = &self.inner;
        let shift = fitting_shift(storage.len());
        if shift < inner.min_shift || shift > inner.max_shift {
            return; // drop it
        }
        inner.pools[(shift - inner.min_shift) as usize].put(storage);
    }

    #[cfg(test)]
    fn idle_count(&self, shift: u32) -> usize {
        self.inner.pools[(shift - self.inner.min_shift) as usize].idle_count()
    }
}

/// A byte buffer drawn from a [`BufPool`].
///
/// Storage length is a power of two; the payload view covers the first
/// `payload_len` bytes. Storage returns to the originating pool when the
/// buffer is dropped.
pub struct Buffer {
    storage: Vec<u8>,
    payload_len: usize,
    pool: Option<BufPool>,
}

impl Buffer {
    /// The payload view.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.storage[..self.payload_len]
    }

    /// Mutable payload view.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.storage[..self.payload_len]
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload_len
    }

    /// Whether the payload view is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    /// Narrow the payload view to `new_payload_len` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `new_payload_len` exceeds the current payload length;
    /// growing the view is a programming error.
    pub fn shrink(&mut self, new_payload_len: usize) {
        assert!(
            new_payload_len <= self.payload_len,
            "shrink is actually an expand, invalid: {} > {}",
            new_payload_len,
            self.payload_len
        );
        self.payload_len = new_payload_len;
    }

    /// Return the buffer to its pool.
    ///
    /// Equivalent to dropping it; provided for call sites where the
    /// release is a deliberate step of a protocol rather than scope end.
    #[inline]
    pub fn free(self) {}
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.storage));
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("storage_len", &self.storage.len())
            .field("payload_len", &self.payload_len)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fitting_shift_powers_of_two() {
        for k in 0..30u32 {
            assert_eq!(fitting_shift(1usize << k), k);
        }
    }

    #[test]
    fn test_fitting_shift_one_past_powers_of_two() {
        for k in 1..30u32 {
            assert_eq!(fitting_shift((1usize << k) + 1), k + 1);
        }
    }

    #[test]
    fn test_fitting_shift_zero() {
        assert_eq!(fitting_shift(0), 0);
    }

    #[test]
    fn test_get_payload_len_matches_request() {
        let pool = BufPool::new(4, 12);
        for n in [0usize, 1, 15, 16, 17, 100, 4096, 4097] {
            let buf = pool.get(n);
            assert_eq!(buf.bytes().len(), n, "payload view for get({})", n);
        }
    }

    #[test]
    fn test_get_zero_is_unpooled() {
        let pool = BufPool::new(4, 12);
        let buf = pool.get(0);
        assert!(buf.is_empty());
        buf.free();
        assert_eq!(pool.idle_count(4), 0);
    }

    #[test]
    fn test_storage_is_power_of_two() {
        let pool = BufPool::new(4, 12);
        let buf = pool.get(100);
        assert_eq!(buf.storage.len(), 128);
        let buf = pool.get(128);
        assert_eq!(buf.storage.len(), 128);
    }

    #[test]
    fn test_free_recycles_storage() {
        let pool = BufPool::new(4, 12);
        pool.get(100).free();
        let shift = fitting_shift(100);
        assert_eq!(pool.idle_count(shift), 1);

        // The next get of the same size class reuses the idle buffer.
        let buf = pool.get(90);
        assert_eq!(pool.idle_count(shift), 0);
        assert_eq!(buf.len(), 90);
    }

    #[test]
    fn test_out_of_range_sizes_are_unpooled() {
        let pool = BufPool::new(4, 8);
        let big = pool.get(1 << 10);
        assert_eq!(big.len(), 1 << 10);
        big.free();
        let small = pool.get(2);
        assert_eq!(small.len(), 2);
        small.free();
        for shift in 4..=8 {
            assert_eq!(pool.idle_count(shift), 0);
        }
    }

    #[test]
    fn test_sub_pool_is_bounded() {
        let pool = BufPool::new(4, 4);
        let bufs: Vec<_> = (0..SUB_POOL_CAP + 5).map(|_| pool.get(16)).collect();
        for buf in bufs {
            buf.free();
        }
        assert_eq!(pool.idle_count(4), SUB_POOL_CAP);
    }

    #[test]
    fn test_shrink_narrows_view() {
        let pool = BufPool::new(4, 12);
        let mut buf = pool.get(100);
        buf.shrink(10);
        assert_eq!(buf.bytes().len(), 10);
        buf.shrink(0);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "shrink is actually an expand")]
    fn test_shrink_expand_panics() {
        let pool = BufPool::new(4, 12);
        let mut buf = pool.get(10);
        buf.shrink(11);
    }

    #[test]
    fn test_concurrent_get_free() {
        let pool = BufPool::new(4, 12);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let mut buf = pool.get(512);
                    buf.bytes_mut()[0] = 0xAB;
                    buf.shrink(1);
                    buf.free();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.idle_count(fitting_shift(512)) <= SUB_POOL_CAP);
    }
}
