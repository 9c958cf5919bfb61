//! Buffered cryptographic randomness.
//!
//! Key pair and nonce generation are synchronous, but the secure entropy
//! source may only be reachable asynchronously. `CryptoPrng` bridges the two:
//!
//! - `initialize()` / `refill()` (async) fill a fixed buffer from the source
//! - `next_bytes()` / `fill()` (sync) hand out bytes and advance a cursor
//!
//! Nothing downstream may produce key material before `initialize()` has
//! succeeded. Bytes are wiped from the buffer as soon as they are handed out
//! and the whole buffer is zeroized on drop.

use std::fmt;

use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Default buffer size. Larger than any single draw (key pair = 32, nonce = 24).
pub const PRNG_BUFFER_SIZE: usize = 256;

/// Errors from the buffered PRNG.
#[derive(Debug, Error)]
pub enum PrngError {
    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("PRNG not initialized")]
    NotReady,

    #[error("random buffer exhausted: requested {requested} bytes, {available} available")]
    BufferExhausted { requested: usize, available: usize },

    #[error("request for {requested} bytes exceeds buffer capacity of {capacity}")]
    RequestTooLarge { requested: usize, capacity: usize },
}

/// A secure source of random bytes.
#[async_trait]
pub trait EntropySource: Send + Sync {
    /// Fill `buf` completely or fail with `PrngError::EntropyUnavailable`.
    async fn fill(&self, buf: &mut [u8]) -> Result<(), PrngError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

#[async_trait]
impl EntropySource for OsEntropy {
    async fn fill(&self, buf: &mut [u8]) -> Result<(), PrngError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| PrngError::EntropyUnavailable(e.to_string()))
    }
}

/// Two-phase PRNG: async fill, sync draw.
pub struct CryptoPrng<S = OsEntropy> {
    source: S,
    buffer: Zeroizing<Vec<u8>>,
    /// Bytes of `buffer` holding fresh entropy. Zero until initialized.
    filled: usize,
    cursor: usize,
}

impl CryptoPrng<OsEntropy> {
    /// PRNG over the OS entropy source with the default buffer size.
    pub fn new() -> Self {
        Self::with_source(OsEntropy)
    }
}

impl Default for CryptoPrng<OsEntropy> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CryptoPrng<S> {
    /// PRNG over a custom source with the default buffer size.
    pub fn with_source(source: S) -> Self {
        Self::with_capacity(source, PRNG_BUFFER_SIZE)
    }

    /// PRNG over a custom source with a custom buffer size.
    pub fn with_capacity(source: S, capacity: usize) -> Self {
        Self {
            source,
            buffer: Zeroizing::new(vec![0u8; capacity]),
            filled: 0,
            cursor: 0,
        }
    }

    /// True once a fill has succeeded and not been invalidated since.
    pub fn is_ready(&self) -> bool {
        self.filled > 0
    }

    /// Bytes left before the next refill is required.
    pub fn remaining(&self) -> usize {
        self.filled - self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Copy the next `out.len()` bytes into `out`.
    pub fn fill(&mut self, out: &mut [u8]) -> Result<(), PrngError> {
        if !self.is_ready() {
            return Err(PrngError::NotReady);
        }

        let requested = out.len();
        let available = self.remaining();
        if requested > available {
            return Err(PrngError::BufferExhausted {
                requested,
                available,
            });
        }

        let range = self.cursor..self.cursor + requested;
        out.copy_from_slice(&self.buffer[range.clone()]);
        self.buffer[range].zeroize();
        self.cursor += requested;

        Ok(())
    }

    /// Return the next `n` bytes.
    pub fn next_bytes(&mut self, n: usize) -> Result<Zeroizing<Vec<u8>>, PrngError> {
        let mut out = Zeroizing::new(vec![0u8; n]);
        self.fill(&mut out)?;
        Ok(out)
    }

    fn invalidate(&mut self) {
        self.buffer.zeroize();
        self.filled = 0;
        self.cursor = 0;
    }
}

impl<S: EntropySource> CryptoPrng<S> {
    /// Fill the whole buffer from the entropy source and reset the cursor.
    ///
    /// On failure the buffer is wiped and the PRNG is left not ready, so no
    /// stale bytes can be drawn afterwards.
    pub async fn initialize(&mut self) -> Result<(), PrngError> {
        let mut fresh = Zeroizing::new(vec![0u8; self.buffer.len()]);

        if let Err(e) = self.source.fill(&mut fresh).await {
            tracing::error!("entropy source failed: {}", e);
            self.invalidate();
            return Err(e);
        }

        self.buffer = fresh;
        self.filled = self.buffer.len();
        self.cursor = 0;
        Ok(())
    }

    /// Alias for [`initialize`](Self::initialize), used after draws.
    pub async fn refill(&mut self) -> Result<(), PrngError> {
        self.initialize().await
    }

    /// Make sure at least `n` bytes can be drawn synchronously.
    ///
    /// Refills when the PRNG is not ready or has fewer than `n` bytes left.
    pub async fn ensure(&mut self, n: usize) -> Result<&mut Self, PrngError> {
        if n > self.capacity() {
            return Err(PrngError::RequestTooLarge {
                requested: n,
                capacity: self.capacity(),
            });
        }

        if !self.is_ready() || self.remaining() < n {
            self.initialize().await?;
        }

        Ok(self)
    }
}

impl<S> fmt::Debug for CryptoPrng<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoPrng")
            .field("capacity", &self.capacity())
            .field("remaining", &self.remaining())
            .field("buffer", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    /// Counting source so draws are predictable.
    struct CountingEntropy(AtomicU8);

    #[async_trait]
    impl EntropySource for CountingEntropy {
        async fn fill(&self, buf: &mut [u8]) -> Result<(), PrngError> {
            for byte in buf.iter_mut() {
                *byte = self.0.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }
    }

    struct BrokenEntropy;

    #[async_trait]
    impl EntropySource for BrokenEntropy {
        async fn fill(&self, _buf: &mut [u8]) -> Result<(), PrngError> {
            Err(PrngError::EntropyUnavailable("device offline".into()))
        }
    }

    #[test]
    fn test_draw_before_initialize_fails() {
        let mut prng = CryptoPrng::new();
        assert!(matches!(prng.next_bytes(8), Err(PrngError::NotReady)));
    }

    #[tokio::test]
    async fn test_draws_advance_cursor() {
        let mut prng = CryptoPrng::with_capacity(CountingEntropy(AtomicU8::new(1)), 16);
        prng.initialize().await.unwrap();

        let first = prng.next_bytes(4).unwrap();
        let second = prng.next_bytes(4).unwrap();

        assert_eq!(first.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(second.as_slice(), &[5, 6, 7, 8]);
        assert_eq!(prng.remaining(), 8);
    }

    #[tokio::test]
    async fn test_exhaustion() {
        let mut prng = CryptoPrng::with_capacity(CountingEntropy(AtomicU8::new(0)), 16);
        prng.initialize().await.unwrap();

        prng.next_bytes(12).unwrap();
        let err = prng.next_bytes(8).unwrap_err();
        assert!(matches!(
            err,
            PrngError::BufferExhausted {
                requested: 8,
                available: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_drawn_bytes_are_wiped() {
        let mut prng = CryptoPrng::with_capacity(CountingEntropy(AtomicU8::new(1)), 8);
        prng.initialize().await.unwrap();

        prng.next_bytes(3).unwrap();
        assert_eq!(&prng.buffer[..3], &[0, 0, 0]);
        assert_eq!(&prng.buffer[3..], &[4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_failed_source_leaves_prng_not_ready() {
        let mut prng = CryptoPrng::with_source(BrokenEntropy);

        let err = prng.initialize().await.unwrap_err();
        assert!(matches!(err, PrngError::EntropyUnavailable(_)));
        assert!(!prng.is_ready());
        assert!(matches!(prng.next_bytes(1), Err(PrngError::NotReady)));
    }

    #[tokio::test]
    async fn test_ensure_refills_when_low() {
        let mut prng = CryptoPrng::with_capacity(CountingEntropy(AtomicU8::new(0)), 16);
        prng.ensure(10).await.unwrap();
        prng.next_bytes(10).unwrap();

        prng.ensure(10).await.unwrap();
        assert_eq!(prng.remaining(), 16);
    }

    #[tokio::test]
    async fn test_ensure_rejects_oversized_requests() {
        let mut prng = CryptoPrng::with_capacity(CountingEntropy(AtomicU8::new(0)), 16);
        let err = prng.ensure(17).await.unwrap_err();
        assert!(matches!(err, PrngError::RequestTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_os_entropy_draws_differ() {
        let mut prng = CryptoPrng::new();
        prng.initialize().await.unwrap();

        let a = prng.next_bytes(32).unwrap();
        let b = prng.next_bytes(32).unwrap();
        assert_ne!(a.as_slice(), b.as_slice());
    }
}
