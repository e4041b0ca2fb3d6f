//! Sample position counter.
//!
//! Written once per cycle by the owning processing thread, read from any
//! thread. A sequence counter lets readers retry instead of observing a
//! (samples, timestamp) pair from two different cycles.

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// A consistent (samples, nanoseconds) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub samples: u64,
    pub nanos: u64,
}

impl Position {
    pub fn sample_words(&self) -> SampleWords {
        SampleWords::from(self.samples)
    }

    pub fn time_words(&self) -> SampleWords {
        SampleWords::from(self.nanos)
    }
}

/// A 64-bit value as the client API's hi/lo 32-bit word pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleWords {
    pub hi: u32,
    pub lo: u32,
}

impl From<u64> for SampleWords {
    fn from(value: u64) -> Self {
        Self {
            hi: (value >> 32) as u32,
            lo: value as u32,
        }
    }
}

impl From<SampleWords> for u64 {
    fn from(words: SampleWords) -> Self {
        ((words.hi as u64) << 32) | words.lo as u64
    }
}

/// Single-writer seqlock over [`Position`].
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct PositionCounter {
    seq: AtomicU64,
    samples: AtomicU64,
    nanos: AtomicU64,
}

impl PositionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one cycle. Only the owning thread may call this.
    #[inline]
    pub fn advance(&self, frames: u64, now_ns: u64) -> Position {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        let samples = self.samples.load(Ordering::Relaxed).wrapping_add(frames);
        self.samples.store(samples, Ordering::Relaxed);
        self.nanos.store(now_ns, Ordering::Relaxed);

        self.seq.store(seq.wrapping_add(2), Ordering::Release);
        Position {
            samples,
            nanos: now_ns,
        }
    }

    #[inline]
    pub fn snapshot(&self) -> Position {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let samples = self.samples.load(Ordering::Relaxed);
            let nanos = self.nanos.load(Ordering::Relaxed);
            fence(Ordering::Acquire);

            if self.seq.load(Ordering::Relaxed) == before {
                return Position { samples, nanos };
            }
        }
    }
}
