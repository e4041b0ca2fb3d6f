//! Double-buffer swap protocol.
//!
//! Each channel has two slots. Per cycle the owning thread hands slot `s`
//! (the current swap index) to the client, runs the host's swap callback,
//! toggles the index, advances the position and marks slot `s` ready so the
//! output stream queues it back to the backend.
//!
//! Slot ownership transitions are compare-and-swap checked. A failed check is
//! counted as a violation rather than enforced: the protocol has no
//! backpressure, so an overrunning client shows up as drift in these counters.

use crate::arena::SLOTS;
use crate::backend::BackendStream;
use crate::callback::{AsioTime, HostCallbacks, TimeInfoFlags};
use crate::lockfree::AtomicCounter;
use crate::ports::{Direction, PortRegistry};
use crate::position::{Position, PositionCounter};
use crate::rt::current_tid;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Who may write a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotOwner {
    Backend = 0,
    Client = 1,
}

impl SlotOwner {
    fn from_u8(value: u8) -> Self {
        if value == SlotOwner::Client as u8 {
            SlotOwner::Client
        } else {
            SlotOwner::Backend
        }
    }
}

/// Realtime counters, readable from any thread.
#[derive(Debug, Default)]
pub struct SwapStats {
    pub cycles: AtomicCounter,
    /// Frame-ready events dropped because the invocation channel was full.
    pub overruns: AtomicCounter,
    /// Failed ownership transitions or cycles run off the owning thread.
    pub violations: AtomicCounter,
    /// Queue-back steps skipped because a slot was never negotiated.
    pub unnegotiated: AtomicCounter,
    /// Output process triggers the backend refused after queue-back.
    pub dropped_triggers: AtomicCounter,
}

/// Static inputs of a [`SwapEngine`].
pub struct SwapContext {
    pub registry: Arc<PortRegistry>,
    pub callbacks: Arc<dyn HostCallbacks>,
    pub output: Arc<dyn BackendStream>,
    /// Host answered the time-info capability query.
    pub time_info: bool,
}

pub struct SwapEngine {
    registry: Arc<PortRegistry>,
    callbacks: Arc<dyn HostCallbacks>,
    output: Arc<dyn BackendStream>,
    time_info: bool,
    sample_rate: f64,
    index: AtomicUsize,
    owners: [AtomicU8; SLOTS],
    owning_tid: AtomicI32,
    position: PositionCounter,
    stats: Arc<SwapStats>,
}

impl SwapEngine {
    pub fn new(context: SwapContext) -> Self {
        let sample_rate = context.registry.config().sample_rate as f64;
        Self {
            registry: context.registry,
            callbacks: context.callbacks,
            output: context.output,
            time_info: context.time_info,
            sample_rate,
            index: AtomicUsize::new(0),
            owners: [
                AtomicU8::new(SlotOwner::Backend as u8),
                AtomicU8::new(SlotOwner::Backend as u8),
            ],
            owning_tid: AtomicI32::new(0),
            position: PositionCounter::new(),
            stats: Arc::new(SwapStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    /// Slot the next callback hands to the client.
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    pub fn owner(&self, slot: usize) -> SlotOwner {
        SlotOwner::from_u8(self.owners[slot & 1].load(Ordering::Acquire))
    }

    pub fn position(&self) -> Position {
        self.position.snapshot()
    }

    pub fn stats(&self) -> &Arc<SwapStats> {
        &self.stats
    }

    pub fn uses_time_info(&self) -> bool {
        self.time_info
    }

    /// Make the calling thread the only one allowed to run cycles.
    pub fn bind_owner(&self) {
        self.owning_tid.store(current_tid(), Ordering::Release);
    }

    pub fn unbind_owner(&self) {
        self.owning_tid.store(0, Ordering::Release);
    }

    /// Run one cycle of `frames` frames stamped `now_ns`.
    ///
    /// # RT Safety
    /// No allocation or locking; called once per cycle on the owning thread.
    pub fn cycle(&self, frames: u32, now_ns: u64) {
        if self.owning_tid.load(Ordering::Acquire) != current_tid() {
            self.stats.violations.incr();
            warn!("swap cycle requested off the owning thread, skipped");
            return;
        }

        let slot = self.index.load(Ordering::Relaxed) & 1;

        // The client takes slot `slot`; the other one stays with the backend.
        self.transfer(slot, SlotOwner::Backend, SlotOwner::Client);
        if self.owner(slot ^ 1) != SlotOwner::Backend {
            self.stats.violations.incr();
            warn!("slot {} still client-owned during swap({slot})", slot ^ 1);
        }

        let position = self.position.snapshot();
        if self.time_info {
            let time = AsioTime {
                sample_position: position.sample_words(),
                system_time: now_ns.into(),
                sample_rate: self.sample_rate,
                flags: TimeInfoFlags::CYCLE,
            };
            self.callbacks.swap_buffers_time_info(&time, slot, true);
        } else {
            self.callbacks.swap_buffers(slot, true);
        }

        self.index.store(slot ^ 1, Ordering::Release);
        self.position.advance(frames as u64, now_ns);

        self.transfer(slot, SlotOwner::Client, SlotOwner::Backend);
        self.queue_back(slot);
        self.stats.cycles.incr();

        if let Err(e) = self.output.trigger_process() {
            self.stats.dropped_triggers.incr();
            debug!("output trigger dropped: {e}");
        }
    }

    fn transfer(&self, slot: usize, from: SlotOwner, to: SlotOwner) {
        if self.owners[slot]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.violations.incr();
            warn!("slot {slot} ownership {from:?} -> {to:?} failed");
            self.owners[slot].store(to as u8, Ordering::Release);
        }
    }

    fn queue_back(&self, slot: usize) {
        for direction in Direction::ALL {
            if !self.registry.is_negotiated(direction, slot) {
                self.stats.unnegotiated.incr();
                continue;
            }
            for channel in self.registry.channels(direction) {
                if channel.is_active() {
                    channel.slot(slot).mark_ready();
                }
            }
        }
    }
}

impl std::fmt::Debug for SwapEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapEngine")
            .field("index", &self.index())
            .field("time_info", &self.time_info)
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}
