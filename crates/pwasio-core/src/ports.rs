//! Port registry: logical channels, their arena slots and backend buffer negotiation.

use crate::arena::{AliasedSlot, Arena, SAMPLE_BYTES, SLOTS};
use crate::backend::{DataKind, DataPlane};
use crate::config::StreamConfig;
use crate::lockfree::AtomicFlag;
use crate::{Error, Result};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Stream direction as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Input, Direction::Output];

    /// Channel name prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }

    fn table(self) -> usize {
        match self {
            Direction::Input => 0,
            Direction::Output => 1,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// A client request for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub direction: Direction,
    /// Signed because the client API carries it that way; negatives are rejected.
    pub index: i32,
}

impl ChannelSpec {
    pub fn input(index: i32) -> Self {
        Self {
            direction: Direction::Input,
            index,
        }
    }

    pub fn output(index: i32) -> Self {
        Self {
            direction: Direction::Output,
            index,
        }
    }
}

/// One of the two alternating regions of a channel.
#[derive(Debug)]
pub struct BufferSlot {
    offset: usize,
    data: AliasedSlot,
    ready: AtomicFlag,
}

impl BufferSlot {
    /// Byte offset in the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn data(&self) -> AliasedSlot {
        self.data
    }

    /// Whether the slot has been completed and awaits queueing.
    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    pub fn mark_ready(&self) {
        self.ready.set(true);
    }

    /// Clear the ready flag, returning its previous value.
    pub fn take_ready(&self) -> bool {
        self.ready.swap(false)
    }
}

/// A configured channel. Active once the client has requested it.
#[derive(Debug)]
pub struct Channel {
    direction: Direction,
    index: usize,
    name: String,
    active: AtomicFlag,
    slots: [BufferSlot; SLOTS],
}

impl Channel {
    fn new(arena: &Arena, direction: Direction, index: usize) -> Self {
        let layout = arena.layout();
        let slot = |b: usize| BufferSlot {
            offset: layout.offset(direction, index, b),
            data: arena.slot(direction, index, b),
            ready: AtomicFlag::new(false),
        };

        Self {
            direction,
            index,
            name: format!("{}_{}", direction.prefix(), index),
            active: AtomicFlag::new(false),
            slots: [slot(0), slot(1)],
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn slot(&self, slot: usize) -> &BufferSlot {
        &self.slots[slot & 1]
    }

    /// Both slot pointers, slot 0 first.
    pub fn pointers(&self) -> [AliasedSlot; SLOTS] {
        [self.slots[0].data, self.slots[1].data]
    }
}

const NO_BUFFER: u32 = u32::MAX;

/// Backend buffer ids negotiated for one stream, indexed by slot.
#[derive(Debug)]
struct Negotiation {
    buffers: [AtomicU32; SLOTS],
}

impl Negotiation {
    fn new() -> Self {
        Self {
            buffers: [AtomicU32::new(NO_BUFFER), AtomicU32::new(NO_BUFFER)],
        }
    }
}

/// All channels of an allocated-buffers session plus the arena they live in.
///
/// Channel slot pointers stay fixed for the registry's lifetime.
#[derive(Debug)]
pub struct PortRegistry {
    inputs: Vec<Channel>,
    outputs: Vec<Channel>,
    negotiation: [Negotiation; 2],
    config: StreamConfig,
    // Dropped last so no channel outlives the mapping.
    arena: Arena,
}

impl PortRegistry {
    /// Validate `specs` against `config`, then map the arena and activate the
    /// requested channels.
    ///
    /// Validation completes before any resource is acquired, so a rejected
    /// request leaves nothing behind.
    pub fn allocate(config: &StreamConfig, specs: &[ChannelSpec]) -> Result<Self> {
        for spec in specs {
            let count = match spec.direction {
                Direction::Input => config.n_inputs,
                Direction::Output => config.n_outputs,
            };
            if spec.index < 0 || spec.index as usize >= count {
                return Err(Error::InvalidChannel {
                    direction: spec.direction,
                    index: spec.index,
                });
            }
        }

        let arena = Arena::create(config.buffer_size, config.n_inputs)?;

        let inputs = (0..config.n_inputs)
            .map(|i| Channel::new(&arena, Direction::Input, i))
            .collect::<Vec<_>>();
        let outputs = (0..config.n_outputs)
            .map(|i| Channel::new(&arena, Direction::Output, i))
            .collect::<Vec<_>>();

        let registry = Self {
            inputs,
            outputs,
            negotiation: [Negotiation::new(), Negotiation::new()],
            config: *config,
            arena,
        };

        for spec in specs {
            if let Some(channel) = registry.channel(spec.direction, spec.index as usize) {
                channel.active.set(true);
            }
        }

        debug!(
            "allocated {} of {} channels (fd {})",
            registry.active_count(),
            config.n_inputs + config.n_outputs,
            registry.arena.fd()
        );

        Ok(registry)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn channels(&self, direction: Direction) -> &[Channel] {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    pub fn channel(&self, direction: Direction, index: usize) -> Option<&Channel> {
        self.channels(direction).get(index)
    }

    pub fn active_count(&self) -> usize {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .filter(|c| c.is_active())
            .count()
    }

    /// Clear every active flag. Pointers stay valid until the registry drops.
    pub fn deactivate_all(&self) {
        for channel in self.inputs.iter().chain(self.outputs.iter()) {
            channel.active.set(false);
            for slot in &channel.slots {
                slot.ready.set(false);
            }
        }
    }

    /// Assign a newly added backend buffer to the first free slot and
    /// describe its planes, one per configured channel.
    ///
    /// Returns `None` when both slots are already negotiated.
    pub fn add_buffer(
        &self,
        direction: Direction,
        buffer_id: u32,
    ) -> Option<(usize, Vec<DataPlane>)> {
        if buffer_id == NO_BUFFER {
            return None;
        }
        let table = &self.negotiation[direction.table()];
        let slot = (0..SLOTS).find(|&b| {
            table.buffers[b]
                .compare_exchange(NO_BUFFER, buffer_id, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });

        let Some(slot) = slot else {
            warn!("{direction} buffer {buffer_id} rejected: both slots negotiated");
            return None;
        };

        let planes = self
            .channels(direction)
            .iter()
            .map(|channel| self.plane(channel, slot))
            .collect();

        debug!("{direction} buffer {buffer_id} negotiated as slot {slot}");
        Some((slot, planes))
    }

    fn plane(&self, channel: &Channel, slot: usize) -> DataPlane {
        let slot = channel.slot(slot);
        DataPlane {
            kind: DataKind::MemFd,
            fd: self.fd(),
            map_offset: slot.offset,
            max_size: self.config.buffer_size * SAMPLE_BYTES,
            data: slot.data,
        }
    }

    /// Forget a backend buffer. Unknown ids are ignored.
    pub fn remove_buffer(&self, direction: Direction, buffer_id: u32) {
        let table = &self.negotiation[direction.table()];
        for (b, entry) in table.buffers.iter().enumerate() {
            if entry
                .compare_exchange(buffer_id, NO_BUFFER, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!("{direction} buffer {buffer_id} released from slot {b}");
            }
        }
    }

    /// Slot a backend buffer was negotiated into.
    pub fn slot_for_buffer(&self, direction: Direction, buffer_id: u32) -> Option<usize> {
        if buffer_id == NO_BUFFER {
            return None;
        }
        let table = &self.negotiation[direction.table()];
        table
            .buffers
            .iter()
            .position(|entry| entry.load(Ordering::Acquire) == buffer_id)
    }

    pub fn is_negotiated(&self, direction: Direction, slot: usize) -> bool {
        self.negotiation[direction.table()].buffers[slot & 1].load(Ordering::Acquire) != NO_BUFFER
    }

    fn fd(&self) -> RawFd {
        self.arena.fd()
    }
}
