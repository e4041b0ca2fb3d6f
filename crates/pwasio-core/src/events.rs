//! [`StreamEvents`] for the driver's input and output streams.

use crate::arena::SAMPLE_BYTES;
use crate::backend::{BackendBuffer, Chunk, Cycle, StreamEvents};
use crate::invoke::{Invocation, InvokeSender};
use crate::ports::{Direction, PortRegistry};
use crate::swap::{SlotOwner, SwapEngine};
use std::sync::Arc;
use tracing::warn;

/// Stream callbacks for one direction.
///
/// The input stream's `process` is the frame-ready signal; it is forwarded to
/// the owning thread and never runs the swap itself. The output stream's
/// `process` queues the slot the last swap completed.
pub struct PortEvents {
    direction: Direction,
    registry: Arc<PortRegistry>,
    engine: Arc<SwapEngine>,
    invoke: Option<InvokeSender>,
}

impl PortEvents {
    pub fn input(
        registry: Arc<PortRegistry>,
        engine: Arc<SwapEngine>,
        invoke: InvokeSender,
    ) -> Self {
        Self {
            direction: Direction::Input,
            registry,
            engine,
            invoke: Some(invoke),
        }
    }

    pub fn output(registry: Arc<PortRegistry>, engine: Arc<SwapEngine>) -> Self {
        Self {
            direction: Direction::Output,
            registry,
            engine,
            invoke: None,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn process_input(&self, cycle: &mut Cycle<'_>) -> bool {
        let slot = cycle
            .buffer
            .and_then(|id| self.registry.slot_for_buffer(Direction::Input, id));

        if let Some(slot) = slot {
            if self.engine.owner(slot) == SlotOwner::Client {
                self.engine.stats().violations.incr();
                warn!("backend filled input slot {slot} while the client owns it");
            }
            for channel in self.registry.channels(Direction::Input) {
                channel.slot(slot).take_ready();
            }
        }

        if let Some(invoke) = &self.invoke {
            invoke.try_send(Invocation::FrameReady {
                slot,
                frames: cycle.frames,
                now_ns: cycle.now_ns,
            });
        }

        // Captured data stays in the arena; the buffer goes straight back.
        cycle.buffer.is_some()
    }

    fn process_output(&self, cycle: &mut Cycle<'_>) -> bool {
        let Some(id) = cycle.buffer else {
            return false;
        };

        let size = (self.registry.config().buffer_size * SAMPLE_BYTES) as u32;
        for chunk in cycle.chunks.iter_mut() {
            *chunk = Chunk {
                offset: 0,
                size,
                stride: SAMPLE_BYTES as i32,
                flags: 0,
            };
        }

        if let Some(slot) = self.registry.slot_for_buffer(Direction::Output, id) {
            for channel in self.registry.channels(Direction::Output) {
                channel.slot(slot).take_ready();
            }
        }
        true
    }
}

impl StreamEvents for PortEvents {
    fn process(&self, cycle: &mut Cycle<'_>) -> bool {
        match self.direction {
            Direction::Input => self.process_input(cycle),
            Direction::Output => self.process_output(cycle),
        }
    }

    fn add_buffer(&self, buffer: &mut BackendBuffer) {
        if let Some((_, planes)) = self.registry.add_buffer(self.direction, buffer.id) {
            buffer.planes = planes;
        }
    }

    fn remove_buffer(&self, buffer_id: u32) {
        self.registry.remove_buffer(self.direction, buffer_id);
    }
}

impl std::fmt::Debug for PortEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortEvents")
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}
