//! Backend collaborator interface.
//!
//! A backend owns the processing loop and a pair of streams. The driver
//! registers [`StreamEvents`] on each stream and [`ThreadUtils`] on the
//! backend; everything else flows through these callbacks.

use crate::arena::AliasedSlot;
use crate::error::BackendError;
use crate::ports::Direction;
use crate::rt::ThreadUtils;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Buffers negotiated per stream.
pub const BUFFERS_PER_STREAM: u32 = 2;

/// Stream properties set at session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProps {
    /// Node name shown by the backend, derived from the host executable.
    pub name: String,
    pub media_type: &'static str,
    pub category: &'static str,
    pub role: &'static str,
    pub always_process: bool,
    pub force_rate: u32,
    pub force_quantum: u32,
}

impl StreamProps {
    pub fn new(name: impl Into<String>, direction: Direction, rate: u32, quantum: u32) -> Self {
        Self {
            name: name.into(),
            media_type: "Audio",
            category: match direction {
                Direction::Input => "Capture",
                Direction::Output => "Playback",
            },
            role: "Music",
            always_process: true,
            force_rate: rate,
            force_quantum: quantum,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
}

/// Non-interleaved audio format requested at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u32,
}

/// Buffer parameters offered at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferNegotiation {
    pub buffers: u32,
    /// Bytes per plane.
    pub size: usize,
    pub stride: usize,
    pub align: usize,
}

impl BufferNegotiation {
    /// `align` is the arena slot stride, so planes start on page boundaries.
    pub fn new(frames: usize, align: usize) -> Self {
        let stride = std::mem::size_of::<f32>();
        Self {
            buffers: BUFFERS_PER_STREAM,
            size: frames * stride,
            stride,
            align,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    pub autoconnect: bool,
    pub driver: bool,
    pub rt_process: bool,
    /// The client supplies buffer memory in `add_buffer`.
    pub alloc_buffers: bool,
}

impl ConnectFlags {
    pub fn new(autoconnect: bool) -> Self {
        Self {
            autoconnect,
            driver: false,
            rt_process: true,
            alloc_buffers: true,
        }
    }

    /// The stream drives the graph clock.
    pub fn with_driver(mut self) -> Self {
        self.driver = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    MemFd,
}

/// One plane (channel) of a backend buffer, pointing into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPlane {
    pub kind: DataKind,
    pub fd: RawFd,
    pub map_offset: usize,
    pub max_size: usize,
    pub data: AliasedSlot,
}

/// A backend buffer being added to a stream. The driver fills `planes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendBuffer {
    pub id: u32,
    pub planes: Vec<DataPlane>,
}

impl BackendBuffer {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            planes: Vec::new(),
        }
    }
}

/// Valid-data descriptor of one plane, written before queueing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
    pub flags: i32,
}

/// One processing cycle as seen by a stream.
#[derive(Debug)]
pub struct Cycle<'a> {
    /// Buffer dequeued for this cycle, if any.
    pub buffer: Option<u32>,
    pub frames: u32,
    /// Backend clock.
    pub now_ns: u64,
    /// One chunk per plane of `buffer`.
    pub chunks: &'a mut [Chunk],
}

/// Callbacks a stream invokes on its processing thread.
pub trait StreamEvents: Send + Sync {
    /// Returns `true` to queue `cycle.buffer` back to the backend.
    ///
    /// # RT Safety
    /// Runs on the backend's realtime thread; must not block or allocate.
    fn process(&self, cycle: &mut Cycle<'_>) -> bool;

    fn add_buffer(&self, buffer: &mut BackendBuffer);

    fn remove_buffer(&self, buffer_id: u32);
}

/// A backend stream in one direction.
pub trait BackendStream: Send + Sync {
    fn direction(&self) -> Direction;

    fn connect(
        &self,
        format: AudioFormat,
        negotiation: BufferNegotiation,
        flags: ConnectFlags,
        events: Arc<dyn StreamEvents>,
    ) -> Result<(), BackendError>;

    /// Removes every negotiated buffer before returning.
    fn disconnect(&self) -> Result<(), BackendError>;

    fn is_connected(&self) -> bool;

    /// Schedule a process call for this stream on the processing thread.
    fn trigger_process(&self) -> Result<(), BackendError>;
}

/// The backend session.
pub trait Backend: Send + Sync {
    /// Used as the clock source name.
    fn name(&self) -> &str;

    /// Register the thread hooks used for every backend thread.
    fn set_thread_utils(&self, utils: Arc<dyn ThreadUtils>);

    fn create_stream(
        &self,
        direction: Direction,
        props: &StreamProps,
    ) -> Result<Arc<dyn BackendStream>, BackendError>;

    /// Drop the session's stream in `direction`, disconnecting it first.
    fn destroy_stream(&self, direction: Direction);

    /// Start the processing loop.
    fn start(&self) -> Result<(), BackendError>;

    /// Stop the processing loop and join its thread.
    fn stop(&self) -> Result<(), BackendError>;

    fn is_running(&self) -> bool;
}
