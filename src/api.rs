//! The client-facing driver interface.

use crate::error::AsioResult;
use pwasio_core::{AliasedSlot, Direction, HostCallbacks, SampleWords, SLOTS};
use std::sync::Arc;

/// Sample type code for 32-bit little-endian float.
pub const SAMPLE_TYPE_FLOAT32_LSB: i32 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelCounts {
    pub inputs: i32,
    pub outputs: i32,
}

/// Latencies in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latencies {
    pub input: i32,
    pub output: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizeRange {
    pub min: i32,
    pub max: i32,
    pub preferred: i32,
    /// 0: only `preferred` is supported.
    pub granularity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockSource {
    pub index: i32,
    pub channel: i32,
    pub group: i32,
    pub is_current: bool,
    pub name: String,
}

/// Sample position and the system time it was taken at, as hi/lo words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplePosition {
    pub samples: SampleWords,
    pub timestamp: SampleWords,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub direction: Direction,
    pub index: i32,
    pub is_active: bool,
    pub group: i32,
    pub sample_type: i32,
    pub name: String,
}

/// One requested channel; `buffers` is filled by `create_buffers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub direction: Direction,
    pub channel: i32,
    pub buffers: [Option<AliasedSlot>; SLOTS],
}

impl BufferInfo {
    pub fn input(channel: i32) -> Self {
        Self {
            direction: Direction::Input,
            channel,
            buffers: [None; SLOTS],
        }
    }

    pub fn output(channel: i32) -> Self {
        Self {
            direction: Direction::Output,
            channel,
            buffers: [None; SLOTS],
        }
    }
}

/// The driver method table a host calls into.
///
/// Every method except [`AsioDriver::init`], the name/version queries and
/// [`AsioDriver::error_message`] fails with an [`crate::AsioError`] whose
/// status code and message mirror the client API; the message is also kept
/// for one later `error_message` call.
pub trait AsioDriver: Send + Sync {
    /// Create the backend session. Idempotent.
    fn init(&self) -> bool;

    fn driver_name(&self) -> String;

    fn driver_version(&self) -> i32;

    /// Return and clear the last failing call's message.
    fn error_message(&self) -> String;

    fn start(&self) -> AsioResult<()>;

    fn stop(&self) -> AsioResult<()>;

    fn channels(&self) -> AsioResult<ChannelCounts>;

    fn latencies(&self) -> AsioResult<Latencies>;

    fn buffer_size(&self) -> AsioResult<BufferSizeRange>;

    fn can_sample_rate(&self, rate: f64) -> AsioResult<()>;

    fn sample_rate(&self) -> AsioResult<f64>;

    fn set_sample_rate(&self, rate: f64) -> AsioResult<()>;

    fn clock_sources(&self) -> AsioResult<Vec<ClockSource>>;

    fn set_clock_source(&self, index: i32) -> AsioResult<()>;

    fn sample_position(&self) -> AsioResult<SamplePosition>;

    fn channel_info(&self, direction: Direction, index: i32) -> AsioResult<ChannelInfo>;

    /// Allocate slots for `infos`, connect the streams and fill in each
    /// entry's two buffer pointers.
    fn create_buffers(
        &self,
        infos: &mut [BufferInfo],
        buffer_size: i32,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> AsioResult<()>;

    fn dispose_buffers(&self) -> AsioResult<()>;

    /// Open the configuration dialog on its own thread.
    fn control_panel(&self) -> AsioResult<()>;

    /// Not implemented.
    fn future(&self, selector: i32) -> AsioResult<()>;

    /// Not implemented.
    fn output_ready(&self) -> AsioResult<()>;
}
