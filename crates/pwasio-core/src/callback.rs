//! Host callback interface invoked from the owning processing thread.

use crate::position::SampleWords;

/// Host notification selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageSelector {
    Supported = 1,
    EngineVersion = 2,
    ResetRequest = 3,
    BufferSizeChange = 4,
    ResyncRequest = 5,
    LatenciesChanged = 6,
    SupportsTimeInfo = 7,
    SupportsTimeCode = 8,
    MmcCommand = 9,
    SupportsInputMonitor = 10,
    SupportsInputGain = 11,
    SupportsInputMeter = 12,
    SupportsOutputGain = 13,
    SupportsOutputMeter = 14,
    Overload = 15,
}

impl MessageSelector {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use MessageSelector::*;
        Some(match code {
            1 => Supported,
            2 => EngineVersion,
            3 => ResetRequest,
            4 => BufferSizeChange,
            5 => ResyncRequest,
            6 => LatenciesChanged,
            7 => SupportsTimeInfo,
            8 => SupportsTimeCode,
            9 => MmcCommand,
            10 => SupportsInputMonitor,
            11 => SupportsInputGain,
            12 => SupportsInputMeter,
            13 => SupportsOutputGain,
            14 => SupportsOutputMeter,
            15 => Overload,
            _ => return None,
        })
    }
}

/// Validity flags carried in [`AsioTime`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeInfoFlags(u32);

impl TimeInfoFlags {
    pub const SYSTEM_TIME_VALID: Self = Self(0x1);
    pub const SAMPLE_POSITION_VALID: Self = Self(0x2);
    pub const SAMPLE_RATE_VALID: Self = Self(0x4);
    pub const SPEED_VALID: Self = Self(0x8);
    pub const SAMPLE_RATE_CHANGED: Self = Self(0x10);
    pub const CLOCK_SOURCE_CHANGED: Self = Self(0x20);

    /// What every processing cycle reports.
    pub const CYCLE: Self = Self(0x7);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for TimeInfoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-cycle timing handed to [`HostCallbacks::swap_buffers_time_info`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AsioTime {
    pub sample_position: SampleWords,
    /// Backend clock, nanoseconds.
    pub system_time: SampleWords,
    pub sample_rate: f64,
    pub flags: TimeInfoFlags,
}

/// Callbacks the host registers at buffer creation.
///
/// `swap_buffers` and `swap_buffers_time_info` run on the owning processing
/// thread at realtime priority. Implementations should not block.
pub trait HostCallbacks: Send + Sync {
    /// Slot `index` is now the client's to fill (outputs) and read (inputs).
    fn swap_buffers(&self, index: usize, direct_process: bool);

    fn sample_rate_changed(&self, _rate: f64) {}

    /// Host notification. Returns the host's answer, 0 for "unsupported".
    fn message(&self, _selector: MessageSelector, _value: i32) -> i32 {
        0
    }

    /// Used instead of `swap_buffers` when the host answered
    /// [`MessageSelector::SupportsTimeInfo`].
    fn swap_buffers_time_info(&self, time: &AsioTime, index: usize, direct_process: bool) {
        let _ = time;
        self.swap_buffers(index, direct_process);
    }
}
