//! Test helpers and fixtures for pwasio integration tests
//!
//! Drivers run on the loopback backend in manual clock mode, so every test
//! steps an exact number of cycles. Realtime elevation goes through a
//! scheduler that records requests instead of touching the OS, so the suite
//! runs unprivileged.

#![allow(dead_code)]

use parking_lot::Mutex;
use pwasio::core::AliasedSlot;
use pwasio::prelude::*;
use pwasio::{AsioTime, HostPriority, HostScheduler};
use std::collections::HashMap;
use std::io;
use std::time::Duration;

/// Matches the default configuration.
pub const TEST_BUFFER_SIZE: usize = 256;

pub const TEST_SAMPLE_RATE: usize = 48000;

/// Generous bound for one manual cycle on a loaded CI machine.
pub const CYCLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Scheduler that accepts every request and remembers it.
#[derive(Debug, Default)]
pub struct PermissiveScheduler {
    priorities: Mutex<HashMap<i32, HostPriority>>,
    fifo: Mutex<HashMap<i32, Option<i32>>>,
}

impl PermissiveScheduler {
    pub fn priority(&self, tid: i32) -> Option<HostPriority> {
        self.priorities.lock().get(&tid).copied()
    }

    pub fn fifo(&self, tid: i32) -> Option<Option<i32>> {
        self.fifo.lock().get(&tid).copied()
    }

    /// Threads currently at `priority`.
    pub fn count(&self, priority: HostPriority) -> usize {
        self.priorities
            .lock()
            .values()
            .filter(|&&p| p == priority)
            .count()
    }
}

impl HostScheduler for PermissiveScheduler {
    fn set_priority(&self, tid: i32, priority: HostPriority) -> io::Result<()> {
        self.priorities.lock().insert(tid, priority);
        Ok(())
    }

    fn set_fifo(&self, tid: i32, fifo: Option<i32>) -> io::Result<()> {
        self.fifo.lock().insert(tid, fifo);
        Ok(())
    }

    fn acquire_privileges(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Scheduler whose privilege check always fails.
#[derive(Debug, Default)]
pub struct UnprivilegedScheduler;

impl HostScheduler for UnprivilegedScheduler {
    fn set_priority(&self, _tid: i32, _priority: HostPriority) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }

    fn set_fifo(&self, _tid: i32, _fifo: Option<i32>) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }

    fn acquire_privileges(&self) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }
}

/// Host side of the client API.
///
/// Records every swap and message. On each swap it copies input channel `n`
/// into output channel `n` for the slot it was handed, if buffers are attached.
#[derive(Default)]
pub struct RecordingHost {
    pub time_info: bool,
    pub swaps: Mutex<Vec<usize>>,
    pub times: Mutex<Vec<AsioTime>>,
    pub threads: Mutex<Vec<std::thread::ThreadId>>,
    pub messages: Mutex<Vec<MessageSelector>>,
    buffers: Mutex<Vec<BufferInfo>>,
}

impl RecordingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Host that answers yes to the time-info query.
    pub fn with_time_info() -> Arc<Self> {
        Arc::new(Self {
            time_info: true,
            ..Self::default()
        })
    }

    pub fn attach(&self, infos: &[BufferInfo]) {
        *self.buffers.lock() = infos.to_vec();
    }

    pub fn swap_count(&self) -> usize {
        self.swaps.lock().len()
    }

    fn passthrough(&self, index: usize) {
        let buffers = self.buffers.lock();
        let slot = |direction: Direction, channel: i32| -> Option<AliasedSlot> {
            buffers
                .iter()
                .find(|info| info.direction == direction && info.channel == channel)
                .and_then(|info| info.buffers[index])
        };

        for info in buffers.iter().filter(|i| i.direction == Direction::Output) {
            let (Some(out), Some(input)) = (
                slot(Direction::Output, info.channel),
                slot(Direction::Input, info.channel),
            ) else {
                continue;
            };
            // SAFETY: slot `index` belongs to the client for this callback.
            unsafe {
                out.as_mut_slice()[..TEST_BUFFER_SIZE]
                    .copy_from_slice(&input.as_slice()[..TEST_BUFFER_SIZE]);
            }
        }
    }
}

impl HostCallbacks for RecordingHost {
    fn swap_buffers(&self, index: usize, direct_process: bool) {
        assert!(direct_process);
        self.passthrough(index);
        self.swaps.lock().push(index);
        self.threads.lock().push(std::thread::current().id());
    }

    fn message(&self, selector: MessageSelector, _value: i32) -> i32 {
        self.messages.lock().push(selector);
        match selector {
            MessageSelector::SupportsTimeInfo => self.time_info as i32,
            MessageSelector::ResetRequest => 1,
            _ => 0,
        }
    }

    fn swap_buffers_time_info(&self, time: &AsioTime, index: usize, direct_process: bool) {
        self.times.lock().push(*time);
        self.swap_buffers(index, direct_process);
    }
}

/// Route driver logs to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A manual-clock loopback backend.
pub fn loopback() -> LoopbackBackend {
    init_tracing();
    LoopbackBackend::new(ClockMode::Manual).with_cycle_timeout(CYCLE_TIMEOUT)
}

/// A driver over a fresh loopback backend, with `store` pre-seeded.
pub fn test_driver_with(store: Arc<MemoryStore>) -> (Driver, LoopbackBackend) {
    let backend = loopback();
    let driver = Driver::builder(Arc::new(backend.clone()))
        .store(store)
        .scheduler(Arc::new(PermissiveScheduler::default()))
        .stream_name("test-host")
        .build()
        .expect("Failed to build test driver");
    (driver, backend)
}

/// A driver with the default configuration.
pub fn test_driver() -> (Driver, LoopbackBackend) {
    test_driver_with(Arc::new(MemoryStore::new()))
}

/// An initialized driver with buffers for `infos` and `host` attached.
pub fn driver_with_buffers(
    infos: &mut [BufferInfo],
    host: &Arc<RecordingHost>,
) -> (Driver, LoopbackBackend) {
    let (driver, backend) = test_driver();
    assert!(driver.init());
    let callbacks: Arc<dyn HostCallbacks> = Arc::clone(host) as Arc<dyn HostCallbacks>;
    driver
        .create_buffers(infos, TEST_BUFFER_SIZE as i32, callbacks)
        .expect("Failed to create buffers");
    host.attach(infos);
    (driver, backend)
}

/// First two inputs and outputs.
pub fn stereo_infos() -> Vec<BufferInfo> {
    vec![
        BufferInfo::input(0),
        BufferInfo::input(1),
        BufferInfo::output(0),
        BufferInfo::output(1),
    ]
}

/// Open file descriptors of this process.
pub fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count())
        .unwrap_or(0)
}

/// Absolute frame index as a sample, exact for the sizes used here.
pub fn ramp(_channel: usize, frame: u64) -> f32 {
    frame as f32
}
