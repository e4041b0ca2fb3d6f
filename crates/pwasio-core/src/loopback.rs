//! Software backend for tests and demos.
//!
//! Runs its own data loop on a thread created through the registered
//! [`ThreadUtils`], negotiates two buffers per stream, writes a configurable
//! signal into the input planes each cycle and records every queued output
//! plane into a per-channel sink.
//!
//! In [`ClockMode::Manual`] nothing happens until [`LoopbackBackend::run_cycles`]
//! is called, which makes cycle counts exact. [`ClockMode::FreeRunning`] ticks
//! every `quantum / rate` seconds.

use crate::arena::SAMPLE_BYTES;
use crate::backend::{
    AudioFormat, Backend, BackendBuffer, BackendStream, BufferNegotiation, Chunk, ConnectFlags,
    Cycle, StreamEvents, StreamProps,
};
use crate::error::BackendError;
use crate::lockfree::{AtomicCounter, AtomicFlag};
use crate::ports::Direction;
use crate::rt::{RtPriority, RtThread, ThreadExit, ThreadUtils};
use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CONTROL_CAPACITY: usize = 64;
const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(2);
const THREAD_NAME: &str = "loopback-data-loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockMode {
    /// Cycles run only on [`LoopbackBackend::run_cycles`].
    #[default]
    Manual,
    /// Cycles run on a timer.
    FreeRunning,
}

/// Input signal: `(channel, absolute frame) -> sample`.
pub type SignalFn = Box<dyn Fn(usize, u64) -> f32 + Send + Sync>;

enum Control {
    Cycle,
    Output,
    Shutdown,
}

#[derive(Debug, Default)]
struct Faults {
    create: HashSet<Direction>,
    connect: HashSet<Direction>,
}

struct Shared {
    name: String,
    mode: ClockMode,
    cycle_timeout: Duration,
    utils: Mutex<Option<Arc<dyn ThreadUtils>>>,
    streams: Mutex<Vec<Arc<LoopbackStream>>>,
    thread: Mutex<Option<RtThread>>,
    control_tx: Sender<Control>,
    control_rx: Receiver<Control>,
    queued_tx: Sender<u64>,
    queued_rx: Receiver<u64>,
    running: AtomicFlag,
    faults: Mutex<Faults>,
    signal: ArcSwap<SignalFn>,
    sinks: Mutex<Vec<Vec<f32>>>,
    /// (rate, quantum) from the most recent stream properties.
    timing: Mutex<(u32, u32)>,
    frames: AtomicU64,
    input_cycles: AtomicCounter,
    output_cycles: AtomicCounter,
    epoch: Instant,
}

impl Shared {
    fn stream(&self, direction: Direction) -> Option<Arc<LoopbackStream>> {
        self.streams
            .lock()
            .iter()
            .find(|s| s.direction == direction)
            .cloned()
    }

    fn period(&self) -> Duration {
        let (rate, quantum) = *self.timing.lock();
        Duration::from_nanos(quantum as u64 * 1_000_000_000 / rate.max(1) as u64)
    }

    fn now_ns(&self, frames: u64) -> u64 {
        match self.mode {
            ClockMode::Manual => {
                let (rate, _) = *self.timing.lock();
                frames * 1_000_000_000 / rate.max(1) as u64
            }
            ClockMode::FreeRunning => self.epoch.elapsed().as_nanos() as u64,
        }
    }

    fn input_cycle(&self) {
        let (_, quantum) = *self.timing.lock();
        let start = self.frames.fetch_add(quantum as u64, Ordering::AcqRel);
        let now_ns = self.now_ns(start);
        let signal = self.signal.load_full();

        let Some(stream) = self.stream(Direction::Input) else {
            return;
        };
        let fill = |buffer: &BackendBuffer| {
            for (channel, plane) in buffer.planes.iter().enumerate() {
                // SAFETY: the backend owns the slot being filled; the swap
                // protocol keeps the client on the other one.
                let data = unsafe { plane.data.as_mut_slice() };
                for (i, sample) in data.iter_mut().enumerate() {
                    *sample = signal(channel, start + i as u64);
                }
            }
        };
        stream.run(quantum, now_ns, fill, |_, _| {});
        self.input_cycles.incr();
    }

    fn output_cycle(&self) {
        let (_, quantum) = *self.timing.lock();
        let now_ns = self.now_ns(self.frames.load(Ordering::Acquire));
        let Some(stream) = self.stream(Direction::Output) else {
            return;
        };

        let record = |buffer: &BackendBuffer, chunks: &[Chunk]| {
            let mut sinks = self.sinks.lock();
            if sinks.len() < buffer.planes.len() {
                sinks.resize_with(buffer.planes.len(), Vec::new);
            }
            let planes = buffer.planes.iter().zip(chunks);
            for ((plane, chunk), sink) in planes.zip(sinks.iter_mut()) {
                let samples = (chunk.size as usize / SAMPLE_BYTES).min(plane.data.len());
                // SAFETY: the slot was queued back by the swap protocol and
                // is only read here.
                let data = unsafe { plane.data.as_slice() };
                sink.extend_from_slice(&data[..samples]);
            }
        };
        let queued = stream.run(quantum, now_ns, |_| {}, record);

        if queued {
            let n = self.output_cycles.incr();
            let _ = self.queued_tx.try_send(n);
        }
    }
}

fn data_loop(shared: Arc<Shared>) -> u64 {
    let mut deadline = Instant::now() + shared.period();
    loop {
        let control = match shared.mode {
            ClockMode::Manual => shared.control_rx.recv().ok(),
            ClockMode::FreeRunning => match shared.control_rx.recv_deadline(deadline) {
                Ok(control) => Some(control),
                Err(RecvTimeoutError::Timeout) => {
                    deadline += shared.period();
                    Some(Control::Cycle)
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        match control {
            Some(Control::Cycle) => shared.input_cycle(),
            Some(Control::Output) => shared.output_cycle(),
            Some(Control::Shutdown) | None => break,
        }
    }
    shared.input_cycles.get()
}

/// Handle to the loopback backend. Cheap to clone.
#[derive(Clone)]
pub struct LoopbackBackend {
    shared: Arc<Shared>,
}

impl LoopbackBackend {
    pub fn new(mode: ClockMode) -> Self {
        Self::with_name("Loopback", mode)
    }

    pub fn with_name(name: impl Into<String>, mode: ClockMode) -> Self {
        Self::build(name.into(), mode, DEFAULT_CYCLE_TIMEOUT)
    }

    /// How long [`Self::run_cycles`] waits for each cycle's output.
    pub fn with_cycle_timeout(self, timeout: Duration) -> Self {
        Self::build(self.shared.name.clone(), self.shared.mode, timeout)
    }

    fn build(name: String, mode: ClockMode, cycle_timeout: Duration) -> Self {
        let (control_tx, control_rx) = bounded(CONTROL_CAPACITY);
        let (queued_tx, queued_rx) = bounded(CONTROL_CAPACITY);
        let silence: SignalFn = Box::new(|_, _| 0.0);
        Self {
            shared: Arc::new(Shared {
                name,
                mode,
                cycle_timeout,
                utils: Mutex::new(None),
                streams: Mutex::new(Vec::new()),
                thread: Mutex::new(None),
                control_tx,
                control_rx,
                queued_tx,
                queued_rx,
                running: AtomicFlag::new(false),
                faults: Mutex::new(Faults::default()),
                signal: ArcSwap::from_pointee(silence),
                sinks: Mutex::new(Vec::new()),
                timing: Mutex::new((48000, 256)),
                frames: AtomicU64::new(0),
                input_cycles: AtomicCounter::new(),
                output_cycles: AtomicCounter::new(),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.shared.mode
    }

    /// Run `n` cycles, each waiting until its output has been queued back.
    ///
    /// Returns the number of cycles completed before a timeout or a stopped
    /// loop cut the run short.
    pub fn run_cycles(&self, n: usize) -> usize {
        if !self.shared.running.get() {
            return 0;
        }
        while self.shared.queued_rx.try_recv().is_ok() {}

        let mut done = 0;
        for _ in 0..n {
            if self.shared.control_tx.send(Control::Cycle).is_err() {
                break;
            }
            match self.shared.queued_rx.recv_timeout(self.shared.cycle_timeout) {
                Ok(_) => done += 1,
                Err(_) => {
                    warn!(
                        "loopback cycle {done} produced no output within {:?}",
                        self.shared.cycle_timeout
                    );
                    break;
                }
            }
        }
        done
    }

    /// Replace the input signal.
    pub fn set_input_signal(&self, signal: impl Fn(usize, u64) -> f32 + Send + Sync + 'static) {
        self.shared.signal.store(Arc::new(Box::new(signal)));
    }

    /// Everything queued on output channel `channel` so far.
    pub fn output_sink(&self, channel: usize) -> Vec<f32> {
        self.shared
            .sinks
            .lock()
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_sinks(&self) {
        self.shared.sinks.lock().clear();
    }

    /// Make the next `create_stream` in `direction` fail.
    pub fn fail_next_create(&self, direction: Direction) {
        self.shared.faults.lock().create.insert(direction);
    }

    /// Make the next `connect` in `direction` fail.
    pub fn fail_next_connect(&self, direction: Direction) {
        self.shared.faults.lock().connect.insert(direction);
    }

    pub fn input_cycles(&self) -> u64 {
        self.shared.input_cycles.get()
    }

    pub fn output_cycles(&self) -> u64 {
        self.shared.output_cycles.get()
    }

    pub fn stream(&self, direction: Direction) -> Option<Arc<LoopbackStream>> {
        self.shared.stream(direction)
    }

    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// The data loop thread, while running.
    pub fn loop_thread_tid(&self) -> Option<i32> {
        self.shared.thread.lock().as_ref().map(RtThread::tid)
    }
}

impl Backend for LoopbackBackend {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn set_thread_utils(&self, utils: Arc<dyn ThreadUtils>) {
        *self.shared.utils.lock() = Some(utils);
    }

    fn create_stream(
        &self,
        direction: Direction,
        props: &StreamProps,
    ) -> Result<Arc<dyn BackendStream>, BackendError> {
        if self.shared.faults.lock().create.remove(&direction) {
            return Err(BackendError::CreateStream(direction));
        }

        *self.shared.timing.lock() = (props.force_rate, props.force_quantum);

        let stream = Arc::new(LoopbackStream {
            direction,
            props: props.clone(),
            shared: Arc::downgrade(&self.shared),
            connected: AtomicFlag::new(false),
            inner: Mutex::new(StreamInner::default()),
        });

        let mut streams = self.shared.streams.lock();
        streams.retain(|s| s.direction != direction);
        streams.push(Arc::clone(&stream));
        debug!("loopback {direction} stream '{}' created", props.name);
        Ok(stream)
    }

    fn destroy_stream(&self, direction: Direction) {
        let removed = {
            let mut streams = self.shared.streams.lock();
            let position = streams.iter().position(|s| s.direction == direction);
            position.map(|i| streams.remove(i))
        };

        if let Some(stream) = removed {
            if stream.is_connected() {
                let _ = stream.disconnect();
            }
            debug!("loopback {direction} stream destroyed");
        }
    }

    fn start(&self) -> Result<(), BackendError> {
        if self.shared.running.get() {
            return Ok(());
        }

        let utils = self
            .shared
            .utils
            .lock()
            .clone()
            .ok_or(BackendError::NoThreadUtils)?;

        while self.shared.control_rx.try_recv().is_ok() {}

        let shared = Arc::clone(&self.shared);
        let thread = utils
            .create(
                THREAD_NAME,
                Box::new(move || Box::new(data_loop(shared)) as ThreadExit),
            )
            .map_err(|e| BackendError::Start(e.to_string()))?;

        if let Err(e) = utils.acquire_rt(&thread, RtPriority::Max) {
            let _ = self.shared.control_tx.send(Control::Shutdown);
            let _ = utils.join(thread);
            return Err(BackendError::Start(e.to_string()));
        }

        *self.shared.thread.lock() = Some(thread);
        self.shared.running.set(true);
        info!("loopback data loop started ({:?})", self.shared.mode);
        Ok(())
    }

    fn stop(&self) -> Result<(), BackendError> {
        let Some(thread) = self.shared.thread.lock().take() else {
            return Ok(());
        };
        self.shared.running.set(false);

        let _ = self.shared.control_tx.send(Control::Shutdown);
        let utils = self.shared.utils.lock().clone();
        if let Some(utils) = utils {
            let _ = utils.drop_rt(&thread);
            let cycles = utils
                .join(thread)
                .map_err(|e| BackendError::Start(e.to_string()))?;
            if let Ok(cycles) = cycles.downcast::<u64>() {
                info!("loopback data loop stopped after {cycles} cycles");
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.get()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        debug!("loopback backend '{}' dropped", self.name);
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBackend")
            .field("name", &self.shared.name)
            .field("mode", &self.shared.mode)
            .field("running", &self.shared.running.get())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct StreamInner {
    events: Option<Arc<dyn StreamEvents>>,
    format: Option<AudioFormat>,
    flags: Option<ConnectFlags>,
    buffers: Vec<BackendBuffer>,
    chunks: Vec<Chunk>,
    next: usize,
}

/// One loopback stream.
pub struct LoopbackStream {
    direction: Direction,
    props: StreamProps,
    shared: Weak<Shared>,
    connected: AtomicFlag,
    inner: Mutex<StreamInner>,
}

impl LoopbackStream {
    pub fn props(&self) -> &StreamProps {
        &self.props
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.inner.lock().format
    }

    pub fn flags(&self) -> Option<ConnectFlags> {
        self.inner.lock().flags
    }

    /// Buffers currently negotiated.
    pub fn buffers(&self) -> Vec<BackendBuffer> {
        self.inner.lock().buffers.clone()
    }

    /// Dequeue the next buffer round-robin, let `fill` prepare it, run the
    /// stream's `process` and, if it was queued back, hand it to `drain`.
    fn run(
        &self,
        frames: u32,
        now_ns: u64,
        fill: impl FnOnce(&BackendBuffer),
        drain: impl FnOnce(&BackendBuffer, &[Chunk]),
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(events) = inner.events.clone() else {
            return false;
        };

        if inner.buffers.is_empty() {
            let mut cycle = Cycle {
                buffer: None,
                frames,
                now_ns,
                chunks: &mut [],
            };
            events.process(&mut cycle);
            return false;
        }

        let index = inner.next % inner.buffers.len();
        inner.next = index + 1;

        let StreamInner {
            buffers, chunks, ..
        } = &mut *inner;
        let buffer = &buffers[index];
        chunks.clear();
        chunks.resize(buffer.planes.len(), Chunk::default());

        fill(buffer);
        let mut cycle = Cycle {
            buffer: Some(buffer.id),
            frames,
            now_ns,
            chunks: chunks.as_mut_slice(),
        };
        let queued = events.process(&mut cycle);
        if queued {
            drain(buffer, chunks.as_slice());
        }
        queued
    }
}

impl BackendStream for LoopbackStream {
    fn direction(&self) -> Direction {
        self.direction
    }

    fn connect(
        &self,
        format: AudioFormat,
        negotiation: BufferNegotiation,
        flags: ConnectFlags,
        events: Arc<dyn StreamEvents>,
    ) -> Result<(), BackendError> {
        if let Some(shared) = self.shared.upgrade() {
            if shared.faults.lock().connect.remove(&self.direction) {
                let reason = "injected failure".to_string();
                return Err(BackendError::Connect(self.direction, reason));
            }
        }
        if self.connected.get() {
            return Err(BackendError::Connect(self.direction, "already connected".into()));
        }

        let mut buffers = Vec::<BackendBuffer>::with_capacity(negotiation.buffers as usize);
        for id in 0..negotiation.buffers {
            let mut buffer = BackendBuffer::new(id);
            events.add_buffer(&mut buffer);
            if buffer.planes.len() != format.channels as usize {
                events.remove_buffer(id);
                for added in &buffers {
                    events.remove_buffer(added.id);
                }
                return Err(BackendError::Format(format!(
                    "buffer {id} has {} planes, expected {}",
                    buffer.planes.len(),
                    format.channels
                )));
            }
            buffers.push(buffer);
        }

        let mut inner = self.inner.lock();
        inner.events = Some(events);
        inner.format = Some(format);
        inner.flags = Some(flags);
        inner.buffers = buffers;
        inner.next = 0;
        self.connected.set(true);

        debug!(
            "loopback {} stream connected: {} channels, {} buffers",
            self.direction, format.channels, negotiation.buffers
        );
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        if let Some(events) = inner.events.take() {
            for buffer in inner.buffers.drain(..) {
                events.remove_buffer(buffer.id);
            }
        }
        inner.format = None;
        inner.flags = None;
        inner.chunks.clear();
        self.connected.set(false);
        debug!("loopback {} stream disconnected", self.direction);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn trigger_process(&self) -> Result<(), BackendError> {
        if self.direction != Direction::Output {
            return Ok(());
        }
        let Some(shared) = self.shared.upgrade() else {
            return Err(BackendError::Start("backend gone".into()));
        };
        if !shared.running.get() {
            return Err(BackendError::Start("data loop not running".into()));
        }
        shared
            .control_tx
            .try_send(Control::Output)
            .map_err(|_| BackendError::Start("data loop congested".into()))
    }
}

impl std::fmt::Debug for LoopbackStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackStream")
            .field("direction", &self.direction)
            .field("connected", &self.connected.get())
            .finish_non_exhaustive()
    }
}
