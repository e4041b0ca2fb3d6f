//! The driver instance behind the client method table.
//!
//! All lifecycle calls serialize on one session mutex. The realtime path never
//! takes it: backend events reach the processor through the invocation
//! channel. Queries answer from the immutable configuration and the live
//! engine without the lock, so hosts may call them from inside their swap
//! callback, and the processor is joined only after the lock is released.

use crate::api::{
    AsioDriver, BufferInfo, BufferSizeRange, ChannelCounts, ChannelInfo, ClockSource, Latencies,
    SamplePosition, SAMPLE_TYPE_FLOAT32_LSB,
};
use crate::builder::DriverBuilder;
use crate::error::{AsioError, AsioResult};
use crate::panel::{ConfigDialog, ControlPanel, HostSlot, PanelContext, PANEL_CLOSE_TIMEOUT};
use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use pwasio_core::{
    AtomicFlag, AudioFormat, Backend, BackendStream, BufferNegotiation, ChannelSpec, ConfigStore,
    ConnectFlags, Direction, DriverState, HostCallbacks, InvokeChannel, Lifecycle,
    LifecycleEvent, MessageSelector, PortEvents, PortRegistry, Position, Processor, SampleFormat,
    StreamConfig, StreamProps, SwapContext, SwapEngine, SwapStats, ThreadUtils, Transition,
    INVOKE_CAPACITY,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DRIVER_NAME: &str = "pwasio";
pub const VERSION_MAJOR: i32 = 0;
pub const VERSION_MINOR: i32 = 1;
pub const VERSION_PATCH: i32 = 0;

/// `(major << 20) + (minor << 10) + patch`.
pub const DRIVER_VERSION: i32 = (VERSION_MAJOR << 20) + (VERSION_MINOR << 10) + VERSION_PATCH;

/// What the builder hands over.
pub(crate) struct DriverParts {
    pub backend: Arc<dyn Backend>,
    pub utils: Arc<dyn ThreadUtils>,
    pub store: Arc<dyn ConfigStore>,
    pub dialog: Option<Arc<dyn ConfigDialog>>,
    pub config: StreamConfig,
    pub stream_name: String,
}

/// Reference-counted driver handle.
///
/// Cloning adds a reference. Teardown (closing the panel, disposing buffers,
/// destroying the streams) runs exactly once, when the last handle drops.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<DriverInner>,
}

/// Arena, engine and invocation channel of one CreateBuffers.
struct BufferSet {
    registry: Arc<PortRegistry>,
    engine: Arc<SwapEngine>,
    invoke: InvokeChannel,
}

#[derive(Default)]
struct Session {
    lifecycle: Lifecycle,
    input: Option<Arc<dyn BackendStream>>,
    output: Option<Arc<dyn BackendStream>>,
    buffers: Option<BufferSet>,
    processor: Option<Processor>,
}

struct DriverInner {
    backend: Arc<dyn Backend>,
    utils: Arc<dyn ThreadUtils>,
    store: Arc<dyn ConfigStore>,
    dialog: Option<Arc<dyn ConfigDialog>>,
    config: StreamConfig,
    stream_name: String,

    session: Mutex<Session>,
    /// Held by Start, Stop and DisposeBuffers through the processor join, so
    /// a restart never shares the channel with a processor still winding down.
    transport: Mutex<()>,
    panel: Mutex<ControlPanel>,
    last_error: Mutex<Option<String>>,

    callbacks: Arc<HostSlot>,
    /// Live engine for lock-free position reads.
    engine: ArcSwapOption<SwapEngine>,
    last_position: Mutex<Position>,
    has_io: AtomicFlag,
}

impl Driver {
    pub fn builder(backend: Arc<dyn Backend>) -> DriverBuilder {
        DriverBuilder::new(backend)
    }

    pub(crate) fn new(parts: DriverParts) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                backend: parts.backend,
                utils: parts.utils,
                store: parts.store,
                dialog: parts.dialog,
                config: parts.config,
                stream_name: parts.stream_name,
                session: Mutex::new(Session::default()),
                transport: Mutex::new(()),
                panel: Mutex::new(ControlPanel::default()),
                last_error: Mutex::new(None),
                callbacks: Arc::new(ArcSwapOption::empty()),
                engine: ArcSwapOption::empty(),
                last_position: Mutex::new(Position::default()),
                has_io: AtomicFlag::new(false),
            }),
        }
    }

    /// Drop this reference. Returns how many remain.
    pub fn release(self) -> usize {
        let remaining = Arc::strong_count(&self.inner) - 1;
        drop(self);
        remaining
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn state(&self) -> DriverState {
        self.inner.session.lock().lifecycle.state()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn stream_name(&self) -> &str {
        &self.inner.stream_name
    }

    /// Swap counters of the current buffer set.
    pub fn stats(&self) -> Option<Arc<SwapStats>> {
        self.inner
            .engine
            .load_full()
            .map(|engine| Arc::clone(engine.stats()))
    }

    /// Whether the host accepted time-info swaps at CreateBuffers.
    pub fn uses_time_info(&self) -> bool {
        self.inner
            .engine
            .load_full()
            .is_some_and(|engine| engine.uses_time_info())
    }

    pub fn is_panel_open(&self) -> bool {
        self.inner.panel.lock().is_open()
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("backend", &self.inner.backend.name())
            .field("config", &self.inner.config)
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

impl DriverInner {
    /// Run `f` under the session lock, recording its failure for
    /// `GetErrorMessage`.
    fn call<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Self, &mut Session) -> AsioResult<T>,
    ) -> AsioResult<T> {
        let result = {
            let mut session = self.session.lock();
            f(self, &mut session)
        };
        if let Err(e) = &result {
            self.record(name, e);
        }
        result
    }

    /// Answer a query without the session lock. Fails with `NotPresent`
    /// until Init has created the streams.
    fn query<T>(&self, name: &str, f: impl FnOnce(&Self) -> AsioResult<T>) -> AsioResult<T> {
        let result = if self.has_io.get() {
            f(self)
        } else {
            Err(AsioError::NotPresent("no IO".into()))
        };
        if let Err(e) = &result {
            self.record(name, e);
        }
        result
    }

    fn record(&self, name: &str, err: &AsioError) {
        warn!("{name} failed ({}): {err}", err.code());
        *self.last_error.lock() = Some(format!("{name}: {}", err.message()));
    }

    fn streams(
        &self,
        session: &Session,
    ) -> AsioResult<(Arc<dyn BackendStream>, Arc<dyn BackendStream>)> {
        match (&session.input, &session.output) {
            (Some(input), Some(output)) => Ok((Arc::clone(input), Arc::clone(output))),
            _ => Err(AsioError::NotPresent("no IO".into())),
        }
    }

    fn format(&self, channels: usize) -> AudioFormat {
        AudioFormat {
            format: SampleFormat::F32,
            rate: self.config.sample_rate as u32,
            channels: channels as u32,
        }
    }

    fn check_rate(&self, rate: f64) -> AsioResult<()> {
        if rate as usize != self.config.sample_rate {
            return Err(AsioError::NoClock("invalid sample rate".into()));
        }
        Ok(())
    }

    fn init(&self, session: &mut Session) -> AsioResult<()> {
        let transition = session.lifecycle.check(LifecycleEvent::Init)?;
        if transition == Transition::None {
            return Ok(());
        }

        let rate = self.config.sample_rate as u32;
        let quantum = self.config.buffer_size as u32;
        let props = |direction| StreamProps::new(&self.stream_name, direction, rate, quantum);

        let input = self
            .backend
            .create_stream(Direction::Input, &props(Direction::Input))
            .map_err(|_| AsioError::NoMemory("failed to create input stream".into()))?;
        let output = match self
            .backend
            .create_stream(Direction::Output, &props(Direction::Output))
        {
            Ok(output) => output,
            Err(_) => {
                self.backend.destroy_stream(Direction::Input);
                return Err(AsioError::NoMemory("failed to create output stream".into()));
            }
        };

        session.input = Some(input);
        session.output = Some(output);
        session.lifecycle.commit(transition);
        self.has_io.set(true);
        info!(
            "streams '{}' created on {} ({} Hz, {} frames)",
            self.stream_name,
            self.backend.name(),
            rate,
            quantum
        );
        Ok(())
    }

    fn create_buffers(
        &self,
        session: &mut Session,
        infos: &mut [BufferInfo],
        buffer_size: i32,
        callbacks: Arc<dyn HostCallbacks>,
        time_info: bool,
    ) -> AsioResult<()> {
        let transition = session.lifecycle.check(LifecycleEvent::CreateBuffers)?;
        let (input, output) = self.streams(session)?;

        if infos.is_empty() {
            return Err(AsioError::InvalidParameter("no channels requested".into()));
        }
        if buffer_size < 0 || buffer_size as usize != self.config.buffer_size {
            return Err(pwasio_core::Error::BufferSizeMismatch {
                requested: buffer_size,
                configured: self.config.buffer_size,
            }
            .into());
        }

        let specs: Vec<ChannelSpec> = infos
            .iter()
            .map(|info| ChannelSpec {
                direction: info.direction,
                index: info.channel,
            })
            .collect();
        let registry = Arc::new(PortRegistry::allocate(&self.config, &specs)?);

        let engine = Arc::new(SwapEngine::new(SwapContext {
            registry: Arc::clone(&registry),
            callbacks: Arc::clone(&callbacks),
            output: Arc::clone(&output),
            time_info,
        }));
        let invoke = InvokeChannel::new(INVOKE_CAPACITY, Arc::clone(engine.stats()));

        let negotiation = BufferNegotiation::new(
            self.config.buffer_size,
            registry.arena().layout().slot_bytes,
        );
        let flags = ConnectFlags::new(self.config.autoconnect);

        let unwind = |err: AsioError| {
            if output.is_connected() {
                let _ = output.disconnect();
            }
            if input.is_connected() {
                let _ = input.disconnect();
            }
            registry.deactivate_all();
            Err(err)
        };

        let input_events = Arc::new(PortEvents::input(
            Arc::clone(&registry),
            Arc::clone(&engine),
            invoke.sender(),
        ));
        if let Err(e) = input.connect(
            self.format(self.config.n_inputs),
            negotiation,
            flags,
            input_events,
        ) {
            return unwind(e.into());
        }

        let output_events = Arc::new(PortEvents::output(
            Arc::clone(&registry),
            Arc::clone(&engine),
        ));
        if let Err(e) = output.connect(
            self.format(self.config.n_outputs),
            negotiation,
            flags.with_driver(),
            output_events,
        ) {
            return unwind(e.into());
        }

        for info in infos.iter_mut() {
            let channel = usize::try_from(info.channel)
                .ok()
                .and_then(|index| registry.channel(info.direction, index));
            match channel {
                Some(channel) => info.buffers = channel.pointers().map(Some),
                None => {
                    return unwind(AsioError::InvalidMode(format!(
                        "Invalid channel requested {} {}",
                        info.direction, info.channel
                    )))
                }
            }
        }

        self.callbacks.store(Some(Arc::new(callbacks)));
        self.engine.store(Some(Arc::clone(&engine)));
        info!(
            "buffers created: {} channels, {} frames, time info {}",
            registry.active_count(),
            buffer_size,
            if time_info { "on" } else { "off" }
        );
        session.buffers = Some(BufferSet {
            registry,
            engine,
            invoke,
        });
        session.lifecycle.commit(transition);
        Ok(())
    }

    fn start(&self, session: &mut Session) -> AsioResult<()> {
        let transition = session.lifecycle.check(LifecycleEvent::Start)?;
        let Some(buffers) = session.buffers.as_ref() else {
            return Err(AsioError::NotPresent("no buffers".into()));
        };

        let stale = buffers.invoke.drain();
        if stale > 0 {
            debug!("dropped {stale} stale frame events");
        }

        let mut processor = Processor::spawn(
            Arc::clone(&self.utils),
            Arc::clone(&buffers.engine),
            &buffers.invoke,
        )
        .map_err(|e| AsioError::HwMalfunction(format!("failed to start processing thread: {e}")))?;

        if let Err(e) = self.backend.start() {
            let _ = processor.stop();
            return Err(AsioError::HwMalfunction(format!(
                "failed to start data loop: {e}"
            )));
        }

        session.processor = Some(processor);
        session.lifecycle.commit(transition);
        info!("started");
        Ok(())
    }

    /// Stop the data loop and hand back the processor. The caller joins it
    /// once the session lock is released, since its last cycle may still be
    /// inside the host callback.
    fn stop(&self, session: &mut Session) -> AsioResult<Option<Processor>> {
        let transition = session.lifecycle.check(LifecycleEvent::Stop)?;

        if let Err(e) = self.backend.stop() {
            warn!("data loop did not stop cleanly: {e}");
        }
        let processor = session.processor.take();

        session.lifecycle.commit(transition);
        info!("stopped");
        Ok(processor)
    }

    /// Stop first if still running, so the processor can be joined before
    /// the buffers go.
    fn stop_if_running(&self, session: &mut Session) -> AsioResult<Option<Processor>> {
        if session.lifecycle.state() == DriverState::Running {
            self.stop(session)
        } else {
            Ok(None)
        }
    }

    fn dispose_buffers(&self, session: &mut Session) -> AsioResult<()> {
        let transition = session.lifecycle.check(LifecycleEvent::DisposeBuffers)?;

        for stream in [&session.output, &session.input].into_iter().flatten() {
            if stream.is_connected() {
                if let Err(e) = stream.disconnect() {
                    warn!("{} stream disconnect failed: {e}", stream.direction());
                }
            }
        }

        if let Some(buffers) = session.buffers.take() {
            buffers.registry.deactivate_all();
            *self.last_position.lock() = buffers.engine.position();
            self.engine.store(None);
        }

        session.lifecycle.commit(transition);
        info!("buffers disposed");
        Ok(())
    }

    fn channel_info(&self, direction: Direction, index: i32) -> AsioResult<ChannelInfo> {
        let count = match direction {
            Direction::Input => self.config.n_inputs,
            Direction::Output => self.config.n_outputs,
        };
        let Some(slot) = usize::try_from(index).ok().filter(|&i| i < count) else {
            return Err(AsioError::InvalidParameter(format!(
                "no {direction} channel {index}"
            )));
        };

        let is_active = self.engine.load_full().is_some_and(|engine| {
            engine
                .registry()
                .channel(direction, slot)
                .is_some_and(|channel| channel.is_active())
        });

        Ok(ChannelInfo {
            direction,
            index,
            is_active,
            group: 0,
            sample_type: SAMPLE_TYPE_FLOAT32_LSB,
            name: format!("{}_{}", direction.prefix(), index),
        })
    }

    fn teardown(&self, session: &mut Session) {
        if session.lifecycle.state().has_buffers() {
            let disposed = self
                .stop_if_running(session)
                .map(join)
                .and_then(|()| self.dispose_buffers(session));
            if let Err(e) = disposed {
                warn!("dispose during release failed: {e}");
            }
        }

        if session.input.take().is_some() {
            self.backend.destroy_stream(Direction::Input);
        }
        if session.output.take().is_some() {
            self.backend.destroy_stream(Direction::Output);
        }

        self.has_io.set(false);
        self.callbacks.store(None);
        let _ = session.lifecycle.apply(LifecycleEvent::Release);
    }
}

/// Wait for a stopped processor to finish its last cycle.
fn join(processor: Option<Processor>) {
    if let Some(mut processor) = processor {
        match processor.stop() {
            Ok(cycles) => debug!("processor ran {cycles} cycles"),
            Err(e) => warn!("processor did not stop cleanly: {e}"),
        }
    }
}

impl Drop for DriverInner {
    fn drop(&mut self) {
        if !self.panel.get_mut().close(PANEL_CLOSE_TIMEOUT) {
            warn!("releasing with the control panel still open");
        }

        let mut session = std::mem::take(self.session.get_mut());
        self.teardown(&mut session);
        info!("driver released");
    }
}

impl AsioDriver for Driver {
    fn init(&self) -> bool {
        self.inner
            .call("Init", |inner, session| inner.init(session))
            .is_ok()
    }

    fn driver_name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    fn driver_version(&self) -> i32 {
        DRIVER_VERSION
    }

    fn error_message(&self) -> String {
        self.inner
            .last_error
            .lock()
            .take()
            .unwrap_or_else(|| "Undocumented error".to_string())
    }

    fn start(&self) -> AsioResult<()> {
        let _transport = self.inner.transport.lock();
        self.inner
            .call("Start", |inner, session| inner.start(session))
    }

    fn stop(&self) -> AsioResult<()> {
        let _transport = self.inner.transport.lock();
        let processor = self.inner.call("Stop", |inner, session| inner.stop(session))?;
        join(processor);
        Ok(())
    }

    fn channels(&self) -> AsioResult<ChannelCounts> {
        self.inner.query("GetChannels", |inner| {
            Ok(ChannelCounts {
                inputs: inner.config.n_inputs as i32,
                outputs: inner.config.n_outputs as i32,
            })
        })
    }

    fn latencies(&self) -> AsioResult<Latencies> {
        self.inner.query("GetLatencies", |inner| {
            Ok(Latencies {
                input: inner.config.buffer_size as i32,
                output: 0,
            })
        })
    }

    fn buffer_size(&self) -> AsioResult<BufferSizeRange> {
        self.inner.query("GetBufferSize", |inner| {
            let size = inner.config.buffer_size as i32;
            Ok(BufferSizeRange {
                min: size,
                max: size,
                preferred: size,
                granularity: 0,
            })
        })
    }

    fn can_sample_rate(&self, rate: f64) -> AsioResult<()> {
        self.inner.query("CanSampleRate", |inner| inner.check_rate(rate))
    }

    fn sample_rate(&self) -> AsioResult<f64> {
        self.inner.query("GetSampleRate", |inner| Ok(inner.config.sample_rate as f64))
    }

    fn set_sample_rate(&self, rate: f64) -> AsioResult<()> {
        self.inner.query("SetSampleRate", |inner| inner.check_rate(rate))
    }

    fn clock_sources(&self) -> AsioResult<Vec<ClockSource>> {
        self.inner.query("GetClockSources", |inner| {
            Ok(vec![ClockSource {
                index: 0,
                channel: -1,
                group: -1,
                is_current: true,
                name: inner.backend.name().to_string(),
            }])
        })
    }

    fn set_clock_source(&self, index: i32) -> AsioResult<()> {
        self.inner.query("SetClockSource", |_| {
            if index != 0 {
                return Err(AsioError::InvalidParameter(format!(
                    "no clock source {index}"
                )));
            }
            Ok(())
        })
    }

    fn sample_position(&self) -> AsioResult<SamplePosition> {
        self.inner.query("GetSamplePosition", |inner| {
            let position = match inner.engine.load_full() {
                Some(engine) => engine.position(),
                None => *inner.last_position.lock(),
            };
            Ok(SamplePosition {
                samples: position.sample_words(),
                timestamp: position.time_words(),
            })
        })
    }

    fn channel_info(&self, direction: Direction, index: i32) -> AsioResult<ChannelInfo> {
        self.inner.query("GetChannelInfo", |inner| inner.channel_info(direction, index))
    }

    fn create_buffers(
        &self,
        infos: &mut [BufferInfo],
        buffer_size: i32,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> AsioResult<()> {
        // The host may answer by calling back into the driver.
        let time_info = callbacks.message(MessageSelector::SupportsTimeInfo, 0) != 0;
        self.inner.call("CreateBuffers", |inner, session| {
            inner.create_buffers(session, infos, buffer_size, callbacks, time_info)
        })
    }

    fn dispose_buffers(&self) -> AsioResult<()> {
        let _transport = self.inner.transport.lock();
        let processor = self
            .inner
            .call("DisposeBuffers", |inner, session| inner.stop_if_running(session))?;
        join(processor);
        self.inner
            .call("DisposeBuffers", |inner, session| inner.dispose_buffers(session))
    }

    fn control_panel(&self) -> AsioResult<()> {
        let Some(dialog) = self.inner.dialog.clone() else {
            let err = AsioError::NotPresent("no control panel".into());
            self.inner.record("ControlPanel", &err);
            return Err(err);
        };

        let context = PanelContext {
            dialog,
            store: Arc::clone(&self.inner.store),
            config: self.inner.config,
            callbacks: Arc::clone(&self.inner.callbacks),
        };
        match self.inner.panel.lock().open(context) {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!("control panel already open");
                Ok(())
            }
            Err(e) => {
                let err = AsioError::NotPresent(format!("failed to open control panel: {e}"));
                self.inner.record("ControlPanel", &err);
                Err(err)
            }
        }
    }

    fn future(&self, _selector: i32) -> AsioResult<()> {
        Err(AsioError::NotPresent("not implemented".into()))
    }

    fn output_ready(&self) -> AsioResult<()> {
        Err(AsioError::NotPresent("not implemented".into()))
    }
}
