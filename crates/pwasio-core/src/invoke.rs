//! Cross-thread invocation: backend events onto the single owning thread.
//!
//! Backend callbacks never run the swap protocol themselves. They post an
//! [`Invocation`] to a bounded channel; one processing thread, created
//! through [`ThreadUtils`] and elevated to realtime, drains it.

use crate::error::ThreadError;
use crate::rt::{RtPriority, RtThread, ThreadExit, ThreadUtils};
use crate::swap::{SwapEngine, SwapStats};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pending frame-ready events before new ones are dropped.
pub const INVOKE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    FrameReady {
        /// Slot the backend filled, when its buffer was negotiated.
        slot: Option<usize>,
        frames: u32,
        now_ns: u64,
    },
    Shutdown,
}

/// RT-side handle. Never blocks.
#[derive(Debug, Clone)]
pub struct InvokeSender {
    tx: Sender<Invocation>,
    stats: Arc<SwapStats>,
}

impl InvokeSender {
    /// Post without blocking. A full channel drops the event and counts an
    /// overrun.
    pub fn try_send(&self, invocation: Invocation) -> bool {
        match self.tx.try_send(invocation) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let overruns = self.stats.overruns.incr();
                warn!("invocation channel full, frame dropped ({overruns} overruns)");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// The bounded channel between backend callbacks and the processor.
#[derive(Debug)]
pub struct InvokeChannel {
    tx: Sender<Invocation>,
    rx: Receiver<Invocation>,
    stats: Arc<SwapStats>,
}

impl InvokeChannel {
    pub fn new(capacity: usize, stats: Arc<SwapStats>) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, stats }
    }

    pub fn sender(&self) -> InvokeSender {
        InvokeSender {
            tx: self.tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Drop stale events left from a previous run.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// The owning processing thread.
pub struct Processor {
    utils: Arc<dyn ThreadUtils>,
    thread: Option<RtThread>,
    tx: Sender<Invocation>,
}

impl Processor {
    pub const THREAD_NAME: &'static str = "pwasio-process";

    /// Spawn the processor and raise it to realtime.
    ///
    /// If elevation fails the thread is shut down and joined before the
    /// error is returned.
    pub fn spawn(
        utils: Arc<dyn ThreadUtils>,
        engine: Arc<SwapEngine>,
        channel: &InvokeChannel,
    ) -> Result<Self, ThreadError> {
        let rx = channel.rx.clone();
        let tx = channel.tx.clone();

        let thread = utils.create(
            Self::THREAD_NAME,
            Box::new(move || {
                engine.bind_owner();
                let cycles = process_loop(&engine, &rx);
                engine.unbind_owner();
                Box::new(cycles) as ThreadExit
            }),
        )?;

        let mut processor = Self {
            utils,
            thread: Some(thread),
            tx,
        };

        let elevated = match processor.thread.as_ref() {
            Some(thread) => processor.utils.acquire_rt(thread, RtPriority::Max),
            None => Ok(()),
        };
        if let Err(e) = elevated {
            let _ = processor.stop();
            return Err(e);
        }

        Ok(processor)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Ask the thread to exit after draining queued events and join it.
    ///
    /// Returns the number of cycles it ran.
    pub fn stop(&mut self) -> Result<u64, ThreadError> {
        let Some(thread) = self.thread.take() else {
            return Ok(0);
        };

        let _ = self.tx.send(Invocation::Shutdown);
        let exit = self.utils.join(thread)?;
        let cycles = exit.downcast::<u64>().map(|c| *c).unwrap_or(0);
        debug!("processor stopped after {cycles} cycles");
        Ok(cycles)
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("processor join failed: {e}");
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("thread", &self.thread)
            .finish_non_exhaustive()
    }
}

fn process_loop(engine: &SwapEngine, rx: &Receiver<Invocation>) -> u64 {
    let mut cycles = 0u64;
    while let Ok(invocation) = rx.recv() {
        match invocation {
            Invocation::FrameReady {
                slot,
                frames,
                now_ns,
            } => {
                if let Some(slot) = slot.filter(|&slot| slot != engine.index()) {
                    let violations = engine.stats().violations.incr();
                    warn!(
                        "backend filled slot {slot} but slot {} is next ({violations} violations)",
                        engine.index()
                    );
                }
                engine.cycle(frames, now_ns);
                cycles += 1;
            }
            Invocation::Shutdown => break,
        }
    }
    cycles
}
