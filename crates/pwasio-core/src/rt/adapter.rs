//! [`ThreadUtils`] implementation on top of a [`HostScheduler`].

use super::{
    current_tid, HostPriority, HostScheduler, RtPriority, RtThread, ThreadExit, ThreadStart,
    ThreadUtils,
};
use crate::error::ThreadError;
use crossbeam_channel::bounded;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// SCHED_FIFO priority requested for [`RtPriority::Max`].
const FIFO_PRIORITY: i32 = 1;

pub struct RtThreadAdapter {
    scheduler: Arc<dyn HostScheduler>,
}

impl RtThreadAdapter {
    pub fn new(scheduler: Arc<dyn HostScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<dyn HostScheduler> {
        &self.scheduler
    }
}

impl std::fmt::Debug for RtThreadAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtThreadAdapter").finish_non_exhaustive()
    }
}

impl ThreadUtils for RtThreadAdapter {
    fn create(&self, name: &str, start: ThreadStart) -> Result<RtThread, ThreadError> {
        let (tid_tx, tid_rx) = bounded::<i32>(1);

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tid_tx.send(current_tid());
                drop(tid_tx);
                start()
            })
            .map_err(|source| ThreadError::Spawn {
                name: name.to_string(),
                source,
            })?;

        // The sender is dropped without sending only if the thread died first.
        let tid = match tid_rx.recv() {
            Ok(tid) => tid,
            Err(_) => {
                let _ = handle.join();
                return Err(ThreadError::NoThreadId(name.to_string()));
            }
        };

        debug!("created thread '{name}' (tid {tid})");
        Ok(RtThread::new(name.to_string(), tid, handle))
    }

    fn join(&self, mut thread: RtThread) -> Result<ThreadExit, ThreadError> {
        let Some(handle) = thread.take_handle() else {
            return Err(ThreadError::NoThreadId(thread.name().to_string()));
        };

        let exit = handle
            .join()
            .map_err(|_| ThreadError::Panicked(thread.name().to_string()))?;
        debug!("joined thread '{}' (tid {})", thread.name(), thread.tid());
        Ok(exit)
    }

    fn rt_range(&self) -> (i32, i32) {
        (
            HostPriority::Normal.level(),
            HostPriority::TimeCritical.level(),
        )
    }

    fn acquire_rt(&self, thread: &RtThread, priority: RtPriority) -> Result<(), ThreadError> {
        let tid = thread.tid();
        let (host, want_fifo) = match priority {
            RtPriority::Max => (HostPriority::TimeCritical, true),
            RtPriority::Level(level) => (HostPriority::from_level(level), false),
        };

        let fifo = want_fifo
            && match self.scheduler.set_fifo(tid, Some(FIFO_PRIORITY)) {
                Ok(()) => true,
                Err(e) => {
                    debug!("SCHED_FIFO unavailable for thread {tid}: {e}");
                    false
                }
            };

        if let Err(source) = self.scheduler.set_priority(tid, host) {
            if fifo {
                let _ = self.scheduler.set_fifo(tid, None);
            }
            warn!(
                "Failed to raise thread '{}' to {host:?}: {source}",
                thread.name()
            );
            return Err(ThreadError::Priority { tid, source });
        }

        thread.set_elevated(true);
        info!(
            "thread '{}' (tid {tid}) elevated to {host:?}{}",
            thread.name(),
            if fifo { " + SCHED_FIFO" } else { "" }
        );
        Ok(())
    }

    fn drop_rt(&self, thread: &RtThread) -> Result<(), ThreadError> {
        let tid = thread.tid();
        let _ = self.scheduler.set_fifo(tid, None);
        self.scheduler
            .set_priority(tid, HostPriority::Normal)
            .map_err(|source| ThreadError::Priority { tid, source })?;
        thread.set_elevated(false);
        debug!("thread '{}' (tid {tid}) back to normal priority", thread.name());
        Ok(())
    }
}
