//! Realtime thread management.
//!
//! The backend creates its processing threads through [`ThreadUtils`] so that
//! every realtime thread in the process goes through one place that knows
//! how to raise and lower scheduling priority on the host.

mod adapter;
mod scheduler;

pub use adapter::RtThreadAdapter;
pub use scheduler::{HostPriority, HostScheduler, NativeScheduler};

use crate::error::ThreadError;
use crate::lockfree::AtomicFlag;
use std::any::Any;
use std::thread::JoinHandle;

/// Value returned by a thread's start routine.
pub type ThreadExit = Box<dyn Any + Send>;

/// Start routine handed to [`ThreadUtils::create`].
pub type ThreadStart = Box<dyn FnOnce() -> ThreadExit + Send>;

/// Requested realtime priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtPriority {
    /// Highest host class plus an OS-level FIFO attempt.
    Max,
    /// A host priority level, clamped into [`ThreadUtils::rt_range`].
    Level(i32),
}

/// A thread created through [`ThreadUtils::create`].
#[derive(Debug)]
pub struct RtThread {
    name: String,
    tid: i32,
    handle: Option<JoinHandle<ThreadExit>>,
    elevated: AtomicFlag,
}

impl RtThread {
    pub(crate) fn new(name: String, tid: i32, handle: JoinHandle<ThreadExit>) -> Self {
        Self {
            name,
            tid,
            handle: Some(handle),
            elevated: AtomicFlag::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread id, recorded by the thread itself before `create` returns.
    pub fn tid(&self) -> i32 {
        self.tid
    }

    /// Whether `acquire_rt` succeeded and `drop_rt` has not run since.
    pub fn is_elevated(&self) -> bool {
        self.elevated.get()
    }

    pub(crate) fn set_elevated(&self, elevated: bool) {
        self.elevated.set(elevated);
    }

    pub(crate) fn take_handle(&mut self) -> Option<JoinHandle<ThreadExit>> {
        self.handle.take()
    }
}

/// Thread-creation and priority hooks registered with the backend.
pub trait ThreadUtils: Send + Sync {
    /// Spawn `start` on a new thread. Returns once the thread has recorded
    /// its kernel id.
    fn create(&self, name: &str, start: ThreadStart) -> Result<RtThread, ThreadError>;

    /// Block until the thread finishes and return its start routine's value.
    fn join(&self, thread: RtThread) -> Result<ThreadExit, ThreadError>;

    /// Inclusive range accepted by [`RtPriority::Level`].
    fn rt_range(&self) -> (i32, i32);

    /// Raise the thread's scheduling class. Fails without side effects.
    fn acquire_rt(&self, thread: &RtThread, priority: RtPriority) -> Result<(), ThreadError>;

    /// Exact inverse of `acquire_rt`.
    fn drop_rt(&self, thread: &RtThread) -> Result<(), ThreadError>;
}

/// Kernel id of the calling thread.
pub fn current_tid() -> i32 {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: gettid has no preconditions.
        unsafe { libc::syscall(libc::SYS_gettid) as i32 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::process::id() as i32
    }
}
