//! Host scheduling primitives.

use std::io;
use tracing::{debug, warn};

/// Host-level thread priority classes, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostPriority {
    Normal,
    AboveNormal,
    Highest,
    TimeCritical,
}

impl HostPriority {
    /// Numeric level as reported by `rt_range`.
    pub fn level(self) -> i32 {
        match self {
            HostPriority::Normal => 0,
            HostPriority::AboveNormal => 1,
            HostPriority::Highest => 2,
            HostPriority::TimeCritical => 15,
        }
    }

    /// Nearest class at or below `level`, clamped to the valid range.
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => HostPriority::Normal,
            1 => HostPriority::AboveNormal,
            2..=14 => HostPriority::Highest,
            _ => HostPriority::TimeCritical,
        }
    }

    /// Nice value used by [`NativeScheduler`].
    pub fn nice(self) -> i32 {
        match self {
            HostPriority::Normal => 0,
            HostPriority::AboveNormal => -5,
            HostPriority::Highest => -10,
            HostPriority::TimeCritical => -15,
        }
    }
}

/// OS calls behind the realtime thread adapter.
pub trait HostScheduler: Send + Sync {
    /// Set the host priority class of thread `tid`.
    fn set_priority(&self, tid: i32, priority: HostPriority) -> io::Result<()>;

    /// `Some(prio)` switches `tid` to SCHED_FIFO at `prio`; `None` back to
    /// the default policy.
    fn set_fifo(&self, tid: i32, fifo: Option<i32>) -> io::Result<()>;

    /// Make realtime scheduling available to the process.
    fn acquire_privileges(&self) -> io::Result<()>;
}

/// [`HostScheduler`] on top of `libc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeScheduler;

impl NativeScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl HostScheduler for NativeScheduler {
    fn set_priority(&self, tid: i32, priority: HostPriority) -> io::Result<()> {
        // SAFETY: plain syscall wrapper; tid identifies a thread of this process.
        let rc =
            unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority.nice()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("thread {tid} priority set to {priority:?}");
        Ok(())
    }

    fn set_fifo(&self, tid: i32, fifo: Option<i32>) -> io::Result<()> {
        let (policy, priority) = match fifo {
            Some(priority) => (libc::SCHED_FIFO, priority),
            None => (libc::SCHED_OTHER, 0),
        };
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: param is a valid sched_param for the duration of the call.
        let rc = unsafe { libc::sched_setscheduler(tid, policy, &param) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn acquire_privileges(&self) -> io::Result<()> {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: limit is a valid out-pointer.
        if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut limit) } < 0 {
            return Err(io::Error::last_os_error());
        }

        if limit.rlim_max < 1 {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "RLIMIT_RTPRIO hard limit is 0",
            ));
        }

        if limit.rlim_cur < 1 {
            limit.rlim_cur = 1;
            // SAFETY: limit is a valid rlimit.
            if unsafe { libc::setrlimit(libc::RLIMIT_RTPRIO, &limit) } < 0 {
                let err = io::Error::last_os_error();
                warn!("Unable to raise RLIMIT_RTPRIO soft limit: {err}");
                return Err(err);
            }
        }

        Ok(())
    }
}
