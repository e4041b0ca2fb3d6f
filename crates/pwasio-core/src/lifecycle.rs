//! Driver lifecycle state machine.
//!
//! `Created -> Initialized -> BuffersAllocated -> Running -> Stopped -> Disposed -> Released`,
//! where `Stopped` may start again and `Disposed` may allocate again.
//!
//! The machine only decides; the driver performs side effects between
//! [`Lifecycle::check`] and [`Lifecycle::commit`] so that a failed side
//! effect leaves the state untouched.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Created,
    Initialized,
    BuffersAllocated,
    Running,
    Stopped,
    Disposed,
    Released,
}

impl DriverState {
    /// Streams exist.
    pub fn has_io(self) -> bool {
        !matches!(self, DriverState::Created | DriverState::Released)
    }

    /// Arena and channels exist.
    pub fn has_buffers(self) -> bool {
        matches!(
            self,
            DriverState::BuffersAllocated | DriverState::Running | DriverState::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Init,
    CreateBuffers,
    Start,
    Stop,
    DisposeBuffers,
    Release,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    /// A required predecessor is missing.
    #[error("{reason}")]
    Absent {
        event: LifecycleEvent,
        state: DriverState,
        reason: &'static str,
    },

    /// The request conflicts with the current state.
    #[error("{reason}")]
    InvalidMode {
        event: LifecycleEvent,
        state: DriverState,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Accepted, state unchanged.
    None,
    Changed { from: DriverState, to: DriverState },
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    state: DriverState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Where `event` would lead from the current state, without moving.
    pub fn check(&self, event: LifecycleEvent) -> Result<Transition, LifecycleError> {
        use DriverState::*;
        use LifecycleEvent::*;

        let from = self.state;
        let absent = |reason| LifecycleError::Absent {
            event,
            state: from,
            reason,
        };
        let invalid = |reason| LifecycleError::InvalidMode {
            event,
            state: from,
            reason,
        };

        let to = match (event, from) {
            (Release, Released) => return Ok(Transition::None),
            (Release, _) => Released,
            (_, Released) => return Err(absent("driver released")),

            (Init, Created) => Initialized,
            (Init, _) => return Ok(Transition::None),

            (_, Created) => return Err(absent("no IO")),

            (CreateBuffers, Initialized | Disposed) => BuffersAllocated,
            (CreateBuffers, _) => return Err(invalid("buffers already created")),

            (Start, BuffersAllocated | Stopped) => Running,
            (Start, Running) => return Err(absent("already running")),
            (Start, _) => return Err(absent("no buffers")),

            (Stop, Running) => Stopped,
            (Stop, _) => return Err(absent("not running")),

            (DisposeBuffers, BuffersAllocated | Stopped) => Disposed,
            (DisposeBuffers, Running) => return Err(invalid("stop before disposing")),
            (DisposeBuffers, _) => return Err(invalid("no buffers")),
        };

        Ok(Transition::Changed { from, to })
    }

    /// Move to the state `transition` names. Must come from [`Self::check`]
    /// on the current state.
    pub fn commit(&mut self, transition: Transition) {
        if let Transition::Changed { from, to } = transition {
            debug_assert_eq!(from, self.state);
            tracing::debug!("lifecycle {from:?} -> {to:?}");
            self.state = to;
        }
    }

    /// `check` followed by `commit`.
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<Transition, LifecycleError> {
        let transition = self.check(event)?;
        self.commit(transition);
        Ok(transition)
    }
}
