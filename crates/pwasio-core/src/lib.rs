//! Buffer-lifecycle and double-buffering engine for the pwasio bridge.
//!
//! # Primary API
//!
//! - [`PortRegistry`] / [`Arena`]: page-aligned shared buffer slots per channel
//! - [`SwapEngine`]: the double-buffer swap protocol and position counter
//! - [`Lifecycle`]: valid operation sequencing
//! - [`RtThreadAdapter`]: realtime thread hooks handed to the backend
//! - [`Processor`] / [`InvokeChannel`]: backend events onto one owning thread
//! - [`Backend`] / [`BackendStream`]: the backend collaborator traits
//! - [`LoopbackBackend`]: deterministic software backend for tests and demos
//!
//! # Example
//!
//! ```ignore
//! use pwasio_core::{ChannelSpec, PortRegistry, StreamConfig};
//!
//! let registry = PortRegistry::allocate(
//!     &StreamConfig::default(),
//!     &[ChannelSpec::input(0), ChannelSpec::output(0)],
//! )?;
//! let [front, back] = registry.channel(Direction::Output, 0).unwrap().pointers();
//! ```

pub mod error;
pub use error::{ArenaStage, BackendError, Error, Result, ThreadError};

pub mod arena;
pub use arena::{AliasedSlot, Arena, ArenaLayout, SAMPLE_BYTES, SLOTS};

pub mod backend;
pub use backend::{
    AudioFormat, Backend, BackendBuffer, BackendStream, BufferNegotiation, Chunk, ConnectFlags,
    Cycle, DataKind, DataPlane, SampleFormat, StreamEvents, StreamProps, BUFFERS_PER_STREAM,
};

pub mod callback;
pub use callback::{AsioTime, HostCallbacks, MessageSelector, TimeInfoFlags};

pub mod config;
pub use config::{ConfigStore, StreamConfig, MAX_PORTS};

mod events;
pub use events::PortEvents;

pub mod invoke;
pub use invoke::{Invocation, InvokeChannel, InvokeSender, Processor, INVOKE_CAPACITY};

pub mod lifecycle;
pub use lifecycle::{DriverState, Lifecycle, LifecycleError, LifecycleEvent, Transition};

pub(crate) mod lockfree;
pub use lockfree::{AtomicCounter, AtomicFlag};

pub mod loopback;
pub use loopback::{ClockMode, LoopbackBackend, LoopbackStream};

pub mod ports;
pub use ports::{BufferSlot, Channel, ChannelSpec, Direction, PortRegistry};

pub mod position;
pub use position::{Position, PositionCounter, SampleWords};

pub mod rt;
pub use rt::{
    current_tid, HostPriority, HostScheduler, NativeScheduler, RtPriority, RtThread,
    RtThreadAdapter, ThreadUtils,
};

pub mod store;
pub use store::{MemoryStore, TomlFileStore};

pub mod swap;
pub use swap::{SlotOwner, SwapContext, SwapEngine, SwapStats};
