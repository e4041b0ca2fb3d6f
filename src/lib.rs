//! # pwasio - ASIO-style driver on a multi-client audio service
//!
//! Exposes the synchronous, double-buffered client API (a swap callback, two
//! fixed-size buffer slots per channel, an explicit lifecycle) on top of a
//! backend that works in streams, shared-memory buffers and realtime threads.
//!
//! ## Architecture
//!
//! - **pwasio-core** - Arena, port registry, swap protocol, lifecycle, realtime
//!   thread adapter, invocation channel, backend traits, loopback backend
//! - **pwasio** - The [`AsioDriver`] method table, status codes, builder and
//!   control panel
//!
//! ## Quick Start
//!
//! ```ignore
//! use pwasio::prelude::*;
//!
//! let backend = Arc::new(LoopbackBackend::new(ClockMode::FreeRunning));
//! let driver = Driver::builder(backend).build()?;
//!
//! assert!(driver.init());
//! let mut infos = [BufferInfo::input(0), BufferInfo::output(0)];
//! driver.create_buffers(&mut infos, 256, Arc::new(MyHost))?;
//! driver.start()?;
//! ```

/// Re-export of pwasio-core for direct access
pub use pwasio_core as core;

pub mod api;
pub use api::{
    AsioDriver, BufferInfo, BufferSizeRange, ChannelCounts, ChannelInfo, ClockSource, Latencies,
    SamplePosition, SAMPLE_TYPE_FLOAT32_LSB,
};

mod builder;
pub use builder::DriverBuilder;

mod driver;
pub use driver::{Driver, DRIVER_NAME, DRIVER_VERSION};

pub mod error;
pub use error::{status_code, AsioError, AsioResult, Error, Result, ASE_OK};

mod panel;
pub use panel::{ConfigDialog, PANEL_CLOSE_TIMEOUT};

pub use pwasio_core::{
    AsioTime, ClockMode, ConfigStore, Direction, DriverState, HostCallbacks, HostPriority,
    HostScheduler, LoopbackBackend, MemoryStore, MessageSelector, NativeScheduler, SampleWords,
    StreamConfig, TimeInfoFlags, TomlFileStore,
};

pub mod prelude {
    pub use crate::{
        AsioDriver, AsioError, AsioResult, BufferInfo, ClockMode, ConfigDialog, Direction, Driver,
        HostCallbacks, LoopbackBackend, MemoryStore, MessageSelector, StreamConfig, TomlFileStore,
    };
    pub use std::sync::Arc;
}
