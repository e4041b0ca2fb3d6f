//! Builder for configuring and constructing a [`Driver`].

use crate::driver::{Driver, DriverParts};
use crate::panel::ConfigDialog;
use crate::Result;
use pwasio_core::{
    Backend, ConfigStore, HostScheduler, MemoryStore, NativeScheduler, RtThreadAdapter,
    StreamConfig, ThreadError, ThreadUtils,
};
use std::sync::Arc;
use tracing::info;

/// Longest stream name the backend accepts.
const MAX_NAME: usize = 31;

/// The configuration is read from the store once, at build time. Changes
/// made through the control panel take effect on the next driver instance.
///
/// # Example
///
/// ```ignore
/// use pwasio::prelude::*;
///
/// let backend = Arc::new(LoopbackBackend::new(ClockMode::FreeRunning));
/// let driver = Driver::builder(backend)
///     .store(Arc::new(TomlFileStore::open("pwasio.toml")?))
///     .build()?;
///
/// assert!(driver.init());
/// ```
pub struct DriverBuilder {
    backend: Arc<dyn Backend>,
    store: Option<Arc<dyn ConfigStore>>,
    scheduler: Option<Arc<dyn HostScheduler>>,
    dialog: Option<Arc<dyn ConfigDialog>>,
    stream_name: Option<String>,
}

impl DriverBuilder {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            store: None,
            scheduler: None,
            dialog: None,
            stream_name: None,
        }
    }

    /// Default: an empty [`MemoryStore`].
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Default: [`NativeScheduler`].
    pub fn scheduler(mut self, scheduler: Arc<dyn HostScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Without a dialog, `control_panel` reports NotPresent.
    pub fn dialog(mut self, dialog: Arc<dyn ConfigDialog>) -> Self {
        self.dialog = Some(dialog);
        self
    }

    /// Default: the executable's file name.
    pub fn stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = Some(name.into());
        self
    }

    /// Fails if realtime scheduling privileges cannot be acquired.
    pub fn build(self) -> Result<Driver> {
        let scheduler: Arc<dyn HostScheduler> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(NativeScheduler::new()),
        };
        scheduler
            .acquire_privileges()
            .map_err(|e| pwasio_core::Error::Thread(ThreadError::Privileges(e)))?;

        let store: Arc<dyn ConfigStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let config = StreamConfig::load(store.as_ref());

        let utils: Arc<dyn ThreadUtils> = Arc::new(RtThreadAdapter::new(scheduler));
        self.backend.set_thread_utils(Arc::clone(&utils));

        let stream_name = truncate_name(self.stream_name.unwrap_or_else(executable_name));
        info!(
            "pwasio on {}: {} in / {} out, {} frames @ {} Hz",
            self.backend.name(),
            config.n_inputs,
            config.n_outputs,
            config.buffer_size,
            config.sample_rate
        );

        Ok(Driver::new(DriverParts {
            backend: self.backend,
            utils,
            store,
            dialog: self.dialog,
            config,
            stream_name,
        }))
    }
}

fn executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| crate::driver::DRIVER_NAME.to_string())
}

fn truncate_name(name: String) -> String {
    if name.chars().count() <= MAX_NAME {
        name
    } else {
        name.chars().take(MAX_NAME).collect()
    }
}
