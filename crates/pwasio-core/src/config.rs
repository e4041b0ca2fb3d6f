//! Stream configuration and its persisted key/value form.

use crate::{Error, Result};
use tracing::{debug, warn};

/// Maximum channels per direction.
pub const MAX_PORTS: usize = 32;

pub const KEY_N_INPUTS: &str = "n_inputs";
pub const KEY_N_OUTPUTS: &str = "n_outputs";
pub const KEY_BUFFER_SIZE: &str = "buffer_size";
pub const KEY_SAMPLE_RATE: &str = "sample_rate";
pub const KEY_AUTOCONNECT: &str = "autoconnect";

/// Key/value store the configuration is persisted in.
///
/// Values are unsigned 32-bit integers; booleans are stored as 0/1.
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<u32>>;

    fn set(&self, key: &str, value: u32) -> Result<()>;
}

/// Stream configuration. Immutable once buffers are allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub n_inputs: usize,
    pub n_outputs: usize,
    pub buffer_size: usize,
    pub sample_rate: usize,
    pub autoconnect: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            n_inputs: 2,
            n_outputs: 2,
            buffer_size: 256,
            sample_rate: 48000,
            autoconnect: true,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_inputs > MAX_PORTS || self.n_outputs > MAX_PORTS {
            return Err(Error::InvalidConfig(format!(
                "{} inputs / {} outputs exceeds {MAX_PORTS} channels per direction",
                self.n_inputs, self.n_outputs
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be non-zero".into()));
        }
        if self.sample_rate == 0 {
            return Err(Error::InvalidConfig("sample_rate must be non-zero".into()));
        }
        Ok(())
    }

    /// Clamp channel counts to [`MAX_PORTS`] and replace zero sizes with defaults.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.n_inputs = self.n_inputs.min(MAX_PORTS);
        self.n_outputs = self.n_outputs.min(MAX_PORTS);
        if self.buffer_size == 0 {
            self.buffer_size = defaults.buffer_size;
        }
        if self.sample_rate == 0 {
            self.sample_rate = defaults.sample_rate;
        }
        self
    }

    /// Read the configuration, writing defaults back for absent keys.
    ///
    /// Any store failure falls back to the full default set.
    pub fn load(store: &dyn ConfigStore) -> Self {
        match Self::try_load(store) {
            Ok(config) => config.sanitized(),
            Err(e) => {
                warn!("Unable to read configuration, using defaults: {e}");
                Self::default()
            }
        }
    }

    fn try_load(store: &dyn ConfigStore) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            n_inputs: get_or_init(store, KEY_N_INPUTS, defaults.n_inputs as u32)? as usize,
            n_outputs: get_or_init(store, KEY_N_OUTPUTS, defaults.n_outputs as u32)? as usize,
            buffer_size: get_or_init(store, KEY_BUFFER_SIZE, defaults.buffer_size as u32)?
                as usize,
            sample_rate: get_or_init(store, KEY_SAMPLE_RATE, defaults.sample_rate as u32)?
                as usize,
            autoconnect: get_or_init(store, KEY_AUTOCONNECT, defaults.autoconnect as u32)? != 0,
        })
    }

    /// Write only the keys whose value differs from `previous`.
    ///
    /// Returns the number of keys written.
    pub fn store_changes(&self, previous: &Self, store: &dyn ConfigStore) -> Result<usize> {
        let pairs = [
            (KEY_N_INPUTS, self.n_inputs as u32, previous.n_inputs as u32),
            (KEY_N_OUTPUTS, self.n_outputs as u32, previous.n_outputs as u32),
            (KEY_BUFFER_SIZE, self.buffer_size as u32, previous.buffer_size as u32),
            (KEY_SAMPLE_RATE, self.sample_rate as u32, previous.sample_rate as u32),
            (KEY_AUTOCONNECT, self.autoconnect as u32, previous.autoconnect as u32),
        ];

        let mut written = 0;
        for (key, value, old) in pairs {
            if value != old {
                store.set(key, value)?;
                written += 1;
            }
        }
        Ok(written)
    }
}

fn get_or_init(store: &dyn ConfigStore, key: &str, default: u32) -> Result<u32> {
    match store.get(key)? {
        Some(value) => Ok(value),
        None => {
            debug!("config key '{key}' absent, writing default {default}");
            store.set(key, default)?;
            Ok(default)
        }
    }
}
