//! Control panel: the configuration dialog on its own thread.

use arc_swap::ArcSwapOption;
use crossbeam_channel::{bounded, Receiver};
use pwasio_core::{AtomicFlag, ConfigStore, HostCallbacks, MessageSelector, StreamConfig};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long teardown waits for an open dialog.
pub const PANEL_CLOSE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Host callbacks shared between the driver and the panel thread.
pub(crate) type HostSlot = ArcSwapOption<Arc<dyn HostCallbacks>>;

/// The configuration dialog UI.
pub trait ConfigDialog: Send + Sync {
    /// Show `current` and block until the user closes the dialog.
    ///
    /// Returns the edited configuration on accept, `None` on cancel.
    fn run(&self, current: &StreamConfig) -> Option<StreamConfig>;
}

/// Everything the panel thread needs.
pub(crate) struct PanelContext {
    pub dialog: Arc<dyn ConfigDialog>,
    pub store: Arc<dyn ConfigStore>,
    pub config: StreamConfig,
    pub callbacks: Arc<HostSlot>,
}

#[derive(Default)]
pub(crate) struct ControlPanel {
    thread: Option<JoinHandle<()>>,
    open: Arc<AtomicFlag>,
    done: Option<Receiver<()>>,
}

impl ControlPanel {
    /// Spawn the dialog thread.
    ///
    /// Returns `Ok(false)` without doing anything while a dialog is already
    /// open. A finished previous thread is joined first.
    pub fn open(&mut self, context: PanelContext) -> io::Result<bool> {
        if self.open.get() {
            return Ok(false);
        }
        if let Some(previous) = self.thread.take() {
            let _ = previous.join();
        }

        let (done_tx, done_rx) = bounded(1);
        let open = Arc::clone(&self.open);
        open.set(true);

        let spawned = thread::Builder::new()
            .name("pwasio-panel".into())
            .spawn(move || {
                run_dialog(&context);
                open.set(false);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.done = Some(done_rx);
                Ok(true)
            }
            Err(e) => {
                self.open.set(false);
                Err(e)
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.get()
    }

    /// Wait up to `timeout` for the dialog to close and join its thread.
    ///
    /// Returns `false` if it is still open; the thread is then detached.
    pub fn close(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.thread.take() else {
            return true;
        };

        let closed = match self.done.take() {
            Some(done) => done.recv_timeout(timeout).is_ok() || !self.open.get(),
            None => !self.open.get(),
        };

        if closed {
            let _ = handle.join();
        } else {
            warn!("control panel still open after {timeout:?}, detaching");
        }
        closed
    }
}

impl std::fmt::Debug for ControlPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPanel")
            .field("open", &self.open.get())
            .finish_non_exhaustive()
    }
}

fn run_dialog(context: &PanelContext) {
    let Some(edited) = context.dialog.run(&context.config) else {
        debug!("control panel cancelled");
        return;
    };

    let edited = edited.sanitized();
    let written = match edited.store_changes(&context.config, context.store.as_ref()) {
        Ok(written) => written,
        Err(e) => {
            warn!("failed to store configuration: {e}");
            return;
        }
    };
    if written == 0 {
        return;
    }

    info!("control panel stored {written} changed settings, requesting reset");
    if let Some(callbacks) = context.callbacks.load_full() {
        callbacks.message(MessageSelector::ResetRequest, 0);
    }
}
