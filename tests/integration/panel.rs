//! Control panel integration tests

use crate::helpers::*;
use parking_lot::Mutex;
use pwasio::core::config::KEY_BUFFER_SIZE;
use pwasio::prelude::*;
use pwasio::ConfigStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Accepts with a fixed edit and remembers what it was shown.
struct AcceptingDialog {
    edit: StreamConfig,
    shown: Mutex<Vec<StreamConfig>>,
}

impl ConfigDialog for AcceptingDialog {
    fn run(&self, current: &StreamConfig) -> Option<StreamConfig> {
        self.shown.lock().push(*current);
        Some(self.edit)
    }
}

/// Cancels after a delay.
struct SlowDialog {
    delay: Duration,
    finished: AtomicBool,
}

impl ConfigDialog for SlowDialog {
    fn run(&self, _current: &StreamConfig) -> Option<StreamConfig> {
        std::thread::sleep(self.delay);
        self.finished.store(true, Ordering::SeqCst);
        None
    }
}

fn driver_with_dialog(
    store: Arc<MemoryStore>,
    dialog: Arc<dyn ConfigDialog>,
) -> (Driver, LoopbackBackend) {
    let backend = loopback();
    let driver = Driver::builder(Arc::new(backend.clone()))
        .store(store)
        .scheduler(Arc::new(PermissiveScheduler::default()))
        .dialog(dialog)
        .build()
        .expect("Failed to build driver with dialog");
    (driver, backend)
}

fn wait_closed(driver: &Driver) {
    let deadline = Instant::now() + CYCLE_TIMEOUT;
    while driver.is_panel_open() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!driver.is_panel_open());
}

#[test]
fn test_no_dialog_is_not_present() {
    let (driver, _backend) = test_driver();

    let err = driver.control_panel().unwrap_err();
    assert_eq!(err.code(), -1000);
    assert_eq!(driver.error_message(), "ControlPanel: no control panel");
}

#[test]
fn test_accepted_edit_is_stored_and_reset_requested() {
    let store = Arc::new(MemoryStore::new());
    let dialog = Arc::new(AcceptingDialog {
        edit: StreamConfig {
            buffer_size: 512,
            ..StreamConfig::default()
        },
        shown: Mutex::new(Vec::new()),
    });
    let (driver, _backend) = driver_with_dialog(Arc::clone(&store), dialog.clone());

    assert!(driver.init());
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    driver
        .create_buffers(&mut infos, TEST_BUFFER_SIZE as i32, host.clone())
        .unwrap();

    driver.control_panel().unwrap();
    wait_closed(&driver);

    assert_eq!(dialog.shown.lock().as_slice(), &[StreamConfig::default()]);
    assert_eq!(store.get(KEY_BUFFER_SIZE).unwrap(), Some(512));
    assert!(host.messages.lock().contains(&MessageSelector::ResetRequest));

    // Takes effect on the next driver instance only.
    assert_eq!(driver.config().buffer_size, 256);
    assert_eq!(driver.buffer_size().unwrap().preferred, 256);
}

#[test]
fn test_unchanged_edit_requests_nothing() {
    let store = Arc::new(MemoryStore::new());
    let dialog = Arc::new(AcceptingDialog {
        edit: StreamConfig::default(),
        shown: Mutex::new(Vec::new()),
    });
    let (driver, _backend) = driver_with_dialog(store, dialog);

    assert!(driver.init());
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    driver
        .create_buffers(&mut infos, TEST_BUFFER_SIZE as i32, host.clone())
        .unwrap();

    driver.control_panel().unwrap();
    wait_closed(&driver);
    assert!(!host.messages.lock().contains(&MessageSelector::ResetRequest));
}

#[test]
fn test_release_waits_for_open_dialog() {
    let dialog = Arc::new(SlowDialog {
        delay: Duration::from_millis(200),
        finished: AtomicBool::new(false),
    });
    let (driver, _backend) = driver_with_dialog(Arc::new(MemoryStore::new()), dialog.clone());

    driver.control_panel().unwrap();
    assert!(driver.is_panel_open());
    // A second request while open is accepted and ignored.
    driver.control_panel().unwrap();

    assert_eq!(driver.release(), 0);
    assert!(dialog.finished.load(Ordering::SeqCst));
}
