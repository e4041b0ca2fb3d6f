//! Lifecycle integration tests
//!
//! Valid and invalid call orders, forced stops, re-entry and release.

use crate::helpers::*;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use pwasio::core::{Backend, BackendStream};
use pwasio::prelude::*;
use pwasio::{status_code, DriverState};
use std::time::Duration;

/// How long a lifecycle call may take before it counts as deadlocked.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Host that calls back into the driver from inside its callbacks.
///
/// A gate, when set, holds the next swap open until the test releases it;
/// the driver is queried after the gate opens.
#[derive(Default)]
struct ReentrantHost {
    driver: Mutex<Option<Driver>>,
    entered: Mutex<Option<Sender<()>>>,
    gate: Mutex<Option<Receiver<()>>>,
    /// `(preferred size, output 0 active, rate, position ok)` per swap.
    answers: Mutex<Vec<(i32, bool, f64, bool)>>,
    time_info_answers: Mutex<Vec<i32>>,
}

impl ReentrantHost {
    fn driver(&self) -> Option<Driver> {
        self.driver.lock().clone()
    }

    /// Release the driver handle so the host no longer keeps it alive.
    fn detach(&self) {
        self.driver.lock().take();
    }
}

impl HostCallbacks for ReentrantHost {
    fn swap_buffers(&self, _index: usize, _direct_process: bool) {
        if let Some(entered) = self.entered.lock().take() {
            let _ = entered.send(());
        }
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(CALL_TIMEOUT);
        }

        let Some(driver) = self.driver() else {
            return;
        };
        let size = driver.buffer_size().map_or(-1, |sizes| sizes.preferred);
        let active = driver
            .channel_info(Direction::Output, 0)
            .is_ok_and(|info| info.is_active);
        let rate = driver.sample_rate().unwrap_or(0.0);
        let position = driver.sample_position().is_ok();
        self.answers.lock().push((size, active, rate, position));
    }

    fn message(&self, selector: MessageSelector, _value: i32) -> i32 {
        if selector == MessageSelector::SupportsTimeInfo {
            if let Some(driver) = self.driver() {
                let inputs = driver.channels().map_or(-1, |counts| counts.inputs);
                self.time_info_answers.lock().push(inputs);
            }
        }
        0
    }
}

/// Run `f` on its own thread and fail the test if it does not return in time.
fn within_timeout<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(CALL_TIMEOUT)
        .expect("driver call did not return, lock held across the host callback")
}

fn reentrant_driver() -> (Driver, LoopbackBackend, Arc<ReentrantHost>) {
    let (driver, backend) = test_driver();
    assert!(driver.init());
    let host = Arc::new(ReentrantHost::default());
    *host.driver.lock() = Some(driver.clone());

    let mut infos = stereo_infos();
    let callbacks: Arc<dyn HostCallbacks> = Arc::clone(&host) as Arc<dyn HostCallbacks>;
    let creator = driver.clone();
    let created: AsioResult<()> = within_timeout(move || {
        creator.create_buffers(&mut infos, TEST_BUFFER_SIZE as i32, callbacks)
    });
    created.unwrap();
    (driver, backend, host)
}

#[test]
fn test_start_before_init_is_not_present() {
    let (driver, _backend) = test_driver();

    let result = driver.start();
    assert_eq!(status_code(&result), -1000);
    assert_eq!(driver.error_message(), "Start: no IO");
    assert_eq!(driver.error_message(), "Undocumented error");
}

#[test]
fn test_init_is_idempotent() {
    let (driver, backend) = test_driver();

    assert!(driver.init());
    assert!(driver.init());
    assert_eq!(backend.stream_count(), 2);
    assert_eq!(driver.state(), DriverState::Initialized);

    let input = backend.stream(Direction::Input).unwrap();
    assert_eq!(input.props().name, "test-host");
    assert_eq!(input.props().category, "Capture");
    assert_eq!(input.props().force_quantum, TEST_BUFFER_SIZE as u32);
    assert!(input.props().always_process);
}

#[test]
fn test_init_failure_unwinds_input_stream() {
    let (driver, backend) = test_driver();
    backend.fail_next_create(Direction::Output);

    assert!(!driver.init());
    assert_eq!(driver.error_message(), "Init: failed to create output stream");
    assert_eq!(backend.stream_count(), 0);
    assert_eq!(driver.state(), DriverState::Created);

    assert!(driver.init());
    assert_eq!(backend.stream_count(), 2);
}

#[test]
fn test_create_buffers_twice_is_invalid_mode() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, _backend) = driver_with_buffers(&mut infos, &host);

    let mut again = stereo_infos();
    let err = driver
        .create_buffers(&mut again, TEST_BUFFER_SIZE as i32, host)
        .unwrap_err();
    assert_eq!(err.code(), -997);
    assert_eq!(
        driver.error_message(),
        "CreateBuffers: buffers already created"
    );
    assert!(again.iter().all(|info| info.buffers == [None, None]));
}

#[test]
fn test_stop_when_stopped_is_not_present() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, _backend) = driver_with_buffers(&mut infos, &host);

    let before = driver.stop();
    assert_eq!(status_code(&before), -1000);
    assert_eq!(driver.state(), DriverState::BuffersAllocated);

    driver.start().unwrap();
    driver.stop().unwrap();
    assert_eq!(driver.state(), DriverState::Stopped);

    let again = driver.stop();
    assert_eq!(status_code(&again), -1000);
    assert_eq!(driver.error_message(), "Stop: not running");
    assert_eq!(driver.state(), DriverState::Stopped);
}

#[test]
fn test_start_while_running_is_not_present() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, _backend) = driver_with_buffers(&mut infos, &host);

    driver.start().unwrap();
    assert_eq!(status_code(&driver.start()), -1000);
    assert_eq!(driver.state(), DriverState::Running);
    driver.stop().unwrap();
}

#[test]
fn test_dispose_twice_errors_without_double_free() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, _backend) = driver_with_buffers(&mut infos, &host);

    driver.dispose_buffers().unwrap();
    assert_eq!(driver.state(), DriverState::Disposed);

    let again = driver.dispose_buffers();
    assert_eq!(status_code(&again), -997);
    assert_eq!(driver.error_message(), "DisposeBuffers: no buffers");
    assert!(driver.stats().is_none());
}

#[test]
fn test_dispose_while_running_forces_stop() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);

    driver.start().unwrap();
    assert_eq!(backend.run_cycles(3), 3);
    driver.dispose_buffers().unwrap();

    assert_eq!(driver.state(), DriverState::Disposed);
    assert!(!backend.is_running());
    for direction in [Direction::Input, Direction::Output] {
        assert!(!backend.stream(direction).unwrap().is_connected());
    }
}

#[test]
fn test_restart_continues_position() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);

    driver.start().unwrap();
    assert_eq!(backend.run_cycles(5), 5);
    driver.stop().unwrap();

    driver.start().unwrap();
    assert_eq!(backend.run_cycles(5), 5);
    driver.stop().unwrap();

    let position = driver.sample_position().unwrap();
    assert_eq!(u64::from(position.samples), 10 * TEST_BUFFER_SIZE as u64);
    assert_eq!(host.swap_count(), 10);
}

#[test]
fn test_buffers_can_be_recreated_after_dispose() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);
    driver.dispose_buffers().unwrap();

    let mut fresh = vec![BufferInfo::output(1)];
    driver
        .create_buffers(&mut fresh, TEST_BUFFER_SIZE as i32, host)
        .unwrap();
    assert!(fresh[0].buffers.iter().all(Option::is_some));

    driver.start().unwrap();
    assert_eq!(backend.run_cycles(2), 2);
    driver.stop().unwrap();
}

#[test]
fn test_release_tears_down_once() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);
    driver.start().unwrap();

    let second = driver.clone();
    assert_eq!(driver.ref_count(), 2);
    assert_eq!(driver.release(), 1);

    assert!(backend.is_running());
    assert_eq!(backend.stream_count(), 2);

    assert_eq!(second.release(), 0);
    assert!(!backend.is_running());
    assert_eq!(backend.stream_count(), 0);
}

#[test]
fn test_build_without_realtime_privileges_fails() {
    let result = Driver::builder(Arc::new(loopback()))
        .scheduler(Arc::new(UnprivilegedScheduler))
        .build();

    match result {
        Err(pwasio::Error::Core(pwasio::core::Error::Thread(
            pwasio::core::ThreadError::Privileges(_),
        ))) => {}
        other => panic!("expected a privileges error, got {other:?}"),
    }
}

#[test]
fn test_driver_queries_answer_from_inside_callbacks() {
    let (driver, backend, host) = reentrant_driver();
    assert_eq!(*host.time_info_answers.lock(), vec![2]);
    assert!(!driver.uses_time_info());

    driver.start().unwrap();
    assert_eq!(backend.run_cycles(4), 4);
    let stopper = driver.clone();
    within_timeout(move || stopper.stop()).unwrap();

    let answers = host.answers.lock().clone();
    assert_eq!(answers.len(), 4);
    assert!(answers.iter().all(|&a| a == (256, true, 48000.0, true)));

    host.detach();
    assert_eq!(driver.state(), DriverState::Prepared);
}

#[test]
fn test_stop_while_callback_is_inside_the_driver() {
    let (driver, backend, host) = reentrant_driver();
    let (entered_tx, entered_rx) = bounded(1);
    let (gate_tx, gate_rx) = bounded(1);
    *host.entered.lock() = Some(entered_tx);
    *host.gate.lock() = Some(gate_rx);

    driver.start().unwrap();
    let cycler = backend.clone();
    let cycling = std::thread::spawn(move || cycler.run_cycles(1));
    entered_rx.recv_timeout(CALL_TIMEOUT).unwrap();

    // Stop begins while the swap is held open, then the swap queries the
    // driver before returning.
    let stopper = driver.clone();
    let (stopped_tx, stopped_rx) = bounded(1);
    std::thread::spawn(move || {
        let _ = stopped_tx.send(stopper.stop());
    });
    let deadline = std::time::Instant::now() + CALL_TIMEOUT;
    while backend.is_running() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(!backend.is_running());
    gate_tx.send(()).unwrap();

    stopped_rx
        .recv_timeout(CALL_TIMEOUT)
        .expect("stop did not return while the callback queried the driver")
        .unwrap();
    let _ = cycling.join();

    assert_eq!(*host.answers.lock(), vec![(256, true, 48000.0, true)]);
    let stats = driver.stats().unwrap();
    assert_eq!(stats.cycles.get(), 1);
    // The data loop was already down when the swap queued its output back.
    assert_eq!(stats.dropped_triggers.get(), 1);

    host.detach();
    driver.dispose_buffers().unwrap();
    assert_eq!(driver.state(), DriverState::Initialized);
}
