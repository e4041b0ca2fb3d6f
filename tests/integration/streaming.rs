//! Streaming integration tests
//!
//! Drives manual loopback cycles through the swap protocol and checks what
//! the host sees and what reaches the output sinks.

use crate::helpers::*;
use pwasio::core::{Backend, HostScheduler};
use pwasio::prelude::*;
use pwasio::{HostPriority, TimeInfoFlags};
use std::collections::HashSet;

const CYCLES: usize = 10;

fn run(driver: &Driver, backend: &LoopbackBackend, cycles: usize) {
    driver.start().unwrap();
    assert_eq!(backend.run_cycles(cycles), cycles);
    driver.stop().unwrap();
}

#[test]
fn test_passthrough_reaches_output_sinks() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);
    backend.set_input_signal(ramp);

    run(&driver, &backend, CYCLES);

    let expected: Vec<f32> = (0..CYCLES * TEST_BUFFER_SIZE).map(|i| i as f32).collect();
    assert_eq!(backend.output_sink(0), expected);
    assert_eq!(backend.output_sink(1), expected);
    assert_eq!(backend.input_cycles(), CYCLES as u64);
    assert_eq!(backend.output_cycles(), CYCLES as u64);
}

#[test]
fn test_inactive_output_stays_silent() {
    let host = RecordingHost::new();
    let mut infos = vec![BufferInfo::input(0), BufferInfo::output(0)];
    let (driver, backend) = driver_with_buffers(&mut infos, &host);
    backend.set_input_signal(|_, _| 0.5);

    run(&driver, &backend, 4);

    assert!(backend.output_sink(0).iter().all(|&s| s == 0.5));
    assert!(backend.output_sink(1).iter().all(|&s| s == 0.0));
}

#[test]
fn test_swap_index_alternates_on_one_thread() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);

    run(&driver, &backend, CYCLES);

    let swaps = host.swaps.lock().clone();
    let expected: Vec<usize> = (0..CYCLES).map(|k| k % 2).collect();
    assert_eq!(swaps, expected);

    let threads: HashSet<_> = host.threads.lock().iter().copied().collect();
    assert_eq!(threads.len(), 1);
    assert!(!threads.contains(&std::thread::current().id()));
    assert!(host.times.lock().is_empty());
}

#[test]
fn test_time_info_host_gets_positions() {
    let host = RecordingHost::with_time_info();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);
    assert!(driver.uses_time_info());

    run(&driver, &backend, 3);

    let times = host.times.lock().clone();
    assert_eq!(times.len(), 3);
    for (k, time) in times.iter().enumerate() {
        assert_eq!(time.sample_position.hi, 0);
        assert_eq!(time.sample_position.lo, (k * TEST_BUFFER_SIZE) as u32);
        assert!(time.flags.contains(TimeInfoFlags::SAMPLE_POSITION_VALID));
        assert!(time.flags.contains(TimeInfoFlags::SYSTEM_TIME_VALID));
        assert_eq!(time.sample_rate, TEST_SAMPLE_RATE as f64);
    }
    assert_eq!(host.swaps.lock().as_slice(), &[0, 1, 0]);
}

#[test]
fn test_sample_position_advances_per_cycle() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);

    let before = driver.sample_position().unwrap();
    assert_eq!(u64::from(before.samples), 0);

    driver.start().unwrap();
    assert_eq!(backend.run_cycles(4), 4);
    let running = driver.sample_position().unwrap();
    assert_eq!(u64::from(running.samples), 4 * TEST_BUFFER_SIZE as u64);
    driver.stop().unwrap();

    driver.dispose_buffers().unwrap();
    let after = driver.sample_position().unwrap();
    assert_eq!(after.samples, running.samples);
    assert_eq!(after.timestamp, running.timestamp);
}

#[test]
fn test_realtime_threads_are_elevated() {
    let scheduler = Arc::new(PermissiveScheduler::default());
    let backend = loopback();
    let driver = Driver::builder(Arc::new(backend.clone()))
        .scheduler(Arc::clone(&scheduler) as Arc<dyn HostScheduler>)
        .build()
        .unwrap();

    assert!(driver.init());
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    driver
        .create_buffers(&mut infos, TEST_BUFFER_SIZE as i32, host)
        .unwrap();
    driver.start().unwrap();

    let loop_tid = backend.loop_thread_tid().unwrap();
    assert_eq!(scheduler.priority(loop_tid), Some(HostPriority::TimeCritical));
    assert!(matches!(scheduler.fifo(loop_tid), Some(Some(_))));
    // Data loop plus processor.
    assert_eq!(scheduler.count(HostPriority::TimeCritical), 2);

    assert_eq!(backend.run_cycles(2), 2);
    driver.stop().unwrap();
    assert!(backend.loop_thread_tid().is_none());
    assert_eq!(scheduler.priority(loop_tid), Some(HostPriority::Normal));
    assert!(!backend.is_running());
}

#[test]
fn test_clean_run_has_no_violations() {
    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    let (driver, backend) = driver_with_buffers(&mut infos, &host);

    run(&driver, &backend, CYCLES);

    let stats = driver.stats().unwrap();
    assert_eq!(stats.cycles.get(), CYCLES as u64);
    assert_eq!(stats.violations.get(), 0);
    assert_eq!(stats.overruns.get(), 0);
    assert_eq!(stats.unnegotiated.get(), 0);
    assert_eq!(host.swap_count(), CYCLES);
}

#[test]
fn test_free_running_clock_drives_cycles() {
    let backend = LoopbackBackend::new(ClockMode::FreeRunning);
    let driver = Driver::builder(Arc::new(backend.clone()))
        .scheduler(Arc::new(PermissiveScheduler::default()))
        .build()
        .unwrap();
    assert!(driver.init());

    let host = RecordingHost::new();
    let mut infos = stereo_infos();
    driver
        .create_buffers(&mut infos, TEST_BUFFER_SIZE as i32, host.clone())
        .unwrap();
    host.attach(&infos);

    driver.start().unwrap();
    let deadline = std::time::Instant::now() + CYCLE_TIMEOUT;
    while host.swap_count() < 3 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    driver.stop().unwrap();

    assert!(host.swap_count() >= 3);
    assert_eq!(driver.stats().unwrap().violations.get(), 0);
}
