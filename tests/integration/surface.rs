//! Query surface integration tests
//!
//! Channel counts, latencies, rates, clock sources, identity and the
//! configuration the driver picks up from its store.

use crate::helpers::*;
use proptest::prelude::*;
use pwasio::core::config::{KEY_BUFFER_SIZE, KEY_N_INPUTS, KEY_N_OUTPUTS, KEY_SAMPLE_RATE};
use pwasio::prelude::*;
use pwasio::{status_code, ConfigStore, DRIVER_NAME, DRIVER_VERSION, SAMPLE_TYPE_FLOAT32_LSB};

#[test]
fn test_queries_before_init_are_not_present() {
    let (driver, _backend) = test_driver();

    assert_eq!(status_code(&driver.channels()), -1000);
    assert_eq!(status_code(&driver.latencies()), -1000);
    assert_eq!(status_code(&driver.buffer_size()), -1000);
    assert_eq!(status_code(&driver.sample_rate()), -1000);
    assert_eq!(status_code(&driver.can_sample_rate(48000.0)), -1000);
    assert_eq!(status_code(&driver.clock_sources()), -1000);
    assert_eq!(status_code(&driver.sample_position()), -1000);
    assert_eq!(status_code(&driver.channel_info(Direction::Input, 0)), -1000);
    assert_eq!(driver.error_message(), "GetChannelInfo: no IO");
}

#[test]
fn test_default_configuration_after_init() {
    let (driver, _backend) = test_driver();
    assert!(driver.init());

    let channels = driver.channels().unwrap();
    assert_eq!((channels.inputs, channels.outputs), (2, 2));

    let latencies = driver.latencies().unwrap();
    assert_eq!(latencies.input, TEST_BUFFER_SIZE as i32);
    assert_eq!(latencies.output, 0);

    let sizes = driver.buffer_size().unwrap();
    assert_eq!(sizes.min, 256);
    assert_eq!(sizes.max, 256);
    assert_eq!(sizes.preferred, 256);
    assert_eq!(sizes.granularity, 0);

    assert_eq!(driver.sample_rate().unwrap(), 48000.0);
    assert!(driver.can_sample_rate(48000.0).is_ok());
    assert!(driver.set_sample_rate(48000.0).is_ok());
}

#[test]
fn test_foreign_sample_rate_is_no_clock() {
    let (driver, _backend) = test_driver();
    assert!(driver.init());

    let err = driver.can_sample_rate(44100.0).unwrap_err();
    assert_eq!(err.code(), -995);
    assert_eq!(driver.error_message(), "CanSampleRate: invalid sample rate");

    assert_eq!(driver.set_sample_rate(96000.0).unwrap_err().code(), -995);
    assert_eq!(driver.sample_rate().unwrap(), 48000.0);
}

#[test]
fn test_single_clock_source_named_after_backend() {
    let (driver, _backend) = test_driver();
    assert!(driver.init());

    let sources = driver.clock_sources().unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].index, 0);
    assert_eq!(sources[0].channel, -1);
    assert_eq!(sources[0].group, -1);
    assert!(sources[0].is_current);
    assert_eq!(sources[0].name, "Loopback");

    assert!(driver.set_clock_source(0).is_ok());
    assert_eq!(driver.set_clock_source(1).unwrap_err().code(), -998);
}

#[test]
fn test_channel_info_names_and_bounds() {
    let (driver, _backend) = test_driver();
    assert!(driver.init());

    let info = driver.channel_info(Direction::Output, 1).unwrap();
    assert_eq!(info.name, "out_1");
    assert_eq!(info.group, 0);
    assert_eq!(info.sample_type, SAMPLE_TYPE_FLOAT32_LSB);
    assert!(!info.is_active);
    assert_eq!(driver.channel_info(Direction::Input, 0).unwrap().name, "in_0");

    assert_eq!(driver.channel_info(Direction::Input, -1).unwrap_err().code(), -998);
    assert_eq!(driver.channel_info(Direction::Input, 2).unwrap_err().code(), -998);
    assert_eq!(driver.error_message(), "GetChannelInfo: no input channel 2");
}

#[test]
fn test_identity() {
    let (driver, _backend) = test_driver();

    assert_eq!(driver.driver_name(), DRIVER_NAME);
    assert_eq!(driver.driver_version(), 1 << 10);
    assert_eq!(driver.driver_version(), DRIVER_VERSION);
    assert_eq!(driver.stream_name(), "test-host");
}

#[test]
fn test_unimplemented_entry_points() {
    let (driver, _backend) = test_driver();
    assert!(driver.init());

    assert_eq!(driver.future(1).unwrap_err().code(), -1000);
    assert_eq!(driver.output_ready().unwrap_err().code(), -1000);
}

#[test]
fn test_error_message_is_consumed_once() {
    let (driver, _backend) = test_driver();

    assert_eq!(driver.error_message(), "Undocumented error");
    let _ = driver.latencies();
    assert_eq!(driver.error_message(), "GetLatencies: no IO");
    assert_eq!(driver.error_message(), "Undocumented error");

    assert!(driver.init());
    let _ = driver.clock_sources().unwrap();
    assert_eq!(driver.error_message(), "Undocumented error");
}

#[test]
fn test_store_values_are_honoured() {
    let store = Arc::new(MemoryStore::new());
    store.set(KEY_N_INPUTS, 4).unwrap();
    store.set(KEY_BUFFER_SIZE, 128).unwrap();

    let (driver, backend) = test_driver_with(Arc::clone(&store));
    assert_eq!(store.len(), 5);
    assert_eq!(store.get(KEY_N_OUTPUTS).unwrap(), Some(2));
    assert_eq!(store.get(KEY_SAMPLE_RATE).unwrap(), Some(48000));

    assert!(driver.init());
    let channels = driver.channels().unwrap();
    assert_eq!((channels.inputs, channels.outputs), (4, 2));
    assert_eq!(driver.buffer_size().unwrap().preferred, 128);

    let input = backend.stream(Direction::Input).unwrap();
    assert_eq!(input.props().force_quantum, 128);

    let host = RecordingHost::new();
    let mut infos = vec![BufferInfo::input(3), BufferInfo::output(0)];
    let err = driver
        .create_buffers(&mut infos, TEST_BUFFER_SIZE as i32, host.clone())
        .unwrap_err();
    assert_eq!(err.code(), -997);
    driver.create_buffers(&mut infos, 128, host).unwrap();
}

#[test]
fn test_oversized_channel_counts_are_clamped() {
    let store = Arc::new(MemoryStore::new());
    store.set(KEY_N_INPUTS, 100).unwrap();

    let (driver, _backend) = test_driver_with(store);
    assert!(driver.init());
    assert_eq!(driver.channels().unwrap().inputs, 32);
}

#[test]
fn test_toml_store_round_trips_through_driver() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pwasio.toml");
    std::fs::write(&path, "n_outputs = 6\n").unwrap();

    let backend = loopback();
    let driver = Driver::builder(Arc::new(backend.clone()))
        .store(Arc::new(TomlFileStore::open(&path).unwrap()))
        .scheduler(Arc::new(PermissiveScheduler::default()))
        .build()
        .unwrap();
    assert_eq!(driver.config().n_outputs, 6);
    drop(driver);

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("n_outputs = 6"));
    assert!(text.contains("buffer_size = 256"));
    assert!(text.contains("autoconnect = 1"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn channel_info_accepts_exactly_configured_indices(index in -4i32..40) {
        let (driver, _backend) = test_driver();
        prop_assert!(driver.init());

        for direction in [Direction::Input, Direction::Output] {
            let result = driver.channel_info(direction, index);
            if (0..2).contains(&index) {
                let info = result.unwrap();
                prop_assert_eq!(info.index, index);
                prop_assert_eq!(info.name, format!("{}_{index}", direction.prefix()));
            } else {
                prop_assert_eq!(result.unwrap_err().code(), -998);
            }
        }
    }
}
