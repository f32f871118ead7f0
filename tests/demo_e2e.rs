//! End-to-end tests driving the demo device through a session.
//!
//! These cover the full discovery -> open -> configure -> acquire -> close
//! lifecycle and the sinks fed by the datafeed bus.

#![cfg(feature = "demo")]

use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use logic_capture::datafeed::Packet;
use logic_capture::decoder::{DecoderRegistry, DecoderSink};
use logic_capture::demo::DemoPlugin;
use logic_capture::input::BinaryInput;
use logic_capture::output::{output_format, OutputSink};
use logic_capture::{
    list_devices_filtered, open_device, Device, DeviceConfig, DevicePlugin, DeviceStatus,
    DriverKind, EnabledDrivers, PacketCollector, PatternMode, Probe, Session,
};

/// Create an EnabledDrivers with only the demo driver enabled.
fn demo_only() -> EnabledDrivers {
    let mut kinds = EnabledDrivers::none();
    kinds.enable(DriverKind::Demo);
    kinds
}

fn fast_demo() -> Device {
    let mut plugin = DemoPlugin::new().with_interval(Duration::from_millis(5));
    plugin.init().unwrap();
    let device = Device::from_plugin(Box::new(plugin), 0);
    device.open().unwrap();
    device
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_discovery_lists_demo() {
    let devices = list_devices_filtered(&demo_only()).unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, "demo:0");
    assert_eq!(devices[0].kind, DriverKind::Demo);
}

#[test]
fn test_open_unknown_device_fails() {
    assert!(open_device("demo:3").is_err());
    assert!(open_device("nonexistent:0").is_err());
}

#[test]
fn test_limited_capture() {
    let _ = env_logger::builder().is_test(true).try_init();

    let device = open_device("demo:0").unwrap();
    assert_eq!(device.status(), DeviceStatus::Active);
    device
        .configure(&DeviceConfig::new().with_limit_samples(100))
        .unwrap();

    let mut session = Session::new();
    let collector = PacketCollector::new();
    session.subscribe(collector.clone());
    let id = session.add_device(device.clone());
    session.start().unwrap();
    session.run();

    assert_eq!(collector.count("header"), 1);
    assert_eq!(collector.count("end"), 1);
    assert_eq!(collector.logic_bytes(id).len(), 100);

    let packets = collector.packets();
    assert!(matches!(packets.first(), Some((_, Packet::Header(_)))));
    assert!(matches!(packets.last(), Some((_, Packet::End))));

    device.close().unwrap();
    assert_eq!(device.status(), DeviceStatus::Inactive);
}

#[test]
fn test_binary_output_matches_collected_samples() {
    let device = fast_demo();
    device
        .configure(
            &DeviceConfig::new()
                .with_pattern(PatternMode::Incremental)
                .with_limit_samples(300),
        )
        .unwrap();

    let buffer = SharedBuffer::default();
    let mut session = Session::new();
    let collector = PacketCollector::new();
    session.subscribe(collector.clone());
    session.subscribe(OutputSink::new(output_format("binary", None).unwrap(), buffer.clone()));
    let id = session.add_device(device);
    session.start().unwrap();
    session.run();

    let written = buffer.contents();
    assert_eq!(written.len(), 300);
    assert_eq!(written, collector.logic_bytes(id));
}

#[test]
fn test_software_trigger_marks_stream() {
    let device = fast_demo();
    device
        .configure(
            &DeviceConfig::new()
                .with_pattern(PatternMode::Incremental)
                .with_probes(vec![Probe::new(1).with_trigger("1")])
                .with_limit_samples(64),
        )
        .unwrap();

    let mut session = Session::new();
    let collector = PacketCollector::new();
    session.subscribe(collector.clone());
    let id = session.add_device(device);
    session.start().unwrap();
    session.run();

    assert_eq!(collector.count("trigger"), 1);
    let kinds: Vec<_> = collector.packets().iter().map(|(_, p)| p.kind()).collect();
    let trigger = kinds.iter().position(|k| *k == "trigger").unwrap();
    assert!(kinds[..trigger].iter().all(|k| *k == "header"));

    let samples = collector.logic_bytes(id);
    assert_eq!(samples[0] & 1, 1);
}

#[test]
fn test_stop_continuous_capture() {
    let device = fast_demo();
    device
        .configure(&DeviceConfig::new().with_continuous(true))
        .unwrap();

    let mut session = Session::new();
    let collector = PacketCollector::new();
    session.subscribe(collector.clone());
    session.add_device(device);
    session.start().unwrap();

    let control = session.control();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        control.stop();
    });
    session.run();
    stopper.join().unwrap();

    assert_eq!(collector.count("header"), 1);
    assert_eq!(collector.count("end"), 1);
    assert!(!session.event_loop().has_sources());
}

#[test]
fn test_replay_with_text_output_and_decoder() {
    let buffer = SharedBuffer::default();
    let mut session = Session::new();
    session.subscribe(OutputSink::new(output_format("bits", Some("8")).unwrap(), buffer.clone()));

    let counts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&counts);
    let sink = DecoderSink::new(
        DecoderRegistry::with_builtins(1),
        vec!["transitioncounter".into()],
    )
    .on_output(move |_, _, bytes| seen.lock().unwrap().push(bytes));
    let stats = sink.stats();
    session.subscribe(sink);

    let mut input = BinaryInput::with_probes(2).unwrap();
    let recording = vec![0b00, 0b01, 0b10, 0b11, 0b00, 0b01, 0b10, 0b11];
    session
        .load_input(&mut input, &mut Cursor::new(recording))
        .unwrap();

    let text = String::from_utf8(buffer.contents()).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert!(lines[0].starts_with("logic-capture "));
    assert_eq!(lines[1], "Acquisition with 2/2 probes at 0 Hz");
    assert_eq!(&lines[2..], ["1:01010101", "2:00110011"]);

    assert_eq!(stats.decoded(), 1);
    assert_eq!(stats.failed(), 0);
    let counts = counts.lock().unwrap();
    assert_eq!(&counts[0][0..4], &7u32.to_le_bytes());
    assert_eq!(&counts[0][4..8], &3u32.to_le_bytes());
}
