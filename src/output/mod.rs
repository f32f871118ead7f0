//! Output formatters.
//!
//! A formatter turns datafeed packets into bytes; [`OutputSink`] subscribes
//! one to the bus and writes whatever it renders to a [`Write`].

mod text;

use std::io::Write;

use log::warn;

pub use text::{TextMode, TextOutput, DEFAULT_BITS_PER_LINE, DEFAULT_HEX_PER_LINE};

use crate::datafeed::{DatafeedSink, DeviceId, Packet};
use crate::error::{Error, Result};

/// Renders datafeed packets.
pub trait OutputFormat: Send {
    fn name(&self) -> &'static str;

    /// Bytes to emit for `packet`, possibly none.
    fn render(&mut self, packet: &Packet) -> Vec<u8>;
}

/// Raw sample bytes, nothing else.
#[derive(Debug, Default)]
pub struct BinaryOutput;

impl OutputFormat for BinaryOutput {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn render(&mut self, packet: &Packet) -> Vec<u8> {
        match packet {
            Packet::Logic(logic) => logic.data.clone(),
            _ => Vec::new(),
        }
    }
}

/// Formats by name, with a one-line description each.
pub const OUTPUT_FORMATS: &[(&str, &str)] = &[
    ("bits", "Bits (takes argument, default 64)"),
    ("hex", "Hexadecimal (takes argument, default 256)"),
    ("binary", "Raw binary"),
];

/// Creates the formatter called `name`. For the text formats `param` is
/// the number of samples per line.
pub fn output_format(name: &str, param: Option<&str>) -> Result<Box<dyn OutputFormat>> {
    let per_line = match param.filter(|p| !p.is_empty()) {
        Some(p) => match p.parse::<usize>() {
            Ok(n) if n >= 1 => Some(n),
            _ => return Err(Error::msg(format!("invalid samples per line: {:?}", p))),
        },
        None => None,
    };

    let mut text = match name {
        "bits" => TextOutput::new(TextMode::Bits),
        "hex" => TextOutput::new(TextMode::Hex),
        "binary" => return Ok(Box::new(BinaryOutput)),
        other => return Err(Error::msg(format!("unknown output format: {}", other))),
    };
    if let Some(n) = per_line {
        text = text.with_samples_per_line(n);
    }
    Ok(Box::new(text))
}

// =============================================================================
// Sink
// =============================================================================

/// Bus subscriber writing a formatter's output.
///
/// Write errors are logged; after the first one the sink stops writing.
pub struct OutputSink<W> {
    format: Box<dyn OutputFormat>,
    writer: W,
    device: Option<DeviceId>,
    failed: bool,
}

impl<W: Write + Send> OutputSink<W> {
    pub fn new(format: Box<dyn OutputFormat>, writer: W) -> Self {
        Self {
            format,
            writer,
            device: None,
            failed: false,
        }
    }

    /// Only renders packets of `device`.
    pub fn for_device(mut self, device: DeviceId) -> Self {
        self.device = Some(device);
        self
    }

    fn write(&mut self, bytes: &[u8], flush: bool) -> std::io::Result<()> {
        self.writer.write_all(bytes)?;
        if flush {
            self.writer.flush()?;
        }
        Ok(())
    }
}

impl<W: Write + Send> DatafeedSink for OutputSink<W> {
    fn receive(&mut self, device: DeviceId, packet: &Packet) {
        if self.failed || self.device.is_some_and(|d| d != device) {
            return;
        }
        let bytes = self.format.render(packet);
        if bytes.is_empty() && *packet != Packet::End {
            return;
        }
        if let Err(e) = self.write(&bytes, *packet == Packet::End) {
            warn!("{} output for {}: {}", self.format.name(), device, e);
            self.failed = true;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::io;

    use super::test_util::SharedBuffer;
    use super::*;
    use crate::datafeed::{DatafeedBus, Header};

    #[test]
    fn test_output_format_lookup() {
        assert_eq!(output_format("bits", None).unwrap().name(), "bits");
        assert_eq!(output_format("hex", Some("16")).unwrap().name(), "hex");
        assert_eq!(output_format("binary", None).unwrap().name(), "binary");
        assert!(output_format("csv", None).is_err());
        assert!(output_format("bits", Some("0")).is_err());
        assert!(output_format("bits", Some("x")).is_err());
    }

    #[test]
    fn test_binary_sink_writes_payload_only() {
        let buffer = SharedBuffer::default();
        let mut bus = DatafeedBus::new();
        bus.subscribe(OutputSink::new(Box::new(BinaryOutput), buffer.clone()));

        let dev = DeviceId(0);
        bus.send(dev, Packet::Header(Header::new(1000, 8)));
        bus.send(dev, Packet::logic(1, b"ab".to_vec()));
        bus.send(dev, Packet::Trigger);
        bus.send(dev, Packet::logic(1, b"cd".to_vec()));
        bus.send(dev, Packet::End);
        assert_eq!(buffer.contents(), "abcd");
    }

    #[test]
    fn test_sink_filters_device() {
        let buffer = SharedBuffer::default();
        let mut sink =
            OutputSink::new(Box::new(BinaryOutput), buffer.clone()).for_device(DeviceId(1));
        sink.receive(DeviceId(0), &Packet::logic(1, b"x".to_vec()));
        sink.receive(DeviceId(1), &Packet::logic(1, b"y".to_vec()));
        assert_eq!(buffer.contents(), "y");
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_disables_sink() {
        let mut sink = OutputSink::new(Box::new(BinaryOutput), Broken);
        sink.receive(DeviceId(0), &Packet::logic(1, vec![1]));
        assert!(sink.failed);
        sink.receive(DeviceId(0), &Packet::logic(1, vec![2]));
    }
}
