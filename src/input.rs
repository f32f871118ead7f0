//! Input formats: recorded captures fed through the datafeed bus.

use std::io::{self, Read};

use log::debug;

use crate::datafeed::{DatafeedBus, DeviceId, Header, Packet};
use crate::error::{Error, Result};

/// Bytes per Logic packet produced by [`BinaryInput`].
pub const CHUNK_SIZE: usize = 4096;

pub const DEFAULT_NUM_PROBES: usize = 8;

/// Loads a recording and replays it on the bus as `device`.
pub trait InputFormat {
    fn name(&self) -> &'static str;

    /// Sends Header, the recorded samples, then End.
    fn load(&mut self, reader: &mut dyn Read, device: DeviceId, bus: &mut DatafeedBus) -> Result<()>;
}

/// Raw sample bytes with no framing.
#[derive(Debug, Clone)]
pub struct BinaryInput {
    num_probes: usize,
}

impl BinaryInput {
    pub fn new() -> Self {
        Self {
            num_probes: DEFAULT_NUM_PROBES,
        }
    }

    pub fn with_probes(num_probes: usize) -> Result<Self> {
        if num_probes == 0 {
            return Err(Error::msg("binary input needs at least one probe"));
        }
        Ok(Self { num_probes })
    }

    /// Parses the probe count from an optional format parameter.
    pub fn from_param(param: Option<&str>) -> Result<Self> {
        match param.filter(|p| !p.is_empty()) {
            None => Ok(Self::new()),
            Some(p) => {
                let n = p
                    .parse()
                    .map_err(|_| Error::msg(format!("invalid probe count: {:?}", p)))?;
                Self::with_probes(n)
            }
        }
    }

    pub fn num_probes(&self) -> usize {
        self.num_probes
    }

    pub fn unitsize(&self) -> usize {
        self.num_probes.div_ceil(8)
    }
}

impl Default for BinaryInput {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads until `buf` is full or the reader is exhausted.
fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl InputFormat for BinaryInput {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn load(&mut self, reader: &mut dyn Read, device: DeviceId, bus: &mut DatafeedBus) -> Result<()> {
        bus.send(device, Packet::Header(Header::new(0, self.num_probes)));

        let unitsize = self.unitsize();
        let mut total = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let result = loop {
            match fill(reader, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    total += n;
                    bus.send(device, Packet::logic(unitsize, buf[..n].to_vec()));
                }
                Err(e) => break Err(Error::context("reading binary input", e)),
            }
        };
        debug!("{}: loaded {} bytes of binary input", device, total);

        bus.send(device, Packet::End);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::datafeed::PacketCollector;

    fn load(input: &mut BinaryInput, data: Vec<u8>) -> (PacketCollector, Result<()>) {
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        let result = input.load(&mut Cursor::new(data), DeviceId(9), &mut bus);
        (collector, result)
    }

    #[test]
    fn test_chunks_file_into_packets() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let (collector, result) = load(&mut BinaryInput::new(), data.clone());
        result.unwrap();

        let packets = collector.packets();
        let kinds: Vec<_> = packets.iter().map(|(_, p)| p.kind()).collect();
        assert_eq!(kinds, ["header", "logic", "logic", "logic", "end"]);
        match &packets[0].1 {
            Packet::Header(header) => {
                assert_eq!(header.samplerate, 0);
                assert_eq!(header.num_logic_probes, 8);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &packets[3].1 {
            Packet::Logic(logic) => {
                assert_eq!(logic.unitsize, 1);
                assert_eq!(logic.data.len(), 10_000 - 2 * CHUNK_SIZE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(collector.logic_bytes(DeviceId(9)), data);
    }

    #[test]
    fn test_empty_input() {
        let (collector, result) = load(&mut BinaryInput::new(), Vec::new());
        result.unwrap();
        assert_eq!(collector.count("header"), 1);
        assert_eq!(collector.count("logic"), 0);
        assert_eq!(collector.count("end"), 1);
    }

    #[test]
    fn test_probe_parameter() {
        let input = BinaryInput::from_param(Some("12")).unwrap();
        assert_eq!(input.num_probes(), 12);
        assert_eq!(input.unitsize(), 2);
        assert_eq!(BinaryInput::from_param(None).unwrap().num_probes(), 8);
        assert!(BinaryInput::from_param(Some("0")).is_err());
        assert!(BinaryInput::from_param(Some("many")).is_err());
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
        }
    }

    #[test]
    fn test_read_error_still_ends_stream() {
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        let result = BinaryInput::new().load(&mut FailingReader, DeviceId(1), &mut bus);
        assert!(matches!(result, Err(Error::Context { .. })));
        assert_eq!(collector.count("end"), 1);
    }
}
