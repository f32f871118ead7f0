//! Protocol decoders fed from the datafeed.
//!
//! Decoders are registered by name and run on the payload of every Logic
//! packet. A failing decoder is logged and counted; it never disturbs the
//! bus or the other sinks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::datafeed::{DatafeedSink, DeviceId, Packet};
use crate::error::{Error, Result};

/// Turns a chunk of samples into decoder-specific output bytes.
pub trait Decoder: Send {
    fn name(&self) -> &'static str;

    fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Forgets state carried between chunks.
    fn reset(&mut self) {}
}

/// Counts level changes per probe.
///
/// Output is one little-endian `u32` per probe of the sample word: the
/// running count of transitions since the last reset.
#[derive(Debug, Clone)]
pub struct TransitionCounter {
    unitsize: usize,
    last: Option<u64>,
    counts: Vec<u32>,
}

impl TransitionCounter {
    pub const NAME: &'static str = "transitioncounter";

    pub fn new(unitsize: usize) -> Self {
        let unitsize = unitsize.clamp(1, 8);
        Self {
            unitsize,
            last: None,
            counts: vec![0; unitsize * 8],
        }
    }

    pub fn counts(&self) -> &[u32] {
        &self.counts
    }
}

impl Default for TransitionCounter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Decoder for TransitionCounter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() % self.unitsize != 0 {
            return Err(Error::msg(format!(
                "{} bytes is not a whole number of {}-byte samples",
                data.len(),
                self.unitsize
            )));
        }
        for raw in data.chunks_exact(self.unitsize) {
            let sample = LittleEndian::read_uint(raw, self.unitsize);
            if let Some(last) = self.last {
                let mut changed = sample ^ last;
                while changed != 0 {
                    let bit = changed.trailing_zeros() as usize;
                    self.counts[bit] = self.counts[bit].saturating_add(1);
                    changed &= changed - 1;
                }
            }
            self.last = Some(sample);
        }

        let mut out = vec![0u8; self.counts.len() * 4];
        LittleEndian::write_u32_into(&self.counts, &mut out);
        Ok(out)
    }

    fn reset(&mut self) {
        self.last = None;
        self.counts.iter_mut().for_each(|c| *c = 0);
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Decoders by name.
#[derive(Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Box<dyn Decoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in decoders for `unitsize`-byte samples.
    pub fn with_builtins(unitsize: usize) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(TransitionCounter::new(unitsize)));
        registry
    }

    /// Adds `decoder`, replacing one of the same name.
    pub fn register(&mut self, decoder: Box<dyn Decoder>) {
        debug!("registered decoder {}", decoder.name());
        self.decoders.insert(decoder.name().to_string(), decoder);
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn decode(&mut self, name: &str, data: &[u8]) -> Result<Vec<u8>> {
        let decoder = self
            .decoders
            .get_mut(name)
            .ok_or_else(|| Error::msg(format!("no decoder named {}", name)))?;
        decoder.decode(data)
    }

    fn reset(&mut self) {
        self.decoders.values_mut().for_each(|d| d.reset());
    }
}

// =============================================================================
// Sink
// =============================================================================

/// Decode statistics shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    decoded: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl DecoderStats {
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

type OutputFn = Box<dyn FnMut(DeviceId, &str, Vec<u8>) + Send>;

/// Runs a list of decoders on every Logic packet.
pub struct DecoderSink {
    registry: DecoderRegistry,
    stack: Vec<String>,
    stats: DecoderStats,
    output: Option<OutputFn>,
}

impl DecoderSink {
    /// Runs the decoders named in `stack`, in order, on each payload.
    pub fn new(registry: DecoderRegistry, stack: Vec<String>) -> Self {
        Self {
            registry,
            stack,
            stats: DecoderStats::default(),
            output: None,
        }
    }

    /// Receives each decoder's output.
    pub fn on_output(mut self, f: impl FnMut(DeviceId, &str, Vec<u8>) + Send + 'static) -> Self {
        self.output = Some(Box::new(f));
        self
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats.clone()
    }
}

impl DatafeedSink for DecoderSink {
    fn receive(&mut self, device: DeviceId, packet: &Packet) {
        let logic = match packet {
            Packet::Logic(logic) => logic,
            Packet::Header(_) => {
                self.registry.reset();
                return;
            }
            _ => return,
        };

        for name in &self.stack {
            match self.registry.decode(name, &logic.data) {
                Ok(bytes) => {
                    self.stats.decoded.fetch_add(1, Ordering::Relaxed);
                    if let Some(output) = self.output.as_mut() {
                        output(device, name, bytes);
                    }
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("{}: decoder {} failed: {}", device, name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, PoisonError};

    use super::*;
    use crate::datafeed::{DatafeedBus, Header, PacketCollector};

    #[test]
    fn test_transition_counter() {
        let mut counter = TransitionCounter::new(1);
        let out = counter.decode(&[0b00, 0b01, 0b11, 0b10]).unwrap();
        assert_eq!(&counter.counts()[..3], &[3, 1, 0]);
        assert_eq!(out.len(), 8 * 4);
        assert_eq!(LittleEndian::read_u32(&out[0..4]), 3);

        // state carries into the next chunk
        counter.decode(&[0b11]).unwrap();
        assert_eq!(&counter.counts()[..2], &[4, 1]);

        counter.reset();
        counter.decode(&[0b01]).unwrap();
        assert_eq!(counter.counts()[0], 0);
    }

    #[test]
    fn test_transition_counter_wide_samples() {
        let mut counter = TransitionCounter::new(2);
        counter.decode(&[0x00, 0x00, 0x00, 0x80]).unwrap();
        assert_eq!(counter.counts()[15], 1);
        assert!(counter.decode(&[0x00]).is_err());
    }

    #[test]
    fn test_registry_decode_by_name() {
        let mut registry = DecoderRegistry::with_builtins(1);
        assert_eq!(registry.names(), vec![TransitionCounter::NAME]);
        assert!(registry.decode("transitioncounter", &[0, 1]).is_ok());
        assert!(registry.decode("uart", &[0, 1]).is_err());
    }

    struct Failing;

    impl Decoder for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn decode(&mut self, _: &[u8]) -> Result<Vec<u8>> {
            Err(Error::msg("always fails"))
        }
    }

    #[test]
    fn test_sink_isolates_failures() {
        let mut registry = DecoderRegistry::with_builtins(1);
        registry.register(Box::new(Failing));

        let outputs = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&outputs);
        let sink = DecoderSink::new(
            registry,
            vec!["failing".into(), "transitioncounter".into()],
        )
        .on_output(move |_, name, bytes| {
            seen.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((name.to_string(), bytes));
        });
        let stats = sink.stats();

        let mut bus = DatafeedBus::new();
        bus.subscribe(sink);
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());

        let dev = DeviceId(0);
        bus.send(dev, Packet::Header(Header::new(1000, 8)));
        bus.send(dev, Packet::logic(1, vec![0, 1, 0]));
        bus.send(dev, Packet::logic(1, vec![1]));
        bus.send(dev, Packet::End);

        assert_eq!(stats.failed(), 2);
        assert_eq!(stats.decoded(), 2);
        assert_eq!(collector.count("logic"), 2);
        assert_eq!(collector.count("end"), 1);

        let outputs = outputs.lock().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(LittleEndian::read_u32(&outputs[1].1[0..4]), 3);
    }
}
