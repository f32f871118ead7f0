//! Sample datafeed: packets and the bus that delivers them to sinks.
//!
//! Every acquisition produces, per device, exactly one [`Packet::Header`],
//! any number of [`Packet::Logic`] chunks with at most one
//! [`Packet::Trigger`] among them, and exactly one [`Packet::End`]. The
//! [`DatafeedBus`] delivers packets synchronously and in order to every
//! subscribed sink, and drops packets that would break that sequence.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use log::warn;

/// Datafeed format version carried in every header.
pub const FEED_VERSION: u32 = 1;

/// Identifies the device a packet was produced by within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}", self.0)
    }
}

/// How logic payload bytes are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Raw,
}

/// Acquisition metadata, sent before any sample data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
    pub samplerate: u64,
    pub protocol: Protocol,
    pub num_logic_probes: usize,
    pub num_analog_probes: usize,
}

impl Header {
    /// Header stamped with the current time.
    pub fn new(samplerate: u64, num_logic_probes: usize) -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
            samplerate,
            protocol: Protocol::Raw,
            num_logic_probes,
            num_analog_probes: 0,
        }
    }
}

/// A chunk of logic samples, `unitsize` little-endian bytes per sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logic {
    pub unitsize: usize,
    pub data: Vec<u8>,
}

impl Logic {
    pub fn new(unitsize: usize, data: Vec<u8>) -> Self {
        Self { unitsize, data }
    }

    pub fn num_samples(&self) -> usize {
        if self.unitsize == 0 {
            0
        } else {
            self.data.len() / self.unitsize
        }
    }
}

/// One element of the datafeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Header(Header),
    Logic(Logic),
    /// Marks the trigger point: the next logic sample is the first
    /// post-trigger sample.
    Trigger,
    End,
}

impl Packet {
    pub fn logic(unitsize: usize, data: Vec<u8>) -> Self {
        Packet::Logic(Logic::new(unitsize, data))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Header(_) => "header",
            Packet::Logic(_) => "logic",
            Packet::Trigger => "trigger",
            Packet::End => "end",
        }
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Receives datafeed packets on the session thread.
pub trait DatafeedSink: Send {
    fn receive(&mut self, device: DeviceId, packet: &Packet);
}

impl<F> DatafeedSink for F
where
    F: FnMut(DeviceId, &Packet) + Send,
{
    fn receive(&mut self, device: DeviceId, packet: &Packet) {
        self(device, packet)
    }
}

/// Stores every packet it receives. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct PacketCollector {
    packets: Arc<Mutex<Vec<(DeviceId, Packet)>>>,
}

impl PacketCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far.
    pub fn packets(&self) -> Vec<(DeviceId, Packet)> {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Concatenated logic payload for one device.
    pub fn logic_bytes(&self, device: DeviceId) -> Vec<u8> {
        self.packets()
            .into_iter()
            .filter(|(id, _)| *id == device)
            .filter_map(|(_, packet)| match packet {
                Packet::Logic(logic) => Some(logic.data),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.packets()
            .iter()
            .filter(|(_, packet)| packet.kind() == kind)
            .count()
    }
}

impl DatafeedSink for PacketCollector {
    fn receive(&mut self, device: DeviceId, packet: &Packet) {
        self.packets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((device, packet.clone()));
    }
}

// =============================================================================
// Bus
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Idle,
    Streaming { triggered: bool },
    Ended,
}

/// Delivers packets to all sinks in subscription order.
#[derive(Default)]
pub struct DatafeedBus {
    sinks: Vec<Box<dyn DatafeedSink>>,
    streams: HashMap<DeviceId, StreamState>,
}

impl DatafeedBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, sink: impl DatafeedSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn num_sinks(&self) -> usize {
        self.sinks.len()
    }

    /// Forgets stream state so a device can start a new acquisition.
    pub fn reset(&mut self, device: DeviceId) {
        self.streams.remove(&device);
    }

    /// True once `device` has sent its End packet.
    pub fn is_ended(&self, device: DeviceId) -> bool {
        self.streams.get(&device) == Some(&StreamState::Ended)
    }

    /// True while `device` is between Header and End.
    pub fn is_streaming(&self, device: DeviceId) -> bool {
        matches!(
            self.streams.get(&device),
            Some(StreamState::Streaming { .. })
        )
    }

    /// Sends `packet` to every sink. Returns false if it was dropped for
    /// breaking the Header, data, End sequence.
    pub fn send(&mut self, device: DeviceId, packet: Packet) -> bool {
        let state = self
            .streams
            .get(&device)
            .copied()
            .unwrap_or(StreamState::Idle);

        let next = match (state, &packet) {
            (StreamState::Idle, Packet::Header(_)) => StreamState::Streaming { triggered: false },
            (StreamState::Streaming { triggered }, Packet::Logic(_)) => {
                StreamState::Streaming { triggered }
            }
            (StreamState::Streaming { triggered: false }, Packet::Trigger) => {
                StreamState::Streaming { triggered: true }
            }
            (StreamState::Streaming { .. }, Packet::End) => StreamState::Ended,
            (state, packet) => {
                warn!(
                    "{}: dropping {} packet in state {:?}",
                    device,
                    packet.kind(),
                    state
                );
                return false;
            }
        };
        self.streams.insert(device, next);

        for sink in &mut self.sinks {
            sink.receive(device, &packet);
        }
        true
    }
}

impl fmt::Debug for DatafeedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatafeedBus")
            .field("sinks", &self.sinks.len())
            .field("streams", &self.streams)
            .finish()
    }
}
