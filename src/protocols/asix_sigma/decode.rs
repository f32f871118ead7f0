//! Decoding of downloaded DRAM rows.
//!
//! A row holds 64 clusters of 16 bytes: a 16-bit timestamp followed by
//! seven 16-bit events. Events are only stored when the inputs change, so
//! the gap between two cluster timestamps is filled with the last sample.
//! Above 50 MHz an event packs several samples of fewer probes.

use byteorder::{ByteOrder, LittleEndian};

use super::protocol::CHUNK_SIZE;
use crate::datafeed::Packet;
use crate::trigger::HardwareTrigger;

pub const CLUSTER_SIZE: usize = 16;
pub const CLUSTERS_PER_CHUNK: usize = CHUNK_SIZE / CLUSTER_SIZE;
pub const EVENTS_PER_CLUSTER: usize = 7;

/// Bytes per sample in the datafeed.
pub const UNITSIZE: usize = 2;

/// Largest Logic packet sent while padding.
const MAX_PAD_SAMPLES: usize = 2048;

/// Returns the index within `samples` of the first sample satisfying
/// `trigger`, looking at no more than the first eight. Falls back to 0.
pub fn trigger_offset(samples: &[u16], last_sample: u16, trigger: &HardwareTrigger) -> usize {
    let mut prev = last_sample;
    for (i, &sample) in samples.iter().take(8).enumerate() {
        let before = prev;
        prev = sample;

        if sample & trigger.simple_mask != trigger.simple_value & trigger.simple_mask {
            continue;
        }
        if before & trigger.rising_mask != 0 || sample & trigger.rising_mask != trigger.rising_mask {
            continue;
        }
        if before & trigger.falling_mask != trigger.falling_mask || sample & trigger.falling_mask != 0 {
            continue;
        }
        return i;
    }
    0
}

/// Decodes rows into datafeed packets, keeping state across rows.
#[derive(Debug, Clone)]
pub struct ChunkDecoder {
    num_probes: usize,
    samples_per_event: usize,
    /// The 50 MHz firmware reports trigger positions six events late.
    trigger_lag: usize,
    trigger: HardwareTrigger,
    last_ts: Option<u16>,
    last_sample: u16,
}

impl ChunkDecoder {
    pub fn new(num_probes: usize, trigger: HardwareTrigger) -> Self {
        let num_probes = num_probes.clamp(1, 16);
        Self {
            num_probes,
            samples_per_event: 16 / num_probes,
            trigger_lag: if num_probes == 16 { 6 } else { 0 },
            trigger,
            last_ts: None,
            last_sample: 0,
        }
    }

    pub fn last_sample(&self) -> u16 {
        self.last_sample
    }

    /// Splits one event into its samples. Sample `k` takes probe `l` from
    /// bit `l * samples_per_event + k`.
    fn expand_event(&self, event: u16, out: &mut Vec<u16>) {
        let spe = self.samples_per_event;
        if spe == 1 {
            out.push(event);
            return;
        }
        for k in 0..spe {
            let mut sample = 0u16;
            for l in 0..self.num_probes {
                if event & (1 << (l * spe + k)) != 0 {
                    sample |= 1 << l;
                }
            }
            out.push(sample);
        }
    }

    /// Decodes one row. `trigger_pos` is the trigger address within the
    /// row when the trigger fired in it.
    pub fn decode(&mut self, chunk: &[u8], trigger_pos: Option<u32>) -> Vec<Packet> {
        let mut packets = Vec::new();
        let spe = self.samples_per_event;

        let trigger_cluster = trigger_pos.map(|pos| {
            let pos = (pos & 0x1ff) as usize;
            pos.saturating_sub(self.trigger_lag) / EVENTS_PER_CLUSTER
        });

        let mut samples = Vec::with_capacity(EVENTS_PER_CLUSTER * spe);
        for (index, cluster) in chunk.chunks_exact(CLUSTER_SIZE).enumerate() {
            let ts = LittleEndian::read_u16(&cluster[0..2]);
            let last_ts = self.last_ts.unwrap_or_else(|| ts.wrapping_sub(1));
            let tsdiff = usize::from(ts.wrapping_sub(last_ts));
            self.last_ts = Some(ts);

            // Timestamps count events; a full cluster covers seven of them.
            let pad = (tsdiff * spe).saturating_sub(EVENTS_PER_CLUSTER * spe);
            self.pad(pad, &mut packets);

            samples.clear();
            for event in cluster[2..].chunks_exact(2) {
                self.expand_event(LittleEndian::read_u16(event), &mut samples);
            }

            if trigger_cluster == Some(index) {
                let offset = trigger_offset(&samples, self.last_sample, &self.trigger);
                if offset > 0 {
                    packets.push(logic_packet(&samples[..offset]));
                }
                packets.push(Packet::Trigger);
                if offset < samples.len() {
                    packets.push(logic_packet(&samples[offset..]));
                }
            } else {
                packets.push(logic_packet(&samples));
            }

            if let Some(&last) = samples.last() {
                self.last_sample = last;
            }
        }
        packets
    }

    fn pad(&self, count: usize, packets: &mut Vec<Packet>) {
        let mut left = count;
        while left > 0 {
            let n = left.min(MAX_PAD_SAMPLES);
            packets.push(logic_packet(&vec![self.last_sample; n]));
            left -= n;
        }
    }
}

fn logic_packet(samples: &[u16]) -> Packet {
    let mut data = vec![0u8; samples.len() * UNITSIZE];
    LittleEndian::write_u16_into(samples, &mut data);
    Packet::logic(UNITSIZE, data)
}
