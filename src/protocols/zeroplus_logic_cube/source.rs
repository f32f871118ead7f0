//! Timer-driven capture download.

use log::{debug, error, info};

use super::analyzer::{Analyzer, RegisterIo};
use super::{PACKET_SIZE, UNITSIZE};
use crate::codec;
use crate::datafeed::{DatafeedBus, DeviceId, Packet};
use crate::error::Result;
use crate::event_loop::{Source, SourceControl, SourceEvent};

/// Packets downloaded per timer tick.
pub const PACKETS_PER_DISPATCH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Capture armed, polling the status register.
    Waiting,
    /// Reading out memory; counts packets still to fetch.
    Downloading { remaining: usize },
    Done,
}

/// Polls the analyzer until its memory is full, then downloads it a batch
/// at a time.
pub(crate) struct DownloadSource<R> {
    device: DeviceId,
    analyzer: Analyzer<R>,
    num_packets: usize,
    compressed: bool,
    /// Remaining bytes allowed by the sample limit.
    budget: Option<usize>,
    phase: Phase,
}

impl<R: RegisterIo> DownloadSource<R> {
    pub(crate) fn new(
        device: DeviceId,
        analyzer: Analyzer<R>,
        num_packets: usize,
        compressed: bool,
        limit_samples: Option<u64>,
    ) -> Self {
        let budget = limit_samples
            .map(|samples| usize::try_from(samples.saturating_mul(UNITSIZE as u64)).unwrap_or(usize::MAX));
        Self {
            device,
            analyzer,
            num_packets,
            compressed,
            budget,
            phase: Phase::Waiting,
        }
    }

    fn poll(&mut self) -> Result<()> {
        if !self.analyzer.data_ready()? {
            return Ok(());
        }
        info!(
            "{}: capture complete, stop {:#x} now {:#x} trigger {:#x}",
            self.device,
            self.analyzer.stop_address()?,
            self.analyzer.now_address()?,
            self.analyzer.trigger_address()?
        );
        self.analyzer.read_start()?;
        self.phase = Phase::Downloading {
            remaining: self.num_packets,
        };
        Ok(())
    }

    /// Downloads one batch. Returns true when the download is finished.
    fn download(&mut self, bus: &mut DatafeedBus, remaining: usize) -> Result<bool> {
        let batch = remaining.min(PACKETS_PER_DISPATCH);
        let mut buf = vec![0u8; PACKET_SIZE];

        for _ in 0..batch {
            let read = self.analyzer.read_packet(&mut buf)?;
            let room = self.budget.unwrap_or(usize::MAX);
            let data = if self.compressed {
                codec::decompress_at_most(&buf[..read], room)
            } else {
                buf[..read.min(room)].to_vec()
            };
            if let Some(budget) = self.budget.as_mut() {
                *budget -= data.len();
            }
            if !data.is_empty() {
                bus.send(self.device, Packet::logic(UNITSIZE, data));
            }
            if self.budget == Some(0) {
                debug!("{}: sample limit reached", self.device);
                return Ok(true);
            }
        }

        let remaining = remaining - batch;
        self.phase = Phase::Downloading { remaining };
        Ok(remaining == 0)
    }

    fn step(&mut self, bus: &mut DatafeedBus) -> Result<bool> {
        match self.phase {
            Phase::Waiting => {
                self.poll()?;
                Ok(false)
            }
            Phase::Downloading { remaining } => self.download(bus, remaining),
            Phase::Done => Ok(true),
        }
    }

    fn finish(&mut self, bus: &mut DatafeedBus) {
        if self.phase == Phase::Done {
            return;
        }
        if matches!(self.phase, Phase::Downloading { .. }) {
            if let Err(e) = self.analyzer.read_stop() {
                error!("{}: failed to leave read mode: {}", self.device, e);
            }
        }
        self.phase = Phase::Done;
        bus.send(self.device, Packet::End);
    }
}

impl<R: RegisterIo> Source for DownloadSource<R> {
    fn dispatch(&mut self, event: SourceEvent, bus: &mut DatafeedBus) -> SourceControl {
        if !matches!(event, SourceEvent::Timeout) {
            return SourceControl::Continue;
        }
        match self.step(bus) {
            Ok(false) => SourceControl::Continue,
            Ok(true) => {
                self.finish(bus);
                SourceControl::Remove
            }
            Err(e) => {
                error!("{}: download failed: {}", self.device, e);
                self.finish(bus);
                SourceControl::Remove
            }
        }
    }

    fn cancel(&mut self, bus: &mut DatafeedBus) {
        if self.phase == Phase::Done {
            return;
        }
        self.phase = Phase::Done;
        if let Err(e) = self.analyzer.reset() {
            error!("{}: reset failed: {}", self.device, e);
        }
        bus.send(self.device, Packet::End);
    }
}
