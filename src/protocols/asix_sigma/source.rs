//! Timer-driven capture and download.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use super::decode::ChunkDecoder;
use super::protocol::{
    Port, Sigma, CHUNK_SIZE, MODE_DOWNLOAD, MODE_STOP, MODE_TRIGGERED, READ_MODE, ROW_LENGTH,
    WRITE_MODE,
};
use crate::datafeed::{DatafeedBus, DeviceId, Packet};
use crate::error::Result;
use crate::event_loop::{Source, SourceControl, SourceEvent};

pub(super) type SharedSigma<P> = Arc<Mutex<Sigma<P>>>;

/// DRAM rows downloaded per timer tick.
pub const CHUNKS_PER_DISPATCH: usize = 32;

/// The capture stops by itself once the stop address reaches this row.
const LAST_CHUNK: u32 = 32767;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Capture {
        started: Instant,
    },
    Download {
        stop_chunk: usize,
        /// Trigger address, if the trigger fired.
        trigger: Option<u32>,
        next: usize,
    },
    Done,
}

/// Runs a capture until the time limit or memory is exhausted, then
/// downloads and decodes the DRAM.
pub(crate) struct CaptureSource<P> {
    device: DeviceId,
    sigma: SharedSigma<P>,
    limit: Option<Duration>,
    decoder: ChunkDecoder,
    /// No trigger was armed; a fired flag is the pin select idling.
    free_running: bool,
    phase: Phase,
}

impl<P: Port> CaptureSource<P> {
    pub(crate) fn new(
        device: DeviceId,
        sigma: SharedSigma<P>,
        limit: Option<Duration>,
        decoder: ChunkDecoder,
    ) -> Self {
        Self {
            device,
            sigma,
            limit,
            decoder,
            free_running: false,
            phase: Phase::Capture {
                started: Instant::now(),
            },
        }
    }

    /// Ignores the trigger flag the hardware reports after the capture.
    pub(crate) fn free_running(mut self, free_running: bool) -> Self {
        self.free_running = free_running;
        self
    }

    fn capture(&mut self, started: Instant) -> Result<()> {
        let mut sigma = self.sigma.lock().unwrap_or_else(PoisonError::into_inner);
        let done = match self.limit {
            Some(limit) => started.elapsed() >= limit,
            None => sigma.read_positions()?.stop / ROW_LENGTH >= LAST_CHUNK,
        };
        if !done {
            return Ok(());
        }

        sigma.set_register(WRITE_MODE, MODE_STOP)?;
        sigma.set_register(WRITE_MODE, MODE_DOWNLOAD)?;
        let positions = sigma.read_positions()?;
        let triggered =
            !self.free_running && sigma.get_register(READ_MODE)? & MODE_TRIGGERED != 0;

        let stop_chunk = (positions.stop / ROW_LENGTH) as usize;
        info!(
            "{}: capture stopped after {:?}, {} rows, trigger {}",
            self.device,
            started.elapsed(),
            stop_chunk,
            if triggered {
                format!("at {:#x}", positions.trigger)
            } else {
                "not fired".to_string()
            }
        );
        self.phase = Phase::Download {
            stop_chunk,
            trigger: triggered.then_some(positions.trigger),
            next: 0,
        };
        Ok(())
    }

    /// Downloads one batch. Returns true when all rows are in.
    fn download(
        &mut self,
        bus: &mut DatafeedBus,
        stop_chunk: usize,
        trigger: Option<u32>,
        next: usize,
    ) -> Result<bool> {
        let count = stop_chunk.saturating_sub(next).min(CHUNKS_PER_DISPATCH);
        if count == 0 {
            return Ok(true);
        }

        let data = {
            let mut sigma = self.sigma.lock().unwrap_or_else(PoisonError::into_inner);
            sigma.read_dram(next as u16, count)?
        };
        debug!("{}: rows {}..{} of {}", self.device, next, next + count, stop_chunk);

        for (i, chunk) in data.chunks_exact(CHUNK_SIZE).enumerate() {
            let row = next + i;
            let trigger_pos = trigger.filter(|pos| (pos / ROW_LENGTH) as usize == row);
            for packet in self.decoder.decode(chunk, trigger_pos) {
                bus.send(self.device, packet);
            }
        }

        let next = next + count;
        self.phase = Phase::Download {
            stop_chunk,
            trigger,
            next,
        };
        Ok(next >= stop_chunk)
    }

    fn step(&mut self, bus: &mut DatafeedBus) -> Result<bool> {
        match self.phase {
            Phase::Capture { started } => {
                self.capture(started)?;
                Ok(false)
            }
            Phase::Download {
                stop_chunk,
                trigger,
                next,
            } => self.download(bus, stop_chunk, trigger, next),
            Phase::Done => Ok(true),
        }
    }

    fn finish(&mut self, bus: &mut DatafeedBus) {
        if self.phase != Phase::Done {
            self.phase = Phase::Done;
            bus.send(self.device, Packet::End);
        }
    }
}

impl<P: Port> Source for CaptureSource<P> {
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
                error!("{}: acquisition failed: {}", self.device, e);
                self.finish(bus);
                SourceControl::Remove
            }
        }
    }

    fn cancel(&mut self, bus: &mut DatafeedBus) {
        if let Phase::Capture { .. } = self.phase {
            let mut sigma = self.sigma.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = sigma.set_register(WRITE_MODE, MODE_STOP) {
                error!("{}: failed to stop capture: {}", self.device, e);
            }
        }
        self.finish(bus);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::protocol::mock::MockPort;
    use super::*;
    use crate::datafeed::{Header, PacketCollector};
    use crate::event_loop::{EventLoop, SourceId};
    use crate::trigger::HardwareTrigger;

    const DEV: DeviceId = DeviceId(5);
    const POSITIONS_CMD: [u8; 7] = [0x01, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41];
    const READ_MODE_CMD: [u8; 3] = [0x07, 0x10, 0x40];
    const STOP: [u8; 4] = [0x03, 0x10, 0x21, 0x31];

    fn raw_positions(trigger: u32, stop: u32) -> Vec<u8> {
        let mut out = trigger.to_le_bytes()[..3].to_vec();
        out.extend_from_slice(&stop.to_le_bytes()[..3]);
        out
    }

    /// Emulates a device holding `stop_chunk` rows of constant samples.
    fn device(stop_chunk: u32, trigger: u32, mode: u8) -> MockPort {
        let mut ts = 0u16;
        MockPort::new(move |cmd| {
            if cmd == POSITIONS_CMD {
                raw_positions(trigger + 1, stop_chunk * ROW_LENGTH + 1)
            } else if cmd == READ_MODE_CMD {
                vec![mode]
            } else if cmd[0] == 0x60 {
                let rows = cmd.iter().filter(|&&b| b & 0xe0 == 0xa0).count();
                let mut out = Vec::new();
                for _ in 0..rows * 64 {
                    out.extend(ts.to_le_bytes());
                    for _ in 0..7 {
                        out.extend(0x0001u16.to_le_bytes());
                    }
                    ts = ts.wrapping_add(7);
                }
                out
            } else {
                vec![]
            }
        })
    }

    fn setup(
        port: &MockPort,
        limit: Option<Duration>,
    ) -> (EventLoop, DatafeedBus, PacketCollector, SourceId) {
        setup_with(port, limit, false)
    }

    fn setup_with(
        port: &MockPort,
        limit: Option<Duration>,
        free_running: bool,
    ) -> (EventLoop, DatafeedBus, PacketCollector, SourceId) {
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        bus.send(DEV, Packet::Header(Header::new(50_000_000, 16)));

        let sigma = Arc::new(Mutex::new(Sigma::new(port.clone())));
        let decoder = ChunkDecoder::new(16, HardwareTrigger::default());
        let mut ev = EventLoop::new();
        let source = CaptureSource::new(DEV, sigma, limit, decoder).free_running(free_running);
        let id = ev.add_source(0, Some(Duration::from_millis(1)), Box::new(source));
        (ev, bus, collector, id)
    }

    #[test]
    fn test_time_limit_then_download() {
        let port = device(2, 0x200 + 27, MODE_TRIGGERED);
        let (mut ev, mut bus, collector, _) = setup(&port, Some(Duration::ZERO));
        ev.run(&mut bus);

        assert_eq!(collector.logic_bytes(DEV).len(), 2 * 64 * 7 * 2);
        assert_eq!(collector.count("trigger"), 1);
        assert_eq!(collector.count("end"), 1);
        let writes = port.state().writes.clone();
        assert!(writes.contains(&STOP.to_vec()));
        assert!(writes.contains(&vec![0x03, 0x10, 0x22, 0x30]));
    }

    #[test]
    fn test_untriggered_capture_has_no_marker() {
        let port = device(1, 0x10, 0x00);
        let (mut ev, mut bus, collector, _) = setup(&port, Some(Duration::ZERO));
        ev.run(&mut bus);

        assert_eq!(collector.count("trigger"), 0);
        assert_eq!(collector.logic_bytes(DEV).len(), 64 * 7 * 2);
        assert_eq!(collector.count("end"), 1);
    }

    #[test]
    fn test_free_running_ignores_fired_flag() {
        let port = device(2, 0x200 + 27, MODE_TRIGGERED);
        let (mut ev, mut bus, collector, _) = setup_with(&port, Some(Duration::ZERO), true);
        ev.run(&mut bus);

        assert_eq!(collector.count("trigger"), 0);
        assert_eq!(collector.logic_bytes(DEV).len(), 2 * 64 * 7 * 2);
        assert_eq!(collector.count("end"), 1);
    }

    #[test]
    fn test_empty_memory_ends_immediately() {
        let port = device(0, 0, 0x00);
        let (mut ev, mut bus, collector, _) = setup(&port, Some(Duration::ZERO));
        ev.run(&mut bus);

        assert_eq!(collector.count("logic"), 0);
        assert_eq!(collector.count("end"), 1);
    }

    #[test]
    fn test_full_memory_stops_capture() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        let port = MockPort::new(move |cmd| {
            if cmd == POSITIONS_CMD {
                let stop = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    0x1001
                } else {
                    LAST_CHUNK * ROW_LENGTH + 1
                };
                raw_positions(1, stop)
            } else if cmd == READ_MODE_CMD {
                vec![0]
            } else {
                vec![]
            }
        });
        let (mut ev, mut bus, collector, id) = setup(&port, None);

        while polls.load(Ordering::SeqCst) < 1 {
            ev.iteration(&mut bus);
        }
        assert!(!port.state().writes.contains(&STOP.to_vec()));

        while polls.load(Ordering::SeqCst) < 3 {
            ev.iteration(&mut bus);
        }
        assert!(port.state().writes.contains(&STOP.to_vec()));

        assert!(ev.remove_source(id, &mut bus));
        assert_eq!(collector.count("end"), 1);
    }

    #[test]
    fn test_cancel_during_capture_stops_device() {
        let port = MockPort::default();
        let (mut ev, mut bus, collector, id) = setup(&port, Some(Duration::from_secs(3600)));
        ev.iteration(&mut bus);
        assert!(port.state().writes.is_empty());

        assert!(ev.remove_source(id, &mut bus));
        assert_eq!(port.state().writes, vec![STOP.to_vec()]);
        assert_eq!(collector.count("end"), 1);
        assert!(!ev.remove_source(id, &mut bus));
        assert_eq!(collector.count("end"), 1);
    }
}
