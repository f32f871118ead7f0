//! Background sample generator for the demo device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use rand::Rng;

use crate::event_loop::{Completion, EventSender};
use crate::types::PatternMode;

/// Bytes per generated chunk.
pub const BUFSIZE: usize = 4096;

/// Produces logic samples, one byte per sample.
#[derive(Debug, Clone)]
pub struct Generator {
    pattern: PatternMode,
    counter: u8,
}

impl Generator {
    pub fn new(pattern: PatternMode) -> Self {
        Self { pattern, counter: 0 }
    }

    /// Fills `buf` with the next samples. The incremental pattern counts on
    /// from where the previous chunk stopped.
    pub fn fill(&mut self, buf: &mut [u8]) {
        match self.pattern {
            PatternMode::Random => rand::thread_rng().fill(buf),
            PatternMode::Incremental => {
                for byte in buf.iter_mut() {
                    *byte = self.counter;
                    self.counter = self.counter.wrapping_add(1);
                }
            }
        }
    }
}

/// How much the worker produces before it closes its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    Samples(u64),
    Unlimited,
}

/// Worker thread body: sends a chunk every `interval` until the budget is
/// spent or `stop` is raised, then posts [`Completion::Closed`].
pub(super) fn run(
    mut generator: Generator,
    budget: Budget,
    interval: Duration,
    sender: EventSender,
    stop: Arc<AtomicBool>,
) {
    let mut sent: u64 = 0;

    while !stop.load(Ordering::SeqCst) {
        let chunk = match budget {
            Budget::Samples(limit) => (limit - sent).min(BUFSIZE as u64) as usize,
            Budget::Unlimited => BUFSIZE,
        };
        if chunk == 0 {
            break;
        }

        let mut buf = vec![0u8; chunk];
        generator.fill(&mut buf);
        sent += chunk as u64;
        trace!("generated {} samples ({} total)", chunk, sent);
        if !sender.send(Completion::Data(buf)) {
            return;
        }

        if budget == Budget::Samples(sent) {
            break;
        }
        thread::sleep(interval);
    }

    debug!("demo generator finished after {} samples", sent);
    sender.send(Completion::Closed);
}
