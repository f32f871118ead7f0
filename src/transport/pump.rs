//! Bulk IN transfer pump.
//!
//! A pump owns a reader thread that issues back-to-back blocking reads on a
//! bulk endpoint for the whole capture. Only one read is outstanding at a
//! time, so buffers reach the event loop in the order the device sent them.
//! Every completed read is handed over as a [`Completion::Data`] buffer; a
//! fresh buffer is allocated for the next read, so a buffer is never touched
//! again after it has been sent. However the thread ends, its last message
//! is [`Completion::Closed`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event_loop::{Completion, EventSender};

/// Why a bulk read failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Nothing arrived in time. The read is simply retried.
    Timeout,
    /// The device is gone.
    NoDevice,
    /// The transfer failed at the I/O level.
    Io(String),
    /// Any other failure; costs the pump one unit of its failure budget.
    Other(String),
}

impl ReadError {
    /// True if the capture cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReadError::NoDevice | ReadError::Io(_))
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Timeout => write!(f, "timed out"),
            ReadError::NoDevice => write!(f, "no such device"),
            ReadError::Io(e) => write!(f, "I/O error: {}", e),
            ReadError::Other(e) => write!(f, "{}", e),
        }
    }
}

#[cfg(feature = "usb")]
impl From<rusb::Error> for ReadError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => ReadError::Timeout,
            rusb::Error::NoDevice => ReadError::NoDevice,
            rusb::Error::Io => ReadError::Io(e.to_string()),
            other => ReadError::Other(other.to_string()),
        }
    }
}

/// A blocking bulk IN endpoint.
pub trait BulkRead: Send + 'static {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> std::result::Result<usize, ReadError>;
}

/// Transfer sizing for a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    /// Non-fatal read failures tolerated before the pump gives up.
    pub failure_budget: usize,
    /// Size of the very first read.
    pub first_size: usize,
    /// Size of every later read.
    pub size: usize,
    pub timeout: Duration,
}

impl PumpConfig {
    pub const fn new(
        failure_budget: usize,
        first_size: usize,
        size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            failure_budget,
            first_size,
            size,
            timeout,
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self::new(10, 2048, 4096, Duration::from_millis(40))
    }
}

/// Stop request shared between a pump and whoever ends the capture.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A running reader thread.
pub struct TransferPump {
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl TransferPump {
    /// Starts reading from `reader` until stopped, a fatal error, or the
    /// failure budget is spent. Errors that end the pump are posted as
    /// [`Completion::Error`], and [`Completion::Closed`] always follows.
    pub fn spawn<R: BulkRead>(reader: R, config: PumpConfig, sender: EventSender) -> Result<Self> {
        Self::spawn_with(reader, config, sender, StopFlag::new())
    }

    /// Like [`spawn`](Self::spawn), stopping also when `stop` is raised
    /// elsewhere (e.g. by the source once its sample limit is reached).
    pub fn spawn_with<R: BulkRead>(
        reader: R,
        config: PumpConfig,
        sender: EventSender,
        stop: StopFlag,
    ) -> Result<Self> {
        let stop_flag = stop.clone();
        let thread = thread::Builder::new()
            .name("bulk-pump".into())
            .spawn(move || pump_loop(reader, config, sender, stop_flag))
            .map_err(|e| Error::context("spawning transfer pump", e))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Asks the thread to stop after its current read and waits for it.
    pub fn stop(&mut self) {
        self.stop.raise();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for TransferPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop<R: BulkRead>(
    reader: R,
    config: PumpConfig,
    sender: EventSender,
    stop: StopFlag,
) {
    if read_until_done(&reader, &config, &sender, &stop) {
        sender.send(Completion::Closed);
    }
}

/// Returns false if the event loop is gone.
fn read_until_done<R: BulkRead>(
    reader: &R,
    config: &PumpConfig,
    sender: &EventSender,
    stop: &StopFlag,
) -> bool {
    let mut budget = config.failure_budget;
    let mut size = config.first_size;

    while !stop.is_raised() {
        let mut buf = vec![0u8; size];
        match reader.read_bulk(&mut buf, config.timeout) {
            Ok(0) => {}
            Ok(n) => {
                buf.truncate(n);
                if !sender.send(Completion::Data(buf)) {
                    debug!("event loop gone, stopping pump");
                    return false;
                }
                size = config.size;
            }
            Err(ReadError::Timeout) => {}
            Err(e) if e.is_fatal() => {
                error!("bulk transfer failed: {}", e);
                return sender.send(Completion::Error(Error::TransferSubmitFailed(e.to_string())));
            }
            Err(e) => {
                budget = budget.saturating_sub(1);
                warn!("bulk transfer failed ({} failures left): {}", budget, e);
                if budget == 0 {
                    return sender.send(Completion::Error(Error::TransferSubmitFailed(
                        "too many failed transfers".into(),
                    )));
                }
            }
        }
    }
    true
}
