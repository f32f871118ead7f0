//! Single-threaded event multiplexer.
//!
//! Acquisition sources register with the loop and are driven by two kinds of
//! events: completion messages posted by producer threads (USB readers, the
//! demo generator) over one shared channel, and per-source timers. Handlers
//! run one at a time on the thread calling [`EventLoop::iteration`], so a
//! source never races another source or the datafeed sinks.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::datafeed::DatafeedBus;
use crate::error::Error;

/// Longest the loop blocks when no timer is due sooner.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Handle of a registered source. Ids are never reused within a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source {}", self.0)
    }
}

/// A message from a producer thread. Data buffers change owner here.
#[derive(Debug)]
pub enum Completion {
    Data(Vec<u8>),
    Error(Error),
    /// The producer has finished and will send nothing more.
    Closed,
}

#[derive(Debug)]
pub enum SourceEvent {
    Ready(Completion),
    Timeout,
}

/// What the loop should do with a source after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceControl {
    Continue,
    Remove,
}

/// An acquisition source driven by the loop.
pub trait Source: Send {
    fn dispatch(&mut self, event: SourceEvent, bus: &mut DatafeedBus) -> SourceControl;

    /// Called when the source is removed from outside. Producers should be
    /// told to stop; a source that has not ended its stream should end it.
    fn cancel(&mut self, _bus: &mut DatafeedBus) {}
}

/// Posts completions for one source. Cheap to clone, usable from any thread.
#[derive(Debug, Clone)]
pub struct EventSender {
    id: SourceId,
    tx: Sender<(SourceId, Completion)>,
}

impl EventSender {
    /// Returns false if the loop is gone.
    pub fn send(&self, completion: Completion) -> bool {
        self.tx.send((self.id, completion)).is_ok()
    }

    pub fn id(&self) -> SourceId {
        self.id
    }
}

struct Registered {
    priority: i32,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    source: Box<dyn Source>,
}

/// The multiplexer. Lower priority values dispatch first.
pub struct EventLoop {
    tx: Sender<(SourceId, Completion)>,
    rx: Receiver<(SourceId, Completion)>,
    sources: BTreeMap<SourceId, Registered>,
    next_id: u64,
    poll_interval: Duration,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            tx,
            rx,
            sources: BTreeMap::new(),
            next_id: 0,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the longest blocking wait per iteration.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Registers a source. With a timeout the source also receives
    /// [`SourceEvent::Timeout`] every `timeout`.
    pub fn add_source(
        &mut self,
        priority: i32,
        timeout: Option<Duration>,
        source: Box<dyn Source>,
    ) -> SourceId {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.sources.insert(
            id,
            Registered {
                priority,
                timeout,
                deadline: timeout.map(|t| Instant::now() + t),
                source,
            },
        );
        debug!("{} added, priority {}, timeout {:?}", id, priority, timeout);
        id
    }

    /// A sender posting completions to source `id`.
    pub fn sender(&self, id: SourceId) -> EventSender {
        EventSender {
            id,
            tx: self.tx.clone(),
        }
    }

    /// Removes a source and cancels it. Completions still queued or posted
    /// later for `id` are discarded.
    pub fn remove_source(&mut self, id: SourceId, bus: &mut DatafeedBus) -> bool {
        match self.sources.remove(&id) {
            Some(mut registered) => {
                registered.source.cancel(bus);
                debug!("{} removed", id);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Waits for at most the poll interval (or until the next timer),
    /// dispatches every pending completion in priority order, then fires due
    /// timers. Returns the number of handlers run.
    pub fn iteration(&mut self, bus: &mut DatafeedBus) -> usize {
        let now = Instant::now();
        let wait = self
            .sources
            .values()
            .filter_map(|r| r.deadline)
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(self.poll_interval)
            .min(self.poll_interval);

        let mut batch = Vec::new();
        match self.rx.recv_timeout(wait) {
            Ok(message) => batch.push(message),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        batch.extend(std::iter::from_fn(|| self.rx.try_recv().ok()));

        let priority_of = |id: &SourceId| self.sources.get(id).map(|r| r.priority).unwrap_or(0);
        let mut batch: Vec<_> = batch
            .into_iter()
            .map(|(id, completion)| (priority_of(&id), id, completion))
            .collect();
        batch.sort_by_key(|(priority, _, _)| *priority);

        let mut dispatched = 0;
        for (_, id, completion) in batch {
            if !self.sources.contains_key(&id) {
                trace!("{}: discarding completion after removal", id);
                continue;
            }
            self.dispatch(id, SourceEvent::Ready(completion), bus);
            dispatched += 1;
        }

        let now = Instant::now();
        let mut due: Vec<_> = self
            .sources
            .iter()
            .filter(|(_, r)| r.deadline.is_some_and(|d| d <= now))
            .map(|(id, r)| (r.priority, *id))
            .collect();
        due.sort();
        for (_, id) in due {
            if let Some(registered) = self.sources.get_mut(&id) {
                registered.deadline = registered.timeout.map(|t| Instant::now() + t);
                self.dispatch(id, SourceEvent::Timeout, bus);
                dispatched += 1;
            }
        }

        dispatched
    }

    /// Iterates until no sources remain.
    pub fn run(&mut self, bus: &mut DatafeedBus) {
        while self.has_sources() {
            self.iteration(bus);
        }
    }

    fn dispatch(&mut self, id: SourceId, event: SourceEvent, bus: &mut DatafeedBus) {
        let Some(registered) = self.sources.get_mut(&id) else {
            return;
        };
        if registered.source.dispatch(event, bus) == SourceControl::Remove {
            self.sources.remove(&id);
            debug!("{} finished", id);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// Records every event it sees into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        remove_on_closed: bool,
        cancelled: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                log: Arc::clone(log),
                remove_on_closed: true,
                cancelled: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Source for Recorder {
        fn dispatch(&mut self, event: SourceEvent, _bus: &mut DatafeedBus) -> SourceControl {
            let entry = match &event {
                SourceEvent::Ready(Completion::Data(data)) => format!("{}:data{}", self.name, data.len()),
                SourceEvent::Ready(Completion::Error(_)) => format!("{}:error", self.name),
                SourceEvent::Ready(Completion::Closed) => format!("{}:closed", self.name),
                SourceEvent::Timeout => format!("{}:timeout", self.name),
            };
            self.log.lock().unwrap().push(entry);
            match event {
                SourceEvent::Ready(Completion::Closed) if self.remove_on_closed => {
                    SourceControl::Remove
                }
                _ => SourceControl::Continue,
            }
        }

        fn cancel(&mut self, _bus: &mut DatafeedBus) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_batch_dispatches_by_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();

        let low = ev.add_source(10, None, Box::new(Recorder::new("low", &log)));
        let high = ev.add_source(-5, None, Box::new(Recorder::new("high", &log)));

        ev.sender(low).send(Completion::Data(vec![0; 3]));
        ev.sender(high).send(Completion::Data(vec![0; 1]));
        ev.sender(low).send(Completion::Data(vec![0; 2]));

        assert_eq!(ev.iteration(&mut bus), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["high:data1", "low:data3", "low:data2"]
        );
    }

    #[test]
    fn test_closed_removes_source() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let id = ev.add_source(0, None, Box::new(Recorder::new("a", &log)));

        let sender = ev.sender(id);
        let producer = thread::spawn(move || {
            sender.send(Completion::Data(vec![1, 2]));
            sender.send(Completion::Closed);
        });
        producer.join().unwrap();

        ev.run(&mut bus);
        assert!(!ev.has_sources());
        assert_eq!(*log.lock().unwrap(), vec!["a:data2", "a:closed"]);
    }

    #[test]
    fn test_removed_source_drains_late_completions() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ev = EventLoop::new().with_poll_interval(Duration::from_millis(5));
        let mut bus = DatafeedBus::new();
        let recorder = Recorder::new("a", &log);
        let cancelled = Arc::clone(&recorder.cancelled);
        let id = ev.add_source(0, None, Box::new(recorder));
        let sender = ev.sender(id);

        sender.send(Completion::Data(vec![1]));
        assert!(ev.remove_source(id, &mut bus));
        sender.send(Completion::Data(vec![2]));

        assert_eq!(ev.iteration(&mut bus), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(!ev.remove_source(id, &mut bus));
    }

    #[test]
    fn test_late_completion_never_reaches_a_newer_source() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ev = EventLoop::new().with_poll_interval(Duration::from_millis(1));
        let mut bus = DatafeedBus::new();

        let mut stale = Vec::new();
        for _ in 0..100 {
            let id = ev.add_source(0, None, Box::new(Recorder::new("old", &log)));
            stale.push(ev.sender(id));
            ev.remove_source(id, &mut bus);
        }
        let finished = ev.add_source(0, None, Box::new(Recorder::new("done", &log)));
        ev.sender(finished).send(Completion::Closed);
        ev.iteration(&mut bus);

        let current = ev.add_source(0, None, Box::new(Recorder::new("new", &log)));
        assert!(stale.iter().all(|s| s.id() != current));
        assert_ne!(finished, current);
        for sender in &stale {
            sender.send(Completion::Data(vec![0]));
        }
        ev.sender(finished).send(Completion::Data(vec![0]));

        assert_eq!(ev.iteration(&mut bus), 0);
        assert_eq!(*log.lock().unwrap(), vec!["done:closed"]);
        assert_eq!(ev.num_sources(), 1);
    }

    #[test]
    fn test_timer_fires_repeatedly() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let mut recorder = Recorder::new("t", &log);
        recorder.remove_on_closed = false;
        ev.add_source(0, Some(Duration::from_millis(5)), Box::new(recorder));

        let start = Instant::now();
        while log.lock().unwrap().len() < 3 {
            ev.iteration(&mut bus);
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert!(log.lock().unwrap().iter().all(|e| e == "t:timeout"));
    }

    #[test]
    fn test_unknown_source_ignored() {
        let mut ev = EventLoop::new().with_poll_interval(Duration::from_millis(1));
        let mut bus = DatafeedBus::new();
        ev.sender(SourceId(42)).send(Completion::Closed);
        assert_eq!(ev.iteration(&mut bus), 0);
    }
}
