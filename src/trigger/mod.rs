//! Trigger matching.
//!
//! [`SoftwareTrigger`] runs a multi-stage value/mask matcher over incoming
//! sample chunks for devices without trigger hardware. The [`lut`] module
//! builds the look-up tables for devices that match in hardware.

pub mod lut;

pub use lut::{fixup_position, HardwareTrigger, TriggerLut, TriggerParams};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::types::{Capability, EdgeDirection, Probe, StagePredicate, TriggerSpec};

/// Characters accepted in per-probe trigger strings.
pub const TRIGGER_CHARS: &str = "01";

/// Result of a trigger firing inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerMatch {
    /// Index, in samples, of the sample that completed the match.
    pub offset: usize,
    /// The samples that matched each stage, `unitsize` bytes each.
    pub matched: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stage(usize),
    Fired,
}

/// Multi-stage software trigger.
///
/// Each stage tests `(sample & mask) == value`. Stages are matched on
/// consecutive samples; a stage with mask 0 ends the sequence early. The
/// configured edge conditions are checked on the sample that completes the
/// last stage against the sample immediately before it.
#[derive(Debug, Clone)]
pub struct SoftwareTrigger {
    stages: Vec<StagePredicate>,
    rising: u64,
    falling: u64,
    both: u64,
    state: State,
    matched: Vec<u64>,
    previous: Option<u64>,
}

impl SoftwareTrigger {
    /// A trigger that has already fired; every sample passes through.
    pub fn disabled() -> Self {
        Self {
            stages: Vec::new(),
            rising: 0,
            falling: 0,
            both: 0,
            state: State::Fired,
            matched: Vec::new(),
            previous: None,
        }
    }

    /// Creates a trigger from explicit stages and edge masks.
    ///
    /// With no stages and no edges the trigger starts fired.
    pub fn new(stages: Vec<StagePredicate>, rising: u64, falling: u64, both: u64) -> Self {
        let mut stages = stages;
        let has_edges = rising | falling | both != 0;
        if stages.iter().all(|s| s.mask == 0) && !has_edges {
            return Self::disabled();
        }
        if stages.is_empty() {
            stages.push(StagePredicate::default());
        }
        Self {
            stages,
            rising,
            falling,
            both,
            state: State::Stage(0),
            matched: Vec::new(),
            previous: None,
        }
    }

    /// Builds stages from the per-probe trigger strings of enabled probes.
    ///
    /// Character `n` of a probe's string is that probe's condition in stage
    /// `n`: `'1'` high, `'0'` low.
    pub fn from_probes(probes: &[Probe], max_stages: usize) -> Result<Self> {
        let mut stages = vec![StagePredicate::default(); max_stages];
        let mut used = 0;

        for probe in probes.iter().filter(|p| p.enabled) {
            let Some(pattern) = probe.trigger.as_deref() else {
                continue;
            };
            add_sequence(&mut stages, &mut used, probe.mask(), pattern, max_stages)?;
        }

        stages.truncate(used);
        Ok(Self::new(stages, 0, 0, 0))
    }

    /// Builds a trigger from trigger specs.
    ///
    /// Logic stages and probe sequences are merged stage by stage; edges
    /// apply to the completing sample. Other trigger kinds are rejected.
    pub fn from_specs(specs: &[TriggerSpec], max_stages: usize) -> Result<Self> {
        let mut stages = vec![StagePredicate::default(); max_stages];
        let mut used = 0;
        let (mut rising, mut falling, mut both) = (0u64, 0u64, 0u64);

        for spec in specs {
            match spec {
                TriggerSpec::Logic { stages: logic } => {
                    if logic.len() > max_stages {
                        return Err(too_many_stages(logic.len(), max_stages));
                    }
                    for (stage, predicate) in stages.iter_mut().zip(logic) {
                        stage.mask |= predicate.mask;
                        stage.value |= predicate.value & predicate.mask;
                    }
                    used = used.max(logic.len());
                }
                TriggerSpec::Sequence { probe, pattern } => {
                    let mask = Probe::new(*probe).mask();
                    add_sequence(&mut stages, &mut used, mask, pattern, max_stages)?;
                }
                TriggerSpec::Edge { probe, direction } => {
                    let mask = Probe::new(*probe).mask();
                    match direction {
                        EdgeDirection::Rising => rising |= mask,
                        EdgeDirection::Falling => falling |= mask,
                        EdgeDirection::Both => both |= mask,
                    }
                }
                other => {
                    return Err(Error::UnsupportedTrigger(format!(
                        "{} triggers are not supported in software",
                        other.kind()
                    )))
                }
            }
        }

        stages.truncate(used);
        Ok(Self::new(stages, rising, falling, both))
    }

    pub fn is_fired(&self) -> bool {
        self.state == State::Fired
    }

    /// Current stage, or `None` once fired.
    pub fn stage(&self) -> Option<usize> {
        match self.state {
            State::Stage(stage) => Some(stage),
            State::Fired => None,
        }
    }

    /// The configured stages, empty for a disabled trigger.
    pub fn stages(&self) -> &[StagePredicate] {
        &self.stages
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    /// Scans a chunk of `unitsize`-byte little-endian samples.
    ///
    /// Returns the match if the trigger fires inside this chunk. Once fired,
    /// later calls return `None`.
    pub fn feed(&mut self, data: &[u8], unitsize: usize) -> Option<TriggerMatch> {
        let State::Stage(mut stage) = self.state else {
            return None;
        };
        if unitsize == 0 || unitsize > 8 {
            return None;
        }

        let count = data.len() / unitsize;
        let sample_at = |idx: usize| LittleEndian::read_uint(&data[idx * unitsize..], unitsize);
        let mut result = None;

        let mut i: isize = 0;
        while (i as usize) < count {
            let idx = i as usize;
            let sample = sample_at(idx);
            let previous = if idx == 0 {
                self.previous
            } else {
                Some(sample_at(idx - 1))
            };

            if self.stage_passes(stage, sample, previous) {
                self.matched.truncate(stage);
                self.matched.push(sample);
                stage += 1;
                if self.completes(stage) {
                    self.state = State::Fired;
                    let mut matched = vec![0u8; self.matched.len() * unitsize];
                    for (chunk, value) in matched.chunks_exact_mut(unitsize).zip(&self.matched) {
                        LittleEndian::write_uint(chunk, *value, unitsize);
                    }
                    result = Some(TriggerMatch {
                        offset: idx,
                        matched,
                    });
                    break;
                }
            } else if stage > 0 {
                // Retry from the sample after the one that began this match.
                i -= stage as isize;
                if i < -1 {
                    i = -1;
                }
                stage = 0;
            }
            i += 1;
        }

        if result.is_none() {
            self.state = State::Stage(stage);
        }
        if count > 0 {
            self.previous = Some(sample_at(count - 1));
        }
        result
    }

    fn completes(&self, next: usize) -> bool {
        next == self.stages.len() || self.stages[next].mask == 0
    }

    fn stage_passes(&self, stage: usize, sample: u64, previous: Option<u64>) -> bool {
        if !self.stages[stage].matches(sample) {
            return false;
        }
        if !self.completes(stage + 1) {
            return true;
        }
        self.edges_hold(sample, previous)
    }

    fn edges_hold(&self, sample: u64, previous: Option<u64>) -> bool {
        if self.rising | self.falling | self.both == 0 {
            return true;
        }
        let Some(prev) = previous else {
            return false;
        };
        prev & self.rising == 0
            && sample & self.rising == self.rising
            && prev & self.falling == self.falling
            && sample & self.falling == 0
            && (prev ^ sample) & self.both == self.both
    }
}

impl Default for SoftwareTrigger {
    fn default() -> Self {
        Self::disabled()
    }
}

fn add_sequence(
    stages: &mut [StagePredicate],
    used: &mut usize,
    mask: u64,
    pattern: &str,
    max_stages: usize,
) -> Result<()> {
    if pattern.chars().count() > max_stages {
        return Err(too_many_stages(pattern.chars().count(), max_stages));
    }
    for (stage, c) in pattern.chars().enumerate() {
        match c {
            '0' => stages[stage].mask |= mask,
            '1' => {
                stages[stage].mask |= mask;
                stages[stage].value |= mask;
            }
            other => {
                return Err(Error::bad_value(
                    Capability::ProbeConfig,
                    format!(
                        "trigger character '{}' not in \"{}\"",
                        other, TRIGGER_CHARS
                    ),
                ))
            }
        }
        *used = (*used).max(stage + 1);
    }
    Ok(())
}

fn too_many_stages(requested: usize, max: usize) -> Error {
    Error::UnsupportedTrigger(format!(
        "{} trigger stages requested, device supports {}",
        requested, max
    ))
}
