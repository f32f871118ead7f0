//! Text renderings: one line per probe, as bits or as hex bytes.

use std::fmt::Write as _;

use super::OutputFormat;
use crate::datafeed::{Header, Logic, Packet};
use crate::types::{default_probes, samplerate_string, Probe};

pub const DEFAULT_BITS_PER_LINE: usize = 64;
pub const DEFAULT_HEX_PER_LINE: usize = 256;

const PACKAGE_STRING: &str = concat!("logic-capture ", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMode {
    /// One character per sample, a space every eight.
    Bits,
    /// Eight samples per hex byte, most recent sample in bit 0.
    Hex,
}

#[derive(Debug, Clone)]
struct Channel {
    name: String,
    mask: u64,
    line: String,
    /// Shift register for hex mode.
    value: u8,
}

/// Renders probe lines of `samples_per_line` samples each.
#[derive(Debug, Clone)]
pub struct TextOutput {
    mode: TextMode,
    samples_per_line: usize,
    probes: Option<Vec<Probe>>,
    channels: Vec<Channel>,
    name_width: usize,
    /// Samples on the current line.
    count: usize,
    /// Sample on the current line the trigger fired before.
    mark: Option<usize>,
}

impl TextOutput {
    pub fn new(mode: TextMode) -> Self {
        Self {
            mode,
            samples_per_line: match mode {
                TextMode::Bits => DEFAULT_BITS_PER_LINE,
                TextMode::Hex => DEFAULT_HEX_PER_LINE,
            },
            probes: None,
            channels: Vec::new(),
            name_width: 0,
            count: 0,
            mark: None,
        }
    }

    pub fn with_samples_per_line(mut self, samples: usize) -> Self {
        self.samples_per_line = samples.max(1);
        self
    }

    /// Names and enables probes. Without this every probe announced by the
    /// header is shown under its index.
    pub fn with_probes(mut self, probes: Vec<Probe>) -> Self {
        self.probes = Some(probes);
        self
    }

    fn begin(&mut self, header: &Header) -> String {
        let probes = self
            .probes
            .clone()
            .unwrap_or_else(|| default_probes(header.num_logic_probes));
        self.channels = probes
            .iter()
            .filter(|p| p.enabled)
            .map(|p| Channel {
                name: p.name.clone(),
                mask: p.mask(),
                line: String::new(),
                value: 0,
            })
            .collect();
        self.name_width = self.channels.iter().map(|c| c.name.len()).max().unwrap_or(1);
        self.count = 0;
        self.mark = None;

        format!(
            "{}\nAcquisition with {}/{} probes at {}\n",
            PACKAGE_STRING,
            self.channels.len(),
            probes.len(),
            samplerate_string(header.samplerate)
        )
    }

    fn push_sample(&mut self, sample: u64, out: &mut String) {
        self.count += 1;
        let boundary = self.count % 8 == 0;

        for channel in &mut self.channels {
            let high = sample & channel.mask != 0;
            match self.mode {
                TextMode::Bits => {
                    channel.line.push(if high { '1' } else { '0' });
                    if boundary {
                        channel.line.push(' ');
                    }
                }
                TextMode::Hex => {
                    channel.value = channel.value << 1 | u8::from(high);
                    if boundary {
                        let _ = write!(channel.line, "{:02x} ", channel.value);
                    }
                }
            }
        }

        if self.count >= self.samples_per_line {
            self.flush(out);
        }
    }

    fn flush(&mut self, out: &mut String) {
        if self.count == 0 {
            return;
        }
        let partial = self.count % 8 != 0;
        for channel in &mut self.channels {
            if self.mode == TextMode::Hex && partial {
                let _ = write!(channel.line, "{:02x}", channel.value);
            }
            let _ = writeln!(
                out,
                "{:>width$}:{}",
                channel.name,
                channel.line.trim_end(),
                width = self.name_width
            );
            channel.line.clear();
        }

        if let Some(mark) = self.mark.take() {
            let column = match self.mode {
                TextMode::Bits => mark + mark / 8,
                TextMode::Hex => mark / 8 * 3,
            };
            let _ = writeln!(
                out,
                "{:>width$}:{}^",
                "T",
                " ".repeat(column),
                width = self.name_width
            );
        }
        self.count = 0;
    }

    fn logic(&mut self, logic: &Logic) -> String {
        let mut out = String::new();
        let unitsize = logic.unitsize.clamp(1, 8);
        for raw in logic.data.chunks_exact(unitsize) {
            let mut bytes = [0u8; 8];
            bytes[..unitsize].copy_from_slice(raw);
            self.push_sample(u64::from_le_bytes(bytes), &mut out);
        }
        out
    }
}

impl OutputFormat for TextOutput {
    fn name(&self) -> &'static str {
        match self.mode {
            TextMode::Bits => "bits",
            TextMode::Hex => "hex",
        }
    }

    fn render(&mut self, packet: &Packet) -> Vec<u8> {
        let text = match packet {
            Packet::Header(header) => self.begin(header),
            Packet::Logic(logic) => self.logic(logic),
            Packet::Trigger => {
                self.mark = Some(self.count);
                String::new()
            }
            Packet::End => {
                let mut out = String::new();
                self.flush(&mut out);
                out
            }
        };
        text.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mhz;

    fn render_all(output: &mut TextOutput, packets: &[Packet]) -> String {
        packets
            .iter()
            .map(|p| String::from_utf8(output.render(p)).unwrap())
            .collect()
    }

    #[test]
    fn test_bits_header_and_lines() {
        let mut output = TextOutput::new(TextMode::Bits);
        let samples: Vec<u8> = (0..10).collect();
        let text = render_all(
            &mut output,
            &[
                Packet::Header(Header::new(mhz(1), 2)),
                Packet::logic(1, samples),
                Packet::End,
            ],
        );
        let expected = format!(
            "logic-capture {}\nAcquisition with 2/2 probes at 1 MHz\n1:01010101 01\n2:00110011 00\n",
            env!("CARGO_PKG_VERSION")
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_bits_wraps_lines() {
        let mut output = TextOutput::new(TextMode::Bits).with_samples_per_line(4);
        output.render(&Packet::Header(Header::new(1000, 1)));
        let first = render_all(&mut output, &[Packet::logic(1, vec![1, 0, 1, 1, 0, 0])]);
        assert_eq!(first, "1:1011\n");
        let rest = render_all(&mut output, &[Packet::End]);
        assert_eq!(rest, "1:00\n");
    }

    #[test]
    fn test_trigger_marker() {
        let mut output = TextOutput::new(TextMode::Bits);
        output.render(&Packet::Header(Header::new(1000, 1)));
        let text = render_all(
            &mut output,
            &[
                Packet::logic(1, vec![0; 10]),
                Packet::Trigger,
                Packet::logic(1, vec![1; 2]),
                Packet::End,
            ],
        );
        assert_eq!(text, "1:00000000 0011\nT:           ^\n");
    }

    #[test]
    fn test_hex_bytes() {
        let mut output = TextOutput::new(TextMode::Hex);
        output.render(&Packet::Header(Header::new(1000, 1)));
        let text = render_all(
            &mut output,
            &[
                Packet::logic(1, vec![1, 0, 1, 0, 1, 0, 1, 0, 1, 1, 0, 0]),
                Packet::End,
            ],
        );
        assert_eq!(text, "1:aa ac\n");
    }

    #[test]
    fn test_probe_names_and_disabled_probes() {
        let probes = vec![
            Probe::new(1).with_name("clk"),
            Probe::new(2).disabled(),
            Probe::new(3),
        ];
        let mut output = TextOutput::new(TextMode::Bits).with_probes(probes);
        let header = String::from_utf8(output.render(&Packet::Header(Header::new(mhz(2), 3)))).unwrap();
        assert!(header.ends_with("Acquisition with 2/3 probes at 2 MHz\n"));

        let text = render_all(&mut output, &[Packet::logic(1, vec![0b101, 0b001]), Packet::End]);
        assert_eq!(text, "clk:11\n  3:10\n");
    }

    #[test]
    fn test_wide_samples() {
        let mut output = TextOutput::new(TextMode::Bits).with_probes(vec![Probe::new(16)]);
        output.render(&Packet::Header(Header::new(1000, 16)));
        let text = render_all(&mut output, &[Packet::logic(2, vec![0x00, 0x80, 0xff, 0x7f]), Packet::End]);
        assert_eq!(text, "16:10\n");
    }
}
