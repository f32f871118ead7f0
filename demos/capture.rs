//! Command line capture tool.
//!
//! Acquires from a device (or replays a raw binary file) and renders the
//! samples to stdout.
//!
//! Run with: `cargo run --example capture -- --samples 64 --format bits`
//!
//! Other uses:
//! - `--list` prints the devices found
//! - `--trigger 1=r --trigger 2=0` sets per-probe trigger strings
//! - `--input capture.bin --input-probes 16` replays a file instead
//! - `--decoder transitioncounter` also prints per-probe transition counts

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::Parser;
use logic_capture::decoder::{DecoderRegistry, DecoderSink};
use logic_capture::input::BinaryInput;
use logic_capture::output::{output_format, OutputSink, OUTPUT_FORMATS};
use logic_capture::types::default_probes;
use logic_capture::{
    list_devices, open_device, DeviceConfig, Error, PatternMode, Result, Session,
};

#[derive(Parser, Debug)]
#[command(about = "Capture samples from a logic analyzer")]
struct Args {
    /// List devices and output formats, then exit
    #[arg(long)]
    list: bool,

    /// Device id, as printed by --list
    #[arg(short, long, default_value = "demo:0")]
    device: String,

    /// Sample rate in Hz
    #[arg(short = 'r', long)]
    samplerate: Option<u64>,

    /// Number of samples to acquire
    #[arg(short = 'n', long)]
    samples: Option<u64>,

    /// Acquisition time in milliseconds
    #[arg(short, long)]
    time: Option<u64>,

    /// Capture until interrupted
    #[arg(long)]
    continuous: bool,

    /// Demo pattern (sigrok, random, incremental)
    #[arg(long)]
    pattern: Option<PatternMode>,

    /// Per-probe trigger, `<probe>=<chars>` (repeatable)
    #[arg(long = "trigger", value_name = "PROBE=CHARS")]
    triggers: Vec<String>,

    /// Pre-trigger capture ratio in percent
    #[arg(long)]
    capture_ratio: Option<u8>,

    /// Output format, optionally `<name>:<samples per line>`
    #[arg(short, long, default_value = "bits")]
    format: String,

    /// Replay a raw binary capture instead of acquiring
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Probe count of the --input file
    #[arg(long)]
    input_probes: Option<String>,

    /// Decoders to run on the samples (repeatable)
    #[arg(long = "decoder")]
    decoders: Vec<String>,
}

fn list() -> Result<()> {
    let devices = list_devices()?;
    if devices.is_empty() {
        println!("No devices found.");
    }
    for info in &devices {
        println!("  {:<24} {}", info.id, info.name);
    }
    println!("\nOutput formats:");
    for (name, description) in OUTPUT_FORMATS {
        println!("  {:<8} {}", name, description);
    }
    Ok(())
}

fn parse_trigger(arg: &str) -> Result<(usize, String)> {
    let (probe, chars) = arg
        .split_once('=')
        .ok_or_else(|| Error::msg(format!("trigger must be PROBE=CHARS: {}", arg)))?;
    let probe = probe
        .trim()
        .parse()
        .map_err(|_| Error::msg(format!("invalid probe number: {}", probe)))?;
    Ok((probe, chars.trim().to_string()))
}

fn device_config(args: &Args, num_probes: usize) -> Result<DeviceConfig> {
    let mut config = DeviceConfig::new();
    if let Some(rate) = args.samplerate {
        config = config.with_sample_rate(rate);
    }
    if let Some(samples) = args.samples {
        config = config.with_limit_samples(samples);
    }
    if let Some(msec) = args.time {
        config = config.with_limit_msec(msec);
    }
    if args.continuous {
        config = config.with_continuous(true);
    }
    if let Some(pattern) = args.pattern {
        config = config.with_pattern(pattern);
    }
    if let Some(ratio) = args.capture_ratio {
        config = config.with_capture_ratio(ratio);
    }
    if !args.triggers.is_empty() {
        let mut probes = default_probes(num_probes);
        for arg in &args.triggers {
            let (index, chars) = parse_trigger(arg)?;
            let probe = probes
                .iter_mut()
                .find(|p| p.index == index)
                .ok_or_else(|| Error::msg(format!("no probe {}", index)))?;
            probe.trigger = Some(chars);
        }
        config = config.with_probes(probes);
    }
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list {
        return list();
    }

    let (name, param) = match args.format.split_once(':') {
        Some((name, param)) => (name, Some(param)),
        None => (args.format.as_str(), None),
    };
    let format = output_format(name, param)?;

    let mut session = Session::new();
    session.subscribe(OutputSink::new(format, io::stdout()));

    if !args.decoders.is_empty() {
        let registry = DecoderRegistry::with_builtins(1);
        for name in &args.decoders {
            if !registry.contains(name) {
                return Err(Error::msg(format!("unknown decoder: {}", name)));
            }
        }
        let sink = DecoderSink::new(registry, args.decoders.clone()).on_output(
            |device, name, bytes| {
                let counts: Vec<String> = bytes
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]).to_string())
                    .collect();
                eprintln!("{} {}: {}", device, name, counts.join(" "));
            },
        );
        session.subscribe(sink);
    }

    if let Some(path) = &args.input {
        let mut input = BinaryInput::from_param(args.input_probes.as_deref())?;
        let file = File::open(path).map_err(|e| Error::context(path.display().to_string(), e))?;
        session.load_input(&mut input, &mut BufReader::new(file))?;
        return Ok(());
    }

    let device = open_device(&args.device)?;
    eprintln!("Capturing from {}", device.info());
    let config = device_config(&args, device.num_probes())?;
    for value in config.values() {
        if !device.capabilities().contains(&value.capability()) {
            eprintln!("{} does not support {}, ignoring", device.name(), value.capability());
        }
    }
    let supported = config
        .values()
        .iter()
        .filter(|v| device.capabilities().contains(&v.capability()))
        .cloned()
        .fold(DeviceConfig::new(), DeviceConfig::with);
    device.configure(&supported)?;

    session.add_device(device.clone());
    session.start()?;
    session.run();
    device.close()?;
    Ok(())
}
