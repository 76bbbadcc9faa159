//! Decode inspector: opens a clip, decodes frames at the requested times and
//! prints timings plus pipeline counters.
//!
//! Usage:
//!   vpreview-inspect <file.mp4> [options]
//!
//! Options:
//!   --at <seconds>        Decode the frame at this time (repeatable)
//!   --frames <n>          Decode the first n frames sequentially (default: 30)
//!   --cpu                 Copy frames to system memory instead of GPU handles
//!   --software            Disable hardware decoding
//!   --in-flight <n>       Maximum samples in flight per session
//!   --scrub               Use the interactive scrubbing profile

use anyhow::{bail, Context, Result};
use std::time::Instant;
use vpreview::{Decoder, DecoderConfig, Frame};

struct Args {
    path: String,
    times: Vec<f64>,
    frames: usize,
    cpu: bool,
    software: bool,
    in_flight: Option<usize>,
    scrub: bool,
}

fn print_usage() {
    eprintln!("Usage: vpreview-inspect <file.mp4> [--at <s>]... [--frames <n>] [--cpu] [--software] [--in-flight <n>] [--scrub]");
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = None;
    let mut times = Vec::new();
    let mut frames = 30;
    let mut cpu = false;
    let mut software = false;
    let mut in_flight = None;
    let mut scrub = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--at" if i + 1 < args.len() => {
                times.push(
                    args[i + 1]
                        .parse()
                        .with_context(|| format!("invalid time {:?}", args[i + 1]))?,
                );
                i += 2;
            }
            "--frames" if i + 1 < args.len() => {
                frames = args[i + 1].parse().context("invalid --frames")?;
                i += 2;
            }
            "--in-flight" if i + 1 < args.len() => {
                in_flight = Some(args[i + 1].parse().context("invalid --in-flight")?);
                i += 2;
            }
            "--cpu" => {
                cpu = true;
                i += 1;
            }
            "--software" => {
                software = true;
                i += 1;
            }
            "--scrub" => {
                scrub = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other if !other.starts_with("--") && path.is_none() => {
                path = Some(other.to_string());
                i += 1;
            }
            other => {
                tracing::warn!("ignoring argument {other}");
                i += 1;
            }
        }
    }

    let Some(path) = path else {
        print_usage();
        bail!("missing input file");
    };
    Ok(Args {
        path,
        times,
        frames,
        cpu,
        software,
        in_flight,
        scrub,
    })
}

fn decode(decoder: &mut Decoder, seconds: f64, cpu: bool) -> Result<Frame> {
    let frame = if cpu {
        decoder.decode_frame_cpu(seconds)?
    } else {
        decoder.decode_frame_zero_copy(seconds)?
    };
    Ok(frame)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vpreview=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args()?;

    let mut config = if args.scrub {
        DecoderConfig::new().for_scrubbing()
    } else {
        DecoderConfig::new()
    };
    config = config.hardware_acceleration(!args.software);
    if let Some(n) = args.in_flight {
        config = config.in_flight_limit(n);
    }

    let mut decoder = Decoder::open(&args.path, config)
        .with_context(|| format!("failed to open {}", args.path))?;
    let props = decoder.properties();
    println!("File:       {}", args.path);
    println!("Size:       {}x{}", props.width, props.height);
    println!("Duration:   {:.3}s", props.duration);
    println!("Frame rate: {:.3}", props.frame_rate);
    println!("Format:     {:?}", props.format);
    println!("Zero-copy:  {}", decoder.supports_zero_copy());
    println!();

    let times: Vec<f64> = if args.times.is_empty() {
        let step = 1.0 / props.frame_rate.max(1.0);
        (0..args.frames).map(|n| n as f64 * step).collect()
    } else {
        args.times.clone()
    };

    let started = Instant::now();
    for &t in &times {
        let at = Instant::now();
        match decode(&mut decoder, t, args.cpu) {
            Ok(frame) => println!(
                "{:>9.3}s -> pts {:>9.3}s  seq {:>6}  {}  {:>7.2}ms",
                t,
                frame.pts,
                frame.sequence,
                if frame.is_zero_copy() { "gpu" } else { "cpu" },
                at.elapsed().as_secs_f64() * 1000.0
            ),
            Err(e) => println!("{t:>9.3}s -> error: {e}"),
        }
    }
    let total = started.elapsed();

    let stats = decoder.stats();
    println!();
    println!(
        "Decoded {} requests in {:.1}ms ({:.2}ms avg)",
        times.len(),
        total.as_secs_f64() * 1000.0,
        total.as_secs_f64() * 1000.0 / times.len().max(1) as f64
    );
    println!("{stats:#?}");

    decoder.close();
    Ok(())
}
