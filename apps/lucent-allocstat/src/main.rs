//! Lucent allocator statistics tool
//!
//! Drives a host-backed dynamic buffer through a seeded random workload of
//! allocations and releases, then prints what the sub-allocator looks like.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p lucent-allocstat -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context};
use lucent_gpu::{AllocError, DynamicResizableBuffer, GpuError, HostBacking, SubBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const MAP_WIDTH: usize = 64;

/// Workload parameters.
#[derive(Debug, Clone)]
struct Options {
    capacity: u64,
    alignment: u64,
    ops: usize,
    seed: u64,
    max_size: u64,
    release_ratio: f64,
    json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capacity: 1024 * 1024,
            alignment: 256,
            ops: 1000,
            seed: 42,
            max_size: 16 * 1024,
            release_ratio: 0.4,
            json: false,
        }
    }
}

/// Outcome counters for one run.
#[derive(Debug, Default)]
struct Tally {
    allocated: usize,
    released: usize,
    out_of_space: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(options) = parse_args(std::env::args().skip(1))? else {
        print_help();
        return Ok(());
    };
    debug!(?options, "Parsed options");

    let capacity = usize::try_from(options.capacity).context("capacity does not fit in memory")?;
    let buffer = DynamicResizableBuffer::new(HostBacking::new(capacity), options.alignment)?;
    let (tally, _live) = run_workload(&buffer, &options)?;

    info!(
        allocated = tally.allocated,
        released = tally.released,
        out_of_space = tally.out_of_space,
        "Workload finished"
    );

    if options.json {
        let report = serde_json::json!({
            "seed": options.seed,
            "ops": options.ops,
            "allocated": tally.allocated,
            "released": tally.released,
            "out_of_space": tally.out_of_space,
            "stats": buffer.stats(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} ops (seed {}): {} allocated, {} released, {} out of space",
            options.ops, options.seed, tally.allocated, tally.released, tally.out_of_space
        );
        println!();
        print!("{}", buffer.debug_report());
        println!();
        println!("[{}]", buffer.occupancy_map(MAP_WIDTH));
    }

    Ok(())
}

/// Run `options.ops` random operations.
///
/// Returns the surviving sub-buffers so their ranges stay allocated while the
/// report is printed.
fn run_workload(
    buffer: &DynamicResizableBuffer<HostBacking>,
    options: &Options,
) -> anyhow::Result<(Tally, Vec<SubBuffer<HostBacking>>)> {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut live: Vec<SubBuffer<HostBacking>> = Vec::new();
    let mut tally = Tally::default();

    for _ in 0..options.ops {
        if !live.is_empty() && rng.gen_bool(options.release_ratio) {
            // Dropping the sub-buffer returns its range.
            drop(live.swap_remove(rng.gen_range(0..live.len())));
            tally.released += 1;
            continue;
        }

        let size = rng.gen_range(1..=options.max_size);
        match buffer.allocate_buffer(size, None) {
            Ok(sub) => {
                live.push(sub);
                tally.allocated += 1;
            }
            Err(GpuError::SubAllocation(AllocError::OutOfSpace { .. })) => {
                tally.out_of_space += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok((tally, live))
}

/// Parse arguments. `Ok(None)` means help was requested.
fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<Options>> {
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--capacity" => options.capacity = parse_size(&value("--capacity")?)?,
            "--alignment" => options.alignment = value("--alignment")?.parse()?,
            "--ops" => options.ops = value("--ops")?.parse()?,
            "--seed" => options.seed = value("--seed")?.parse()?,
            "--max-size" => options.max_size = parse_size(&value("--max-size")?)?,
            "--release-ratio" => options.release_ratio = value("--release-ratio")?.parse()?,
            "--json" => options.json = true,
            "-h" | "--help" => return Ok(None),
            other => bail!("unknown argument: {other}"),
        }
    }

    if options.max_size == 0 {
        bail!("--max-size must be at least 1");
    }
    if !(0.0..=1.0).contains(&options.release_ratio) {
        bail!("--release-ratio must be between 0 and 1");
    }
    Ok(Some(options))
}

/// Byte count with an optional `k`, `m` or `g` binary suffix.
fn parse_size(text: &str) -> anyhow::Result<u64> {
    let lower = text.to_ascii_lowercase();
    let (digits, shift) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 10),
        Some(b'm') => (&lower[..lower.len() - 1], 20),
        Some(b'g') => (&lower[..lower.len() - 1], 30),
        _ => (lower.as_str(), 0),
    };
    let base: u64 = digits
        .parse()
        .with_context(|| format!("invalid size: {text}"))?;
    base.checked_mul(1 << shift)
        .with_context(|| format!("size overflows: {text}"))
}

fn print_help() {
    eprintln!(
        "Lucent allocator statistics tool

USAGE:
    cargo run -p lucent-allocstat -- [OPTIONS]

WORKLOAD OPTIONS:
    --capacity <SIZE>       Backing buffer size (default: 1m)
    --alignment <N>         Default sub-buffer alignment, power of two (default: 256)
    --ops <N>               Number of random operations (default: 1000)
    --seed <N>              RNG seed (default: 42)
    --max-size <SIZE>       Largest single request (default: 16k)
    --release-ratio <P>     Chance each op releases a live sub-buffer (default: 0.4)

    Sizes accept a k, m or g suffix (binary units).

OUTPUT:
    --json                  Print statistics as JSON instead of the text report

OTHER:
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
