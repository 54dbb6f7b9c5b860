// ========================================================================================
//
//                        THE COMMAND-LINE DRIVER: DETPOINT
//
// ========================================================================================
//
// A thin shell around the library. `detpoint env` reports the execution environment the
// engine sees, and `detpoint simulate` builds a synthetic scan, runs the pointing kernel
// on the host and, when asked, on the accelerator, and reports timings and the largest
// disagreement between the two.

use clap::{Parser, Subcommand};
use detpoint::intervals;
use detpoint::qarray::{self, Quat};
use detpoint::{AccelManager, AccelTarget, Buffer, RuntimeConfig, pointing_detector};
use ndarray::{Array1, Array2, Array3};
use std::error::Error;
use std::f64::consts::{FRAC_PI_4, TAU};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

// ========================================================================================
//                              Command-line interface definition
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "detpoint",
    version,
    about = "A detector pointing engine for time-ordered astronomical observations."
)]
struct Cli {
    /// Optional TOML configuration file. Environment variables override its values.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the execution environment: threads, accelerator target and device state.
    Env,
    /// Run the pointing kernel on a synthetic scan.
    Simulate(SimulateArgs),
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Number of detectors on the focal plane.
    #[clap(long, default_value = "64")]
    detectors: usize,

    /// Number of boresight samples.
    #[clap(long, default_value = "100000")]
    samples: usize,

    /// Number of observing intervals the scan is split into.
    #[clap(long, default_value = "8")]
    intervals: usize,

    /// Flag one sample in every N as bad.
    #[clap(long, default_value = "97")]
    flag_every: usize,

    /// Also run on the accelerator and compare against the host result.
    #[clap(long)]
    accel: bool,

    /// Accelerator target, overriding the configuration.
    #[clap(long)]
    target: Option<AccelTarget>,
}

/// Bit set in the shared flags of simulated bad samples.
const SIM_FLAG_BAD: u8 = 1;

/// Bit set in the shared flags of samples between simulated intervals.
const SIM_FLAG_GAP: u8 = 2;

/// Samples left out between consecutive simulated intervals.
const SIM_INTERVAL_GAP: usize = 10;

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("\nError: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut config = RuntimeConfig::resolve(cli.config.as_deref())?;

    env_logger::Builder::new()
        .filter_level(config.level_filter()?)
        .parse_env("RUST_LOG")
        .init();

    match cli.command {
        Command::Env => {
            let manager = AccelManager::install(config.accel)?;
            print_environment(manager);
            Ok(())
        }
        Command::Simulate(args) => {
            if let Some(target) = args.target {
                config.accel.target = target;
            }
            let manager = AccelManager::install(config.accel.clone())?;
            simulate(manager, &args)
        }
    }
}

fn print_environment(manager: &AccelManager) {
    println!("detpoint {}", env!("CARGO_PKG_VERSION"));
    println!("  host threads:        {}", rayon::current_num_threads());
    println!("  accelerator target:  {}", manager.config().target);
    println!("  device is host:      {}", manager.device_is_host());
    println!("  selected device:     {}", manager.get_device());
    println!("  device teams:        {}", manager.n_teams());
    println!("  device allocations:  {}", manager.n_registered());
}

// ========================================================================================
//                                  Synthetic scan
// ========================================================================================

fn axis_angle(axis: [f64; 3], angle: f64) -> Quat {
    let (s, c) = (0.5 * angle).sin_cos();
    [axis[0] * s, axis[1] * s, axis[2] * s, c]
}

/// A constant-elevation azimuth sweep: `az(t) = A sin(2 pi t / P)` about z, composed
/// with a fixed 45 degree tilt about y.
fn simulate_boresight(n_samp: usize) -> Array2<f64> {
    let elevation = axis_angle([0.0, 1.0, 0.0], FRAC_PI_4);
    let amplitude = 0.35;
    let period = 4096.0;

    let mut boresight = Array2::<f64>::zeros((n_samp, 4));
    for (isamp, mut row) in boresight.rows_mut().into_iter().enumerate() {
        let az = amplitude * (TAU * isamp as f64 / period).sin();
        let mut q = [0.0; 4];
        qarray::mult(&axis_angle([0.0, 0.0, 1.0], az), &elevation, &mut q);
        row.iter_mut().zip(q).for_each(|(dst, v)| *dst = v);
    }
    boresight
}

/// Detectors on a ring of 1 degree radius around the boresight.
fn simulate_focalplane(n_det: usize) -> Array2<f64> {
    let radius = 1.0f64.to_radians();
    let mut focalplane = Array2::<f64>::zeros((n_det, 4));
    for (idet, mut row) in focalplane.rows_mut().into_iter().enumerate() {
        let phi = TAU * idet as f64 / n_det.max(1) as f64;
        let mut q = [0.0; 4];
        qarray::mult(
            &axis_angle([0.0, 0.0, 1.0], phi),
            &axis_angle([1.0, 0.0, 0.0], radius),
            &mut q,
        );
        row.iter_mut().zip(q).for_each(|(dst, v)| *dst = v);
    }
    focalplane
}

/// Flags `n_samp` samples split into `n_view` equal stretches. The trailing samples of
/// each stretch, and any remainder, carry the gap bit; every `flag_every`-th sample
/// carries the bad bit.
fn simulate_flags(n_samp: usize, n_view: usize, flag_every: usize) -> Vec<u8> {
    let n_view = n_view.max(1);
    let span = n_samp / n_view;
    (0..n_samp)
        .map(|isamp| {
            let mut flag = 0;
            if flag_every > 0 && isamp % flag_every == 0 {
                flag |= SIM_FLAG_BAD;
            }
            let in_gap = span <= SIM_INTERVAL_GAP
                || isamp >= n_view * span
                || isamp % span >= span - SIM_INTERVAL_GAP;
            if in_gap {
                flag |= SIM_FLAG_GAP;
            }
            flag
        })
        .collect()
}

fn simulate(
    manager: &AccelManager,
    args: &SimulateArgs,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let n_det = args.detectors;
    let n_samp = args.samples;

    eprintln!("> Building a synthetic scan: {n_det} detectors, {n_samp} samples");
    let focalplane = simulate_focalplane(n_det);
    let boresight = simulate_boresight(n_samp);
    let q_index: Array1<i32> = (0..n_det as i32).collect();
    let flags = simulate_flags(n_samp, args.intervals, args.flag_every);
    let views = intervals::from_flags(&flags, SIM_FLAG_GAP);
    eprintln!(
        "> {} intervals covering {} samples",
        views.len(),
        intervals::total_samples(&views)
    );
    let views = Array1::from(views);
    let flags = Array1::from(flags);

    let mut host_quats = Array3::<f64>::zeros((n_det, n_samp, 4));
    let start = Instant::now();
    pointing_detector(
        Buffer::from(focalplane.view()),
        Buffer::from(boresight.view()),
        Buffer::from(q_index.view()),
        Buffer::from(host_quats.view_mut()),
        Buffer::from(views.view()),
        Buffer::from(flags.view()),
        SIM_FLAG_BAD,
        false,
    )?;
    eprintln!("> Host kernel: {:.3?}", start.elapsed());

    if !args.accel {
        return Ok(());
    }
    if manager.device_is_host() {
        eprintln!("> Accelerator requested, but the selected target is the host; skipping");
        return Ok(());
    }

    let mut device_quats = Array3::<f64>::zeros((n_det, n_samp, 4));
    let staged = [
        stage(manager, boresight.as_slice())?,
        stage(manager, views.as_slice())?,
        stage(manager, flags.as_slice())?,
        stage(manager, device_quats.as_slice())?,
    ];
    eprintln!("> Staged {} buffers on device {}", staged.len(), manager.get_device());

    let start = Instant::now();
    pointing_detector(
        Buffer::from(focalplane.view()),
        Buffer::from(boresight.view()),
        Buffer::from(q_index.view()),
        Buffer::from(device_quats.view_mut()),
        Buffer::from(views.view()),
        Buffer::from(flags.view()),
        SIM_FLAG_BAD,
        true,
    )?;
    eprintln!("> Device kernel: {:.3?}", start.elapsed());

    if let Some(quats) = device_quats.as_slice_mut() {
        manager.update_host(quats)?;
    }
    manager.reset();

    let max_diff = host_quats
        .iter()
        .zip(device_quats.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f64, f64::max);
    eprintln!("> Largest host/device discrepancy: {max_diff:e}");
    Ok(())
}

/// Creates and fills the device mirror of a contiguous host array.
fn stage<T: detpoint::buffer::Element>(
    manager: &AccelManager,
    host: Option<&[T]>,
) -> Result<usize, Box<dyn Error + Send + Sync>> {
    let host = host.ok_or("host array is not contiguous")?;
    if host.is_empty() {
        return Ok(0);
    }
    manager.create(host)?;
    manager.update_device(host)?;
    Ok(std::mem::size_of_val(host))
}
