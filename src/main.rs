//! Command-line front end for a picoDAQ on a serial port
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use picodaq::{PortRegistry, ScanData, Session, Settings, StreamSpec};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "picodaq", version, about = "Stream data from a picoDAQ instrument")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Serial port of the device (overrides the configuration file)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Print device identity and calibration
    Info,
    /// Record analog and digital inputs and print them as CSV
    Acquire(AcquireArgs),
}

#[derive(Args)]
struct AcquireArgs {
    /// Analog input channels
    #[arg(long, num_args = 1.., default_values_t = vec![0u8])]
    channels: Vec<u8>,

    /// Digital input lines
    #[arg(long, num_args = 1..)]
    lines: Vec<u8>,

    /// Sampling rate in Hz
    #[arg(long, default_value_t = 1000)]
    rate: u32,

    /// Number of scans to record
    #[arg(long, default_value_t = 1000)]
    scans: usize,

    /// Print raw codes instead of volts
    #[arg(long)]
    raw: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;

    let level = match cli.verbose {
        0 => settings.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(port) = cli.port.clone().or_else(|| settings.port.clone()) else {
        bail!("No serial port given; use --port or set `port` in the configuration");
    };
    let mut session = Session::serial(port, PortRegistry::new(), settings);

    match cli.command {
        Command::Info => {
            let info = session.device_info()?;
            let cal = session.calibration()?;
            println!("{}", info);
            println!("input:         {:.6e} V/code {:+.4} V", cal.input_gain, cal.input_offset);
            println!("output:        {:.4} code/V {:+.2} code", cal.output_gain, cal.output_offset);
        }
        Command::Acquire(args) => acquire(&mut session, &args)?,
    }
    Ok(())
}

fn acquire(session: &mut Session, args: &AcquireArgs) -> Result<()> {
    let cal = session.calibration()?;
    let ai = session.open(StreamSpec::analog_in(args.channels.clone()).with_rate(args.rate))?;
    let di = if args.lines.is_empty() {
        None
    } else {
        Some(session.open(StreamSpec::digital_in(args.lines.clone()).with_rate(args.rate))?)
    };

    let analog = session.read_scans(ai, args.scans)?;
    let digital = match di {
        Some(handle) => Some(session.read_scans(handle, args.scans)?),
        None => None,
    };
    session.stop()?;

    let header: Vec<String> = std::iter::once("t".to_string())
        .chain(args.channels.iter().map(|c| format!("ai{}", c)))
        .chain(args.lines.iter().map(|l| format!("di{}", l)))
        .collect();
    println!("{}", header.join(","));

    let period = Duration::from_secs_f64(1.0 / f64::from(args.rate));
    let scans = digital
        .as_ref()
        .map_or(analog.scans(), |d| d.scans().min(analog.scans()));
    for scan in 0..scans {
        let mut row = vec![format!("{:.6}", (period * scan as u32).as_secs_f64())];
        for &ch in &args.channels {
            let code = analog.analog(ch).map_or(0, |column| column[scan]);
            row.push(if args.raw {
                code.to_string()
            } else {
                format!("{:.5}", cal.input_volts(code))
            });
        }
        if let Some(ScanData::Digital { columns, .. }) = &digital {
            row.extend(columns.iter().map(|column| column[scan].to_string()));
        }
        println!("{}", row.join(","));
    }

    if let Some(handle) = di {
        session.close(handle)?;
    }
    session.close(ai)?;
    Ok(())
}
