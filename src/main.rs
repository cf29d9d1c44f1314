use std::path::{Path, PathBuf};
use std::process::exit;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{unbounded, Receiver};

use benchlink::{
    init_rust_logging, Demultiplexer, Inbound, LinkConfig, LinkState, PollScheduler,
    RecordingConfig, ScriptedSource, SerialSource, Session, SessionEvent, TestParameters,
};

#[derive(Parser, Debug)]
#[command(name = "benchlink", about = "Talk to the stiffness test bench over serial")]
struct Cli {
    /// Log level (error, warn, info, debug, trace). Defaults to BENCHLINK_LOG/RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports,
    /// Open a port, wait for READY and print everything the bench sends
    Monitor(MonitorArgs),
    /// Decode a raw capture file as if it arrived in fixed-size chunks
    Replay {
        file: PathBuf,
        /// Bytes delivered per tick
        #[arg(long, default_value_t = 64)]
        chunk: usize,
    },
}

#[derive(Args, Debug)]
struct MonitorArgs {
    /// Serial port, e.g. /dev/ttyACM0 or COM4
    port: String,
    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    baud: Option<u32>,
    /// Polling interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Start a test once the bench is ready
    #[arg(long)]
    start: bool,
    /// mm/s
    #[arg(long, default_value_t = 0.5)]
    speed: f64,
    #[arg(long, default_value_t = 5)]
    cycles: u32,
    /// N
    #[arg(long, default_value_t = 50.0)]
    max_force: f64,
    /// mm
    #[arg(long, default_value_t = 10.0)]
    max_distance: f64,
    /// Run and discard one preparation cycle first
    #[arg(long)]
    prep_cycle: bool,
    /// Write raw samples to this file
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_rust_logging(cli.log_level.as_deref());

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Monitor(args) => monitor(args),
        Commands::Replay { file, chunk } => replay(&file, chunk),
    }
}

fn list_ports() -> Result<()> {
    let ports = SerialSource::list_ports().context("listing serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn load_config(args: &MonitorArgs) -> Result<LinkConfig> {
    let mut config = match &args.config {
        Some(path) => LinkConfig::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => LinkConfig::default(),
    };
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(poll_ms) = args.poll_ms {
        config.poll_interval_ms = poll_ms;
    }
    config.validate()?;
    Ok(config)
}

fn monitor(args: MonitorArgs) -> Result<()> {
    let config = load_config(&args)?;
    let (tx, rx) = unbounded();
    let mut session = Session::new(config, tx);
    let mut scheduler = PollScheduler::from_config(session.config());

    println!("Opening {}...", args.port);
    session
        .open(&args.port)
        .with_context(|| format!("opening {}", args.port))?;

    let params = TestParameters {
        speed: args.speed,
        cycles: args.cycles,
        max_force: args.max_force,
        max_distance: args.max_distance,
    };
    let mut pending_start = args.start;
    let mut finished = false;

    loop {
        let now = Instant::now();
        if !scheduler.poll_due(&mut session, now) {
            thread::sleep(scheduler.until_due(now));
            continue;
        }
        finished |= print_events(&rx);

        if pending_start && session.state() == LinkState::Ready {
            pending_start = false;
            let recording = RecordingConfig {
                skip_preparation: args.prep_cycle,
                log_path: args.log.clone(),
                ..Default::default()
            };
            session
                .start_test(&params, recording)
                .context("starting test")?;
            finished |= print_events(&rx);
        }

        if session.state() == LinkState::Closed {
            bail!("link to {} closed", args.port);
        }
        if finished {
            break;
        }
    }

    session.close();
    print_events(&rx);
    Ok(())
}

/// Print pending events. Returns `true` once a recording has finished.
fn print_events(rx: &Receiver<SessionEvent>) -> bool {
    let mut finished = false;
    for event in rx.try_iter() {
        match event {
            SessionEvent::Sample(s) => {
                println!("{:>8.2} s {:>8.2} mm {:>8.2} N", s.time, s.displacement, s.force)
            }
            SessionEvent::Line(text) => println!("< {text}"),
            SessionEvent::CommandSent(text) => println!("> {text}"),
            SessionEvent::StateChanged(state) => println!("[link] {state:?}"),
            SessionEvent::RunStateChanged(state) => println!("[run] {state:?}"),
            SessionEvent::CycleFinished { count, total } => match total {
                Some(total) => println!("[cycle] {count}/{total}"),
                None => println!("[cycle] {count}"),
            },
            SessionEvent::RecordingFinished(summary) => {
                finished = true;
                match serde_json::to_string(&summary) {
                    Ok(json) => println!("[done] {json}"),
                    Err(_) => println!("[done] {summary:?}"),
                }
            }
            SessionEvent::Alert(alert) => eprintln!("[alert] {alert:?}"),
            SessionEvent::Message(_) | SessionEvent::Diagnostic(_) => {}
            other => println!("[event] {other:?}"),
        }
    }
    finished
}

fn replay(file: &Path, chunk: usize) -> Result<()> {
    if chunk == 0 {
        bail!("--chunk must be at least 1");
    }
    let capture =
        std::fs::read(file).with_context(|| format!("reading capture {}", file.display()))?;

    let source = ScriptedSource::new();
    for piece in capture.chunks(chunk) {
        source.schedule(piece.to_vec());
    }

    let mut reader = source.clone();
    let mut demux = Demultiplexer::new();
    let (mut samples, mut lines, mut bad_frames, mut truncated) = (0usize, 0usize, 0usize, 0usize);
    while source.remaining() > 0 {
        source.advance();
        let report = demux.poll(&mut reader)?;
        bad_frames += report.checksum_errors;
        if let Some(got) = report.truncated {
            truncated += 1;
            println!("[truncated frame, {got} bytes]");
        }
        for item in report.items {
            match item {
                Inbound::Sample(s) => {
                    samples += 1;
                    println!("{:>8.2} s {:>8.2} mm {:>8.2} N", s.time, s.displacement, s.force);
                }
                Inbound::Line(line) => {
                    lines += 1;
                    println!("< {}", line.text);
                }
            }
        }
        if report.end_of_burst {
            println!("[end of burst]");
        }
    }

    println!(
        "{} bytes: {samples} samples, {lines} lines, {bad_frames} bad frames, {truncated} truncated",
        capture.len()
    );
    Ok(())
}
