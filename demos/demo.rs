//! Demo application profiling a group of thread peers.
//!
//! Every peer runs the same regions of a small synthetic workload; at the
//! end the shared artifact is read back and printed.
//!
//! Run with:
//! ```bash
//! cargo run --example demo --features demo -- --help
//! cargo run --example demo --features demo -- --peers 4 --format csv --summary
//! ```

use std::hint::black_box;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use clap::{Parser, ValueEnum};
use perfdump::config::{BackendKind, EventSelector};
use perfdump::logging::{init_logging, LogConfig};
use perfdump::peers::{LocalGroup, LocalPeer, PeerGroup};
use perfdump::report::{RecordTable, TableStyle};
use perfdump::writers::{array, delimited};
use perfdump::{OutputFormat, Result, Session, SessionConfig};

/// Artifact layout selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatChoice {
    /// Delimited `rank,region,metric,value` log
    Csv,
    /// Extensible array store
    Array,
}

/// Counter backend selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendChoice {
    /// Per-thread statistics from /proc
    Procstat,
    /// perf_event_open (needs the `perf` feature)
    Perf,
}

/// Table style selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum StyleChoice {
    Ascii,
    #[default]
    Rounded,
    Sharp,
    Markdown,
    Blank,
}

impl From<StyleChoice> for TableStyle {
    fn from(choice: StyleChoice) -> Self {
        match choice {
            StyleChoice::Ascii => TableStyle::Ascii,
            StyleChoice::Rounded => TableStyle::Rounded,
            StyleChoice::Sharp => TableStyle::Sharp,
            StyleChoice::Markdown => TableStyle::Markdown,
            StyleChoice::Blank => TableStyle::Blank,
        }
    }
}

/// Demo application for perfdump - per-region counter dumps for peer groups.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of thread peers
    #[arg(short, long, default_value = "4")]
    peers: usize,

    /// Artifact layout
    #[arg(short, long, value_enum, default_value = "csv")]
    format: FormatChoice,

    /// Counter backend
    #[arg(short, long, value_enum, default_value = "procstat")]
    backend: BackendChoice,

    /// Counters to resolve (comma separated)
    #[arg(short, long, default_value = "MINFLT,UTIME,STIME,VCSW,IVCSW")]
    events: String,

    /// Number of times the region loop runs
    #[arg(short, long, default_value = "3")]
    rounds: usize,

    /// Profile spans per region
    #[arg(long, default_value = "2")]
    spans: usize,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Artifact base name
    #[arg(short, long, default_value = "perf_dump")]
    name: String,

    /// Table style
    #[arg(short, long, value_enum, default_value = "rounded")]
    style: StyleChoice,

    /// Aggregate per region and metric
    #[arg(long)]
    summary: bool,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

impl Args {
    fn config(&self) -> SessionConfig {
        let events = self
            .events
            .split(',')
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        SessionConfig::new(EventSelector::Names(events))
            .with_dump_dir(&self.dir)
            .with_filename(&self.name)
            .with_format(match self.format {
                FormatChoice::Csv => OutputFormat::Csv,
                FormatChoice::Array => OutputFormat::Array,
            })
            .with_backend(match self.backend {
                BackendChoice::Procstat => BackendKind::ProcStat,
                BackendChoice::Perf => BackendKind::Perf,
            })
    }
}

/// Touches fresh memory: page faults and user time.
fn allocate(rank: usize) -> u64 {
    let buf = vec![rank as u8 + 1; (rank + 1) << 20];
    black_box(buf.iter().map(|&b| b as u64).sum::<u64>())
}

/// Yields the CPU: context switches.
fn exchange_messages(rank: usize) {
    for _ in 0..(rank + 1) * 16 {
        thread::yield_now();
    }
}

fn run_peer(peer: LocalPeer, config: SessionConfig, rounds: usize, spans: usize) -> Result<()> {
    let rank = peer.rank();
    let mut session = Session::new(config, peer);
    session.init()?;

    session.start_region(Some("setup"))?;
    session.start_profile()?;
    allocate(rank);
    session.end_profile()?;
    session.end_region()?;

    for _ in 0..rounds {
        session.start_region(Some("compute"))?;
        for _ in 0..spans {
            session.start_profile()?;
            allocate(rank);
            session.end_profile()?;
        }
        session.end_region()?;

        // Unnamed: region_<N>.
        session.start_region(None)?;
        session.start_profile()?;
        exchange_messages(rank);
        // end_region completes the open profile.
        session.end_region()?;
    }

    session.finalize()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log = LogConfig {
        level: args.log_level.clone(),
        ..LogConfig::default()
    };
    if let Err(e) = init_logging(&log) {
        eprintln!("logging disabled: {}", e);
    }

    let config = args.config();
    let group = LocalGroup::new(args.peers.max(1));
    let path = config.output_path(group.size());

    eprintln!(
        "Profiling {} peers x {} rounds into {}...",
        group.size(),
        args.rounds,
        path.display()
    );

    let handles: Vec<_> = group
        .peers()
        .into_iter()
        .map(|peer| {
            let config = config.clone();
            let (rounds, spans) = (args.rounds, args.spans);
            thread::spawn(move || run_peer(peer, config, rounds, spans))
        })
        .collect();

    let mut failed = false;
    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                eprintln!("rank {}: {}", rank, e);
                failed = true;
            }
            Err(_) => {
                eprintln!("rank {}: panicked", rank);
                failed = true;
            }
        }
    }
    if failed {
        return ExitCode::FAILURE;
    }

    let records = match args.format {
        FormatChoice::Csv => delimited::read_records(&path),
        FormatChoice::Array => array::read_records(&path),
    };
    match records {
        Ok(records) => {
            let table = RecordTable::new()
                .with_style(args.style.into())
                .with_title(path.display().to_string())
                .summary(args.summary);
            println!("{}", table.render(&records));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("reading {}: {}", path.display(), e);
            ExitCode::FAILURE
        }
    }
}
