//! httap command line: capture, print transactions, stop on interrupt.

use httap_core::config::parse_duration;
use httap_core::{
    load_config, Backend, CancelToken, CaptureConfig, CaptureEvent, Capturer, Transaction,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Parser;
use crossbeam_channel::bounded;
use log::{error, warn};

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::SystemTime;

#[derive(Parser, Debug)]
#[clap(name = "httap", version, about = "Passive HTTP/1.x capture")]
struct Args {
    /// Device name; `any` captures on all interfaces
    #[clap(short = 'i', long = "interface")]
    interface: Option<String>,
    /// BPF filter expression
    #[clap(short = 'f', long = "filter")]
    filter: Option<String>,
    /// Maximum captured bytes per packet
    #[clap(long)]
    snaplen: Option<i32>,
    /// Put the interface(s) in promiscuous mode
    #[clap(long)]
    promisc: bool,
    /// Capture driver read timeout, e.g. 500ms or 1s; 0 blocks forever
    #[clap(long)]
    timeout: Option<String>,
    /// Use the raw-socket backend instead of libpcap
    #[clap(long)]
    portable: bool,
    /// Load settings from a TOML file; explicit flags override it
    #[clap(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("{:#}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => CaptureConfig::default(),
    };
    if let Some(interface) = args.interface {
        config.device = interface;
    }
    if let Some(filter) = args.filter {
        config.filter = filter;
    }
    if let Some(snaplen) = args.snaplen {
        config.snaplen = snaplen;
    }
    if args.promisc {
        config.promisc = true;
    }
    if let Some(timeout) = &args.timeout {
        config.read_timeout = parse_duration(timeout)?;
    }

    let backend = if args.portable {
        portable_backend()?
    } else {
        Backend::Native
    };

    let mut capturer = Capturer::open(&config, backend)?;
    capturer.set_filter(&config.filter)?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || interrupt.cancel()).context("install signal handler")?;

    // Rendezvous channel: a slow reader backpressures the whole pipeline.
    let (tx, rx) = bounded(0);
    let worker = thread::spawn(move || capturer.capture(cancel, tx));

    // Runs until every producer is gone: the ingest loops stop on
    // cancellation, then the parser threads drain out.
    for event in rx.iter() {
        match event {
            CaptureEvent::Transaction(txn) => println!("{}", format_transaction(&txn)),
            CaptureEvent::Error(err) => warn!("capture: {}", err),
        }
    }

    if worker.join().is_err() {
        anyhow::bail!("capture worker panicked");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn portable_backend() -> Result<Backend> {
    Ok(Backend::Portable)
}

#[cfg(not(target_os = "linux"))]
fn portable_backend() -> Result<Backend> {
    anyhow::bail!("the portable backend is linux-only")
}

fn fmt_time(time: SystemTime) -> String {
    DateTime::<Local>::from(time)
        .format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
}

fn format_transaction(txn: &Transaction) -> String {
    let request = match &txn.request {
        Some(req) => format!(
            "{:?} requestBody={:?}",
            req.request_line(),
            String::from_utf8_lossy(&req.body)
        ),
        None => "-".to_string(),
    };
    format!(
        "reqTime={} respTime={} client={} server={} request={} response={:?} responseBody={:?}",
        txn.request_time
            .map(fmt_time)
            .unwrap_or_else(|| "-".to_string()),
        fmt_time(txn.response_time),
        txn.client,
        txn.server,
        request,
        txn.response.status_line(),
        String::from_utf8_lossy(&txn.response.body),
    )
}
