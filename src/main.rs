// ============================================================================
// conntrack - command line entry point
// ============================================================================
//
// Usage: conntrack [snapshot|follow|track]
//
// - snapshot (default): print established TCP connections as one JSON array
// - follow: print every TCP conntrack event as one JSON object per line
// - track: print the tracked established set once per second
//
// JSON goes to stdout, logs go to stderr (RUST_LOG, default "info").
// Socket parameters come from CONNTRACK_* environment variables, see
// `ConntrackConfig::from_env`.
//
// follow and track run until Ctrl+C.
// ============================================================================

use core::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::env;
use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use conntrack::{ConntrackConfig, ConntrackError, InterfaceAddresses, Tracker};

const TRACK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum Mode {
    Snapshot,
    Follow,
    Track,
}

impl Mode {
    fn parse(arg: Option<&str>) -> Option<Self> {
        match arg {
            None | Some("snapshot") => Some(Self::Snapshot),
            Some("follow") => Some(Self::Follow),
            Some("track") => Some(Self::Track),
            Some(_) => None,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(mode) = Mode::parse(args.get(1).map(String::as_str)) else {
        eprintln!("usage: conntrack [snapshot|follow|track]");
        return ExitCode::from(2);
    };

    let config = ConntrackConfig::from_env();
    let result = match mode {
        Mode::Snapshot => run_snapshot(&config).map_err(Arc::new),
        Mode::Follow => run_follow(&config).map_err(Arc::new),
        Mode::Track => run_track(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "conntrack failed");
            if e.is_permission_denied() {
                eprintln!("hint: reading conntrack needs CAP_NET_ADMIN (try running as root)");
            }
            ExitCode::FAILURE
        }
    }
}

fn run_snapshot(config: &ConntrackConfig) -> Result<(), ConntrackError> {
    let mut conns = conntrack::snapshot_with(config, &InterfaceAddresses)?;
    conns.sort();
    info!(count = conns.len(), "established TCP connections");
    print_json(&conns);
    Ok(())
}

fn run_follow(config: &ConntrackConfig) -> Result<(), ConntrackError> {
    let (events, stop) = conntrack::follow_with(config)?;

    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.stop()).expect("Error setting Ctrl-C handler");

    for event in events {
        match event {
            Ok(conn) => {
                if !print_json(&conn) {
                    // stdout closed (e.g. piped into head)
                    stop.stop();
                    break;
                }
            }
            Err(ConntrackError::Overrun) => warn!("kernel dropped events, output is incomplete"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn run_track(config: ConntrackConfig) -> Result<(), Arc<ConntrackError>> {
    let tracker = Tracker::with_config(config).map_err(Arc::new)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || r.store(false, AtomicOrdering::SeqCst))
        .expect("Error setting Ctrl-C handler");

    while running.load(AtomicOrdering::SeqCst) {
        if tracker.last_error().is_some() {
            break;
        }
        let mut conns = tracker.connections();
        conns.sort();
        if !print_json(&conns) {
            break;
        }
        std::thread::sleep(TRACK_INTERVAL);
    }

    tracker.close();
    info!("shutting down");
    tracker.last_error().map_or(Ok(()), Err)
}

/// One JSON document per line on stdout; false once stdout is gone
fn print_json<T: Serialize>(value: &T) -> bool {
    let line = match serde_json::to_string(value) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "cannot serialize record");
            return true;
        }
    };
    let mut out = io::stdout().lock();
    writeln!(out, "{line}").and_then(|()| out.flush()).is_ok()
}
