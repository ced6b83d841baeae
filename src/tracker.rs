//! Live set of established TCP connections
//!
//! A [`Tracker`] combines the two client operations: it subscribes to
//! events first, then seeds its set from a snapshot, then applies every
//! event in arrival order. Events that raced the snapshot sit in the socket
//! until seeding is done, so a flow destroyed during the dump is still
//! removed afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::address::Address;
use crate::client::{Backend, ConnectionStream, NetlinkBackend, StopHandle};
use crate::config::ConntrackConfig;
use crate::connection::{ConnTCP, Connection, MsgType};
use crate::error::{ConntrackError, Result};
use crate::local::LocalAddressProvider;

/// Established TCP connections of this host, kept current from events
pub struct Tracker {
    conns: Arc<RwLock<HashSet<ConnTCP>>>,
    last_error: Arc<Mutex<Option<Arc<ConntrackError>>>>,
    stop: StopHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tracker {
    /// Track with default configuration and the host's interface addresses
    ///
    /// # Errors
    ///
    /// Whatever [`follow`](crate::client::follow) or
    /// [`snapshot`](crate::client::snapshot) report while starting.
    pub fn new() -> Result<Self> {
        Self::with_config(ConntrackConfig::default())
    }

    /// # Errors
    ///
    /// See [`Tracker::new`].
    pub fn with_config(config: ConntrackConfig) -> Result<Self> {
        let backend = NetlinkBackend::new(config);
        let local = backend.local.current_local_addresses();
        Self::start(&backend, local)
    }

    /// Track through any backend, resolving direction against `local`
    ///
    /// # Errors
    ///
    /// See [`Tracker::new`]. A failed snapshot stops the follow session it
    /// was meant to seed.
    pub fn start(backend: &impl Backend, local: HashSet<Address>) -> Result<Self> {
        let (stream, stop) = backend.follow()?;

        let seed = match backend.snapshot() {
            Ok(seed) => seed,
            Err(e) => {
                stop.stop();
                return Err(e);
            }
        };
        info!(established = seed.len(), "conntrack tracker seeded");

        let conns = Arc::new(RwLock::new(seed.into_iter().collect::<HashSet<_>>()));
        let last_error = Arc::new(Mutex::new(None));

        let worker = {
            let conns = Arc::clone(&conns);
            let last_error = Arc::clone(&last_error);
            thread::Builder::new()
                .name("conntrack-tracker".to_string())
                .spawn(move || track(stream, &conns, &last_error, &local))
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                stop.stop();
                return Err(ConntrackError::socket("spawning tracker worker failed", e));
            }
        };

        Ok(Self {
            conns,
            last_error,
            stop,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Copy of the current set, in no particular order
    pub fn connections(&self) -> Vec<ConnTCP> {
        self.conns.read().iter().copied().collect()
    }

    /// The error that ended tracking, if any
    ///
    /// Once set, [`connections`](Self::connections) no longer changes.
    pub fn last_error(&self) -> Option<Arc<ConntrackError>> {
        self.last_error.lock().clone()
    }

    /// Stop the follow session and wait for the worker
    ///
    /// Takes up to one receive timeout. Calling it again is a no-op.
    pub fn close(&self) {
        self.stop.stop();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("conntrack tracker worker panicked");
            }
            debug!("conntrack tracker closed");
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.close();
    }
}

fn track(
    stream: ConnectionStream,
    conns: &RwLock<HashSet<ConnTCP>>,
    last_error: &Mutex<Option<Arc<ConntrackError>>>,
    local: &HashSet<Address>,
) {
    for item in stream {
        match item {
            Ok(conn) => apply(&mut conns.write(), &conn, local),
            Err(ConntrackError::Overrun) => {
                warn!("events lost, tracked connections may be stale");
            }
            Err(e) => {
                error!(error = %e, "conntrack tracking stopped");
                *last_error.lock() = Some(Arc::new(e));
                return;
            }
        }
    }
}

/// Fold one event into the set
fn apply(conns: &mut HashSet<ConnTCP>, conn: &Connection, local: &HashSet<Address>) {
    let Some(tcp) = conn.conn_tcp(local) else {
        return;
    };
    match conn.msg_type {
        MsgType::New | MsgType::Update if conn.is_established() => {
            conns.insert(tcp);
        }
        _ => {
            conns.remove(&tcp);
        }
    }
}
