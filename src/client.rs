//! Snapshot and follow operations
//!
//! This is the glue between the socket and the decoder:
//!
//! - [`snapshot`]: send one dump request, read until `NLMSG_DONE`, keep the
//!   established TCP flows that have a local endpoint.
//! - [`follow`]: subscribe to conntrack events and hand every TCP record to
//!   the caller through a bounded channel, from a dedicated worker thread.
//!
//! # Stopping a Follow Session
//!
//! The worker blocks in `recv()`. [`StopHandle::stop`] raises a flag; the
//! socket's receive timeout wakes the worker, which sees the flag, closes
//! the socket and drops its end of the channel. The consumer just sees the
//! stream end. Every receive failure checks the flag first, so a
//! shutdown is never reported as an error.
//!
//! A worker waiting for a slow consumer to take a record waits on the stop
//! signal as well, and dropping the [`ConnectionStream`] stops the session,
//! so an abandoned stream never keeps its socket open.
//!
//! # Backpressure
//!
//! The channel holds `event_queue_depth` records (1 by default). A slow
//! consumer stalls the worker, and the kernel then drops events once the
//! socket buffer is full. That surfaces as one `Err(ConntrackError::Overrun)`
//! item on the stream; the stream continues afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, never, select};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::config::ConntrackConfig;
use crate::connection::{ConnTCP, Connection, MsgType};
use crate::error::{ConntrackError, Result};
use crate::local::{InterfaceAddresses, LocalAddressProvider};
use crate::netlink::message::{BufferStatus, build_dump_request, dispatch_buffer};
use crate::netlink::socket::{NetlinkSocket, Received, recv_buffer};
use crate::netlink::structures::NF_NETLINK_CONNTRACK_ALL;

/// Sequence number of dump requests
const DUMP_SEQ: u32 = 1;

// ============================================================================
// BACKEND ABSTRACTION
// ============================================================================

/// The two operations every conntrack backend offers
///
/// [`NetlinkBackend`] talks to the kernel directly; a backend wrapping the
/// `conntrack` command line tool would implement the same trait.
pub trait Backend {
    /// Currently established TCP connections with a local endpoint
    fn snapshot(&self) -> Result<Vec<ConnTCP>>;

    /// Live stream of TCP conntrack events
    fn follow(&self) -> Result<(ConnectionStream, StopHandle)>;
}

/// Backend using a `NETLINK_NETFILTER` socket
#[derive(Debug, Clone, Default)]
pub struct NetlinkBackend<P = InterfaceAddresses> {
    pub config: ConntrackConfig,
    pub local: P,
}

impl NetlinkBackend {
    pub fn new(config: ConntrackConfig) -> Self {
        Self {
            config,
            local: InterfaceAddresses,
        }
    }
}

impl<P: LocalAddressProvider> Backend for NetlinkBackend<P> {
    fn snapshot(&self) -> Result<Vec<ConnTCP>> {
        snapshot_with(&self.config, &self.local)
    }

    fn follow(&self) -> Result<(ConnectionStream, StopHandle)> {
        follow_with(&self.config)
    }
}

/// Anything that yields netlink datagrams
///
/// Implemented by [`NetlinkSocket`]; tests substitute scripted sources.
pub trait Datagrams {
    fn recv(&self, buffer: &mut [u8]) -> Result<Received>;
}

impl Datagrams for NetlinkSocket {
    fn recv(&self, buffer: &mut [u8]) -> Result<Received> {
        NetlinkSocket::recv(self, buffer)
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Established TCP connections, using default configuration
///
/// # Errors
///
/// Transport errors opening or using the socket, `Timeout` if the dump does
/// not complete within the receive timeout, framing errors from the kernel.
pub fn snapshot() -> Result<Vec<ConnTCP>> {
    snapshot_with(&ConntrackConfig::default(), &InterfaceAddresses)
}

/// Established TCP connections, with explicit configuration and local set
///
/// # Errors
///
/// See [`snapshot`].
pub fn snapshot_with(
    config: &ConntrackConfig,
    local: &dyn LocalAddressProvider,
) -> Result<Vec<ConnTCP>> {
    let socket = NetlinkSocket::open(0, config)?;
    socket.send(&build_dump_request(DUMP_SEQ))?;

    let local = local.current_local_addresses();
    let conns = collect_established(&socket, &local)?;
    debug!(count = conns.len(), "conntrack snapshot complete");
    Ok(conns)
}

/// Read a dump and keep what a snapshot reports
pub(crate) fn collect_established(
    source: &impl Datagrams,
    local: &HashSet<Address>,
) -> Result<Vec<ConnTCP>> {
    let mut conns = Vec::new();
    read_dump(source, |conn| {
        // Dump entries carry no create flags, so they classify as updates
        if conn.msg_type != MsgType::Update || !conn.is_established() {
            return;
        }
        if let Some(tcp) = conn.conn_tcp(local) {
            conns.push(tcp);
        }
    })?;
    Ok(conns)
}

/// Receive datagrams until `NLMSG_DONE`, dispatching each message
pub(crate) fn read_dump(
    source: &impl Datagrams,
    mut on_conn: impl FnMut(Connection),
) -> Result<()> {
    let mut buffer = recv_buffer();
    loop {
        match source.recv(&mut buffer)? {
            Received::TimedOut => return Err(ConntrackError::Timeout),
            Received::Data(len) => {
                if dispatch_buffer(&buffer[..len], &mut on_conn)? == BufferStatus::Done {
                    return Ok(());
                }
            }
        }
    }
}

// ============================================================================
// FOLLOW
// ============================================================================

/// Stops a follow session
///
/// Cheap to clone; all clones control the same session. Stopping twice is
/// harmless. Dropping the handle does *not* stop the session, dropping the
/// [`ConnectionStream`] does.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    // Dropping the only sender disconnects `signal`, which wakes a worker
    // blocked handing a record to the consumer
    signal_tx: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Default for StopHandle {
    fn default() -> Self {
        let (signal_tx, signal) = bounded(0);
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            signal_tx: Arc::new(Mutex::new(Some(signal_tx))),
            signal,
        }
    }
}

impl StopHandle {
    /// Ask the worker to release the socket and end the stream
    ///
    /// Returns immediately. A worker waiting on the consumer exits at once,
    /// one blocked in `recv()` within one receive timeout.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("conntrack follow session stopping");
        }
        self.signal_tx.lock().take();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Records from a follow session, in kernel delivery order
///
/// Yields `Ok(Connection)` for every TCP event. `Err(Overrun)` items report
/// dropped events and are followed by more records. Any other `Err` is the
/// last item. The iterator ends after a stop or a fatal error.
///
/// Dropping the stream stops the session.
#[derive(Debug)]
pub struct ConnectionStream {
    rx: Receiver<Result<Connection>>,
    stop: StopHandle,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionStream {
    /// Stop the session and wait for the worker thread to exit
    ///
    /// Records still queued are discarded. Returns within one receive
    /// timeout.
    pub fn join(mut self) {
        self.stop.stop();
        // Release our end first so a worker blocked on send sees it gone
        self.rx = never();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("conntrack follow worker panicked");
            }
        }
    }
}

impl Iterator for ConnectionStream {
    type Item = Result<Connection>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for ConnectionStream {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

/// Live conntrack events, using default configuration
///
/// # Errors
///
/// Transport errors opening or binding the socket (subscribing needs
/// `CAP_NET_ADMIN`). Errors after that arrive on the stream.
pub fn follow() -> Result<(ConnectionStream, StopHandle)> {
    follow_with(&ConntrackConfig::default())
}

/// Live conntrack events with explicit configuration
///
/// # Errors
///
/// See [`follow`].
pub fn follow_with(config: &ConntrackConfig) -> Result<(ConnectionStream, StopHandle)> {
    let socket = NetlinkSocket::open(NF_NETLINK_CONNTRACK_ALL, config)?;
    info!("conntrack follow session started");
    spawn_follower(socket, config.queue_depth())
}

/// Start the worker thread that owns `source`
pub(crate) fn spawn_follower<S>(source: S, depth: usize) -> Result<(ConnectionStream, StopHandle)>
where
    S: Datagrams + Send + 'static,
{
    let (tx, rx) = bounded(depth);
    let stop = StopHandle::default();
    let worker_stop = stop.clone();

    let worker = thread::Builder::new()
        .name("conntrack-follow".to_string())
        .spawn(move || {
            follow_loop(&source, &worker_stop, &tx);
            debug!("conntrack follow worker exiting");
            // source (the socket) and tx drop here, ending the stream
        })
        .map_err(|e| ConntrackError::socket("spawning follow worker failed", e))?;

    Ok((
        ConnectionStream {
            rx,
            stop: stop.clone(),
            worker: Some(worker),
        },
        stop,
    ))
}

/// Hand one item to the consumer; false once the session is over
fn forward(tx: &Sender<Result<Connection>>, stop: &StopHandle, item: Result<Connection>) -> bool {
    if stop.is_stopped() {
        return false;
    }
    select! {
        send(tx, item) -> sent => sent.is_ok(),
        recv(stop.signal) -> _ => false,
    }
}

/// Receive, decode and forward until stopped, failed or abandoned
fn follow_loop(source: &impl Datagrams, stop: &StopHandle, tx: &Sender<Result<Connection>>) {
    let mut buffer = recv_buffer();

    while !stop.is_stopped() {
        let received = source.recv(&mut buffer);

        // === Intentional stop wins over whatever recv reported ===
        if stop.is_stopped() {
            break;
        }

        let len = match received {
            Ok(Received::Data(len)) => len,
            Ok(Received::TimedOut) => continue,
            Err(ConntrackError::Overrun) => {
                warn!("kernel dropped conntrack events, consumer too slow");
                if !forward(tx, stop, Err(ConntrackError::Overrun)) {
                    break;
                }
                continue;
            }
            Err(e) => {
                forward(tx, stop, Err(e));
                break;
            }
        };

        let mut ended = false;
        let status = dispatch_buffer(&buffer[..len], |conn| {
            if !ended && !forward(tx, stop, Ok(conn)) {
                ended = true;
            }
        });
        if ended {
            debug!("conntrack stream stopped or dropped by consumer");
            break;
        }
        if let Err(e) = status {
            forward(tx, stop, Err(e));
            break;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
