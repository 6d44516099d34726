//! C1 — the single process-wide shared record (`ClientState`) and the
//! CAS discipline that guards it.
//!
//! `ClientState` is never mutated in place. Every writer goes through
//! [`SharedState::update`], which wraps `ArcSwap::rcu` — load the
//! current snapshot, derive a new one, and retry the swap if another
//! writer raced us. This is the same "atom" discipline the spec asks
//! for in §5 and §9, and the concrete mechanism is grounded in the
//! one file in the retrieval pack that reaches for `arc_swap` for an
//! equivalent "shared mutable atom" (a transport manager's tempo map).

use std::io;
use std::net::TcpStream;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Sync-mode the engine is operating in. See C7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum SyncMode {
    #[default]
    Off,
    Passive,
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Off => write!(f, "off"),
            SyncMode::Passive => write!(f, "passive"),
            SyncMode::Full => write!(f, "full"),
        }
    }
}

/// A live connection to the Link daemon: the socket plus the run id
/// stamped on the read loop that owns it.
///
/// Invariant 1 (spec §3): `connection` present iff `run_id <= last`
/// and a live read-loop thread carries that `run_id`.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub socket: Arc<TcpStream>,
    pub run_id: u64,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Outstanding `beat-at-time` correlator.
#[derive(Debug, Clone, Copy)]
pub struct BeatProbe {
    pub time_us: i64,
    pub beat_number: Option<i64>,
}

/// A DJ-Link playback-position snapshot captured at probe-send time,
/// paired with a phase probe's `when`. The concrete snapshot type is
/// the host-supplied `PlaybackPosition` from the `DjLinkEngine` trait
/// (see `src/djlink.rs`); we only need it to be `Clone` here.
#[derive(Debug, Clone, Copy)]
pub struct PhaseProbe<P> {
    pub time_us: i64,
    pub snapshot: P,
}

/// The single coherent process-wide record. See spec §3.
#[derive(Clone)]
pub struct ClientState<P> {
    pub port: u16,
    pub latency_ms: i64,
    pub sync_mode: SyncMode,
    pub bar_align: bool,
    pub connection: Option<ConnectionHandle>,
    pub last: u64,
    pub link_bpm: Option<f64>,
    pub link_peers: Option<u32>,
    pub target_bpm: Option<f64>,
    pub beat_probe: Option<BeatProbe>,
    pub phase_probe: Option<PhaseProbe<P>>,
}

impl<P: Clone> ClientState<P> {
    pub fn new(port: u16, latency_ms: i64) -> Self {
        Self {
            port,
            latency_ms,
            sync_mode: SyncMode::Off,
            bar_align: false,
            connection: None,
            last: 0,
            link_bpm: None,
            link_peers: None,
            target_bpm: None,
            beat_probe: None,
            phase_probe: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Public subset of [`ClientState`] exposed to callers and status
/// listeners (spec §4.7, §6). Deliberately excludes probe correlators
/// and the raw socket handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientStateView {
    pub port: u16,
    pub latency_ms: i64,
    pub sync_mode: SyncMode,
    pub bar_align: bool,
    pub running: bool,
    pub link_bpm: Option<f64>,
    pub link_peers: Option<u32>,
    pub target_bpm: Option<f64>,
}

impl<P: Clone> From<&ClientState<P>> for ClientStateView {
    fn from(state: &ClientState<P>) -> Self {
        Self {
            port: state.port,
            latency_ms: state.latency_ms,
            sync_mode: state.sync_mode,
            bar_align: state.bar_align,
            running: state.is_connected(),
            link_bpm: state.link_bpm,
            link_peers: state.link_peers,
            target_bpm: state.target_bpm,
        }
    }
}

/// CAS-guarded holder for [`ClientState`]. All mutation goes through
/// [`SharedState::update`]; readers call [`SharedState::load`] and get
/// a consistent, lock-free snapshot.
pub struct SharedState<P> {
    inner: ArcSwap<ClientState<P>>,
}

impl<P: Clone + Send + Sync + 'static> SharedState<P> {
    pub fn new(initial: ClientState<P>) -> Self {
        Self {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    /// A consistent, immutable snapshot of the current state.
    pub fn load(&self) -> Arc<ClientState<P>> {
        self.inner.load_full()
    }

    /// Read-copy-update: `f` receives the current snapshot and
    /// returns the next one. Retried internally by `ArcSwap::rcu` if
    /// another writer races us, so `f` must be side-effect free
    /// besides deriving the new state. To learn the `run_id` a
    /// `connect` produced, read it back off the returned snapshot's
    /// `connection` field rather than computing it out-of-band.
    pub fn update(&self, f: impl Fn(&ClientState<P>) -> ClientState<P>) -> Arc<ClientState<P>> {
        self.inner.rcu(|current| f(current))
    }
}

/// Write a single line (LF-terminated) to the daemon socket using the
/// socket reference captured from the current connection. Per §5,
/// there is no write lock: the caller takes whatever `Arc<TcpStream>`
/// is current and if the peer already tore it down, the write simply
/// fails and is surfaced as an I/O error.
pub fn send_line(socket: &TcpStream, line: &str) -> io::Result<()> {
    use std::io::Write;
    let mut framed = String::with_capacity(line.len() + 1);
    framed.push_str(line);
    framed.push('\n');
    (&*socket).write_all(framed.as_bytes())?;
    (&*socket).flush()
}
