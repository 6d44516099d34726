//! The public engine API (spec §6): introspection, configuration,
//! lifecycle, sync control, tempo control, beat control, and listener
//! subscriptions, all wired on top of C1-C8.
//!
//! `Engine<D>` is a thin, `Clone`-able handle around an `Arc`-shared
//! inner record — the same "cheap handle over shared state" shape the
//! teacher uses for `AbletonLinkManager`.

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::align;
use crate::clock;
use crate::connection::{self, ConnectionContext};
use crate::djlink::{BeatEvent, DjLinkEngine, MasterListener};
use crate::error::{EngineError, EngineResult};
use crate::listeners::Listeners;
use crate::protocol::{Command, Event, QUANTUM};
use crate::state::{send_line, ClientState, ClientStateView, PhaseProbe, SharedState, SyncMode};
use crate::sync_mode;
use crate::tempo;

type StatusListener = dyn Fn(&ClientStateView) + Send + Sync;
type VersionListener = dyn Fn(&str) + Send + Sync;
type DisconnectionListener = dyn Fn(bool) + Send + Sync;

pub struct Engine<D: DjLinkEngine> {
    inner: Arc<EngineInner<D>>,
}

impl<D: DjLinkEngine> Clone for Engine<D> {
    fn clone(&self) -> Self {
        Engine { inner: self.inner.clone() }
    }
}

struct EngineInner<D: DjLinkEngine> {
    dj_link: D,
    shared: Arc<SharedState<D::Position>>,
    listeners: Arc<Listeners>,
    master_listener: Mutex<Option<Arc<MasterListenerAdapter<D>>>>,
}

impl<D: DjLinkEngine> Engine<D> {
    pub fn new(dj_link: D, port: u16, latency_ms: i64, bar_align: bool) -> Self {
        let mut state = ClientState::new(port, latency_ms);
        state.bar_align = bar_align;
        Engine {
            inner: Arc::new(EngineInner {
                dj_link,
                shared: Arc::new(SharedState::new(state)),
                listeners: Arc::new(Listeners::new()),
                master_listener: Mutex::new(None),
            }),
        }
    }

    // ---- Introspection -------------------------------------------------

    pub fn state(&self) -> ClientStateView {
        ClientStateView::from(&*self.inner.shared.load())
    }

    pub fn is_active(&self) -> bool {
        self.inner.shared.load().is_connected()
    }

    pub fn is_sync_enabled(&self) -> bool {
        self.inner.shared.load().sync_mode != SyncMode::Off
    }

    pub fn is_valid_tempo(&self, bpm: f64) -> bool {
        tempo::is_valid_tempo(bpm)
    }

    // ---- Configuration ---------------------------------------------------

    pub fn set_carabiner_port(&self, port: u16) -> EngineResult<()> {
        if self.inner.shared.load().is_connected() {
            return Err(EngineError::InvalidState(
                "cannot change the Link daemon port while connected".to_string(),
            ));
        }
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.port = port;
            next
        });
        Ok(())
    }

    pub fn set_latency(&self, latency_ms: i64) {
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.latency_ms = latency_ms;
            next
        });
    }

    pub fn set_sync_bars(&self, bar_align: bool) {
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.bar_align = bar_align;
            next
        });
    }

    // ---- Lifecycle --------------------------------------------------------

    pub fn connect(&self, failure_fn: impl Fn(String) + Send + Sync + 'static) -> bool {
        connection::connect(self.connection_context(), Arc::new(failure_fn))
    }

    pub fn disconnect(&self) {
        connection::disconnect(&self.inner.shared);
    }

    fn connection_context(&self) -> Arc<ConnectionContext<D::Position>> {
        let engine = self.clone();
        Arc::new(ConnectionContext {
            shared: self.inner.shared.clone(),
            listeners: self.inner.listeners.clone(),
            dispatch: Arc::new(move |event| engine.handle_event(event)),
        })
    }

    // ---- Sync control -------------------------------------------------

    pub fn set_sync_mode(&self, mode: SyncMode) -> EngineResult<()> {
        let current = self.inner.shared.load().sync_mode;
        if current == mode {
            return Ok(());
        }
        sync_mode::validate_transition(
            mode,
            self.inner.dj_link.is_running(),
            self.inner.dj_link.is_sending_status(),
        )?;

        if mode == SyncMode::Off {
            // Commit the mode before freeing either direction: both free
            // paths read `sync_mode` to decide whether re-tying is still
            // warranted, and that check must see `Off`, not the mode
            // being left, or freeing one direction re-ties the other.
            self.set_mode(mode);
            self.free_ableton_from_pioneer();
            self.free_pioneer_from_ableton();
            self.notify_status();
            return Ok(());
        }

        let entering_from_off = current == SyncMode::Off;
        if entering_from_off {
            self.tie_ableton_to_pioneer();
        }

        self.set_mode(mode);

        if entering_from_off {
            let synced = self.inner.dj_link.is_synced();
            self.sync_link(synced);
        }
        if mode == SyncMode::Full && self.inner.dj_link.is_tempo_master() {
            self.tie_pioneer_to_ableton();
        }

        self.notify_status();
        Ok(())
    }

    fn set_mode(&self, mode: SyncMode) {
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.sync_mode = mode;
            next
        });
    }

    pub fn sync_link(&self, flag: bool) {
        self.inner.dj_link.set_synced(flag);
        let mode = self.inner.shared.load().sync_mode;
        if matches!(mode, SyncMode::Passive | SyncMode::Full) && !self.inner.dj_link.is_tempo_master() {
            if flag {
                self.tie_ableton_to_pioneer();
            } else {
                self.free_ableton_from_pioneer();
            }
        }
    }

    pub fn link_master(&self, flag: bool) {
        if self.inner.shared.load().sync_mode == SyncMode::Full {
            if flag {
                self.tie_pioneer_to_ableton();
            } else {
                self.free_pioneer_from_ableton();
            }
        }
    }

    fn subscribe_master_listener(&self) {
        let mut guard = self.inner.master_listener.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let adapter = Arc::new(MasterListenerAdapter { engine: Arc::downgrade(&self.inner) });
        self.inner
            .dj_link
            .add_master_listener(adapter.clone() as Arc<dyn MasterListener>);
        *guard = Some(adapter);
    }

    fn unsubscribe_master_listener(&self) {
        let mut guard = self.inner.master_listener.lock().unwrap();
        if let Some(adapter) = guard.take() {
            self.inner
                .dj_link
                .remove_master_listener(&(adapter as Arc<dyn MasterListener>));
        }
    }

    fn tie_ableton_to_pioneer(&self) {
        self.subscribe_master_listener();
        let master_tempo = self.inner.dj_link.master_tempo();
        if tempo::is_valid_tempo(master_tempo) {
            let _ = self.lock_tempo(master_tempo);
        } else {
            self.unlock_tempo();
        }
    }

    fn free_ableton_from_pioneer(&self) {
        self.unsubscribe_master_listener();
        self.unlock_tempo();
    }

    fn tie_pioneer_to_ableton(&self) {
        self.free_ableton_from_pioneer();
        self.align_pioneer_phase_to_ableton();
        let link_bpm = self.inner.shared.load().link_bpm.unwrap_or(0.0);
        self.inner.dj_link.set_tempo(link_bpm);
        self.inner.dj_link.become_tempo_master();
        self.inner.dj_link.set_playing(true);

        let shared = self.inner.shared.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(1));
            if let Some(conn) = shared.load().connection.clone() {
                if let Err(e) = send_line(&conn.socket, &Command::Status.to_string()) {
                    log::warn!("link daemon: handoff status re-probe failed: {e}");
                }
            }
        });
    }

    fn free_pioneer_from_ableton(&self) {
        self.inner.dj_link.set_playing(false);
        let mode = self.inner.shared.load().sync_mode;
        if matches!(mode, SyncMode::Passive | SyncMode::Full) && self.inner.dj_link.is_synced() {
            self.tie_ableton_to_pioneer();
        }
    }

    // ---- Tempo control --------------------------------------------------

    pub fn lock_tempo(&self, bpm: f64) -> EngineResult<()> {
        if !tempo::is_valid_tempo(bpm) {
            return Err(EngineError::InvalidArgument(format!(
                "tempo {bpm} is outside the valid range ({}, {})",
                tempo::MIN_BPM,
                tempo::MAX_BPM
            )));
        }
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.target_bpm = Some(bpm);
            next
        });
        self.notify_status();
        self.run_tempo_controller();
        Ok(())
    }

    pub fn unlock_tempo(&self) {
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.target_bpm = None;
            next
        });
        self.notify_status();
    }

    pub fn set_link_tempo(&self, bpm: f64) -> EngineResult<()> {
        let link_bpm = self.inner.shared.load().link_bpm;
        if let Some(cmd) = tempo::set_link_tempo_command(bpm, link_bpm) {
            self.send_command(&cmd)?;
        }
        Ok(())
    }

    fn run_tempo_controller(&self) {
        let state = self.inner.shared.load();
        if let Some(cmd) = tempo::controller_command(
            &state,
            self.inner.dj_link.is_tempo_master(),
            self.inner.dj_link.master_tempo(),
        ) {
            let _ = self.send_command(&cmd);
        }
    }

    // ---- Beat control -----------------------------------------------------

    pub fn beat_at_time(&self, time_us: i64, beat_number: Option<i64>) {
        let latency_ms = self.inner.shared.load().latency_ms;
        let (adjusted, probe) = align::beat_probe(time_us, latency_ms, beat_number);
        self.inner.shared.update(|s| {
            let mut next = s.clone();
            next.beat_probe = Some(probe);
            next
        });
        let _ = self.send_command(&Command::BeatAtTime { time_us: adjusted, quantum: QUANTUM });
    }

    fn align_pioneer_phase_to_ableton(&self) {
        let now_us = clock::now_us();
        let latency_ms = self.inner.shared.load().latency_ms;
        let snapshot = self.inner.dj_link.playback_position();
        let (adjusted, snapshot) = align::phase_probe(now_us, latency_ms, &snapshot);
        self.inner.shared.update(move |s| {
            let mut next = s.clone();
            next.phase_probe = Some(PhaseProbe { time_us: adjusted, snapshot: snapshot.clone() });
            next
        });
        let _ = self.send_command(&Command::PhaseAtTime { time_us: adjusted, quantum: QUANTUM });
    }

    pub fn start_transport(&self, time_us: Option<i64>) {
        let time_us = time_us.unwrap_or_else(clock::now_us);
        let _ = self.send_command(&Command::StartPlaying { time_us });
    }

    pub fn stop_transport(&self, time_us: Option<i64>) {
        let time_us = time_us.unwrap_or_else(clock::now_us);
        let _ = self.send_command(&Command::StopPlaying { time_us });
    }

    // ---- Subscriptions -----------------------------------------------------

    pub fn add_status_listener(&self, listener: Arc<StatusListener>) {
        self.inner.listeners.add_status_listener(listener);
    }
    pub fn remove_status_listener(&self, listener: &Arc<StatusListener>) {
        self.inner.listeners.remove_status_listener(listener);
    }
    pub fn add_version_listener(&self, listener: Arc<VersionListener>) {
        self.inner.listeners.add_version_listener(listener);
    }
    pub fn remove_version_listener(&self, listener: &Arc<VersionListener>) {
        self.inner.listeners.remove_version_listener(listener);
    }
    pub fn add_disconnection_listener(&self, listener: Arc<DisconnectionListener>) {
        self.inner.listeners.add_disconnection_listener(listener);
    }
    pub fn remove_disconnection_listener(&self, listener: &Arc<DisconnectionListener>) {
        self.inner.listeners.remove_disconnection_listener(listener);
    }

    // ---- Internals --------------------------------------------------------

    fn send_command(&self, cmd: &Command) -> io::Result<()> {
        match self.inner.shared.load().connection.clone() {
            Some(handle) => send_line(&handle.socket, &cmd.to_string()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "not connected to link daemon")),
        }
    }

    fn notify_status(&self) {
        let view = ClientStateView::from(&*self.inner.shared.load());
        self.inner.listeners.notify_status(&view);
    }

    /// The read loop's event dispatch target (§4.3/§4.4/§4.5).
    fn handle_event(&self, event: Event) {
        match event {
            Event::Status { bpm, peers } => {
                self.inner.shared.update(|s| {
                    let mut next = s.clone();
                    next.link_bpm = Some(bpm);
                    next.link_peers = Some(peers);
                    next
                });
                self.run_tempo_controller();
                self.notify_status();
            }
            Event::BeatAtTime { beat, when } => {
                let probe = self.inner.shared.load().beat_probe;
                let Some(probe) = probe else { return };
                if let Some(cmd) = align::beat_response_command(probe, beat, when) {
                    let _ = self.send_command(&cmd);
                } else if probe.time_us != when {
                    log::warn!("dropping stale beat-at-time response for when={when}");
                }
            }
            Event::PhaseAtTime { phase, when } => {
                let (probe, bar_align) = {
                    let state = self.inner.shared.load();
                    (state.phase_probe.clone(), state.bar_align)
                };
                let Some(probe) = probe else { return };
                if probe.time_us != when {
                    log::warn!("dropping stale phase-at-time response for when={when}");
                    return;
                }
                let live_beat_phase = self.inner.dj_link.playback_position().beat_phase();
                let dj_link = &self.inner.dj_link;
                if let Some(alignment) = align::phase_response(
                    probe.time_us,
                    &probe.snapshot,
                    bar_align,
                    phase,
                    when,
                    live_beat_phase,
                    |x| dj_link.closest_delta(x),
                ) {
                    if alignment.apply && alignment.ms_delta != 0 {
                        self.inner.dj_link.adjust_playback_position(alignment.ms_delta);
                    }
                }
            }
            Event::Version(version) => {
                self.inner
                    .listeners
                    .notify_version(&format!("link daemon reports version {version}"));
            }
            Event::Unsupported(what) => {
                log::warn!("link daemon: '{what}' is unsupported");
                self.inner
                    .listeners
                    .notify_version(&format!("link daemon does not support '{what}'"));
            }
        }
    }
}

/// Adapter satisfying the DJ-Link engine's [`MasterListener`]
/// interface by forwarding into the engine's own public API (spec §9:
/// "model it as an interface implemented by a small adapter"). Holds
/// only a `Weak` reference back to the engine: the DJ-Link engine
/// itself, reached through `EngineInner::dj_link`, is the thing that
/// stores this adapter's `Arc`, so a strong back-reference would be a
/// cycle.
struct MasterListenerAdapter<D: DjLinkEngine> {
    engine: Weak<EngineInner<D>>,
}

impl<D: DjLinkEngine> MasterListener for MasterListenerAdapter<D> {
    fn master_changed(&self) {
        // master-device-change carries no action (spec §4.6).
    }

    fn tempo_changed(&self, bpm: f64) {
        let Some(inner) = self.engine.upgrade() else { return };
        let engine = Engine { inner };
        if tempo::is_valid_tempo(bpm) {
            let _ = engine.lock_tempo(bpm);
        } else {
            engine.unlock_tempo();
        }
    }

    fn new_beat(&self, beat: BeatEvent) {
        let Some(inner) = self.engine.upgrade() else { return };
        let engine = Engine { inner };
        if !engine.inner.dj_link.is_running() || !beat.is_tempo_master {
            return;
        }
        let bar_align = engine.inner.shared.load().bar_align;
        let beat_number = if bar_align { beat.beat_within_bar } else { None };
        let time_us = beat.timestamp_ns / 1_000;
        engine.beat_at_time(time_us, beat_number);
    }
}
