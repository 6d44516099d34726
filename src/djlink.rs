//! §4.8 — the DJ-Link engine surface the core consumes (spec §6).
//!
//! The DJ-Link engine itself — device discovery, packet decoding,
//! becoming a virtual participant on the Pro DJ Link bus — is an
//! external collaborator and explicitly out of scope (spec §1). This
//! module only expresses the interface the sync engine calls through,
//! as a trait, so the crate can be built and tested without a real
//! DJ-Link network. This mirrors the teacher's own pattern of wrapping
//! a third-party timeline source behind a small struct
//! (`AbletonLinkManager` in `ableton_link.rs`) and the retrieval
//! pack's precedent of injecting fake collaborators behind traits for
//! unit testing (`NtpSource`/`PtpNetwork` in the PTP controller
//! reference file).

use std::sync::Arc;

/// A snapshot of the DJ-Link virtual participant's playback position,
/// captured once and then queried repeatedly without redoing I/O.
pub trait PlaybackPosition: Clone + Send + Sync + 'static {
    /// Position within the current beat, in `[0, 1)`.
    fn beat_phase(&self) -> f64;
    /// Position within the current bar (4 beats), in `[0, 1)`.
    fn bar_phase(&self) -> f64;
    /// Duration of one beat at the current tempo, in milliseconds.
    fn beat_interval_ms(&self) -> f64;
    /// Duration of one bar at the current tempo, in milliseconds.
    fn bar_interval_ms(&self) -> f64;
}

/// A DJ-Link beat packet, as delivered to a [`MasterListener`].
#[derive(Debug, Clone, Copy)]
pub struct BeatEvent {
    /// Wall-clock timestamp of the beat, in nanoseconds.
    pub timestamp_ns: i64,
    /// Which beat within the current bar this is (1-4), if known.
    pub beat_within_bar: Option<i64>,
    /// Whether the device that sent this beat is the current tempo master.
    pub is_tempo_master: bool,
}

/// Callbacks the engine injects into the DJ-Link engine's master
/// listener registration (spec §4.6's "master listener").
#[cfg_attr(test, mockall::automock)]
pub trait MasterListener: Send + Sync {
    fn master_changed(&self);
    fn tempo_changed(&self, bpm: f64);
    fn new_beat(&self, beat: BeatEvent);
}

/// The subset of the DJ-Link engine's API the sync engine drives.
pub trait DjLinkEngine: Send + Sync {
    type Position: PlaybackPosition;

    fn is_running(&self) -> bool;
    fn is_sending_status(&self) -> bool;
    fn is_tempo_master(&self) -> bool;
    fn is_synced(&self) -> bool;

    fn set_synced(&self, synced: bool);
    fn set_tempo(&self, bpm: f64);
    fn set_playing(&self, playing: bool);
    fn become_tempo_master(&self);

    fn playback_position(&self) -> Self::Position;
    fn adjust_playback_position(&self, ms_delta: i64);

    fn add_master_listener(&self, listener: Arc<dyn MasterListener>);
    fn remove_master_listener(&self, listener: &Arc<dyn MasterListener>);

    fn master_tempo(&self) -> f64;

    /// Maps `x` to the shortest signed representative modulo 1, in
    /// `[-0.5, 0.5)`.
    fn closest_delta(&self, x: f64) -> f64 {
        let mut d = x - x.floor();
        if d >= 0.5 {
            d -= 1.0;
        }
        d
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, Default)]
    pub struct FakePosition {
        pub beat_phase: f64,
        pub bar_phase: f64,
        pub beat_interval_ms: f64,
        pub bar_interval_ms: f64,
    }

    impl PlaybackPosition for FakePosition {
        fn beat_phase(&self) -> f64 {
            self.beat_phase
        }
        fn bar_phase(&self) -> f64 {
            self.bar_phase
        }
        fn beat_interval_ms(&self) -> f64 {
            self.beat_interval_ms
        }
        fn bar_interval_ms(&self) -> f64 {
            self.bar_interval_ms
        }
    }

    /// A fully in-memory stand-in for the DJ-Link engine, used by
    /// unit tests across `tempo`, `align`, and `sync_mode`.
    #[derive(Default)]
    pub struct FakeDjLinkEngine {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        running: bool,
        sending_status: bool,
        tempo_master: bool,
        synced: bool,
        playing: bool,
        master_tempo: f64,
        position: FakePosition,
        adjustments: Vec<i64>,
        listener: Option<Arc<dyn MasterListener>>,
        become_master_calls: u32,
    }

    impl FakeDjLinkEngine {
        pub fn new() -> Self {
            Self {
                inner: Mutex::new(Inner {
                    running: true,
                    ..Default::default()
                }),
            }
        }

        pub fn set_running(&self, v: bool) {
            self.inner.lock().unwrap().running = v;
        }

        pub fn set_sending_status(&self, v: bool) {
            self.inner.lock().unwrap().sending_status = v;
        }

        pub fn set_is_tempo_master(&self, v: bool) {
            self.inner.lock().unwrap().tempo_master = v;
        }

        pub fn set_master_tempo(&self, bpm: f64) {
            self.inner.lock().unwrap().master_tempo = bpm;
        }

        pub fn set_position(&self, position: FakePosition) {
            self.inner.lock().unwrap().position = position;
        }

        pub fn is_playing(&self) -> bool {
            self.inner.lock().unwrap().playing
        }

        pub fn adjustments(&self) -> Vec<i64> {
            self.inner.lock().unwrap().adjustments.clone()
        }

        pub fn become_master_call_count(&self) -> u32 {
            self.inner.lock().unwrap().become_master_calls
        }

        pub fn fire_tempo_changed(&self, bpm: f64) {
            let listener = self.inner.lock().unwrap().listener.clone();
            if let Some(l) = listener {
                l.tempo_changed(bpm);
            }
        }

        pub fn fire_new_beat(&self, beat: BeatEvent) {
            let listener = self.inner.lock().unwrap().listener.clone();
            if let Some(l) = listener {
                l.new_beat(beat);
            }
        }

        pub fn has_master_listener(&self) -> bool {
            self.inner.lock().unwrap().listener.is_some()
        }
    }

    impl DjLinkEngine for FakeDjLinkEngine {
        type Position = FakePosition;

        fn is_running(&self) -> bool {
            self.inner.lock().unwrap().running
        }
        fn is_sending_status(&self) -> bool {
            self.inner.lock().unwrap().sending_status
        }
        fn is_tempo_master(&self) -> bool {
            self.inner.lock().unwrap().tempo_master
        }
        fn is_synced(&self) -> bool {
            self.inner.lock().unwrap().synced
        }

        fn set_synced(&self, synced: bool) {
            self.inner.lock().unwrap().synced = synced;
        }
        fn set_tempo(&self, bpm: f64) {
            self.inner.lock().unwrap().master_tempo = bpm;
        }
        fn set_playing(&self, playing: bool) {
            self.inner.lock().unwrap().playing = playing;
        }
        fn become_tempo_master(&self) {
            let mut inner = self.inner.lock().unwrap();
            inner.tempo_master = true;
            inner.become_master_calls += 1;
        }

        fn playback_position(&self) -> Self::Position {
            self.inner.lock().unwrap().position
        }
        fn adjust_playback_position(&self, ms_delta: i64) {
            self.inner.lock().unwrap().adjustments.push(ms_delta);
        }

        fn add_master_listener(&self, listener: Arc<dyn MasterListener>) {
            self.inner.lock().unwrap().listener = Some(listener);
        }
        fn remove_master_listener(&self, listener: &Arc<dyn MasterListener>) {
            let mut inner = self.inner.lock().unwrap();
            if let Some(current) = &inner.listener {
                if Arc::ptr_eq(current, listener) {
                    inner.listener = None;
                }
            }
        }

        fn master_tempo(&self) -> f64 {
            self.inner.lock().unwrap().master_tempo
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn closest_delta_wraps_to_shortest_representative() {
        let engine = FakeDjLinkEngine::new();
        assert!((engine.closest_delta(0.9) - (-0.1)).abs() < 1e-9);
        assert!((engine.closest_delta(0.1) - 0.1).abs() < 1e-9);
        assert!((engine.closest_delta(0.49) - 0.49).abs() < 1e-9);
    }

    #[test]
    fn fake_engine_forwards_tempo_changes_to_the_registered_listener() {
        let mut mock = MockMasterListener::new();
        mock.expect_tempo_changed()
            .times(1)
            .withf(|bpm| (*bpm - 128.0).abs() < 1e-9)
            .return_const(());

        let engine = FakeDjLinkEngine::new();
        engine.add_master_listener(Arc::new(mock));
        engine.fire_tempo_changed(128.0);
    }

    #[test]
    fn removing_the_master_listener_stops_further_delivery() {
        let mut mock = MockMasterListener::new();
        mock.expect_new_beat().times(0);

        let engine = FakeDjLinkEngine::new();
        let listener: Arc<dyn MasterListener> = Arc::new(mock);
        engine.add_master_listener(listener.clone());
        engine.remove_master_listener(&listener);
        engine.fire_new_beat(BeatEvent {
            timestamp_ns: 0,
            beat_within_bar: None,
            is_tempo_master: true,
        });
    }
}
