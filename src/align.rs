//! C6 — on each beat probe response and each phase probe response,
//! decides whether and how to nudge one timeline to match the other.
//!
//! As with `tempo.rs`, these are pure decision functions over probe
//! state and response fields; `Engine` owns capturing probes, sending
//! the resulting commands, and invoking `adjust_playback_position`.

use crate::djlink::PlaybackPosition;
use crate::protocol::{Command, QUANTUM};
use crate::state::BeatProbe;

/// Skew threshold above which a beat response triggers realignment:
/// just above expected packet jitter (spec §4.5, ≈ 1/60 beat).
const SKEW_THRESHOLD: f64 = 0.0166;

/// Beat-delta threshold above which a phase shift is already audible
/// enough that deferring buys nothing (spec §4.5, ≈ 1/5 beat).
const AUDIBLE_BEAT_DELTA: f64 = 0.2;

/// Transmission-lag fudge added to a positive beat delta before
/// judging whether the shift stays within the current beat.
const TRANSMISSION_LAG_BEATS: f64 = 0.1;

/// `beat_at_time(time_us, beat_number)` step 1-2: compute the
/// daemon-adjusted query time and the probe to store before sending.
pub fn beat_probe(time_us: i64, latency_ms: i64, beat_number: Option<i64>) -> (i64, BeatProbe) {
    let adjusted = time_us - latency_ms * 1000;
    (adjusted, BeatProbe { time_us: adjusted, beat_number })
}

/// Decide the realignment command for a `beat-at-time` response,
/// given the probe that was outstanding when it was sent. Returns
/// `None` when the response doesn't correlate (`when` mismatch,
/// logged by the caller) or no correction is warranted.
pub fn beat_response_command(probe: BeatProbe, beat: f64, when: i64) -> Option<Command> {
    if probe.time_us != when {
        return None;
    }
    let raw = beat.round() as i64;
    let skew = beat - raw as f64;

    let candidate = match probe.beat_number {
        Some(beat_number) => {
            let mut bar_skew = (beat_number - 1) - raw.rem_euclid(4);
            if bar_skew <= -2 {
                bar_skew += 4;
            }
            raw + bar_skew
        }
        None => raw,
    };
    let target_beat = if candidate < 0 { candidate + 4 } else { candidate };

    if skew.abs() > SKEW_THRESHOLD || target_beat != raw {
        Some(Command::ForceBeatAtTime {
            beat: target_beat,
            time_us: when,
            quantum: QUANTUM,
        })
    } else {
        None
    }
}

/// `align_pioneer_phase_to_ableton()`: capture the query time and the
/// DJ-Link playback snapshot to pair with the response.
pub fn phase_probe<P: PlaybackPosition>(now_us: i64, latency_ms: i64, position: &P) -> (i64, P) {
    (now_us + latency_ms * 1000, position.clone())
}

/// Outcome of evaluating a `phase-at-time` response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseAlignment {
    pub ms_delta: i64,
    /// Whether the shift should actually be applied now, per the
    /// "does it skip/repeat a beat" judgment in §4.5.
    pub apply: bool,
}

/// Decide the phase correction for a `phase-at-time` response against
/// the snapshot captured when the probe was sent. `live_beat_phase` is
/// the *current* DJ-Link beat phase, sampled fresh at response time
/// (not the snapshot). Returns `None` if the response doesn't
/// correlate (`when` mismatch).
#[allow(clippy::too_many_arguments)]
pub fn phase_response<P: PlaybackPosition>(
    probe_when: i64,
    snapshot: &P,
    bar_align: bool,
    phase: f64,
    when: i64,
    live_beat_phase: f64,
    closest_delta: impl Fn(f64) -> f64,
) -> Option<PhaseAlignment> {
    if probe_when != when {
        return None;
    }

    let desired = if bar_align { phase / QUANTUM } else { phase - phase.floor() };
    let actual = if bar_align { snapshot.bar_phase() } else { snapshot.beat_phase() };
    let delta = closest_delta(desired - actual);
    let interval = if bar_align {
        snapshot.bar_interval_ms()
    } else {
        snapshot.beat_interval_ms()
    };
    let ms_delta = (delta * interval).floor() as i64;

    if ms_delta == 0 {
        return Some(PhaseAlignment { ms_delta, apply: false });
    }

    let mut beat_delta = if bar_align { delta * 4.0 } else { delta };
    if beat_delta > 0.0 {
        beat_delta += TRANSMISSION_LAG_BEATS;
    }
    let stays_within_beat = (live_beat_phase + beat_delta).floor() == 0.0;
    let already_audible = beat_delta.abs() > AUDIBLE_BEAT_DELTA;

    Some(PhaseAlignment {
        ms_delta,
        apply: stays_within_beat || already_audible,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::djlink::testing::FakeDjLinkEngine;
    use crate::djlink::DjLinkEngine;

    fn closest_delta(x: f64) -> f64 {
        FakeDjLinkEngine::new().closest_delta(x)
    }

    #[test]
    fn beat_probe_adjusts_for_latency() {
        let (adjusted, probe) = beat_probe(1_000_000, 5, Some(3));
        assert_eq!(adjusted, 995_000);
        assert_eq!(probe.time_us, 995_000);
        assert_eq!(probe.beat_number, Some(3));
    }

    #[test]
    fn beat_realignment_s4_scenario() {
        // §8 S4: bar_align=true, beat_at_time(1_000_000, 3), response
        // beat=8.02 at the adjusted `when`.
        let (adjusted, probe) = beat_probe(1_000_000, 0, Some(3));
        let cmd = beat_response_command(probe, 8.02, adjusted).unwrap();
        assert_eq!(
            cmd,
            Command::ForceBeatAtTime {
                beat: 10,
                time_us: adjusted,
                quantum: QUANTUM,
            }
        );
    }

    #[test]
    fn stale_beat_response_is_dropped() {
        let probe = BeatProbe { time_us: 100, beat_number: None };
        assert_eq!(beat_response_command(probe, 8.0, 999), None);
    }

    #[test]
    fn skew_boundary_at_point_zero_one_six_six_is_not_enough() {
        let probe = BeatProbe { time_us: 100, beat_number: None };
        // raw=8, skew=0.0166 exactly -> not > threshold, and no bar
        // realignment since beat_number is None, so no correction.
        assert_eq!(beat_response_command(probe, 8.0166, 100), None);
        let probe2 = BeatProbe { time_us: 100, beat_number: None };
        assert!(beat_response_command(probe2, 8.0167, 100).is_some());
    }

    #[test]
    fn bar_skew_rotates_negative_three_to_plus_one_invariant_10() {
        // raw=0 forces bar_skew = (beat_number-1) - 0; choose
        // beat_number so bar_skew starts at -3.
        let probe = BeatProbe { time_us: 50, beat_number: Some(-2) };
        let cmd = beat_response_command(probe, 0.0, 50).unwrap();
        assert_eq!(
            cmd,
            Command::ForceBeatAtTime { beat: 1, time_us: 50, quantum: QUANTUM }
        );
    }

    #[test]
    fn negative_candidate_wraps_to_three_invariant_11() {
        // raw=0, beat_number=0 -> bar_skew = -1 - 0 = -1, candidate=-1,
        // wraps to 3.
        let probe = BeatProbe { time_us: 50, beat_number: Some(0) };
        let cmd = beat_response_command(probe, 0.0, 50).unwrap();
        assert_eq!(
            cmd,
            Command::ForceBeatAtTime { beat: 3, time_us: 50, quantum: QUANTUM }
        );
    }

    #[test]
    fn phase_defer_s5_scenario() {
        #[derive(Clone)]
        struct Snap;
        impl PlaybackPosition for Snap {
            fn beat_phase(&self) -> f64 {
                0.0
            }
            fn bar_phase(&self) -> f64 {
                0.0
            }
            fn beat_interval_ms(&self) -> f64 {
                500.0
            }
            fn bar_interval_ms(&self) -> f64 {
                2000.0
            }
        }
        // delta is driven directly via a closest_delta stub returning 0.05.
        let result = phase_response(
            1000,
            &Snap,
            false,
            0.05, // phase such that phase - floor(phase) == 0.05
            1000,
            0.10,
            |_x| 0.05,
        )
        .unwrap();
        assert!(result.apply);
    }

    #[test]
    fn stale_phase_response_is_dropped() {
        #[derive(Clone)]
        struct Snap;
        impl PlaybackPosition for Snap {
            fn beat_phase(&self) -> f64 {
                0.0
            }
            fn bar_phase(&self) -> f64 {
                0.0
            }
            fn beat_interval_ms(&self) -> f64 {
                500.0
            }
            fn bar_interval_ms(&self) -> f64 {
                2000.0
            }
        }
        assert_eq!(
            phase_response(1000, &Snap, false, 0.05, 2000, 0.0, closest_delta),
            None
        );
    }
}
