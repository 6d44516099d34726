//! C5 — maintains tempo parity: either pushes a target tempo into the
//! Link session, or pulls the DJ-Link master tempo into it.
//!
//! These are pure decision functions; the caller (`Engine`) is
//! responsible for sending whatever `Command` comes back over the
//! current daemon socket and for the state/listener side effects
//! around `lock_tempo`/`unlock_tempo`.

use crate::protocol::Command;
use crate::state::ClientState;

/// Lower bound, exclusive, of a valid Link tempo (spec §4.4).
pub const MIN_BPM: f64 = 20.0;
/// Upper bound, exclusive, of a valid Link tempo.
pub const MAX_BPM: f64 = 999.0;

pub fn is_valid_tempo(bpm: f64) -> bool {
    bpm > MIN_BPM && bpm < MAX_BPM
}

/// §4.4's per-`status` controller step: prefer holding `target_bpm`
/// locked; otherwise, if the DJ-Link virtual participant is the
/// current tempo master, pull its tempo into the Link session.
pub fn controller_command<P>(
    state: &ClientState<P>,
    dj_link_is_tempo_master: bool,
    dj_link_master_tempo: f64,
) -> Option<Command> {
    if let Some(target) = state.target_bpm {
        let link_bpm = state.link_bpm.unwrap_or(0.0);
        return if (link_bpm - target).abs() > 1e-5 {
            Some(Command::SetBpm(target))
        } else {
            None
        };
    }
    if dj_link_is_tempo_master && dj_link_master_tempo > 0.0 {
        return Some(Command::SetBpm(dj_link_master_tempo));
    }
    None
}

/// `set_link_tempo(bpm)`: only sent when the daemon's last-known
/// tempo is off by more than half a BPM-thousandth.
pub fn set_link_tempo_command(bpm: f64, link_bpm: Option<f64>) -> Option<Command> {
    let current = link_bpm.unwrap_or(0.0);
    if (bpm - current).abs() > 0.005 {
        Some(Command::SetBpm(bpm))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct DummySnapshot;

    fn state() -> ClientState<DummySnapshot> {
        ClientState::new(17000, 1)
    }

    #[test]
    fn valid_tempo_boundary() {
        assert!(!is_valid_tempo(20.0));
        assert!(is_valid_tempo(20.0000001));
        assert!(!is_valid_tempo(999.0));
    }

    #[test]
    fn controller_pushes_locked_target_when_link_drifts() {
        let mut s = state();
        s.target_bpm = Some(125.0);
        s.link_bpm = Some(124.9);
        assert_eq!(controller_command(&s, false, 0.0), Some(Command::SetBpm(125.0)));
    }

    #[test]
    fn controller_is_silent_once_link_matches_target() {
        let mut s = state();
        s.target_bpm = Some(125.0);
        s.link_bpm = Some(125.0000001);
        assert_eq!(controller_command(&s, false, 0.0), None);
    }

    #[test]
    fn controller_pulls_dj_link_master_tempo_when_unlocked() {
        let s = state();
        assert_eq!(controller_command(&s, true, 128.0), Some(Command::SetBpm(128.0)));
    }

    #[test]
    fn controller_does_nothing_when_unlocked_and_not_tempo_master() {
        let s = state();
        assert_eq!(controller_command(&s, false, 128.0), None);
    }

    #[test]
    fn set_link_tempo_only_sends_past_half_thousandth_threshold() {
        assert_eq!(set_link_tempo_command(125.0, Some(125.004)), None);
        assert_eq!(
            set_link_tempo_command(125.0, Some(125.006)),
            Some(Command::SetBpm(125.0))
        );
    }
}
