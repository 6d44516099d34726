//! C7 — validates `off`/`passive`/`full` mode transitions against
//! DJ-Link engine state. The transition's side effects (subscribing
//! the master listener, tying/freeing each sync direction) are
//! inherently stateful — they touch `ClientState`, the DJ-Link engine,
//! and the daemon socket together — so they live on `Engine` in
//! `engine.rs`, which is the only place that holds all three. This
//! module keeps just the precondition check pure and independently
//! testable.

use crate::error::{EngineError, EngineResult};
use crate::state::SyncMode;

/// §4.6 validation: any mode other than `off` requires the DJ-Link
/// engine to be running; `full` additionally requires its virtual
/// participant to be emitting status packets.
pub fn validate_transition(
    target: SyncMode,
    dj_link_running: bool,
    dj_link_sending_status: bool,
) -> EngineResult<()> {
    if target == SyncMode::Off {
        return Ok(());
    }
    if !dj_link_running {
        return Err(EngineError::InvalidState(
            "cannot enable sync while the DJ-Link engine is not running".to_string(),
        ));
    }
    if target == SyncMode::Full && !dj_link_sending_status {
        return Err(EngineError::InvalidState(
            "cannot enable full sync while the DJ-Link virtual participant is not sending status"
                .to_string(),
        ));
    }
    Ok(())
}
