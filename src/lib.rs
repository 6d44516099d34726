//! A bidirectional tempo and phase bridge between a Pro DJ Link
//! network and an Ableton Link session, reached through a local
//! Carabiner-style Link daemon.
//!
//! [`Engine`] is the crate's single entry point: it owns the shared
//! client state (C1), drives the daemon's line protocol (C2) through
//! a connection supervisor (C3) and read loop (C4), keeps tempo in
//! parity (C5), decides beat and phase corrections (C6), runs the
//! `off`/`passive`/`full` sync-mode state machine (C7), and fans out
//! to subscriber listeners (C8). The DJ-Link engine itself is an
//! external collaborator, modeled here as the [`djlink::DjLinkEngine`]
//! trait so the crate can be built and tested without a real
//! DJ-Link network.

pub mod align;
mod clock;
pub mod config;
pub mod connection;
pub mod djlink;
pub mod engine;
pub mod error;
pub mod listeners;
pub mod protocol;
mod read_loop;
pub mod state;
pub mod sync_mode;
pub mod tempo;

pub use config::{ConfigError, ConfigManager, LinkBridgeConfig};
pub use djlink::{BeatEvent, DjLinkEngine, MasterListener, PlaybackPosition};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use state::{ClientStateView, SyncMode};

/// Test-only logging bootstrap, so `RUST_LOG=debug cargo test -- --nocapture`
/// shows engine log lines instead of swallowing them.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
