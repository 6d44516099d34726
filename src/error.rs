//! Domain errors surfaced synchronously to API callers.
//!
//! Connection failures are never represented here — per the engine's
//! error model, those go through the caller-supplied failure callback
//! (see [`crate::connection`]), not a `Result`. This enum only covers
//! precondition violations the caller is expected to fix.

use thiserror::Error;

/// Errors raised synchronously by the public engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A configuration or sync-mode precondition was not met
    /// (e.g. enabling `full` sync while the DJ-Link virtual participant
    /// isn't sending status, or changing the port while connected).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A caller-supplied argument was out of the domain the engine
    /// accepts (e.g. a tempo outside `20.0 < bpm < 999.0`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error from the daemon socket, surfaced only to callers
    /// that directly invoke a send (e.g. `set_link_tempo`); never
    /// raised out of `connect` itself.
    #[error("link daemon I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
