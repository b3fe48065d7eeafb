//! Event records flowing into the engine
//!
//! Everything the engine reacts to arrives as an [`EngineEvent`] on one queue:
//! raw input records, hot-plug notices, sleep notifications and shutdown.

use handycon_common::{LogicalButton, Phase, SourceId};
use std::path::PathBuf;
use tokio::time::Instant;

pub const EV_SYN: u16 = 0x00;
pub const EV_KEY: u16 = 0x01;
pub const EV_ABS: u16 = 0x03;

/// A record read from an input source
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub source: SourceId,
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
    /// Monotonic instant the record was read
    pub timestamp: Instant,
}

impl RawEvent {
    pub fn key(source: &SourceId, code: u16, value: i32, timestamp: Instant) -> Self {
        Self {
            source: source.clone(),
            event_type: EV_KEY,
            code,
            value,
            timestamp,
        }
    }

    pub fn abs(source: &SourceId, code: u16, value: i32, timestamp: Instant) -> Self {
        Self {
            source: source.clone(),
            event_type: EV_ABS,
            code,
            value,
            timestamp,
        }
    }
}

/// A normalized button transition
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalEvent {
    pub source: SourceId,
    pub button: LogicalButton,
    pub phase: Phase,
    pub timestamp: Instant,
}

impl LogicalEvent {
    pub fn new(source: &SourceId, button: LogicalButton, phase: Phase, timestamp: Instant) -> Self {
        Self {
            source: source.clone(),
            button,
            phase,
            timestamp,
        }
    }
}

/// Input to the engine's single ordering point
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Raw(RawEvent),
    /// A source was (re)acquired; its previous held state is stale
    SourceReset {
        source: SourceId,
        path: PathBuf,
        grabbed: bool,
    },
    /// A source vanished or was released
    SourceLost { source: SourceId, reason: String },
    /// logind PrepareForSleep: `true` before sleep, `false` after resume
    Sleep(bool),
    Shutdown,
}
