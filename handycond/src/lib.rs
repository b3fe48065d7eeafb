//! Handycon Daemon Library
//!
//! Core of the handheld input daemon:
//! - Quirk profiles and hardware identification
//! - Input source supervision and exclusive grabs
//! - Event normalization and chord recognition
//! - The virtual controller and power button handling
//! - IPC status server

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod feedback;
pub mod hardware;
pub mod ipc;
pub mod normalizer;
pub mod power;
pub mod quirks;
pub mod recognizer;
pub mod rumble;
pub mod sink;

pub use error::DaemonError;
pub use handycon_common::{Action, LogicalButton, ModeId, PowerKind, SourceId};
