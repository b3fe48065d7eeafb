use handycon_common::SourceId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the daemon's components.
///
/// `ProfileNotFound`, `InvalidProfile`, `OutputDeviceFailure` and `Config` are
/// fatal at startup. `SourceUnavailable` is retried by the device watcher and
/// `PowerHookFailure` puts the power interceptor into degraded mode.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("no quirk profile matches {0}")]
    ProfileNotFound(String),

    #[error("invalid quirk profile {profile}: {reason}")]
    InvalidProfile { profile: String, reason: String },

    #[error("input source {source_id} unavailable: {reason}")]
    SourceUnavailable { source_id: SourceId, reason: String },

    #[error("virtual controller failure: {0}")]
    OutputDeviceFailure(String),

    #[error("power hook failure: {0}")]
    PowerHookFailure(String),

    #[error("configuration error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    pub fn invalid_profile(profile: &str, reason: impl Into<String>) -> Self {
        DaemonError::InvalidProfile {
            profile: profile.to_string(),
            reason: reason.into(),
        }
    }

    pub fn source_unavailable(source_id: &SourceId, reason: impl Into<String>) -> Self {
        DaemonError::SourceUnavailable {
            source_id: source_id.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the daemon should exit when this error reaches the top level
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DaemonError::SourceUnavailable { .. } | DaemonError::PowerHookFailure(_)
        )
    }
}
