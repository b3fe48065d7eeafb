use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// Re-export common dependencies
pub use serde;
pub use bincode;
pub use tokio;
pub use tracing;

// IPC client module
pub mod ipc_client;

/// Hardware-independent button identity.
///
/// Gamepad buttons use the Xbox layout names. `Key` carries a raw key code for
/// vendor buttons that are only ever seen as keyboard scancodes and are only
/// meaningful as chord members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogicalButton {
    South,
    East,
    North,
    West,
    LeftBumper,
    RightBumper,
    LeftTrigger,
    RightTrigger,
    Select,
    Start,
    Guide,
    LeftStick,
    RightStick,
    DPadUp,
    DPadDown,
    DPadLeft,
    DPadRight,
    Mode,
    QuickAccess,
    Keyboard,
    Screenshot,
    Escape,
    Turbo,
    LeftCustom,
    RightCustom,
    Power,
    VolumeUp,
    VolumeDown,
    Key(u16),
}

const BUTTON_NAMES: &[(LogicalButton, &str)] = &[
    (LogicalButton::South, "south"),
    (LogicalButton::East, "east"),
    (LogicalButton::North, "north"),
    (LogicalButton::West, "west"),
    (LogicalButton::LeftBumper, "left_bumper"),
    (LogicalButton::RightBumper, "right_bumper"),
    (LogicalButton::LeftTrigger, "left_trigger"),
    (LogicalButton::RightTrigger, "right_trigger"),
    (LogicalButton::Select, "select"),
    (LogicalButton::Start, "start"),
    (LogicalButton::Guide, "guide"),
    (LogicalButton::LeftStick, "left_stick"),
    (LogicalButton::RightStick, "right_stick"),
    (LogicalButton::DPadUp, "dpad_up"),
    (LogicalButton::DPadDown, "dpad_down"),
    (LogicalButton::DPadLeft, "dpad_left"),
    (LogicalButton::DPadRight, "dpad_right"),
    (LogicalButton::Mode, "mode"),
    (LogicalButton::QuickAccess, "quick_access"),
    (LogicalButton::Keyboard, "keyboard"),
    (LogicalButton::Screenshot, "screenshot"),
    (LogicalButton::Escape, "escape"),
    (LogicalButton::Turbo, "turbo"),
    (LogicalButton::LeftCustom, "left_custom"),
    (LogicalButton::RightCustom, "right_custom"),
    (LogicalButton::Power, "power"),
    (LogicalButton::VolumeUp, "volume_up"),
    (LogicalButton::VolumeDown, "volume_down"),
];

impl LogicalButton {
    pub fn name(&self) -> String {
        match self {
            LogicalButton::Key(code) => format!("key:{}", code),
            other => BUTTON_NAMES
                .iter()
                .find(|(button, _)| button == other)
                .map(|(_, name)| name.to_string())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for LogicalButton {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for LogicalButton {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(code) = s.strip_prefix("key:") {
            return code
                .parse::<u16>()
                .map(LogicalButton::Key)
                .map_err(|_| format!("invalid key code in button '{}'", s));
        }
        BUTTON_NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(button, _)| *button)
            .ok_or_else(|| format!("unknown logical button '{}'", s))
    }
}

impl TryFrom<String> for LogicalButton {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogicalButton> for String {
    fn from(button: LogicalButton) -> Self {
        button.name()
    }
}

/// Analog axes of the virtual controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisId {
    LeftX,
    LeftY,
    RightX,
    RightY,
    LeftTrigger,
    RightTrigger,
    HatX,
    HatY,
}

/// Press phase of a logical button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Down,
    Up,
}

/// Identifier of a profile mode (e.g. "default", "quickmenu")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModeId(pub String);

impl ModeId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an input source declared by a quirk profile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of power transition requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerKind {
    Suspend,
    Hibernate,
    Shutdown,
    Ignore,
}

impl fmt::Display for PowerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PowerKind::Suspend => "suspend",
            PowerKind::Hibernate => "hibernate",
            PowerKind::Shutdown => "shutdown",
            PowerKind::Ignore => "ignore",
        };
        write!(f, "{}", name)
    }
}

/// Actions produced by the combination recognizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Press or release a button on the virtual controller
    SynthesizeButton(LogicalButton, Phase),
    /// Move an axis of the virtual controller
    SynthesizeAxis(AxisId, i32),
    /// Switch to a mode, or back to the default mode if it is already active
    ToggleMode(ModeId),
    /// Hand a power transition to the power interceptor
    PowerRequest(PowerKind),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::SynthesizeButton(button, Phase::Down) => write!(f, "press {}", button),
            Action::SynthesizeButton(button, Phase::Up) => write!(f, "release {}", button),
            Action::SynthesizeAxis(axis, value) => write!(f, "axis {:?}={}", axis, value),
            Action::ToggleMode(mode) => write!(f, "toggle mode {}", mode),
            Action::PowerRequest(kind) => write!(f, "power {}", kind),
        }
    }
}

/// Runtime information about one input source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub id: SourceId,
    pub role: String,
    pub name: String,
    pub path: Option<PathBuf>,
    pub connected: bool,
    pub grabbed: bool,
    /// Milliseconds since the last event from this source
    pub last_seen_ms: Option<u64>,
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let path = self
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(f, "{} [{}] {} at {}{}", self.id, self.role, self.name, path,
               if self.connected { "" } else { " (disconnected)" })
    }
}

/// Status information structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub version: String,
    pub uptime_seconds: u64,
    pub profile: String,
    pub mode: String,
    pub recognizer: String,
    pub power_state: String,
    pub power_degraded: bool,
    pub events_processed: u64,
    pub actions_dispatched: u64,
    pub held_outputs: Vec<u16>,
    pub sources: Vec<SourceInfo>,
}

/// Summary of the active quirk profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    pub power_mode: String,
    pub modes: Vec<String>,
    pub default_mode: String,
    pub chords: Vec<String>,
}

/// IPC Requests from clients to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Get daemon status and version
    GetStatus,

    /// List the input sources of the active profile
    ListSources,

    /// Describe the active quirk profile
    GetProfile,
}

/// IPC Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Status information
    Status(StatusInfo),

    /// Input sources with their connection state
    Sources(Vec<SourceInfo>),

    /// Active profile description
    Profile(ProfileSummary),

    /// Error response
    Error(String),
}

/// Serialization helpers for the IPC protocol
pub fn serialize<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {:?}", e);
        Vec::new()
    })
}

pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_names_parse() {
        assert_eq!("quick_access".parse::<LogicalButton>().unwrap(), LogicalButton::QuickAccess);
        assert_eq!("key:125".parse::<LogicalButton>().unwrap(), LogicalButton::Key(125));
        assert_eq!(LogicalButton::Key(40).to_string(), "key:40");
        assert_eq!(LogicalButton::DPadLeft.to_string(), "dpad_left");
        assert!("key:abc".parse::<LogicalButton>().is_err());
        assert!("turbo_boost".parse::<LogicalButton>().is_err());
    }

    #[test]
    fn test_every_named_button_parses_back() {
        for (button, name) in BUTTON_NAMES {
            assert_eq!(name.parse::<LogicalButton>().unwrap(), *button);
        }
    }

    #[test]
    fn test_ipc_serialization() {
        let request = Request::GetStatus;
        let serialized = serialize(&request);
        let deserialized: Request = deserialize(&serialized).unwrap();
        assert!(matches!(deserialized, Request::GetStatus));
    }

    #[test]
    fn test_action_serialization() {
        let action = Action::SynthesizeButton(LogicalButton::Key(133), Phase::Down);
        let serialized = serialize(&action);
        let deserialized: Action = deserialize(&serialized).unwrap();
        assert_eq!(deserialized, action);
    }

    #[test]
    fn test_action_display() {
        assert_eq!(Action::ToggleMode(ModeId::new("quickmenu")).to_string(), "toggle mode quickmenu");
        assert_eq!(Action::PowerRequest(PowerKind::Hibernate).to_string(), "power hibernate");
        assert_eq!(
            Action::SynthesizeButton(LogicalButton::Mode, Phase::Up).to_string(),
            "release mode"
        );
    }
}
