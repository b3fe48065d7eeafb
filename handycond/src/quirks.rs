//! Quirk profiles
//!
//! A quirk profile describes one family of handhelds:
//! - which input sources exist and how to find them
//! - which raw codes decode to which logical buttons or axes
//! - the chords recognized on top of those buttons
//! - how the power button is handled
//!
//! Profiles are YAML documents. A built-in table is compiled into the daemon
//! and extra directories can be layered in front of it. A profile is resolved
//! and validated once at startup and is immutable afterwards.

use handycon_common::{
    tracing, Action, AxisId, LogicalButton, ModeId, PowerKind, ProfileSummary, SourceId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::hardware::HardwareIdentifier;

const BUILTIN_PROFILES: &[(&str, &str)] = &[
    ("aya_gen1.yaml", include_str!("../quirks/aya_gen1.yaml")),
    ("aya_gen2.yaml", include_str!("../quirks/aya_gen2.yaml")),
    ("aya_gen7.yaml", include_str!("../quirks/aya_gen7.yaml")),
    ("ayn_gen3.yaml", include_str!("../quirks/ayn_gen3.yaml")),
    ("oxp_gen5.yaml", include_str!("../quirks/oxp_gen5.yaml")),
];

pub const DEFAULT_CHORD_GAP_MS: u64 = 60;

/// Role of an input source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Gamepad,
    Keyboard,
    Power,
}

impl SourceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceRole::Gamepad => "gamepad",
            SourceRole::Keyboard => "keyboard",
            SourceRole::Power => "power",
        }
    }
}

/// How a source's device node is located
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: SourceId,
    pub role: SourceRole,
    /// evdev device name
    #[serde(default)]
    pub name: Option<String>,
    /// Accepted physical paths; empty matches any
    #[serde(default)]
    pub phys: Vec<String>,
    /// Explicit node, bypassing name and phys matching
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub grab: bool,
    /// Absence is expected on some units and only logged at debug level
    #[serde(default)]
    pub optional: bool,
    /// Decode the standard gamepad codes of this source without explicit mappings
    #[serde(default)]
    pub native: bool,
}

impl SourceSpec {
    /// Whether a device with this name and phys is the node for this source
    pub fn matches(&self, name: Option<&str>, phys: Option<&str>) -> bool {
        if let Some(wanted) = &self.name {
            if name != Some(wanted.as_str()) {
                return false;
            }
        }
        self.phys.is_empty() || phys.map_or(false, |p| self.phys.iter().any(|wanted| wanted == p))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RawKind {
    #[default]
    Key,
    Abs,
}

/// One entry of the raw-code table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMapping {
    pub source: SourceId,
    #[serde(default)]
    pub kind: RawKind,
    pub code: u16,
    #[serde(default)]
    pub button: Option<LogicalButton>,
    #[serde(default)]
    pub axis: Option<AxisId>,
    /// Only active in this mode; overrides the mode-less entry for the same code
    #[serde(default)]
    pub mode: Option<ModeId>,
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChordKind {
    #[default]
    Concurrent,
    Ordered,
}

/// A set or sequence of logical buttons that produces one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChordDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub buttons: Vec<LogicalButton>,
    #[serde(default)]
    pub kind: ChordKind,
    /// Window between the first and the last press (concurrent) or between
    /// consecutive steps (ordered); falls back to the profile's chord gap
    #[serde(default)]
    pub max_gap_ms: Option<u64>,
    #[serde(default)]
    pub min_hold_ms: Option<u64>,
    pub action: Action,
}

impl ChordDefinition {
    pub fn label(&self, index: usize) -> String {
        self.name.clone().unwrap_or_else(|| format!("chord #{}", index))
    }

    pub fn button_set(&self) -> BTreeSet<LogicalButton> {
        self.buttons.iter().copied().collect()
    }

    pub fn min_hold(&self) -> Option<Duration> {
        self.min_hold_ms.map(Duration::from_millis)
    }

    pub fn is_concurrent(&self) -> bool {
        self.kind == ChordKind::Concurrent
    }
}

/// Power button handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    NativeSuspend,
    InterceptAndRemap,
    InterceptAndIgnore,
}

impl PowerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::NativeSuspend => "native_suspend",
            PowerMode::InterceptAndRemap => "intercept_and_remap",
            PowerMode::InterceptAndIgnore => "intercept_and_ignore",
        }
    }
}

/// Static per-model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuirkProfile {
    pub name: String,
    #[serde(default)]
    pub product_names: Vec<String>,
    #[serde(default)]
    pub cpu_vendor: Option<String>,
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub mappings: Vec<RawMapping>,
    /// Output codes replacing the defaults for a logical button
    #[serde(default)]
    pub outputs: BTreeMap<LogicalButton, Vec<u16>>,
    #[serde(default)]
    pub power_mode: PowerMode,
    #[serde(default)]
    pub power_remap: Option<Action>,
    #[serde(default)]
    pub chords: Vec<ChordDefinition>,
    #[serde(default = "default_chord_gap")]
    pub chord_gap_ms: u64,
    #[serde(default = "default_modes")]
    pub modes: Vec<ModeId>,
    #[serde(default = "default_mode")]
    pub default_mode: ModeId,
    /// Pause between the steps of a multi-code output
    #[serde(default)]
    pub button_delay_ms: u64,
    #[serde(default = "default_true")]
    pub haptics: bool,
}

fn default_true() -> bool {
    true
}

fn default_chord_gap() -> u64 {
    DEFAULT_CHORD_GAP_MS
}

fn default_modes() -> Vec<ModeId> {
    vec![default_mode()]
}

fn default_mode() -> ModeId {
    ModeId::new("default")
}

impl QuirkProfile {
    /// Parse a profile document. The result is not validated yet.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn matches(&self, id: &HardwareIdentifier) -> bool {
        let product = id.product_name.trim();
        if !self.product_names.iter().any(|name| name == product) {
            return false;
        }
        match &self.cpu_vendor {
            Some(vendor) => vendor == &id.cpu_vendor,
            None => true,
        }
    }

    pub fn source(&self, id: &SourceId) -> Option<&SourceSpec> {
        self.sources.iter().find(|s| &s.id == id)
    }

    pub fn chord_gap(&self, chord: &ChordDefinition) -> Duration {
        Duration::from_millis(chord.max_gap_ms.unwrap_or(self.chord_gap_ms))
    }

    pub fn button_delay(&self) -> Duration {
        Duration::from_millis(self.button_delay_ms)
    }

    /// Buttons that take part in at least one chord
    pub fn chord_members(&self) -> HashSet<LogicalButton> {
        self.chords.iter().flat_map(|c| c.buttons.iter().copied()).collect()
    }

    /// Buttons marked passthrough by any mapping, plus every native gamepad button
    pub fn passthrough_buttons(&self) -> HashSet<LogicalButton> {
        let mut buttons: HashSet<LogicalButton> = self
            .mappings
            .iter()
            .filter(|m| m.passthrough)
            .filter_map(|m| m.button)
            .collect();
        if self.sources.iter().any(|s| s.native) {
            buttons.extend(crate::normalizer::NATIVE_BUTTONS.iter().map(|(_, b)| *b));
        }
        buttons
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            power_mode: self.power_mode.as_str().to_string(),
            modes: self.modes.iter().map(|m| m.to_string()).collect(),
            default_mode: self.default_mode.to_string(),
            chords: self
                .chords
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let buttons: Vec<String> = c.buttons.iter().map(|b| b.to_string()).collect();
                    let joiner = if c.is_concurrent() { " + " } else { " , " };
                    format!("{}: {} -> {}", c.label(i), buttons.join(joiner), c.action)
                })
                .collect(),
        }
    }

    /// Check the profile for inconsistencies and ambiguous chords
    pub fn validate(&self) -> Result<(), DaemonError> {
        let invalid = |reason: String| DaemonError::invalid_profile(&self.name, reason);

        if self.sources.is_empty() {
            return Err(invalid("no input sources".to_string()));
        }
        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if !source_ids.insert(&source.id) {
                return Err(invalid(format!("duplicate source '{}'", source.id)));
            }
            if source.name.is_none() && source.path.is_none() {
                return Err(invalid(format!("source '{}' has neither name nor path", source.id)));
            }
        }

        if !self.modes.contains(&self.default_mode) {
            return Err(invalid(format!("default mode '{}' is not declared", self.default_mode)));
        }

        for mapping in &self.mappings {
            if !source_ids.contains(&mapping.source) {
                return Err(invalid(format!("mapping for code {} uses unknown source '{}'",
                                           mapping.code, mapping.source)));
            }
            match (mapping.kind, mapping.button, mapping.axis) {
                (RawKind::Key, Some(_), None) | (RawKind::Abs, None, Some(_)) => {}
                _ => {
                    return Err(invalid(format!(
                        "mapping for {:?} code {} on '{}' needs a button for keys or an axis for abs",
                        mapping.kind, mapping.code, mapping.source
                    )))
                }
            }
            if let Some(mode) = &mapping.mode {
                if !self.modes.contains(mode) {
                    return Err(invalid(format!("mapping for code {} uses unknown mode '{}'",
                                               mapping.code, mode)));
                }
            }
        }

        if self.chord_gap_ms == 0 {
            return Err(invalid("chord_gap_ms must be positive".to_string()));
        }

        for (i, chord) in self.chords.iter().enumerate() {
            let label = chord.label(i);
            if chord.buttons.is_empty() {
                return Err(invalid(format!("{} has no buttons", label)));
            }
            if chord.button_set().len() != chord.buttons.len() {
                return Err(invalid(format!("{} repeats a button", label)));
            }
            if chord.max_gap_ms == Some(0) {
                return Err(invalid(format!("{} has a zero gap", label)));
            }
            if chord.kind == ChordKind::Ordered {
                if chord.buttons.len() < 2 {
                    return Err(invalid(format!("{} is ordered but has fewer than two steps", label)));
                }
                if chord.min_hold_ms.is_some() {
                    return Err(invalid(format!("{} is ordered and cannot require a hold", label)));
                }
            }
            self.validate_action(&chord.action, &label)?;
        }

        for (i, a) in self.chords.iter().enumerate() {
            for (j, b) in self.chords.iter().enumerate().skip(i + 1) {
                match (a.kind, b.kind) {
                    (ChordKind::Concurrent, ChordKind::Concurrent) => {
                        let set_a = a.button_set();
                        let set_b = b.button_set();
                        if set_a == set_b {
                            return Err(invalid(format!("{} and {} use the same buttons",
                                                       a.label(i), b.label(j))));
                        }
                        if set_a.len() == set_b.len() && !set_a.is_disjoint(&set_b) {
                            return Err(invalid(format!(
                                "{} and {} overlap with equal size and cannot be ordered by length",
                                a.label(i), b.label(j)
                            )));
                        }
                    }
                    (ChordKind::Ordered, ChordKind::Ordered) => {
                        if a.buttons == b.buttons {
                            return Err(invalid(format!("{} and {} use the same steps",
                                                       a.label(i), b.label(j))));
                        }
                    }
                    _ => {}
                }
            }
        }

        let concurrent_members: HashSet<LogicalButton> = self
            .chords
            .iter()
            .filter(|c| c.is_concurrent())
            .flat_map(|c| c.buttons.iter().copied())
            .collect();
        for (i, chord) in self.chords.iter().enumerate() {
            if chord.kind == ChordKind::Ordered && concurrent_members.contains(&chord.buttons[0]) {
                return Err(invalid(format!(
                    "{} starts with {}, which is also part of a concurrent chord",
                    chord.label(i), chord.buttons[0]
                )));
            }
        }

        match (self.power_mode, &self.power_remap) {
            (PowerMode::InterceptAndRemap, None) => {
                return Err(invalid("intercept_and_remap needs power_remap".to_string()));
            }
            (_, Some(Action::PowerRequest(_))) => {
                return Err(invalid("power_remap cannot be another power request".to_string()));
            }
            (_, Some(action)) => self.validate_action(action, "power_remap")?,
            _ => {}
        }

        Ok(())
    }

    fn validate_action(&self, action: &Action, label: &str) -> Result<(), DaemonError> {
        if let Action::ToggleMode(mode) = action {
            if !self.modes.contains(mode) {
                return Err(DaemonError::invalid_profile(
                    &self.name,
                    format!("{} toggles unknown mode '{}'", label, mode),
                ));
            }
        }
        Ok(())
    }
}

/// Table of known profiles in lookup order
#[derive(Debug, Clone, Default)]
pub struct QuirkStore {
    profiles: Vec<QuirkProfile>,
}

impl QuirkStore {
    pub fn from_profiles(profiles: Vec<QuirkProfile>) -> Self {
        Self { profiles }
    }

    /// Profiles compiled into the daemon
    pub fn builtin() -> Result<Self, DaemonError> {
        let mut profiles = Vec::with_capacity(BUILTIN_PROFILES.len());
        for (file, content) in BUILTIN_PROFILES {
            let profile = QuirkProfile::from_yaml(content)
                .map_err(|e| DaemonError::invalid_profile(file, e.to_string()))?;
            profiles.push(profile);
        }
        Ok(Self { profiles })
    }

    /// Profiles from `dirs` in order, followed by the built-in table
    pub fn load(dirs: &[PathBuf]) -> Result<Self, DaemonError> {
        let mut profiles = Vec::new();
        for dir in dirs {
            profiles.extend(load_dir(dir));
        }
        profiles.extend(Self::builtin()?.profiles);
        Ok(Self { profiles })
    }

    pub fn profiles(&self) -> &[QuirkProfile] {
        &self.profiles
    }
}

fn load_dir(dir: &Path) -> Vec<QuirkProfile> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read quirk directory {}: {}", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
        .collect();
    paths.sort();

    let mut profiles = Vec::new();
    for path in paths {
        match fs::read_to_string(&path).map_err(|e| e.to_string())
            .and_then(|content| QuirkProfile::from_yaml(&content).map_err(|e| e.to_string()))
        {
            Ok(profile) => {
                debug!("Loaded quirk profile {} from {}", profile.name, path.display());
                profiles.push(profile);
            }
            Err(e) => warn!("Skipping quirk file {}: {}", path.display(), e),
        }
    }
    profiles
}

/// Select and validate the profile for this hardware
pub fn resolve(store: &QuirkStore, id: &HardwareIdentifier) -> Result<QuirkProfile, DaemonError> {
    let profile = store
        .profiles()
        .iter()
        .find(|p| p.matches(id))
        .ok_or_else(|| DaemonError::ProfileNotFound(id.to_string()))?;

    profile.validate()?;
    info!("Identified {} as {}", id, profile.name);
    Ok(profile.clone())
}

/// Kind of a power request after the configured override. `Ignore` is never replaced.
pub fn effective_power_kind(requested: PowerKind, override_kind: Option<PowerKind>) -> PowerKind {
    match (requested, override_kind) {
        (PowerKind::Ignore, _) => PowerKind::Ignore,
        (_, Some(kind)) => kind,
        (kind, None) => kind,
    }
}
