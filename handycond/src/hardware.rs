//! Hardware identification
//!
//! Reads the DMI strings and the CPU vendor once at startup. The result is only
//! used as the lookup key for the quirk profile table.

use handycon_common::tracing;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

const DMI_DIR: &str = "sys/devices/virtual/dmi/id";

/// Identity of the host handheld
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareIdentifier {
    pub product_name: String,
    pub sys_vendor: String,
    pub board_name: String,
    /// `vendor_id` from /proc/cpuinfo, e.g. "GenuineIntel"
    pub cpu_vendor: String,
}

impl HardwareIdentifier {
    pub fn new(product_name: &str, cpu_vendor: &str) -> Self {
        Self {
            product_name: product_name.to_string(),
            sys_vendor: String::new(),
            board_name: String::new(),
            cpu_vendor: cpu_vendor.to_string(),
        }
    }

    /// Identify the running system
    pub fn detect() -> Self {
        Self::detect_under(Path::new("/"))
    }

    /// Identify a system whose sysfs and procfs are mounted below `root`
    pub fn detect_under(root: &Path) -> Self {
        let dmi = root.join(DMI_DIR);
        let identifier = Self {
            product_name: read_trimmed(&dmi.join("product_name")),
            sys_vendor: read_trimmed(&dmi.join("sys_vendor")),
            board_name: read_trimmed(&dmi.join("board_name")),
            cpu_vendor: cpu_vendor(&root.join("proc/cpuinfo")),
        };
        debug!("Detected hardware: {:?}", identifier);
        identifier
    }

    /// Replace the detected product name, keeping the other fields
    pub fn with_product_override(mut self, product_name: Option<&str>) -> Self {
        if let Some(name) = product_name {
            self.product_name = name.trim().to_string();
        }
        self
    }
}

impl fmt::Display for HardwareIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}'", self.product_name)?;
        if !self.sys_vendor.is_empty() {
            write!(f, " by '{}'", self.sys_vendor)?;
        }
        if !self.cpu_vendor.is_empty() {
            write!(f, " ({})", self.cpu_vendor)?;
        }
        Ok(())
    }
}

fn read_trimmed(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(value) => value.trim().to_string(),
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            String::new()
        }
    }
}

fn cpu_vendor(cpuinfo: &Path) -> String {
    let content = match fs::read_to_string(cpuinfo) {
        Ok(content) => content,
        Err(e) => {
            warn!("Could not read {}: {}", cpuinfo.display(), e);
            return String::new();
        }
    };

    content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "vendor_id")
        .map(|(_, value)| value.trim().to_string())
        .unwrap_or_default()
}
