//! Pipeline configuration
//!
//! The host application owns configuration loading; this module only defines
//! the values the pipeline consumes and sensible defaults for the 270mm
//! four-tool target printer.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Printer build volume in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BedVolume {
    /// Bed width (X)
    pub x: f64,
    /// Bed depth (Y)
    pub y: f64,
    /// Maximum print height (Z)
    pub z: f64,
}

impl BedVolume {
    /// Create a build volume
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Centre of the bed in bed-local coordinates
    pub fn center(&self) -> (f64, f64) {
        (self.x / 2.0, self.y / 2.0)
    }
}

impl Default for BedVolume {
    fn default() -> Self {
        Self::new(270.0, 270.0, 270.0)
    }
}

/// Default ceiling on component nesting when resolving geometry
pub const DEFAULT_NESTING_DEPTH: usize = 12;

/// Bundled slicer profile names for the target printer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileNames {
    /// Printer (machine) preset name
    pub printer: String,
    /// Process (print) preset name
    pub process: String,
    /// Default filament preset name
    pub filament: String,
}

impl Default for ProfileNames {
    fn default() -> Self {
        Self {
            printer: "Snapmaker U1 (0.4 nozzle) - multiplate".to_string(),
            process: "0.20mm Standard @Snapmaker U1".to_string(),
            filament: "PLA @Snapmaker U1".to_string(),
        }
    }
}

impl ProfileNames {
    /// File name of the printer profile inside the profile directory
    pub fn printer_file(&self) -> String {
        format!("{}.json", self.printer)
    }

    /// File name of the process profile inside the profile directory
    pub fn process_file(&self) -> String {
        format!("{}.json", self.process)
    }

    /// File name of the filament profile inside the profile directory
    pub fn filament_file(&self) -> String {
        format!("{}.json", self.filament)
    }
}

/// Configuration shared by every pipeline stage
///
/// Built with chained `with_*` calls:
///
/// ```
/// use plate_bridge::{BedVolume, PipelineConfig};
///
/// let config = PipelineConfig::new()
///     .with_bed(BedVolume::new(256.0, 256.0, 256.0))
///     .with_max_extruders(4);
/// assert_eq!(config.bed.x, 256.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target printer build volume
    pub bed: BedVolume,
    /// Number of physical tool heads
    pub max_extruders: usize,
    /// Keep one travel segment out of this many when rasterizing G-code
    pub travel_keep_every: usize,
    /// Hard cap on segments retained for rendering
    pub max_render_segments: usize,
    /// Bytes of each model member scanned for paint markers
    pub paint_scan_limit: u64,
    /// Maximum component nesting depth when flattening geometry
    pub nesting_depth_limit: usize,
    /// Characters of slicer stderr kept in error messages
    pub stderr_truncate: usize,
    /// Directory holding the bundled printer/process/filament profiles
    pub profile_dir: PathBuf,
    /// Bundled preset names
    pub profile_names: ProfileNames,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineConfig {
    /// Defaults for the 270mm four-tool printer
    pub fn new() -> Self {
        Self {
            bed: BedVolume::default(),
            max_extruders: 4,
            travel_keep_every: 10,
            max_render_segments: 2_000_000,
            paint_scan_limit: 32 * 1024 * 1024,
            nesting_depth_limit: DEFAULT_NESTING_DEPTH,
            stderr_truncate: 200,
            profile_dir: PathBuf::from("profiles"),
            profile_names: ProfileNames::default(),
        }
    }

    /// Load a configuration from a JSON file; missing keys take defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Set the build volume
    pub fn with_bed(mut self, bed: BedVolume) -> Self {
        self.bed = bed;
        self
    }

    /// Set the tool-head count
    pub fn with_max_extruders(mut self, n: usize) -> Self {
        self.max_extruders = n.max(1);
        self
    }

    /// Set the travel decimation factor
    pub fn with_travel_keep_every(mut self, n: usize) -> Self {
        self.travel_keep_every = n.max(1);
        self
    }

    /// Set the render segment cap
    pub fn with_max_render_segments(mut self, n: usize) -> Self {
        self.max_render_segments = n.max(1);
        self
    }

    /// Set the per-member paint scan budget
    pub fn with_paint_scan_limit(mut self, bytes: u64) -> Self {
        self.paint_scan_limit = bytes;
        self
    }

    /// Set the component nesting ceiling
    pub fn with_nesting_depth_limit(mut self, depth: usize) -> Self {
        self.nesting_depth_limit = depth;
        self
    }

    /// Set the profile directory
    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = dir.into();
        self
    }

    /// Set the bundled preset names
    pub fn with_profile_names(mut self, names: ProfileNames) -> Self {
        self.profile_names = names;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new();
        assert_eq!(config.bed, BedVolume::new(270.0, 270.0, 270.0));
        assert_eq!(config.travel_keep_every, 10);
        assert_eq!(config.nesting_depth_limit, 12);
        assert_eq!(config.bed.center(), (135.0, 135.0));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"bed": {"x": 200.0, "y": 210.0, "z": 220.0}}"#).unwrap();
        assert_eq!(config.bed.y, 210.0);
        assert_eq!(config.max_extruders, 4);
        assert_eq!(
            config.profile_names.printer_file(),
            "Snapmaker U1 (0.4 nozzle) - multiplate.json"
        );
    }

    #[test]
    fn test_builder_clamps() {
        let config = PipelineConfig::new()
            .with_travel_keep_every(0)
            .with_max_extruders(0);
        assert_eq!(config.travel_keep_every, 1);
        assert_eq!(config.max_extruders, 1);
    }

    #[test]
    fn test_builder_chain() {
        let names = ProfileNames {
            printer: "P".to_string(),
            process: "Q".to_string(),
            filament: "F".to_string(),
        };
        let config = PipelineConfig::new()
            .with_paint_scan_limit(1024)
            .with_nesting_depth_limit(3)
            .with_profile_dir("/opt/profiles")
            .with_profile_names(names);
        assert_eq!(config.paint_scan_limit, 1024);
        assert_eq!(config.nesting_depth_limit, 3);
        assert_eq!(config.profile_dir, PathBuf::from("/opt/profiles"));
        assert_eq!(config.profile_names.filament_file(), "F.json");
    }
}
