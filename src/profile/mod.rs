//! Profile merge and settings embedding
//!
//! Builds the project settings document the slicer reads from the bundled
//! printer, process and filament profiles plus per-job overrides, and writes
//! it into a copy of the source archive. Which copy is written depends on
//! what the source carries:
//!
//! - vendor files whose extruder assignments, paint or tool changes must
//!   survive keep their geometry and metadata ([`EmbedPath::PreservePath`])
//! - other vendor files are flattened to a plain core archive first
//!   ([`EmbedPath::FlattenPath`])
//! - plain 3MF files are copied with the settings added
//!   ([`EmbedPath::PlainCopy`])

mod embed;
pub mod flatten;
pub mod settings;

pub use embed::{plate_custom_gcode, sanitize_model_settings};
pub use flatten::{FlattenReport, flatten_scene};
pub use settings::{SettingsDoc, printable_area_center, strip_flow_calibrate};

use crate::archive::{CUSTOM_GCODE_PATH, PROJECT_SETTINGS_PATH, Package};
use crate::config::{PipelineConfig, ProfileNames};
use crate::error::{Error, Result};
use crate::probe::ProbeReport;
use embed::{InjectOptions, SourceFacts, copy_and_inject, preserving_settings, profile_settings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The three bundled profiles
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProfileSet {
    /// Printer (machine) profile
    pub printer: SettingsDoc,
    /// Process (print) profile
    pub process: SettingsDoc,
    /// Default filament profile
    pub filament: SettingsDoc,
    /// Names the profiles were loaded under
    pub names: ProfileNames,
}

impl ProfileSet {
    /// Load the profiles from `dir/printer`, `dir/process` and `dir/filament`
    pub fn load(dir: &Path, names: &ProfileNames) -> Result<Self> {
        Ok(Self {
            printer: load_profile(&dir.join("printer").join(names.printer_file()))?,
            process: load_profile(&dir.join("process").join(names.process_file()))?,
            filament: load_profile(&dir.join("filament").join(names.filament_file()))?,
            names: names.clone(),
        })
    }

    /// Printer preset name, as the profile declares it
    pub fn printer_name(&self) -> String {
        declared_name(&self.printer).unwrap_or_else(|| self.names.printer.clone())
    }

    /// Process preset name, as the profile declares it
    pub fn process_name(&self) -> String {
        declared_name(&self.process).unwrap_or_else(|| self.names.process.clone())
    }
}

fn declared_name(doc: &SettingsDoc) -> Option<String> {
    match doc.get("name") {
        Some(Value::String(name)) if !name.trim().is_empty() => Some(name.clone()),
        _ => None,
    }
}

fn load_profile(path: &Path) -> Result<SettingsDoc> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Profile(format!(
                "Profile file not found: {}",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    SettingsDoc::from_json(&text)
        .map_err(|e| Error::Profile(format!("Invalid JSON in profile: {} ({})", path.display(), e)))
}

/// Loaded profiles, kept for as long as the directory and names stay the same
#[derive(Debug, Default)]
pub struct ProfileCache {
    loaded: Option<(PathBuf, ProfileSet)>,
}

impl ProfileCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The profiles under `dir`, loading them on first use or after a change
    pub fn get(&mut self, dir: &Path, names: &ProfileNames) -> Result<&ProfileSet> {
        let stale = match &self.loaded {
            Some((loaded_dir, set)) => loaded_dir != dir || &set.names != names,
            None => true,
        };
        if stale {
            let set = ProfileSet::load(dir, names)?;
            tracing::debug!(dir = %dir.display(), "loaded bundled profiles");
            self.loaded = Some((dir.to_path_buf(), set));
        }
        match &self.loaded {
            Some((_, set)) => Ok(set),
            None => Err(Error::Profile("profiles not loaded".to_string())),
        }
    }

    /// Drop the loaded profiles
    pub fn clear(&mut self) {
        self.loaded = None;
    }
}

/// Per-job input to [`ProfileEmbedder::embed`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedRequest {
    /// Per-job filament settings, overlaid after the filament profile
    pub filament_settings: Map<String, Value>,
    /// User overrides; these win over everything
    pub overrides: Map<String, Value>,
    /// Filament slots the user asked for
    pub requested_filament_count: usize,
    /// Source extruder number → target tool (1-based)
    pub extruder_remap: BTreeMap<u32, u32>,
    /// Keep geometry untouched even when flattening would be allowed
    pub preserve_geometry: bool,
    /// Keep the flow-calibration blocks of the start G-code
    pub enable_flow_calibrate: bool,
    /// Vendor plate the slicer is pointed at, for plate-scoped tool changes
    pub vendor_plate_id: Option<u32>,
    /// Probes already taken on the source
    #[serde(skip)]
    pub probes: Option<ProbeReport>,
}

impl Default for EmbedRequest {
    fn default() -> Self {
        Self {
            filament_settings: Map::new(),
            overrides: Map::new(),
            requested_filament_count: 1,
            extruder_remap: BTreeMap::new(),
            preserve_geometry: false,
            enable_flow_calibrate: true,
            vendor_plate_id: None,
            probes: None,
        }
    }
}

/// How the settings were embedded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedPath {
    /// Geometry and vendor metadata kept
    PreservePath,
    /// Geometry flattened to a core archive
    FlattenPath,
    /// Plain file copied with settings added
    PlainCopy,
}

/// Result of [`ProfileEmbedder::embed`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedOutcome {
    /// Path taken
    pub path: EmbedPath,
    /// Filament slots in the written settings
    pub filament_slots: usize,
}

/// Merges profiles into job archives
#[derive(Debug)]
pub struct ProfileEmbedder {
    config: PipelineConfig,
    cache: ProfileCache,
}

impl ProfileEmbedder {
    /// Embedder with an empty profile cache
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cache: ProfileCache::new(),
        }
    }

    /// Pipeline configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The bundled profiles
    pub fn profiles(&mut self) -> Result<&ProfileSet> {
        self.cache
            .get(&self.config.profile_dir, &self.config.profile_names)
    }

    /// The path [`embed`](Self::embed) takes for a source with these probes
    ///
    /// `preserve_geometry` keeps vendor files on the preserve path even when
    /// no metadata needs preserving, so their geometry is never re-baked.
    pub fn choose_path(probes: &ProbeReport, request: &EmbedRequest) -> EmbedPath {
        if !probes.is_vendor_format {
            EmbedPath::PlainCopy
        } else if probes.needs_metadata_preserve(request.requested_filament_count)
            || request.preserve_geometry
        {
            EmbedPath::PreservePath
        } else {
            EmbedPath::FlattenPath
        }
    }

    /// Write `src` to `dst` with merged settings embedded
    ///
    /// On the preserve path the per-layer custom G-code is narrowed to
    /// `vendor_plate_id` and keeps that plate's id, since the archive still
    /// holds every plate. Nothing is left at `dst` on failure.
    pub fn embed(&mut self, src: &Path, dst: &Path, request: &EmbedRequest) -> Result<EmbedOutcome> {
        let probes = match &request.probes {
            Some(p) => p.clone(),
            None => ProbeReport::probe_path(src, self.config.paint_scan_limit)?,
        };
        let path = Self::choose_path(&probes, request);
        tracing::info!(strategy = ?path, requested = request.requested_filament_count, "embedding profiles");

        let config = &self.config;
        let profiles = self.cache.get(&config.profile_dir, &config.profile_names)?;
        let max_extruders = u32::try_from(config.max_extruders).unwrap_or(u32::MAX);
        let mut inject = InjectOptions {
            extruder_remap: Some(&request.extruder_remap),
            max_extruders,
            custom_gcode: None,
        };

        let filament_slots = match path {
            EmbedPath::PreservePath => {
                let mut package = Package::open_path(src)?;
                let base = match package.read_string_opt(PROJECT_SETTINGS_PATH)? {
                    Some(text) => SettingsDoc::from_json(&text).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "ignoring unreadable source project settings");
                        SettingsDoc::new()
                    }),
                    None => SettingsDoc::new(),
                };
                if probes.has_layer_tool_changes {
                    inject.custom_gcode = scoped_custom_gcode(&mut package, request.vendor_plate_id)?;
                }
                let facts = SourceFacts {
                    assigned_extruders: probes.assigned_extruder_count,
                    has_paint: probes.has_paint_data,
                };
                let (settings, slots) = preserving_settings(base, profiles, request, facts, &config.bed);
                copy_and_inject(src, dst, &settings, &config.bed, &inject)?;
                slots
            }
            EmbedPath::FlattenPath => {
                let work_dir = dst.parent().unwrap_or_else(|| Path::new("."));
                let flat = tempfile::Builder::new()
                    .prefix(".flat-")
                    .suffix(".3mf")
                    .tempfile_in(work_dir)?;
                flatten_scene(src, flat.path(), &config.bed, config.nesting_depth_limit)?;
                let (settings, slots) = profile_settings(profiles, request);
                copy_and_inject(flat.path(), dst, &settings, &config.bed, &inject)?;
                slots
            }
            EmbedPath::PlainCopy => {
                let (settings, slots) = profile_settings(profiles, request);
                copy_and_inject(src, dst, &settings, &config.bed, &inject)?;
                slots
            }
        };

        tracing::info!(strategy = ?path, filament_slots, dst = %dst.display(), "embedded profiles");
        Ok(EmbedOutcome {
            path,
            filament_slots,
        })
    }
}

fn scoped_custom_gcode<R: std::io::Read + std::io::Seek>(
    package: &mut Package<R>,
    vendor_plate_id: Option<u32>,
) -> Result<Option<String>> {
    let Some(plate_id) = vendor_plate_id else {
        return Ok(None);
    };
    let Some(xml) = package.read_string_opt(CUSTOM_GCODE_PATH)? else {
        return Ok(None);
    };
    match plate_custom_gcode(&xml, plate_id) {
        Ok(scoped) => Ok(scoped),
        Err(e) => {
            tracing::warn!(error = %e, "keeping custom G-code unscoped");
            Ok(None)
        }
    }
}
