//! Cheap structural probes of a 3MF package
//!
//! The profile merge decides between keeping the original geometry and
//! flattening it based on these probes. Each probe reads as little of the
//! archive as it can; none of them builds meshes.

use crate::archive::{
    CUSTOM_GCODE_PATH, FILAMENT_SEQUENCE_PATH, MODEL_SETTINGS_PATH, Package, SLICE_INFO_PATH,
};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::model::{ParseMode, parse_model};
use crate::vendor::ModelSettings;
use crate::xml_edit::{Edit, edit_elements};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

/// Marker written by vendor slicers for per-triangle paint
const PAINT_NEEDLE: &[u8] = b"paint_color";

/// Paint scan chunk size
const PAINT_CHUNK: usize = 1024 * 1024;

/// Image extensions recognised as previews
const PREVIEW_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".jpeg", ".webp"];

/// Preview name prefixes that may carry a plate number, in scoring order
const PREVIEW_KEYWORDS: [&str; 6] = ["thumbnail", "preview", "cover", "top", "plate", "pick"];

/// Everything the merge decision needs to know about a source file
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProbeReport {
    /// Vendor side files are present
    pub is_vendor_format: bool,
    /// More than one distinct extruder value is assigned
    pub has_multi_extruder_assignments: bool,
    /// Per-layer tool changes are recorded
    pub has_layer_tool_changes: bool,
    /// Per-triangle paint data is present
    pub has_paint_data: bool,
    /// Some model file has `type="other"` objects
    pub has_modifier_parts: bool,
    /// The main build has `printable="0"` items
    pub has_non_printable_items: bool,
    /// Highest assigned extruder number, at least 1
    pub assigned_extruder_count: usize,
    /// Distinct extruder numbers in use
    pub active_extruders: Vec<u32>,
}

impl ProbeReport {
    /// Probe a package
    ///
    /// A probe that fails records its neutral default and logs a warning; the
    /// report itself never fails.
    pub fn probe<R: Read + Seek>(package: &mut Package<R>, paint_scan_limit: u64) -> Self {
        let settings = match ModelSettings::load(package) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "extruder probes fall back to defaults");
                None
            }
        };

        let report = Self {
            is_vendor_format: is_vendor_format(package),
            has_multi_extruder_assignments: settings
                .as_ref()
                .is_some_and(|s| s.distinct_extruders().len() > 1),
            has_layer_tool_changes: or_default("layer_tool_changes", has_layer_tool_changes(package)),
            has_paint_data: or_default("paint_data", has_paint_data(package, paint_scan_limit)),
            has_modifier_parts: or_default("modifier_parts", has_modifier_parts(package)),
            has_non_printable_items: or_default(
                "non_printable_items",
                has_non_printable_items(package),
            ),
            assigned_extruder_count: settings
                .as_ref()
                .map(|s| s.max_extruder() as usize)
                .unwrap_or(1),
            active_extruders: settings
                .as_ref()
                .map(|s| {
                    s.distinct_extruders()
                        .into_iter()
                        .filter_map(|v| v.parse().ok())
                        .collect::<BTreeSet<u32>>()
                        .into_iter()
                        .collect()
                })
                .unwrap_or_default(),
        };
        tracing::debug!(?report, "probed package");
        report
    }

    /// Open and probe a file
    pub fn probe_path(path: &Path, paint_scan_limit: u64) -> Result<Self> {
        let mut package = Package::open_path(path)?;
        Ok(Self::probe(&mut package, paint_scan_limit))
    }

    /// Whether per-object assignments must survive, so geometry is kept as is
    pub fn needs_metadata_preserve(&self, requested_filaments: usize) -> bool {
        self.is_vendor_format
            && (self.has_multi_extruder_assignments
                || self.has_layer_tool_changes
                || (self.has_paint_data && requested_filaments > 1))
    }
}

fn or_default(probe: &str, outcome: Result<bool>) -> bool {
    outcome.unwrap_or_else(|e| {
        tracing::warn!(probe, error = %e, "probe failed, assuming false");
        false
    })
}

/// Whether any vendor side file is present
pub fn is_vendor_format<R: Read + Seek>(package: &Package<R>) -> bool {
    [MODEL_SETTINGS_PATH, SLICE_INFO_PATH, FILAMENT_SEQUENCE_PATH]
        .iter()
        .any(|name| package.has_file(name))
}

/// Whether `custom_gcode_per_layer.xml` records a tool change (`type="2"`)
pub fn has_layer_tool_changes<R: Read + Seek>(package: &mut Package<R>) -> Result<bool> {
    let Some(xml) = package.read_string_opt(CUSTOM_GCODE_PATH)? else {
        return Ok(false);
    };
    let mut found = false;
    edit_elements(&xml, "layer", |ctx| {
        found |= ctx.attr("type") == Some("2");
        Ok(Edit::Keep)
    })?;
    Ok(found)
}

/// Streamed search for paint markers in every `*.model` member
///
/// At most `limit` bytes of each member are read. Chunks overlap by the
/// marker length so a marker split across reads is still found.
pub fn has_paint_data<R: Read + Seek>(package: &mut Package<R>, limit: u64) -> Result<bool> {
    let models: Vec<String> = package
        .file_names()
        .iter()
        .filter(|n| n.ends_with(".model"))
        .cloned()
        .collect();
    for name in models {
        let mut tail: Vec<u8> = Vec::with_capacity(PAINT_NEEDLE.len());
        let found = package.scan_chunks(&name, PAINT_CHUNK, limit, |chunk| {
            let mut window = std::mem::take(&mut tail);
            window.extend_from_slice(chunk);
            if contains(&window, PAINT_NEEDLE) {
                return true;
            }
            let keep = PAINT_NEEDLE.len() - 1;
            tail = window[window.len().saturating_sub(keep)..].to_vec();
            false
        })?;
        if found {
            tracing::debug!(member = %name, "paint data found");
            return Ok(true);
        }
    }
    Ok(false)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether any model file declares a `type="other"` object
pub fn has_modifier_parts<R: Read + Seek>(package: &mut Package<R>) -> Result<bool> {
    let models: Vec<String> = package
        .file_names()
        .iter()
        .filter(|n| n.ends_with(".model"))
        .cloned()
        .collect();
    for name in models {
        let xml = package.read_string(&name)?;
        let doc = parse_model(&xml, ParseMode::Structure)?;
        if doc.objects.values().any(|o| o.kind == crate::model::ObjectKind::Other) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Whether the main build has a `printable="0"` item
pub fn has_non_printable_items<R: Read + Seek>(package: &mut Package<R>) -> Result<bool> {
    let xml = package.read_model()?;
    let doc = parse_model(&xml, ParseMode::Structure)?;
    Ok(doc.items().iter().any(|item| !item.printable))
}

/// Job-scoped memo of probe reports keyed by source path
#[derive(Debug, Default)]
pub struct ProbeCache {
    reports: HashMap<PathBuf, ProbeReport>,
}

impl ProbeCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// The report for `path`, probing it on first request
    pub fn get_or_probe(&mut self, path: &Path, config: &PipelineConfig) -> Result<&ProbeReport> {
        let report = match self.reports.entry(path.to_path_buf()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                slot.insert(ProbeReport::probe_path(path, config.paint_scan_limit)?)
            }
        };
        Ok(report)
    }
}

/// Embedded preview images of a package
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PreviewIndex {
    /// Plate number → member name; the first image per plate wins
    pub by_plate: BTreeMap<u32, String>,
    /// Best generic preview
    pub best: Option<String>,
}

/// Index images stored under a `Metadata/` directory
pub fn preview_index<R: Read + Seek>(package: &Package<R>) -> PreviewIndex {
    let images: Vec<&String> = package
        .file_names()
        .iter()
        .filter(|n| {
            let lower = n.to_ascii_lowercase();
            PREVIEW_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
                && format!("/{}", lower).contains("/metadata/")
        })
        .collect();

    let mut index = PreviewIndex::default();
    for name in &images {
        if let Some(plate) = plate_number_of(&name.to_ascii_lowercase()) {
            index.by_plate.entry(plate).or_insert_with(|| (*name).clone());
        }
    }
    index.best = images
        .iter()
        .min_by_key(|n| preview_score(n))
        .map(|n| (*n).clone());
    index
}

/// Plate number encoded in a lowercase preview path
fn plate_number_of(lower: &str) -> Option<u32> {
    let bytes = lower.as_bytes();
    for start in 0..bytes.len() {
        for keyword in PREVIEW_KEYWORDS {
            if !bytes[start..].starts_with(keyword.as_bytes()) {
                continue;
            }
            let mut pos = start + keyword.len();
            if matches!(bytes.get(pos), Some(b'_' | b'-'))
                && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)
            {
                pos += 1;
            }
            let digits = leading_digits(&lower[pos..]);
            if !digits.is_empty() {
                return digits.parse().ok();
            }
        }
    }

    let ext_start = lower.rfind('.')?;
    let stem = &lower[..ext_start];
    let digits_len = stem.bytes().rev().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 {
        return None;
    }
    let digits = &stem[stem.len() - digits_len..];
    let sep = stem[..stem.len() - digits_len].bytes().last()?;
    matches!(sep, b'_' | b'-' | b'/')
        .then(|| digits.parse().ok())
        .flatten()
}

fn leading_digits(s: &str) -> &str {
    let end = s.bytes().take_while(u8::is_ascii_digit).count();
    &s[..end]
}

fn preview_score(path: &str) -> (usize, usize) {
    let lower = path.to_ascii_lowercase();
    let rank = PREVIEW_KEYWORDS
        .iter()
        .position(|k| lower.contains(k))
        .unwrap_or(9);
    (rank, lower.len())
}

/// Plate ids that have a `Metadata/plate_N.json` member
pub fn plate_json_ids<R: Read + Seek>(package: &Package<R>) -> BTreeSet<u32> {
    package
        .file_names()
        .iter()
        .filter_map(|name| {
            let lower = name.to_ascii_lowercase();
            let start = lower.rfind("metadata/plate_")?;
            if start != 0 && !lower[..start].ends_with('/') {
                return None;
            }
            lower[start + "metadata/plate_".len()..]
                .strip_suffix(".json")
                .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|d| d.parse().ok())
        })
        .collect()
}
