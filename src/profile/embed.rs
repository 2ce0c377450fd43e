//! Settings assembly and injection into the output archive

use super::settings::{SettingsDoc, strip_flow_calibrate};
use super::{EmbedRequest, ProfileSet};
use crate::archive::{
    ArchiveEdit, CUSTOM_GCODE_PATH, CUT_INFORMATION_PATH, FILAMENT_SEQUENCE_PATH, MODEL_PATH,
    MODEL_SETTINGS_PATH, PROJECT_SETTINGS_PATH, Package, SLICE_INFO_PATH,
};
use crate::config::BedVolume;
use crate::error::Result;
use crate::mutate::{recenter_assemble_items, recenter_build_items};
use crate::xml_edit::{Edit, edit_xml};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Recentre only when the bed centre moves more than this (mm)
const RECENTER_MIN_DELTA: f64 = 0.5;

/// Margin past the bed beyond which assemble poses count as packed (mm)
const PACKED_POSE_MARGIN: f64 = 100.0;

/// Index fields that must not go negative
const NON_NEGATIVE_FIELDS: [&str; 6] = [
    "raft_first_layer_expansion",
    "tree_support_wall_count",
    "prime_volume",
    "prime_tower_brim_width",
    "prime_tower_brim_chamfer",
    "prime_tower_brim_chamfer_max_width",
];

/// Filament selectors; slot numbers start at 1
const FILAMENT_INDEX_FIELDS: [&str; 3] =
    ["solid_infill_filament", "sparse_infill_filament", "wall_filament"];

/// Vendor-only G-code hooks the target firmware does not understand
const VENDOR_GCODE_KEYS: [&str; 2] = ["time_lapse_gcode", "machine_pause_gcode"];

/// Per-filament lists every multi-slot document must carry, with fallbacks
const LIST_DEFAULTS: [(&str, &str); 13] = [
    ("filament_type", "PLA"),
    ("filament_colour", "#FFFFFF"),
    ("extruder_colour", "#FFFFFF"),
    ("default_filament_profile", "Snapmaker PLA"),
    ("filament_settings_id", "Snapmaker PLA"),
    ("nozzle_temperature", "210"),
    ("nozzle_temperature_initial_layer", "210"),
    ("bed_temperature", "60"),
    ("bed_temperature_initial_layer", "60"),
    ("cool_plate_temp", "60"),
    ("cool_plate_temp_initial_layer", "60"),
    ("textured_plate_temp", "60"),
    ("textured_plate_temp_initial_layer", "60"),
];

/// What the preserve path knows about the source beyond its settings
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SourceFacts {
    pub assigned_extruders: usize,
    pub has_paint: bool,
}

fn set_preset_ids(doc: &mut SettingsDoc, profiles: &ProfileSet) {
    let printer = profiles.printer_name();
    let process = profiles.process_name();
    doc.insert("printer_settings_id", printer.clone());
    doc.insert("print_settings_id", process.clone());
    doc.insert("default_print_profile", process);
    doc.insert("print_compatible_printers", Value::Array(vec![Value::String(printer)]));
    doc.remove("inherits");
    doc.remove("inherits_group");
}

/// Settings for a file whose own project settings and assignments are kept
///
/// The source document is the base so vendor keys the printer profile does
/// not define survive. Returns the document and its filament slot count.
pub(crate) fn preserving_settings(
    base: SettingsDoc,
    profiles: &ProfileSet,
    request: &EmbedRequest,
    facts: SourceFacts,
    bed: &BedVolume,
) -> (SettingsDoc, usize) {
    let mut doc = base.clone();
    doc.merge(profiles.printer.as_map());
    set_preset_ids(&mut doc, profiles);
    for key in VENDOR_GCODE_KEYS {
        doc.remove(key);
    }

    doc.merge(profiles.process.as_map());
    doc.merge(profiles.filament.as_map());
    doc.merge(&request.filament_settings);
    doc.merge(&request.overrides);
    doc.replicate_wipe_tower_overrides(&base, &request.overrides);

    doc.insert("layer_gcode", "G92 E0");
    doc.insert_default("enable_arc_fitting", "1");
    doc.strip_vendor_filament_gcode();

    for key in NON_NEGATIVE_FIELDS {
        doc.sanitize_index_field(key, 0);
    }
    if base.has_per_plate_wipe_tower() {
        tracing::debug!("keeping per-plate wipe tower positions");
    } else {
        doc.clamp_wipe_tower(bed.x.min(bed.y));
    }
    for key in FILAMENT_INDEX_FIELDS {
        doc.sanitize_index_field(key, 1);
    }

    let slots = facts
        .assigned_extruders
        .max(request.requested_filament_count)
        .max(1);
    for (key, fallback) in LIST_DEFAULTS {
        doc.pad_list(key, slots, &[fallback]);
    }
    if doc.list_len("bed_temperature_initial_layer_single").is_none() {
        let first = match doc.get("bed_temperature_initial_layer") {
            Some(Value::Array(items)) => items.first().cloned(),
            _ => None,
        };
        doc.insert(
            "bed_temperature_initial_layer_single",
            Value::Array(first.into_iter().collect()),
        );
    }

    if facts.has_paint && slots > 1 {
        doc.insert("single_extruder_multi_material", "1");
        doc.insert("ooze_prevention", "0");
        tracing::info!("enabling single-extruder multi-material for painted file");
    } else {
        doc.insert("single_extruder_multi_material", "0");
    }

    doc.sanitize_nil();
    doc.normalize_filament_arrays(slots);
    if !request.enable_flow_calibrate {
        strip_start_gcode_calibration(&mut doc);
    }

    tracing::info!(
        slots,
        requested = request.requested_filament_count,
        assigned = facts.assigned_extruders,
        "built assignment-preserving settings"
    );
    (doc, slots)
}

/// Settings built from the bundled profiles alone
///
/// Used for flattened vendor files and for plain 3MF files. The slot count
/// follows `filament_colour` once padding is done.
pub(crate) fn profile_settings(profiles: &ProfileSet, request: &EmbedRequest) -> (SettingsDoc, usize) {
    let mut doc = profiles.printer.clone();
    doc.merge(profiles.process.as_map());
    doc.merge(profiles.filament.as_map());
    doc.merge(&request.filament_settings);
    doc.merge(&request.overrides);

    doc.insert_default("layer_gcode", "G92 E0");
    doc.insert_default("enable_arc_fitting", "1");
    set_preset_ids(&mut doc, profiles);
    doc.strip_vendor_filament_gcode();
    for key in VENDOR_GCODE_KEYS {
        doc.remove(key);
    }

    doc.sanitize_nil();
    if request.requested_filament_count > 1 {
        doc.pad_filament_arrays(request.requested_filament_count);
    }
    let slots = doc
        .list_len("filament_colour")
        .unwrap_or_else(|| request.requested_filament_count.max(1));
    doc.normalize_filament_arrays(slots);
    if !request.enable_flow_calibrate {
        strip_start_gcode_calibration(&mut doc);
    }
    tracing::debug!(keys = doc.len(), slots, "merged profile settings");
    (doc, slots)
}

fn strip_start_gcode_calibration(doc: &mut SettingsDoc) {
    let Some(Value::String(gcode)) = doc.get("machine_start_gcode") else {
        return;
    };
    let stripped = strip_flow_calibrate(gcode);
    doc.insert("machine_start_gcode", stripped);
    tracing::info!("stripped flow calibration from start G-code");
}

/// Options for [`copy_and_inject`]
#[derive(Debug, Clone, Default)]
pub(crate) struct InjectOptions<'a> {
    pub extruder_remap: Option<&'a BTreeMap<u32, u32>>,
    pub max_extruders: u32,
    pub custom_gcode: Option<String>,
}

/// Copy `src` to `dst` with `settings` as the project settings
///
/// Vendor slice results and plate previews are dropped, the vendor object
/// settings are sanitized, and the layout is shifted when the new printer's
/// bed centre differs from the one the file was laid out for. Nothing is
/// left at `dst` on failure.
pub(crate) fn copy_and_inject(
    src: &Path,
    dst: &Path,
    settings: &SettingsDoc,
    bed: &BedVolume,
    options: &InjectOptions<'_>,
) -> Result<()> {
    let mut package = Package::open_path(src)?;
    let (dx, dy) = recenter_delta(&mut package, settings)?;

    let mut edit = ArchiveEdit::new();
    for name in [SLICE_INFO_PATH, CUT_INFORMATION_PATH, FILAMENT_SEQUENCE_PATH] {
        edit.remove(name);
    }
    for prefix in ["Metadata/plate", "Metadata/top", "Metadata/pick"] {
        edit.remove_prefix(prefix);
    }

    if package.has_file(MODEL_PATH) && (dx != 0.0 || dy != 0.0) {
        let model = package.read_model()?;
        edit.replace(MODEL_PATH, recenter_build_items(&model, dx, dy)?);
    }
    if let Some(xml) = package.read_string_opt(MODEL_SETTINGS_PATH)? {
        let sanitized = match sanitize_model_settings(&xml, options.extruder_remap, options.max_extruders, bed)
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "could not sanitize model settings");
                xml
            }
        };
        edit.replace(MODEL_SETTINGS_PATH, recenter_assemble_items(&sanitized, dx, dy)?);
    }
    if let Some(custom) = options.custom_gcode.as_deref() {
        edit.replace(CUSTOM_GCODE_PATH, custom);
    }
    edit.replace(PROJECT_SETTINGS_PATH, settings.to_json_pretty()?);

    package.write_edited_to_path(dst, &edit)?;
    tracing::debug!(dst = %dst.display(), "injected project settings");
    Ok(())
}

fn recenter_delta<R: std::io::Read + std::io::Seek>(
    package: &mut Package<R>,
    target: &SettingsDoc,
) -> Result<(f64, f64)> {
    let Some(target_center) = target.printable_area_center() else {
        return Ok((0.0, 0.0));
    };
    let source = match package.read_string_opt(PROJECT_SETTINGS_PATH)? {
        Some(text) => SettingsDoc::from_json(&text).ok(),
        None => None,
    };
    let Some(source_center) = source.and_then(|s| s.printable_area_center()) else {
        return Ok((0.0, 0.0));
    };
    let (dx, dy) = (target_center.0 - source_center.0, target_center.1 - source_center.1);
    if dx.abs() > RECENTER_MIN_DELTA || dy.abs() > RECENTER_MIN_DELTA {
        tracing::info!(dx, dy, "recentering layout for the target bed");
        Ok((dx, dy))
    } else {
        Ok((0.0, 0.0))
    }
}

/// Clean vendor object settings that destabilise the slicer
///
/// - non-empty `plater_name` values are cleared
/// - numeric `extruder` values are remapped when the target is a valid slot
/// - assemble poses far outside the bed (packed multi-plate layouts) move to
///   the bed centre at Z 0
pub fn sanitize_model_settings(
    xml: &str,
    extruder_remap: Option<&BTreeMap<u32, u32>>,
    max_extruders: u32,
    bed: &BedVolume,
) -> Result<String> {
    let (center, _) = bed.center();
    let packed_threshold = center * 2.0 + PACKED_POSE_MARGIN;
    let mut changed = 0usize;

    let patched = edit_xml(xml, |ctx| {
        match ctx.name {
            "metadata" => match ctx.attr("key") {
                Some("plater_name") if ctx.attr("value").is_some_and(|v| !v.is_empty()) => {
                    changed += 1;
                    return Ok(Edit::Attributes(ctx.with_attr("value", "")));
                }
                Some("extruder") => {
                    let remapped = ctx
                        .attr("value")
                        .map(str::trim)
                        .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                        .and_then(|v| v.parse::<u32>().ok())
                        .and_then(|src| {
                            let dst = *extruder_remap?.get(&src)?;
                            ((1..=max_extruders).contains(&dst) && dst != src).then_some(dst)
                        });
                    if let Some(dst) = remapped {
                        changed += 1;
                        return Ok(Edit::Attributes(ctx.with_attr("value", &dst.to_string())));
                    }
                }
                _ => {}
            },
            "assemble_item" => {
                if let Some(reset) = ctx
                    .attr("transform")
                    .and_then(|t| reset_packed_pose(t, packed_threshold, center))
                {
                    changed += 1;
                    return Ok(Edit::Attributes(ctx.with_attr("transform", &reset)));
                }
            }
            _ => {}
        }
        Ok(Edit::Keep)
    })?;

    if changed > 0 {
        tracing::info!(changed, "sanitized model settings");
    }
    Ok(patched)
}

fn reset_packed_pose(text: &str, threshold: f64, center: f64) -> Option<String> {
    let mut tokens: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    if tokens.len() != 12 {
        return None;
    }
    let tx: f64 = tokens[9].parse().ok()?;
    let ty: f64 = tokens[10].parse().ok()?;
    if tx.abs() <= threshold && ty.abs() <= threshold {
        return None;
    }
    tokens[9] = format!("{:.6}", center);
    tokens[10] = format!("{:.6}", center);
    tokens[11] = "0".to_string();
    Some(tokens.join(" "))
}

/// The per-layer G-code records of one vendor plate
///
/// Other plates are dropped; the kept plate keeps its id since the slicer
/// selects it by that number. Returns `None` when no plate has that id.
pub fn plate_custom_gcode(xml: &str, vendor_plate_id: u32) -> Result<Option<String>> {
    let wanted = vendor_plate_id.to_string();
    let mut plate_index = 0usize;
    let mut target = None;
    edit_xml(xml, |ctx| {
        if ctx.name == "plate" {
            plate_index += 1;
        } else if ctx.name == "plate_info"
            && ctx.parent_is("plate")
            && target.is_none()
            && ctx.attr("id") == Some(wanted.as_str())
        {
            target = Some(plate_index);
        }
        Ok(Edit::Keep)
    })?;
    let Some(target) = target else {
        tracing::debug!(plate = vendor_plate_id, "no custom G-code for plate");
        return Ok(None);
    };

    let mut seen = 0usize;
    let scoped = edit_xml(xml, |ctx| {
        if ctx.ancestors.len() == 1 && ctx.name == "plate" {
            seen += 1;
            return Ok(if seen == target { Edit::Keep } else { Edit::Drop });
        }
        Ok(Edit::Keep)
    })?;
    tracing::info!(plate = vendor_plate_id, "scoped custom G-code to plate");
    Ok(Some(scoped))
}
