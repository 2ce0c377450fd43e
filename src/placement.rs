//! Coordinate-frame disambiguation
//!
//! Slicers disagree on where the bed origin is and on how multi-plate
//! projects are laid out. Bambu-style projects pack every plate into one
//! global space, a fixed grid step apart, and keep a second "assemble" pose
//! per object in the vendor side file. This module works out which frame a
//! file uses and maps every build item into bed-local millimetres, recording
//! how confident that mapping is and which edits it makes safe.
//!
//! Strategies are tried in order and the first that applies wins:
//!
//! 1. single-plate files map directly, recentred from the source printable
//!    area or from bounds evidence
//! 2. per-plate packed translations, when every item's plate has one
//! 3. folding by an inferred packed grid step
//! 4. centring the scene on the bed

use crate::affine::{Aabb, Affine3x4, Point3};
use crate::archive::{PROJECT_SETTINGS_PATH, Package};
use crate::config::BedVolume;
use crate::error::{Error, Result};
use crate::plates::{BasePose, LayoutItem, PlateSet, Scene, SceneValidation};
use crate::profile::printable_area_center;
use crate::vendor::ModelSettings;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

/// Placement frame schema version
pub const FRAME_VERSION: u32 = 2;

/// Name of the canonical and viewer coordinate space
pub const BED_LOCAL_FRAME: &str = "bed_local_xy_mm";

/// Slack allowed when testing origin hypotheses (mm)
const ORIGIN_MARGIN: f64 = 2.0;

/// Upper bound on fold steps per direction
const FOLD_ITERATIONS: usize = 8;

/// A plate translation gap counts as a grid step above this share of the bed
const PACKED_STEP_RATIO: f64 = 0.9;

/// Printable-area centre deltas below this are ignored (mm)
const RECENTER_MIN_DELTA: f64 = 0.5;

/// Below this the recentre offset is treated as absent (mm)
const DIRECT_OFFSET_EPSILON: f64 = 0.01;

/// Assemble translations within the bed plus this margin are not packed (mm)
const NORMAL_RANGE_MARGIN: f64 = 10.0;

/// Containment tolerance for the post-mutation check (mm)
const INSIDE_TOLERANCE: f64 = 1e-6;

/// How far a mapping can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Positions are exact; object editing is safe
    Exact,
    /// Positions are a best guess for display only
    Approximate,
}

/// Strategy that produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Mapping {
    /// Bed-local positions, possibly recentred
    #[serde(rename = "direct")]
    Direct,
    /// `object - packed plate translation + bed centre`
    #[serde(rename = "bambu_plate_translation_offset")]
    PlateTranslationOffset,
    /// Per-axis folding by the packed grid step
    #[serde(rename = "bambu_packed_grid_fold")]
    PackedGridFold,
    /// Scene centred on the bed
    #[serde(rename = "centered_preview_offset")]
    CenteredPreviewOffset,
}

/// Origin convention detected for a direct mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    /// (0,0) is the bed centre
    BedCenter,
    /// (0,0) is the front-left bed corner
    BedCorner,
}

/// Edits a frame makes safe to offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// Moving and rotating objects
    pub object_transform_edit: bool,
    /// Moving the prime tower
    pub prime_tower_edit: bool,
}

/// Canonical placement frame for one layout request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacementFrame {
    /// Schema version
    pub version: u32,
    /// Canonical coordinate space
    pub canonical: &'static str,
    /// Coordinate space of `ui_base_pose`
    pub viewer_frame: &'static str,
    /// Trust level
    pub confidence: Confidence,
    /// Strategy used
    pub mapping: Mapping,
    /// Offset the viewer should apply on top of base poses
    pub offset_xy: [f64; 2],
    /// Safe edits
    pub capabilities: Capabilities,
    /// Origin convention, direct mappings only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_detected: Option<OriginKind>,
    /// Packed translation of the single plate in scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plate_translation_mm: Option<Point3>,
    /// Inferred X grid step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packed_grid_step_x_mm: Option<f64>,
    /// Inferred Y grid step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packed_grid_step_y_mm: Option<f64>,
    /// Human-readable caveats
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl PlacementFrame {
    fn initial(is_multi_plate: bool) -> Self {
        Self {
            version: FRAME_VERSION,
            canonical: BED_LOCAL_FRAME,
            viewer_frame: BED_LOCAL_FRAME,
            confidence: if is_multi_plate {
                Confidence::Approximate
            } else {
                Confidence::Exact
            },
            mapping: Mapping::Direct,
            offset_xy: [0.0, 0.0],
            capabilities: Capabilities {
                object_transform_edit: !is_multi_plate,
                prime_tower_edit: true,
            },
            origin_detected: None,
            plate_translation_mm: None,
            packed_grid_step_x_mm: None,
            packed_grid_step_y_mm: None,
            notes: Vec::new(),
        }
    }
}

/// File-level facts the frame derivation needs
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameContext {
    /// More than one build item
    pub is_multi_plate: bool,
    /// Selected plate, if any
    pub plate_id: Option<usize>,
    /// Target bed
    pub bed: BedVolume,
    /// Packed translation per plate (multi-plate files only)
    pub plate_translations: BTreeMap<usize, Point3>,
    /// Inferred packed grid steps
    pub packed_grid_steps: (Option<f64>, Option<f64>),
    /// Source-to-target printable area recentre offset
    pub recenter_offset: (f64, f64),
    /// Scene bounds from validation
    pub validation_bounds: Option<Aabb>,
}

impl FrameContext {
    /// Gather the context from an opened scene
    pub fn from_scene<R: Read + Seek>(
        scene: &mut Scene<R>,
        bed: BedVolume,
        plate_id: Option<usize>,
        validation_bounds: Option<Aabb>,
    ) -> Result<Self> {
        let plates = scene.parse_plates()?;
        Ok(Self {
            is_multi_plate: plates.is_multi_plate,
            plate_id,
            bed,
            plate_translations: plate_translations(&plates),
            packed_grid_steps: packed_grid_steps(&plates, &bed),
            recenter_offset: bed_recenter_offset(scene.package(), &bed),
            validation_bounds,
        })
    }
}

/// Fold a packed coordinate back towards `[0, bed]`
///
/// Adds `step` while the value is negative, then subtracts it while the
/// value exceeds the bed, each at most eight times.
pub fn fold_packed_coord(value: f64, step: f64, bed_size: f64) -> f64 {
    let bed = bed_size.max(1.0);
    if step <= 0.0 || step.is_nan() {
        return value;
    }
    let mut v = value;
    for _ in 0..FOLD_ITERATIONS {
        if v >= 0.0 {
            break;
        }
        v += step;
    }
    for _ in 0..FOLD_ITERATIONS {
        if v <= bed {
            break;
        }
        v -= step;
    }
    v
}

/// Grid step per axis: the smallest gap above 90% of the bed between sorted
/// distinct plate translations
pub fn packed_grid_steps(plates: &PlateSet, bed: &BedVolume) -> (Option<f64>, Option<f64>) {
    if !plates.is_multi_plate {
        return (None, None);
    }
    let axis_step = |axis: usize, bed_dim: f64| -> Option<f64> {
        let mut values: Vec<f64> = plates.plates.iter().map(|p| p.translation[axis]).collect();
        values.sort_by(f64::total_cmp);
        values.dedup();
        let threshold = bed_dim * PACKED_STEP_RATIO;
        values
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .filter(|d| *d > threshold)
            .min_by(f64::total_cmp)
    };
    (axis_step(0, bed.x), axis_step(1, bed.y))
}

/// Packed translation of every plate of a multi-plate file
pub fn plate_translations(plates: &PlateSet) -> BTreeMap<usize, Point3> {
    if !plates.is_multi_plate {
        return BTreeMap::new();
    }
    plates
        .plates
        .iter()
        .map(|p| (p.plate_id, p.translation))
        .collect()
}

/// Offset that moves a packed plate's translation onto the bed centre
pub fn plate_translation_offset(
    plates: &PlateSet,
    plate_id: usize,
    bed: &BedVolume,
) -> Option<(f64, f64)> {
    let t = plate_translations(plates).remove(&plate_id)?;
    let (cx, cy) = bed.center();
    Some((cx - t[0], cy - t[1]))
}

/// Decide between bed-centre and bed-corner origin from item bounds
///
/// Returns the XY offset to add to file coordinates. When both hypotheses
/// fit, no offset is applied, so a genuinely off-bed corner-origin layout is
/// never masked by a centre correction. When neither fits, the centre
/// convention is assumed.
pub fn detect_origin_offset<'a>(
    bounds: impl IntoIterator<Item = &'a Aabb>,
    bed: &BedVolume,
) -> (f64, f64) {
    let (cx, cy) = bed.center();
    let Some(all) = Aabb::union_all(bounds) else {
        return (cx, cy);
    };
    let fits = |dx: f64, dy: f64| {
        all.min[0] + dx >= -ORIGIN_MARGIN
            && all.max[0] + dx <= bed.x + ORIGIN_MARGIN
            && all.min[1] + dy >= -ORIGIN_MARGIN
            && all.max[1] + dy <= bed.y + ORIGIN_MARGIN
    };
    if fits(0.0, 0.0) {
        (0.0, 0.0)
    } else {
        (cx, cy)
    }
}

/// Offset from the source printable-area centre to the target bed centre
///
/// Reads `printable_area` from the project settings. Returns `(0, 0)` when
/// the settings are missing or unreadable, or when the centres differ by
/// less than half a millimetre on both axes.
pub fn bed_recenter_offset<R: Read + Seek>(package: &mut Package<R>, bed: &BedVolume) -> (f64, f64) {
    let text = match package.read_string_opt(PROJECT_SETTINGS_PATH) {
        Ok(Some(text)) => text,
        Ok(None) => return (0.0, 0.0),
        Err(e) => {
            tracing::debug!(error = %e, "project settings unreadable");
            return (0.0, 0.0);
        }
    };
    let settings: serde_json::Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "project settings are not JSON");
            return (0.0, 0.0);
        }
    };
    let Some((sx, sy)) = settings.get("printable_area").and_then(printable_area_center) else {
        return (0.0, 0.0);
    };
    let (cx, cy) = bed.center();
    let (dx, dy) = (cx - sx, cy - sy);
    if dx.abs() < RECENTER_MIN_DELTA && dy.abs() < RECENTER_MIN_DELTA {
        (0.0, 0.0)
    } else {
        (dx, dy)
    }
}

/// Base pose before frame mapping
///
/// Multi-plate files take XY from the assemble pose when one exists. Z always
/// comes from the build item, as assemble Z can be in project space.
fn base_xyz(item: &LayoutItem, is_multi_plate: bool) -> Point3 {
    let core = item.translation;
    match item.assemble_translation {
        Some(asm) if is_multi_plate => [asm[0], asm[1], core[2]],
        _ => core,
    }
}

fn pose(x: f64, y: f64, z: f64) -> Option<BasePose> {
    Some(BasePose {
        x,
        y,
        z,
        rotate_z_deg: 0.0,
    })
}

/// Pick a frame for `items` and fill in each item's `ui_base_pose`
pub fn derive_placement_frame(items: &mut [LayoutItem], ctx: &FrameContext) -> PlacementFrame {
    let mut frame = PlacementFrame::initial(ctx.is_multi_plate);
    if items.is_empty() {
        return frame;
    }

    if !ctx.is_multi_plate {
        apply_direct(&mut frame, items, ctx);
    } else if !apply_plate_translation(&mut frame, items, ctx) {
        match ctx.packed_grid_steps {
            (Some(sx), Some(sy)) if sx > 0.0 && sy > 0.0 => {
                apply_grid_fold(&mut frame, items, ctx, sx, sy)
            }
            _ => apply_centered(&mut frame, items, ctx),
        }
    }
    tracing::info!(
        strategy = ?frame.mapping,
        confidence = ?frame.confidence,
        items = items.len(),
        "placement frame"
    );
    frame
}

fn apply_direct(frame: &mut PlacementFrame, items: &mut [LayoutItem], ctx: &FrameContext) {
    let (mut ox, mut oy) = ctx.recenter_offset;
    if ox.abs() < DIRECT_OFFSET_EPSILON && oy.abs() < DIRECT_OFFSET_EPSILON {
        (ox, oy) = detect_origin_offset(items.iter().filter_map(|i| i.world_bounds.as_ref()), &ctx.bed);
    }
    frame.confidence = Confidence::Exact;
    frame.mapping = Mapping::Direct;
    frame.offset_xy = [0.0, 0.0];
    frame.origin_detected = Some(if ox.abs() > 1.0 {
        OriginKind::BedCenter
    } else {
        OriginKind::BedCorner
    });
    frame.capabilities = Capabilities {
        object_transform_edit: true,
        prime_tower_edit: true,
    };
    for item in items.iter_mut() {
        let [x, y, z] = base_xyz(item, false);
        item.ui_base_pose = pose(x + ox, y + oy, z);
    }
}

/// Returns false, leaving everything untouched, when some item has no
/// packed plate translation
fn apply_plate_translation(
    frame: &mut PlacementFrame,
    items: &mut [LayoutItem],
    ctx: &FrameContext,
) -> bool {
    if ctx.plate_translations.is_empty()
        || items
            .iter()
            .any(|i| i.build_item_index == 0 || !ctx.plate_translations.contains_key(&i.build_item_index))
    {
        return false;
    }

    let exact = ctx.plate_id.is_some() && items.len() == 1;
    frame.confidence = if exact {
        Confidence::Exact
    } else {
        Confidence::Approximate
    };
    frame.mapping = Mapping::PlateTranslationOffset;
    frame.offset_xy = [0.0, 0.0];
    frame.capabilities = Capabilities {
        object_transform_edit: exact,
        prime_tower_edit: true,
    };
    frame.notes = vec![if exact {
        "Packed multi-plate layout mapped via plate translation offset (exact for the selected plate).".to_string()
    } else {
        "Packed multi-plate layout normalized via plate translation offset; object move/rotate stays disabled until a single plate is selected.".to_string()
    }];
    if items.len() == 1 {
        frame.plate_translation_mm = ctx
            .plate_translations
            .get(&items[0].build_item_index)
            .copied();
    }

    let (cx, cy) = ctx.bed.center();
    for item in items.iter_mut() {
        let Some(pt) = ctx.plate_translations.get(&item.build_item_index) else {
            continue;
        };
        // build-item translation; assemble space uses unrelated offsets
        let [x, y, z] = item.translation;
        item.ui_base_pose = pose(x - pt[0] + cx, y - pt[1] + cy, z);
    }
    true
}

fn apply_grid_fold(
    frame: &mut PlacementFrame,
    items: &mut [LayoutItem],
    ctx: &FrameContext,
    step_x: f64,
    step_y: f64,
) {
    frame.confidence = Confidence::Approximate;
    frame.mapping = Mapping::PackedGridFold;
    frame.packed_grid_step_x_mm = Some(step_x);
    frame.packed_grid_step_y_mm = Some(step_y);
    frame.capabilities = Capabilities {
        object_transform_edit: false,
        prime_tower_edit: true,
    };
    frame.notes = vec![
        "Packed multi-plate layout normalized with inferred grid folding; object move/rotate disabled until exact mapping is available.".to_string(),
    ];
    for item in items.iter_mut() {
        let [x, y, z] = base_xyz(item, true);
        item.ui_base_pose = pose(
            fold_packed_coord(x, step_x, ctx.bed.x),
            fold_packed_coord(y, step_y, ctx.bed.y),
            z,
        );
    }
}

fn apply_centered(frame: &mut PlacementFrame, items: &mut [LayoutItem], ctx: &FrameContext) {
    let multi = ctx.is_multi_plate;
    let center = Aabb::union_all(items.iter().filter_map(|i| i.assemble_world_bounds.as_ref()))
        .or(ctx.validation_bounds)
        .map(|b| b.center_xy())
        .unwrap_or_else(|| {
            let n = items.len().max(1) as f64;
            let (sx, sy) = items.iter().fold((0.0, 0.0), |(sx, sy), i| {
                let [x, y, _] = base_xyz(i, multi);
                (sx + x, sy + y)
            });
            (sx / n, sy / n)
        });

    let (cx, cy) = ctx.bed.center();
    let (ox, oy) = (cx - center.0, cy - center.1);
    frame.confidence = if multi {
        Confidence::Approximate
    } else {
        Confidence::Exact
    };
    frame.mapping = Mapping::CenteredPreviewOffset;
    frame.offset_xy = [ox, oy];
    frame.capabilities = Capabilities {
        object_transform_edit: !multi,
        prime_tower_edit: true,
    };
    if multi {
        frame.notes = vec![
            "Multi-plate preview uses centered normalization; object move/rotate disabled until exact plate-local mapping is available.".to_string(),
        ];
    }
    for item in items.iter_mut() {
        let [x, y, z] = base_xyz(item, multi);
        item.ui_base_pose = pose(x + ox, y + oy, z);
    }
}

/// Everything a placement viewer needs for one file or plate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutReport {
    /// More than one build item
    pub is_multi_plate: bool,
    /// Plate the report is narrowed to
    pub selected_plate_id: Option<usize>,
    /// Target bed
    pub build_volume: BedVolume,
    /// Bounds check of the items in scope
    pub validation: SceneValidation,
    /// Chosen frame
    pub placement_frame: PlacementFrame,
    /// Items in scope with their viewer poses
    pub objects: Vec<LayoutItem>,
}

/// Compute the layout report for a scene
pub fn layout<R: Read + Seek>(
    scene: &mut Scene<R>,
    bed: BedVolume,
    plate_id: Option<usize>,
) -> Result<LayoutReport> {
    let mut objects = scene.list_build_items(plate_id)?;
    let validation = scene.validate_scene_bounds(&bed, plate_id)?;
    let ctx = FrameContext::from_scene(scene, bed, plate_id, Some(validation.bounds))?;
    let placement_frame = derive_placement_frame(&mut objects, &ctx);
    Ok(LayoutReport {
        is_multi_plate: ctx.is_multi_plate,
        selected_plate_id: plate_id,
        build_volume: bed,
        validation,
        placement_frame,
        objects,
    })
}

/// Assemble poses of a file, as index and object-id lookups
#[derive(Default)]
struct AssemblePoses {
    settings: Option<ModelSettings>,
    by_object: BTreeMap<String, Affine3x4>,
}

impl AssemblePoses {
    fn new(settings: Option<ModelSettings>) -> Self {
        let by_object = settings
            .as_ref()
            .map(ModelSettings::assemble_transforms_by_object)
            .unwrap_or_default();
        Self {
            settings,
            by_object,
        }
    }

    fn by_index(&self, index: usize) -> Option<Affine3x4> {
        self.settings
            .as_ref()
            .and_then(|s| s.assemble_transform_by_index(index))
    }

    fn object_id_by_index(&self, index: usize) -> Option<&str> {
        self.settings
            .as_ref()
            .and_then(|s| s.assemble_object_id_by_index(index))
    }

    fn lookup(&self, object_id: &str, index: usize) -> Option<Affine3x4> {
        self.by_object
            .get(object_id)
            .copied()
            .or_else(|| self.by_index(index))
    }

    fn is_empty(&self) -> bool {
        !self
            .settings
            .as_ref()
            .is_some_and(|s| s.assemble.iter().any(|a| a.transform().is_some()))
    }
}

/// Reject a mutated layout in which no printable object lies fully on the bed
///
/// Size overflow from [`Scene::validate_scene_bounds`] fails first. Then
/// each printable item with bounds is tried as is, and shifted by the best
/// available display offset: the baseline plate translation, the centre of
/// the baseline assemble or world bounds, or a detected origin offset. Items
/// whose assemble pose lies far outside the bed (packed coordinates) are
/// checked with that pose instead of the build transform.
pub fn enforce_transformed_bounds(
    file: &Path,
    bed: &BedVolume,
    plate_id: Option<usize>,
    baseline: Option<&Path>,
    depth_limit: usize,
) -> Result<()> {
    let scope = match plate_id {
        Some(id) => format!("plate {}", id),
        None => "model".to_string(),
    };

    let mut scene = Scene::open_path(file, depth_limit)?;
    let validation = scene.validate_scene_bounds(bed, plate_id)?;
    if !validation.build_volume_warnings.is_empty() {
        return Err(Error::OutOfBuildVolume(format!(
            "Object transforms place {} outside build volume: {}",
            scope,
            validation.build_volume_warnings.join("; ")
        )));
    }
    if !validation.warnings.is_empty() {
        tracing::info!(warnings = ?validation.warnings, "post-transform layout warnings");
    }

    let items = match scene.list_build_items(plate_id) {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(error = %e, "skipping transformed item-inside-volume validation");
            return Ok(());
        }
    };
    let candidates: Vec<&LayoutItem> = items
        .iter()
        .filter(|i| i.printable && i.world_bounds.is_some())
        .collect();
    if candidates.is_empty() {
        return Ok(());
    }

    let current = AssemblePoses::new(scene.settings().cloned());
    let mut baseline_scene = match baseline {
        Some(path) => match Scene::open_path(path, depth_limit) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(error = %e, "baseline unreadable, checking without it");
                None
            }
        },
        None => None,
    };
    let baseline_poses = AssemblePoses::new(
        baseline_scene
            .as_ref()
            .and_then(|s| s.settings().cloned()),
    );

    if let Some(id) = plate_id {
        let selected_oid = candidates
            .iter()
            .find(|i| i.build_item_index == id)
            .map(|i| i.object_id.as_str())
            .unwrap_or_default();
        let indexed_oid = current.object_id_by_index(id).unwrap_or_default();
        let keyed = !selected_oid.is_empty() && current.by_object.contains_key(selected_oid);
        if !selected_oid.is_empty() && !indexed_oid.is_empty() && selected_oid != indexed_oid && !keyed {
            tracing::warn!(
                plate = id,
                assemble_object = indexed_oid,
                build_object = selected_oid,
                "skipping strict fully-inside precheck: assemble item does not match build item"
            );
            return Ok(());
        }
    }

    let offset = display_offset(&mut scene, baseline_scene.as_mut(), &baseline_poses, &candidates, bed, plate_id);
    if let (Some((ox, oy)), Some(id)) = (offset, plate_id) {
        tracing::info!(plate = id, ox, oy, "transformed precheck display offset");
    }

    let fully_inside = |item: &LayoutItem| -> bool {
        let Some(mut wb) = item.world_bounds else {
            return false;
        };
        if let (Some(t), Some(local)) = (
            current.lookup(&item.object_id, item.build_item_index),
            item.local_bounds,
        ) {
            let [tx, ty, _] = t.translation();
            let normal_range =
                tx.abs() <= bed.x + NORMAL_RANGE_MARGIN && ty.abs() <= bed.y + NORMAL_RANGE_MARGIN;
            if !normal_range {
                wb = t.transform_aabb(&local);
            }
        }
        if wb.inside_volume(bed.x, bed.y, bed.z, INSIDE_TOLERANCE) {
            return true;
        }
        offset.is_some_and(|(ox, oy)| {
            wb.translated_xy(ox, oy)
                .inside_volume(bed.x, bed.y, bed.z, INSIDE_TOLERANCE)
        })
    };

    if candidates.iter().any(|i| fully_inside(*i)) {
        return Ok(());
    }

    let detail = candidates[0]
        .world_bounds
        .map(|b| format!(" first printable item bounds={:?}..{:?}", b.min, b.max))
        .unwrap_or_default();
    Err(Error::OutOfBuildVolume(format!(
        "Object transforms place {} so no printable object is fully inside the print volume.{}",
        scope, detail
    )))
}

fn display_offset<R: Read + Seek>(
    scene: &mut Scene<R>,
    baseline: Option<&mut Scene<File>>,
    baseline_poses: &AssemblePoses,
    candidates: &[&LayoutItem],
    bed: &BedVolume,
    plate_id: Option<usize>,
) -> Option<(f64, f64)> {
    let (cx, cy) = bed.center();
    let centred = |b: Aabb| {
        let (bx, by) = b.center_xy();
        (cx - bx, cy - by)
    };

    let mut baseline = baseline;
    if let Some(id) = plate_id {
        let plates = match baseline.as_deref_mut() {
            Some(b) => b.parse_plates(),
            None => scene.parse_plates(),
        };
        if let Some(offset) = plates
            .ok()
            .and_then(|p| plate_translation_offset(&p, id, bed))
        {
            return Some(offset);
        }

        if !baseline_poses.is_empty() {
            let boxes: Vec<Aabb> = candidates
                .iter()
                .filter_map(|i| {
                    let t = baseline_poses.lookup(&i.object_id, i.build_item_index)?;
                    Some(t.transform_aabb(&i.local_bounds?))
                })
                .collect();
            if let Some(all) = Aabb::union_all(&boxes) {
                return Some(centred(all));
            }
        }

        if let Some(b) = baseline.as_deref_mut() {
            let boxes: Vec<Aabb> = b
                .list_build_items(Some(id))
                .unwrap_or_default()
                .into_iter()
                .filter(|i| i.printable)
                .filter_map(|i| i.world_bounds)
                .collect();
            if let Some(all) = Aabb::union_all(&boxes) {
                return Some(centred(all));
            }
        }
    }

    let (ox, oy) = detect_origin_offset(candidates.iter().filter_map(|i| i.world_bounds.as_ref()), bed);
    (ox.abs() > 1e-6 || oy.abs() > 1e-6).then_some((ox, oy))
}
