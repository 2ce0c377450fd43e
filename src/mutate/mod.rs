//! Archive mutations
//!
//! Every operation reads a source 3MF and writes a new one. Only the XML
//! members that encode the change are rewritten, through the streaming
//! patcher in [`crate::xml_edit`]; all other members are raw-copied so their
//! compressed bytes are untouched.

mod copies;
mod plate;
mod scale;
mod strip;

pub use copies::{CopyLayout, apply_copies};
pub use plate::extract_plate;
pub use scale::{apply_layout_scale, apply_uniform_scale, recenter_assemble_items, recenter_build_items};
pub use strip::{strip_modifier_parts, strip_non_printable_items};

use crate::affine::Affine3x4;
use crate::archive::{ArchiveEdit, MODEL_PATH, MODEL_SETTINGS_PATH, Package};
use crate::error::{Error, Result};
use crate::xml_edit::{Edit, ElementContext, edit_xml};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Rotations smaller than this are treated as none (degrees)
const ROTATION_EPSILON: f64 = 1e-9;

/// One requested move of a build item
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectTransform {
    /// 1-based build item position
    pub build_item_index: usize,
    /// Object id the caller expects at that position
    pub object_id: Option<String>,
    /// X delta in millimetres
    pub translate_x_mm: f64,
    /// Y delta in millimetres
    pub translate_y_mm: f64,
    /// Z rotation delta in degrees, about the object's own origin
    pub rotate_z_deg: f64,
}

impl ObjectTransform {
    /// The item's new transform
    ///
    /// The rotation is composed on the object side, so the object turns in
    /// place; the translation is then added to the result.
    pub fn apply_to(&self, current: &Affine3x4) -> Affine3x4 {
        let rotated = if self.rotate_z_deg.abs() > ROTATION_EPSILON {
            current.compose(&Affine3x4::rotation_z(self.rotate_z_deg))
        } else {
            *current
        };
        rotated.translated_xy(self.translate_x_mm, self.translate_y_mm)
    }
}

/// One applied move
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedTransform {
    /// 1-based build item position
    pub build_item_index: usize,
    /// Object id found at that position
    pub object_id: String,
    /// X delta in millimetres
    pub translate_x_mm: f64,
    /// Y delta in millimetres
    pub translate_y_mm: f64,
    /// Z rotation delta in degrees
    pub rotate_z_deg: f64,
    /// Resulting `transform` attribute
    pub transform: String,
}

/// Outcome of [`apply_object_transforms`]
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ApplyReport {
    /// Number of items moved
    pub applied_count: usize,
    /// Moves in build order
    pub applied: Vec<AppliedTransform>,
}

/// Move and rotate build items
///
/// The same deltas are applied to the vendor assemble poses so slicers that
/// prefer those stay in sync. An assemble item is matched by object id when
/// that id belongs to exactly one moved item, else by its position.
///
/// # Errors
///
/// - [`Error::InvalidRequest`] for an empty list
/// - [`Error::InvalidIndex`] for an index below 1 or past the last item
/// - [`Error::DuplicateIndex`] when an index repeats
/// - [`Error::ObjectIdMismatch`] when an expected object id differs
pub fn apply_object_transforms(
    src: &Path,
    dst: &Path,
    transforms: &[ObjectTransform],
) -> Result<ApplyReport> {
    let requested = index_requests(transforms)?;

    let mut package = Package::open_path(src)?;
    let model = package.read_model()?;

    let mut applied = Vec::new();
    let (patched, _) = edit_build_items(&model, |index, ctx| {
        let Some(request) = requested.get(&index) else {
            return Ok(None);
        };
        let actual = ctx.attr("objectid").unwrap_or_default();
        if let Some(expected) = request.object_id.as_deref() {
            if !expected.is_empty() && !actual.is_empty() && expected != actual {
                return Err(Error::ObjectIdMismatch {
                    index,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        let current = Affine3x4::parse_opt(ctx.attr("transform"));
        let transform = request.apply_to(&current).format();
        applied.push(AppliedTransform {
            build_item_index: index,
            object_id: actual.to_string(),
            translate_x_mm: request.translate_x_mm,
            translate_y_mm: request.translate_y_mm,
            rotate_z_deg: request.rotate_z_deg,
            transform: transform.clone(),
        });
        Ok(Some(transform))
    })?;

    let seen: BTreeSet<usize> = applied.iter().map(|a| a.build_item_index).collect();
    let missing: Vec<usize> = requested.keys().filter(|i| !seen.contains(i)).copied().collect();
    if !missing.is_empty() {
        return Err(Error::InvalidIndex(format!(
            "Invalid build_item_index values: {:?}",
            missing
        )));
    }

    let mut edit = ArchiveEdit::new();
    edit.replace(MODEL_PATH, patched);
    if let Some(settings) = package.read_string_opt(MODEL_SETTINGS_PATH)? {
        match patch_assemble_moves(&settings, &requested, &applied) {
            Ok(updated) => {
                edit.replace(MODEL_SETTINGS_PATH, updated);
            }
            Err(e) => {
                tracing::warn!(error = %e, "assemble transforms left unchanged");
            }
        }
    }
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(applied = applied.len(), "applied object transforms");
    Ok(ApplyReport {
        applied_count: applied.len(),
        applied,
    })
}

fn index_requests(transforms: &[ObjectTransform]) -> Result<BTreeMap<usize, &ObjectTransform>> {
    if transforms.is_empty() {
        return Err(Error::InvalidRequest("object_transforms cannot be empty".to_string()));
    }
    let mut by_index = BTreeMap::new();
    for t in transforms {
        if t.build_item_index < 1 {
            return Err(Error::InvalidIndex("build_item_index must be >= 1".to_string()));
        }
        if by_index.insert(t.build_item_index, t).is_some() {
            return Err(Error::DuplicateIndex(t.build_item_index));
        }
    }
    Ok(by_index)
}

fn patch_assemble_moves(
    xml: &str,
    requested: &BTreeMap<usize, &ObjectTransform>,
    applied: &[AppliedTransform],
) -> Result<String> {
    let mut by_object: BTreeMap<&str, &ObjectTransform> = BTreeMap::new();
    let mut duplicates: HashSet<&str> = HashSet::new();
    for a in applied {
        let Some(request) = requested.get(&a.build_item_index) else {
            continue;
        };
        if by_object.insert(a.object_id.as_str(), request).is_some() {
            duplicates.insert(a.object_id.as_str());
        }
    }
    for id in duplicates {
        by_object.remove(id);
    }

    let (patched, _) = edit_assemble_items(xml, |position, ctx| {
        let request = ctx
            .attr("object_id")
            .and_then(|id| by_object.get(id))
            .or_else(|| requested.get(&position));
        let (Some(request), Some(text)) = (request, ctx.attr("transform")) else {
            return Ok(None);
        };
        Ok(Some(request.apply_to(&Affine3x4::parse(text)).format()))
    })?;
    Ok(patched)
}

/// Visit `<item>` elements inside `<build>`
///
/// `visit` receives each item's 1-based position. Component `<item>`s
/// elsewhere are not counted. Returns the document and the item count.
pub(crate) fn edit_build_item_tags<F>(xml: &str, mut visit: F) -> Result<(String, usize)>
where
    F: FnMut(usize, &ElementContext<'_>) -> Result<Edit>,
{
    let mut count = 0usize;
    let mut saw_build = false;
    let patched = edit_xml(xml, |ctx| {
        if ctx.name == "build" {
            saw_build = true;
        }
        if ctx.name != "item" || !ctx.parent_is("build") {
            return Ok(Edit::Keep);
        }
        count += 1;
        visit(count, ctx)
    })?;
    if !saw_build {
        return Err(Error::MissingBuild);
    }
    Ok((patched, count))
}

/// Rewrite the `transform` of build items
///
/// `visit` returns the new attribute value, or `None` to leave the item
/// alone.
pub(crate) fn edit_build_items<F>(xml: &str, mut visit: F) -> Result<(String, usize)>
where
    F: FnMut(usize, &ElementContext<'_>) -> Result<Option<String>>,
{
    edit_build_item_tags(xml, |index, ctx| {
        Ok(match visit(index, ctx)? {
            Some(t) => Edit::Attributes(ctx.with_attr("transform", &t)),
            None => Edit::Keep,
        })
    })
}

/// Rewrite the `transform` of vendor `<assemble_item>` elements
///
/// Positions are 1-based and count every assemble item.
pub(crate) fn edit_assemble_items<F>(xml: &str, mut visit: F) -> Result<(String, usize)>
where
    F: FnMut(usize, &ElementContext<'_>) -> Result<Option<String>>,
{
    let mut count = 0usize;
    let patched = edit_xml(xml, |ctx| {
        if ctx.name != "assemble_item" {
            return Ok(Edit::Keep);
        }
        count += 1;
        Ok(match visit(count, ctx)? {
            Some(t) => Edit::Attributes(ctx.with_attr("transform", &t)),
            None => Edit::Keep,
        })
    })?;
    Ok((patched, count))
}
