//! Uniform scaling and bed recentring

use super::{edit_assemble_items, edit_build_items};
use crate::affine::{Affine3x4, TRANSFORM_TOKENS, format_number};
use crate::archive::{ArchiveEdit, MODEL_PATH, MODEL_SETTINGS_PATH, Package, copy_archive};
use crate::error::{Error, Result};
use crate::xml_edit::{Edit, edit_xml};
use std::path::Path;

/// Percentages this close to 100 are a no-op
const IDENTITY_PERCENT_EPSILON: f64 = 0.001;

/// Recentre deltas below this on both axes are a no-op (mm)
const RECENTER_EPSILON: f64 = 0.001;

fn scale_factor(percent: f64) -> Result<Option<f64>> {
    if !percent.is_finite() || percent <= 0.0 {
        return Err(Error::InvalidRequest(format!(
            "scale_percent must be a positive number, got {}",
            percent
        )));
    }
    if (percent - 100.0).abs() < IDENTITY_PERCENT_EPSILON {
        return Ok(None);
    }
    Ok(Some(percent / 100.0))
}

/// Scale every build item about its own origin
///
/// Assemble poses in the vendor settings get the same factor. At 100% the
/// output is a byte copy of the input.
pub fn apply_uniform_scale(src: &Path, dst: &Path, percent: f64) -> Result<()> {
    let Some(s) = scale_factor(percent)? else {
        return copy_archive(src, dst);
    };
    let factor = Affine3x4::scale(s);

    let mut package = Package::open_path(src)?;
    let model = package.read_model()?;
    let (patched, count) = edit_build_items(&model, |_, ctx| {
        let current = Affine3x4::parse_opt(ctx.attr("transform"));
        Ok(Some(current.compose(&factor).format()))
    })?;

    let mut edit = ArchiveEdit::new();
    edit.replace(MODEL_PATH, patched);
    if let Some(settings) = package.read_string_opt(MODEL_SETTINGS_PATH)? {
        let (patched, _) = edit_assemble_items(&settings, |_, ctx| {
            Ok(ctx
                .attr("transform")
                .map(|t| Affine3x4::parse(t).compose(&factor).format()))
        })?;
        edit.replace(MODEL_SETTINGS_PATH, patched);
    }
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(percent, items = count, "applied uniform scale");
    Ok(())
}

/// Scale the spacing between parts and objects, leaving meshes alone
///
/// Component offsets in the main model are multiplied by the factor, and
/// build/assemble XY translations are spread about their centroid. The
/// slicer's own scale option then scales each mesh, so the assembly keeps
/// its proportions.
pub fn apply_layout_scale(src: &Path, dst: &Path, percent: f64) -> Result<()> {
    let Some(s) = scale_factor(percent)? else {
        return copy_archive(src, dst);
    };

    let mut package = Package::open_path(src)?;
    let model = package.read_model()?;

    let scaled_components = edit_xml(&model, |ctx| {
        if ctx.name != "component" {
            return Ok(Edit::Keep);
        }
        let Some(text) = ctx.attr("transform") else {
            return Ok(Edit::Keep);
        };
        let current = Affine3x4::parse(text);
        let [x, y, z] = current.translation();
        let scaled = current.with_translation([x * s, y * s, z * s]);
        Ok(Edit::Attributes(ctx.with_attr("transform", &scaled.format())))
    })?;

    let mut item_poses = Vec::new();
    edit_build_items(&scaled_components, |_, ctx| {
        item_poses.push(Affine3x4::parse_opt(ctx.attr("transform")).translation());
        Ok(None)
    })?;
    let (cx, cy) = centroid_xy(&item_poses);
    let (patched, _) = edit_build_items(&scaled_components, |_, ctx| {
        let current = Affine3x4::parse_opt(ctx.attr("transform"));
        Ok(Some(spread_about(&current, cx, cy, s).format()))
    })?;

    let mut edit = ArchiveEdit::new();
    edit.replace(MODEL_PATH, patched);

    if let Some(settings) = package.read_string_opt(MODEL_SETTINGS_PATH)? {
        let mut assemble_poses = Vec::new();
        edit_assemble_items(&settings, |_, ctx| {
            if let Some(t) = ctx.attr("transform") {
                assemble_poses.push(Affine3x4::parse(t).translation());
            }
            Ok(None)
        })?;
        let (ax, ay) = centroid_xy(&assemble_poses);
        let (patched, _) = edit_assemble_items(&settings, |_, ctx| {
            Ok(ctx
                .attr("transform")
                .map(|t| spread_about(&Affine3x4::parse(t), ax, ay, s).format()))
        })?;
        edit.replace(MODEL_SETTINGS_PATH, patched);
    }
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(percent, "applied layout scale");
    Ok(())
}

fn centroid_xy(points: &[[f64; 3]]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
    (sx / n, sy / n)
}

fn spread_about(current: &Affine3x4, cx: f64, cy: f64, s: f64) -> Affine3x4 {
    let [x, y, z] = current.translation();
    current.with_translation([cx + (x - cx) * s, cy + (y - cy) * s, z])
}

/// Shift the XY translation of every build item by `(dx, dy)`
///
/// Works on the raw text: only transforms with exactly twelve tokens are
/// touched, and only their X and Y tokens are rewritten.
pub fn recenter_build_items(xml: &str, dx: f64, dy: f64) -> Result<String> {
    if dx.abs() < RECENTER_EPSILON && dy.abs() < RECENTER_EPSILON {
        return Ok(xml.to_string());
    }
    let (patched, _) = edit_build_items(xml, |_, ctx| {
        Ok(ctx.attr("transform").and_then(|t| shift_tokens(t, dx, dy)))
    })?;
    Ok(patched)
}

/// Shift the XY translation of every vendor assemble item by `(dx, dy)`
pub fn recenter_assemble_items(xml: &str, dx: f64, dy: f64) -> Result<String> {
    if dx.abs() < RECENTER_EPSILON && dy.abs() < RECENTER_EPSILON {
        return Ok(xml.to_string());
    }
    let (patched, _) = edit_assemble_items(xml, |_, ctx| {
        Ok(ctx.attr("transform").and_then(|t| shift_tokens(t, dx, dy)))
    })?;
    Ok(patched)
}

fn shift_tokens(text: &str, dx: f64, dy: f64) -> Option<String> {
    let mut tokens: Vec<String> = text.split_whitespace().map(str::to_string).collect();
    if tokens.len() != TRANSFORM_TOKENS {
        return None;
    }
    let x: f64 = tokens[9].parse().ok()?;
    let y: f64 = tokens[10].parse().ok()?;
    tokens[9] = format_number(x + dx);
    tokens[10] = format_number(y + dy);
    Some(tokens.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILD: &str = r#"<model><resources><object id="1"><components><component objectid="2" transform="1 0 0 0 1 0 0 0 1 5 0 0"/></components></object></resources><build><item objectid="1" transform="1 0 0 0 1 0 0 0 1 10 20 3"/><item objectid="1" transform="bogus"/></build></model>"#;

    #[test]
    fn test_recenter_shifts_only_xy() {
        let out = recenter_build_items(BUILD, 5.0, -2.5).unwrap();
        assert!(out.contains(r#"transform="1 0 0 0 1 0 0 0 1 15.0 17.5 3""#));
        // malformed and component transforms untouched
        assert!(out.contains(r#"transform="bogus""#));
        assert!(out.contains(r#"transform="1 0 0 0 1 0 0 0 1 5 0 0""#));
    }

    #[test]
    fn test_recenter_below_threshold_is_noop() {
        assert_eq!(recenter_build_items(BUILD, 0.0005, -0.0009).unwrap(), BUILD);
        let settings = r#"<config><assemble><assemble_item object_id="1" transform="1 0 0 0 1 0 0 0 1 1 1 0"/></assemble></config>"#;
        assert_eq!(recenter_assemble_items(settings, 0.0, 0.0).unwrap(), settings);
        let moved = recenter_assemble_items(settings, 1.0, 1.0).unwrap();
        assert!(moved.contains("1 0 0 0 1 0 0 0 1 2.0 2.0 0"));
    }

    #[test]
    fn test_scale_factor_bounds() {
        assert_eq!(scale_factor(100.0005).unwrap(), None);
        assert_eq!(scale_factor(150.0).unwrap(), Some(1.5));
        assert!(matches!(scale_factor(0.0), Err(Error::InvalidRequest(_))));
        assert!(matches!(scale_factor(f64::NAN), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_spread_about_centroid() {
        let poses = [[100.0, 100.0, 0.0], [200.0, 100.0, 0.0]];
        let (cx, cy) = centroid_xy(&poses);
        assert_eq!((cx, cy), (150.0, 100.0));
        let spread = spread_about(&Affine3x4::translation_of(200.0, 100.0, 4.0), cx, cy, 2.0);
        assert_eq!(spread.translation(), [250.0, 100.0, 4.0]);
    }
}
