use super::{edit_build_item_tags, recenter_assemble_items};
use crate::affine::{Aabb, Affine3x4};
use crate::archive::{ArchiveEdit, MODEL_PATH, MODEL_SETTINGS_PATH, copy_archive};
use crate::config::{BedVolume, DEFAULT_NESTING_DEPTH};
use crate::error::{Error, Result};
use crate::plates::Scene;
use crate::xml::get_local_name;
use crate::xml_edit::{Edit, append_children};
use serde::Serialize;
use std::path::Path;

/// Grid chosen by [`apply_copies`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CopyLayout {
    /// Columns in the grid
    pub cols: usize,
    /// Rows in the grid
    pub rows: usize,
    /// Whether the grid fits the bed; nothing is written when it does not
    pub fits_bed: bool,
}

impl CopyLayout {
    /// Smallest near-square grid holding `count` cells
    pub fn for_count(count: usize) -> Self {
        let cols = (count as f64).sqrt().ceil().max(1.0) as usize;
        let rows = count.div_ceil(cols).max(1);
        Self {
            cols,
            rows,
            fits_bed: true,
        }
    }
}

/// Duplicate the printable part of the scene into a grid centred on the bed
///
/// `scale` is the factor the slicer will apply to each mesh; it widens the
/// cells so scaled copies do not collide. Non-printable items are left
/// where they are.
pub fn apply_copies(
    src: &Path,
    dst: &Path,
    count: usize,
    spacing: f64,
    scale: f64,
    bed: &BedVolume,
) -> Result<CopyLayout> {
    if count == 0 {
        return Err(Error::InvalidRequest("copies must be >= 1".to_string()));
    }
    if !scale.is_finite() || scale <= 0.0 {
        return Err(Error::InvalidRequest(format!("copy scale must be positive, got {}", scale)));
    }
    let mut layout = CopyLayout::for_count(count);
    if count == 1 {
        copy_archive(src, dst)?;
        return Ok(layout);
    }

    let mut scene = Scene::open_path(src, DEFAULT_NESTING_DEPTH)?;
    let mut footprint = Aabb::empty();
    for item in scene.items().iter().filter(|i| i.printable) {
        if let Some(local) = scene.item_local_bounds(item) {
            footprint = footprint.union(&item.transform.transform_aabb(&local));
        }
    }
    if footprint.is_empty() {
        return Err(Error::InvalidRequest("no printable geometry to copy".to_string()));
    }

    let size = footprint.size();
    let (cell_w, cell_h) = (size[0] * scale, size[1] * scale);
    let total_w = layout.cols as f64 * cell_w + (layout.cols - 1) as f64 * spacing;
    let total_h = layout.rows as f64 * cell_h + (layout.rows - 1) as f64 * spacing;
    if total_w > bed.x || total_h > bed.y {
        layout.fits_bed = false;
        tracing::warn!(count, total_w, total_h, "copy grid does not fit the bed");
        return Ok(layout);
    }

    let (scene_x, scene_y) = footprint.center_xy();
    let (bed_x, bed_y) = bed.center();
    let first_x = bed_x - total_w / 2.0 + cell_w / 2.0;
    let first_y = bed_y + total_h / 2.0 - cell_h / 2.0;
    let shifts: Vec<(f64, f64)> = (0..count)
        .map(|k| {
            let (col, row) = (k % layout.cols, k / layout.cols);
            (
                first_x + col as f64 * (cell_w + spacing) - scene_x,
                first_y - row as f64 * (cell_h + spacing) - scene_y,
            )
        })
        .collect();
    let (first_dx, first_dy) = shifts[0];

    let package = scene.package();
    let model = package.read_model()?;
    let mut templates = Vec::new();
    let (moved, _) = edit_build_item_tags(&model, |_, ctx| {
        if ctx.attr("printable").map(str::trim) == Some("0") {
            return Ok(Edit::Keep);
        }
        let current = Affine3x4::parse_opt(ctx.attr("transform"));
        templates.push((ctx.attributes.to_vec(), current));
        let placed = current.translated_xy(first_dx, first_dy);
        Ok(Edit::Attributes(ctx.with_attr("transform", &placed.format())))
    })?;

    let mut extra = Vec::with_capacity((count - 1) * templates.len());
    for &(dx, dy) in &shifts[1..] {
        for (attrs, current) in &templates {
            extra.push(copy_attributes(attrs, &current.translated_xy(dx, dy)));
        }
    }
    let patched = append_children(&moved, "build", "item", &extra)?;

    let mut edit = ArchiveEdit::new();
    edit.replace(MODEL_PATH, patched);
    if let Some(settings) = package.read_string_opt(MODEL_SETTINGS_PATH)? {
        edit.replace(MODEL_SETTINGS_PATH, recenter_assemble_items(&settings, first_dx, first_dy)?);
    }
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(count, cols = layout.cols, rows = layout.rows, "applied copies");
    Ok(layout)
}

/// Attributes for a duplicated item: same object, new transform, no UUID
fn copy_attributes(attrs: &[(String, String)], transform: &Affine3x4) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = attrs
        .iter()
        .filter(|(k, _)| get_local_name(k) != "UUID" && get_local_name(k) != "transform")
        .cloned()
        .collect();
    out.push(("transform".to_string(), transform.format()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::Package;
    use crate::model::{ParseMode, parse_model};
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    const MODEL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02" xmlns:p="http://schemas.microsoft.com/3dmanufacturing/production/2015/06">
 <resources>
  <object id="1" type="model"><mesh><vertices><vertex x="-10" y="-10" z="0"/><vertex x="10" y="-10" z="0"/><vertex x="10" y="10" z="0"/><vertex x="-10" y="10" z="20"/></vertices><triangles><triangle v1="0" v2="1" v3="2"/><triangle v1="0" v2="2" v3="3"/></triangles></mesh></object>
 </resources>
 <build>
  <item objectid="1" p:UUID="a-b-c" transform="1 0 0 0 1 0 0 0 1 40 40 0"/>
  <item objectid="1" printable="0" transform="1 0 0 0 1 0 0 0 1 200 200 0"/>
 </build>
</model>"#;

    fn fixture(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("single.3mf");
        let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file(MODEL_PATH, SimpleFileOptions::default()).unwrap();
        zip.write_all(MODEL.as_bytes()).unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_grid_shape() {
        assert_eq!((CopyLayout::for_count(1).cols, CopyLayout::for_count(1).rows), (1, 1));
        assert_eq!((CopyLayout::for_count(4).cols, CopyLayout::for_count(4).rows), (2, 2));
        assert_eq!((CopyLayout::for_count(5).cols, CopyLayout::for_count(5).rows), (3, 2));
        assert_eq!((CopyLayout::for_count(10).cols, CopyLayout::for_count(10).rows), (4, 3));
    }

    #[test]
    fn test_apply_copies_grid() {
        let dir = TempDir::new().unwrap();
        let src = fixture(&dir);
        let dst = dir.path().join("copies.3mf");
        let layout = apply_copies(&src, &dst, 4, 5.0, 1.0, &BedVolume::default()).unwrap();
        assert_eq!(layout, CopyLayout { cols: 2, rows: 2, fits_bed: true });

        let mut out = Package::open_path(&dst).unwrap();
        let xml = out.read_model().unwrap();
        assert_eq!(xml.matches("p:UUID").count(), 1);
        let doc = parse_model(&xml, ParseMode::Structure).unwrap();
        let printable: Vec<[f64; 3]> = doc
            .items()
            .iter()
            .filter(|i| i.printable)
            .map(|i| i.transform.translation())
            .collect();
        // 20mm parts with 5mm gaps: centres at 135 +/- 12.5
        assert_eq!(
            printable,
            vec![
                [122.5, 147.5, 0.0],
                [147.5, 147.5, 0.0],
                [122.5, 122.5, 0.0],
                [147.5, 122.5, 0.0],
            ]
        );
        // the non-printable item is untouched
        assert_eq!(doc.items()[1].transform.translation(), [200.0, 200.0, 0.0]);
    }

    #[test]
    fn test_apply_copies_too_large() {
        let dir = TempDir::new().unwrap();
        let src = fixture(&dir);
        let dst = dir.path().join("copies.3mf");
        let layout = apply_copies(&src, &dst, 100, 5.0, 2.0, &BedVolume::default()).unwrap();
        assert!(!layout.fits_bed);
        assert!(!dst.exists());
    }
}
