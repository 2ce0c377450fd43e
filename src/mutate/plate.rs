use super::edit_build_item_tags;
use crate::archive::{ArchiveEdit, MODEL_PATH, Package, copy_archive};
use crate::error::{Error, Result};
use crate::model::{ParseMode, parse_model};
use crate::xml_edit::Edit;
use std::path::Path;

/// Narrow a multi-plate file to one plate
///
/// Every build item is kept so vendor metadata that refers to items by
/// position stays valid; only the target stays printable. A single-plate
/// file is copied unchanged.
pub fn extract_plate(src: &Path, dst: &Path, plate_id: usize) -> Result<()> {
    let mut package = Package::open_path(src)?;
    let model = package.read_model()?;
    let item_count = parse_model(&model, ParseMode::Structure)?.items().len();

    if item_count <= 1 {
        tracing::info!("single plate file, copying");
        return copy_archive(src, dst);
    }
    if plate_id < 1 || plate_id > item_count {
        return Err(Error::PlateNotFound(format!(
            "Plate {} out of range (1-{})",
            plate_id, item_count
        )));
    }

    let (patched, _) = edit_build_item_tags(&model, |index, ctx| {
        let printable = if index == plate_id { "1" } else { "0" };
        Ok(Edit::Attributes(ctx.with_attr("printable", printable)))
    })?;

    let mut edit = ArchiveEdit::new();
    edit.replace(MODEL_PATH, patched);
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(plate = plate_id, "extracted plate");
    Ok(())
}
