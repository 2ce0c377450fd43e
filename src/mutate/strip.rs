//! Removal of modifier volumes and non-printable items

use super::edit_build_item_tags;
use crate::archive::{ArchiveEdit, MODEL_PATH, Package, member_name};
use crate::error::Result;
use crate::model::{ModelDoc, ParseMode, parse_model};
use crate::xml_edit::{Edit, edit_xml};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Relationships of the main model part
const MODEL_RELS_PATH: &str = "3D/_rels/3dmodel.model.rels";

/// Drop modifier volumes from a vendor project
///
/// Modifiers are `type="other"` objects in component sub-models. They are
/// removed from those sub-models, and main-model components pointing at them
/// are dropped. A file without modifiers is written unchanged.
pub fn strip_modifier_parts(src: &Path, dst: &Path) -> Result<()> {
    let mut package = Package::open_path(src)?;
    let sub_models: Vec<String> = package
        .file_names()
        .iter()
        .filter(|n| n.ends_with(".model") && n.as_str() != MODEL_PATH)
        .cloned()
        .collect();

    let mut modifier_ids = HashSet::new();
    let mut edit = ArchiveEdit::new();
    for name in &sub_models {
        let xml = package.read_string(name)?;
        let mut found = false;
        let patched = edit_xml(&xml, |ctx| {
            if ctx.name == "object" && ctx.attr("type") == Some("other") {
                if let Some(id) = ctx.attr("id") {
                    modifier_ids.insert(id.to_string());
                }
                found = true;
                return Ok(Edit::Drop);
            }
            Ok(Edit::Keep)
        })?;
        if found {
            edit.replace(name.as_str(), patched);
        }
    }

    if modifier_ids.is_empty() {
        return package.write_edited_to_path(dst, &edit);
    }

    let model = package.read_model()?;
    let patched = edit_xml(&model, |ctx| {
        let is_modifier = ctx.name == "component"
            && ctx.attr("objectid").is_some_and(|id| modifier_ids.contains(id));
        Ok(if is_modifier { Edit::Drop } else { Edit::Keep })
    })?;
    edit.replace(MODEL_PATH, patched);
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(modifiers = modifier_ids.len(), "stripped modifier parts");
    Ok(())
}

/// Drop build items marked `printable="0"`
///
/// Objects only those items used are removed with them, as are sub-model
/// files no remaining object points at. Returns `false` and writes nothing
/// when every item is printable.
pub fn strip_non_printable_items(src: &Path, dst: &Path) -> Result<bool> {
    let mut package = Package::open_path(src)?;
    if !package.has_file(MODEL_PATH) {
        return Ok(false);
    }
    let model = package.read_model()?;
    let doc = parse_model(&model, ParseMode::Structure)?;

    let (kept, dropped): (Vec<_>, Vec<_>) = doc.items().iter().partition(|i| i.printable);
    if dropped.is_empty() {
        return Ok(false);
    }

    let (keep_objects, keep_paths) = reachable(&doc, kept.iter().map(|&i| i.object_id.as_str()));
    let (drop_objects, drop_paths) = reachable(&doc, dropped.iter().map(|&i| i.object_id.as_str()));
    let orphan_objects: HashSet<&str> = drop_objects
        .iter()
        .filter(|id| !keep_objects.contains(*id))
        .copied()
        .collect();
    let orphan_paths: BTreeSet<String> = drop_paths.difference(&keep_paths).cloned().collect();

    let (patched, _) = edit_build_item_tags(&model, |_, ctx| {
        Ok(if ctx.attr("printable").map(str::trim) == Some("0") {
            Edit::Drop
        } else {
            Edit::Keep
        })
    })?;
    let patched = edit_xml(&patched, |ctx| {
        let orphan = ctx.name == "object"
            && ctx.parent_is("resources")
            && ctx.attr("id").is_some_and(|id| orphan_objects.contains(id));
        Ok(if orphan { Edit::Drop } else { Edit::Keep })
    })?;

    let mut edit = ArchiveEdit::new();
    edit.replace(MODEL_PATH, patched);
    for path in &orphan_paths {
        edit.remove(path.as_str());
    }
    if !orphan_paths.is_empty() {
        if let Some(rels) = package.read_string_opt(MODEL_RELS_PATH)? {
            let patched = edit_xml(&rels, |ctx| {
                let orphan = ctx.name == "Relationship"
                    && ctx
                        .attr("Target")
                        .is_some_and(|t| orphan_paths.contains(&member_name(t)));
                Ok(if orphan { Edit::Drop } else { Edit::Keep })
            })?;
            edit.replace(MODEL_RELS_PATH, patched);
        }
    }
    package.write_edited_to_path(dst, &edit)?;

    tracing::info!(
        removed_items = dropped.len(),
        removed_objects = orphan_objects.len(),
        removed_models = orphan_paths.len(),
        "stripped non-printable items"
    );
    Ok(true)
}

/// Main-model objects reachable from `roots` through local components, and
/// the sub-model members their external components point at
fn reachable<'a>(
    doc: &'a ModelDoc,
    roots: impl Iterator<Item = &'a str>,
) -> (HashSet<&'a str>, BTreeSet<String>) {
    let mut objects = HashSet::new();
    let mut paths = BTreeSet::new();
    let mut stack: Vec<&str> = roots.collect();
    while let Some(id) = stack.pop() {
        if !objects.insert(id) {
            continue;
        }
        let Some(object) = doc.object(id) else {
            continue;
        };
        for component in &object.components {
            match component.path.as_deref().map(member_name) {
                Some(path) if path != MODEL_PATH => {
                    paths.insert(path);
                }
                _ => stack.push(component.object_id.as_str()),
            }
        }
    }
    (objects, paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    const MAIN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02" xmlns:p="http://schemas.microsoft.com/3dmanufacturing/production/2015/06">
 <resources>
  <object id="10" type="model"><components><component p:path="/3D/Objects/a.model" objectid="1"/><component p:path="/3D/Objects/a.model" objectid="2"/></components></object>
  <object id="20" type="model"><components><component p:path="/3D/Objects/b.model" objectid="1"/></components></object>
 </resources>
 <build>
  <item objectid="10" printable="1"/>
  <item objectid="20" printable="0"/>
 </build>
</model>"#;

    const SUB_A: &str = r#"<model><resources><object id="1" type="model"><mesh/></object><object id="2" type="other"><mesh/></object></resources></model>"#;
    const SUB_B: &str = r#"<model><resources><object id="1" type="model"><mesh/></object></resources></model>"#;
    const RELS: &str = r#"<Relationships><Relationship Target="/3D/Objects/a.model" Id="rel-1" Type="http://schemas.microsoft.com/3dmanufacturing/2013/01/3dmodel"/><Relationship Target="/3D/Objects/b.model" Id="rel-2" Type="http://schemas.microsoft.com/3dmanufacturing/2013/01/3dmodel"/></Relationships>"#;

    fn fixture(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("vendor.3mf");
        let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
        for (name, body) in [
            (MODEL_PATH, MAIN),
            ("3D/Objects/a.model", SUB_A),
            ("3D/Objects/b.model", SUB_B),
            (MODEL_RELS_PATH, RELS),
        ] {
            zip.start_file(name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_strip_modifier_parts() {
        let dir = TempDir::new().unwrap();
        let src = fixture(&dir);
        let dst = dir.path().join("out.3mf");
        strip_modifier_parts(&src, &dst).unwrap();

        let mut out = Package::open_path(&dst).unwrap();
        let sub = out.read_string("3D/Objects/a.model").unwrap();
        assert!(!sub.contains(r#"type="other""#));
        let doc = parse_model(&out.read_model().unwrap(), ParseMode::Structure).unwrap();
        assert_eq!(doc.object("10").unwrap().components.len(), 1);
        assert_eq!(doc.object("20").unwrap().components.len(), 1);
    }

    #[test]
    fn test_strip_non_printable_items() {
        let dir = TempDir::new().unwrap();
        let src = fixture(&dir);
        let dst = dir.path().join("out.3mf");
        assert!(strip_non_printable_items(&src, &dst).unwrap());

        let mut out = Package::open_path(&dst).unwrap();
        let doc = parse_model(&out.read_model().unwrap(), ParseMode::Structure).unwrap();
        assert_eq!(doc.items().len(), 1);
        assert!(doc.object("10").is_some());
        assert!(doc.object("20").is_none());
        assert!(out.has_file("3D/Objects/a.model"));
        assert!(!out.has_file("3D/Objects/b.model"));
        let rels = out.read_string(MODEL_RELS_PATH).unwrap();
        assert!(rels.contains("a.model"));
        assert!(!rels.contains("b.model"));
    }

    #[test]
    fn test_strip_non_printable_noop() {
        let dir = TempDir::new().unwrap();
        let src = fixture(&dir);
        let once = dir.path().join("once.3mf");
        assert!(strip_non_printable_items(&src, &once).unwrap());
        let twice = dir.path().join("twice.3mf");
        assert!(!strip_non_printable_items(&once, &twice).unwrap());
        assert!(!twice.exists());
    }
}
