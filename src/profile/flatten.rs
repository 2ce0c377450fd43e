//! Vendor scene flattening
//!
//! Resolves every printable build item to a world-space mesh and writes a
//! plain core-spec 3MF with one object per item. Component assemblies,
//! sub-model files and vendor metadata do not survive; per-object extruder
//! assignments do not either, which is why the merge only takes this path
//! for files that carry none.

use crate::affine::{Aabb, Point3};
use crate::archive::{MODEL_PATH, Package, persist_atomically};
use crate::config::BedVolume;
use crate::error::{Error, Result};
use crate::model::{CORE_NAMESPACE, Mesh, ModelSet, ParseMode};
use crate::mutate::{strip_modifier_parts, strip_non_printable_items};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use std::io::{Seek, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">
  <Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>
  <Default Extension="model" ContentType="application/vnd.ms-package.3dmanufacturing-3dmodel+xml"/>
</Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">
  <Relationship Target="/3D/3dmodel.model" Id="rel0" Type="http://schemas.microsoft.com/3dmanufacturing/2013/01/3dmodel"/>
</Relationships>"#;

/// One flattened object
#[derive(Debug, Clone, Default)]
pub struct FlatObject {
    /// Display name carried into the output
    pub name: Option<String>,
    /// World-space mesh
    pub mesh: Mesh,
}

/// Outcome of [`flatten_scene`]
#[derive(Debug, Clone, PartialEq)]
pub struct FlattenReport {
    /// Objects written
    pub objects: usize,
    /// Triangles written across all objects
    pub triangles: usize,
    /// Offset applied by the build items to centre the scene
    pub offset: Point3,
}

/// Flatten a vendor project into a clean single-plate archive at `dst`
///
/// Non-printable items and modifier volumes are removed first so their
/// geometry is not merged into the printable parts.
pub fn flatten_scene(
    src: &Path,
    dst: &Path,
    bed: &BedVolume,
    depth_limit: usize,
) -> Result<FlattenReport> {
    let work_dir = dst.parent().unwrap_or_else(|| Path::new("."));

    let printable = scratch_file(work_dir)?;
    let mut load_from = src.to_path_buf();
    if strip_non_printable_items(&load_from, printable.path())? {
        tracing::info!("stripped non-printable items before flattening");
        load_from = printable.path().to_path_buf();
    }

    let no_modifiers = scratch_file(work_dir)?;
    strip_modifier_parts(&load_from, no_modifiers.path())?;

    let objects = collect_world_objects(no_modifiers.path(), depth_limit)?;
    let boxes: Vec<Aabb> = objects.iter().filter_map(|o| mesh_bounds(&o.mesh)).collect();
    let bounds = Aabb::union_all(&boxes)
        .ok_or_else(|| Error::Profile("no printable geometry to flatten".to_string()))?;

    let (scene_x, scene_y) = bounds.center_xy();
    let (bed_x, bed_y) = bed.center();
    let offset = [bed_x - scene_x, bed_y - scene_y, -bounds.min[2]];

    persist_atomically(dst, |file| {
        write_core_package(&objects, offset, file)?;
        Ok(())
    })?;

    let report = FlattenReport {
        objects: objects.len(),
        triangles: objects.iter().map(|o| o.mesh.triangles.len()).sum(),
        offset,
    };
    tracing::info!(
        objects = report.objects,
        triangles = report.triangles,
        "flattened scene"
    );
    Ok(report)
}

/// World-space meshes of every printable build item, modifiers excluded
pub fn collect_world_objects(path: &Path, depth_limit: usize) -> Result<Vec<FlatObject>> {
    let mut package = Package::open_path(path)?;
    let mut models = ModelSet::load(&mut package, ParseMode::Full, depth_limit)?;
    let items = models.main().items().to_vec();

    let mut objects = Vec::with_capacity(items.len());
    for item in items.iter().filter(|i| i.printable) {
        let model_path = item.path.as_deref().unwrap_or(MODEL_PATH);
        let mesh = models.object_geometry(
            &mut package,
            model_path,
            &item.object_id,
            &item.transform,
            false,
        )?;
        if mesh.triangles.is_empty() {
            tracing::debug!(object = %item.object_id, "build item has no printable geometry");
            continue;
        }
        let name = models
            .main()
            .object(&item.object_id)
            .and_then(|o| o.name.clone());
        objects.push(FlatObject { name, mesh });
    }
    Ok(objects)
}

fn scratch_file(dir: &Path) -> Result<NamedTempFile> {
    Ok(tempfile::Builder::new()
        .prefix(".flatten-")
        .suffix(".3mf")
        .tempfile_in(dir)?)
}

fn mesh_bounds(mesh: &Mesh) -> Option<Aabb> {
    let mut b = Aabb::empty();
    for v in &mesh.vertices {
        b.include(*v);
    }
    (!b.is_empty()).then_some(b)
}

/// Write a core-only 3MF package
///
/// Each object gets a build item that translates it by `offset`.
pub fn write_core_package<W: Write + Seek>(
    objects: &[FlatObject],
    offset: Point3,
    writer: W,
) -> Result<W> {
    let mut zip = ZipWriter::new(writer);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    zip.start_file("[Content_Types].xml", options)?;
    zip.write_all(CONTENT_TYPES.as_bytes())?;
    zip.start_file("_rels/.rels", options)?;
    zip.write_all(ROOT_RELS.as_bytes())?;

    zip.start_file(MODEL_PATH, options)?;
    write_model_xml(objects, offset, &mut zip)?;

    Ok(zip.finish()?)
}

/// Serialize flattened objects as a core 3MF model document
pub fn write_model_xml<W: Write>(objects: &[FlatObject], offset: Point3, writer: W) -> Result<()> {
    let mut xml = Writer::new_with_indent(writer, b' ', 1);

    xml.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| Error::xml_write(format!("Failed to write XML declaration: {}", e)))?;

    let mut model = BytesStart::new("model");
    model.push_attribute(("unit", "millimeter"));
    model.push_attribute(("xml:lang", "en-US"));
    model.push_attribute(("xmlns", CORE_NAMESPACE));
    start(&mut xml, model)?;

    start(&mut xml, BytesStart::new("resources"))?;
    for (i, object) in objects.iter().enumerate() {
        write_object(&mut xml, i + 1, object)?;
    }
    end(&mut xml, "resources")?;

    let transform = format!(
        "1 0 0 0 1 0 0 0 1 {} {} {}",
        offset[0], offset[1], offset[2]
    );
    start(&mut xml, BytesStart::new("build"))?;
    for i in 0..objects.len() {
        let mut item = BytesStart::new("item");
        item.push_attribute(("objectid", (i + 1).to_string().as_str()));
        item.push_attribute(("transform", transform.as_str()));
        xml.write_event(Event::Empty(item))
            .map_err(|e| Error::xml_write(format!("Failed to write build item: {}", e)))?;
    }
    end(&mut xml, "build")?;

    end(&mut xml, "model")
}

fn write_object<W: Write>(xml: &mut Writer<W>, id: usize, object: &FlatObject) -> Result<()> {
    let mut elem = BytesStart::new("object");
    elem.push_attribute(("id", id.to_string().as_str()));
    elem.push_attribute(("type", "model"));
    if let Some(name) = object.name.as_deref() {
        elem.push_attribute(("name", name));
    }
    start(xml, elem)?;
    start(xml, BytesStart::new("mesh"))?;

    start(xml, BytesStart::new("vertices"))?;
    for v in &object.mesh.vertices {
        let mut vertex = BytesStart::new("vertex");
        vertex.push_attribute(("x", v[0].to_string().as_str()));
        vertex.push_attribute(("y", v[1].to_string().as_str()));
        vertex.push_attribute(("z", v[2].to_string().as_str()));
        xml.write_event(Event::Empty(vertex))
            .map_err(|e| Error::xml_write(format!("Failed to write vertex: {}", e)))?;
    }
    end(xml, "vertices")?;

    start(xml, BytesStart::new("triangles"))?;
    for t in &object.mesh.triangles {
        let mut triangle = BytesStart::new("triangle");
        triangle.push_attribute(("v1", t[0].to_string().as_str()));
        triangle.push_attribute(("v2", t[1].to_string().as_str()));
        triangle.push_attribute(("v3", t[2].to_string().as_str()));
        xml.write_event(Event::Empty(triangle))
            .map_err(|e| Error::xml_write(format!("Failed to write triangle: {}", e)))?;
    }
    end(xml, "triangles")?;

    end(xml, "mesh")?;
    end(xml, "object")
}

fn start<W: Write>(xml: &mut Writer<W>, elem: BytesStart<'_>) -> Result<()> {
    xml.write_event(Event::Start(elem))
        .map_err(|e| Error::xml_write(format!("Failed to write element: {}", e)))
}

fn end<W: Write>(xml: &mut Writer<W>, name: &str) -> Result<()> {
    xml.write_event(Event::End(BytesEnd::new(name)))
        .map_err(|e| Error::xml_write(format!("Failed to close {} element: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_model;
    use std::io::Cursor;
    use tempfile::TempDir;

    const VENDOR_MAIN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02" xmlns:p="http://schemas.microsoft.com/3dmanufacturing/production/2015/06">
 <resources>
  <object id="5" type="model" name="Bracket"><components><component p:path="/3D/Objects/object_1.model" objectid="1" transform="1 0 0 0 1 0 0 0 1 0 0 2"/><component p:path="/3D/Objects/object_1.model" objectid="2"/></components></object>
 </resources>
 <build>
  <item objectid="5" transform="1 0 0 0 1 0 0 0 1 1000 1000 0"/>
  <item objectid="5" printable="0" transform="1 0 0 0 1 0 0 0 1 0 0 0"/>
 </build>
</model>"#;

    const VENDOR_SUB: &str = r#"<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02"><resources>
<object id="1" type="model"><mesh><vertices><vertex x="0" y="0" z="0"/><vertex x="20" y="0" z="0"/><vertex x="0" y="10" z="8"/></vertices><triangles><triangle v1="0" v2="1" v3="2"/></triangles></mesh></object>
<object id="2" type="other"><mesh><vertices><vertex x="-50" y="0" z="0"/><vertex x="50" y="0" z="0"/><vertex x="0" y="50" z="0"/></vertices><triangles><triangle v1="0" v2="1" v3="2"/></triangles></mesh></object>
</resources></model>"#;

    #[test]
    fn test_write_model_xml_parses_back() {
        let objects = vec![FlatObject {
            name: Some("A & B".to_string()),
            mesh: Mesh {
                vertices: vec![[0.0, 0.0, 0.0], [1.5, 0.0, 0.0], [0.0, 1.0, 2.0]],
                triangles: vec![[0, 1, 2]],
            },
        }];
        let mut out = Vec::new();
        write_model_xml(&objects, [10.0, 20.0, 0.0], &mut out).unwrap();
        let xml = String::from_utf8(out).unwrap();
        let doc = parse_model(&xml, ParseMode::Full).unwrap();
        assert_eq!(doc.object("1").unwrap().name.as_deref(), Some("A & B"));
        assert_eq!(doc.object("1").unwrap().vertex_count, 3);
        assert_eq!(doc.items()[0].transform.translation(), [10.0, 20.0, 0.0]);
    }

    #[test]
    fn test_flatten_scene_centres_printable_geometry() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("vendor.3mf");
        {
            let mut zip = ZipWriter::new(std::fs::File::create(&src).unwrap());
            for (name, body) in [
                (MODEL_PATH, VENDOR_MAIN),
                ("3D/Objects/object_1.model", VENDOR_SUB),
                ("Metadata/model_settings.config", "<config/>"),
            ] {
                zip.start_file(name, SimpleFileOptions::default()).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        let dst = dir.path().join("flat.3mf");
        let report = flatten_scene(&src, &dst, &BedVolume::default(), 12).unwrap();
        assert_eq!(report.objects, 1);
        assert_eq!(report.triangles, 1);
        // part spans x 1000..1020, y 1000..1010, z 2..10
        assert_eq!(report.offset, [-875.0, -870.0, -2.0]);

        let bytes = std::fs::read(&dst).unwrap();
        let mut out = Package::open(Cursor::new(bytes)).unwrap();
        assert!(!out.has_file("Metadata/model_settings.config"));
        assert_eq!(out.file_names().len(), 3);
        let doc = parse_model(&out.read_model().unwrap(), ParseMode::Full).unwrap();
        assert_eq!(doc.items().len(), 1);
        assert_eq!(doc.object("1").unwrap().name.as_deref(), Some("Bracket"));
        let temp_left = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(temp_left, 2);
    }
}
