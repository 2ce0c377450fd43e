//! Shared fixtures for integration tests
//!
//! Archives are assembled with `zip::ZipWriter` from small XML strings so
//! each test states exactly which members its input carries.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

pub const MODEL_PATH: &str = "3D/3dmodel.model";
pub const MODEL_SETTINGS_PATH: &str = "Metadata/model_settings.config";
pub const PROJECT_SETTINGS_PATH: &str = "Metadata/project_settings.config";

/// Write a ZIP archive with the given members
pub fn write_archive(path: &Path, members: &[(&str, String)]) -> PathBuf {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    for (name, body) in members {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
    path.to_path_buf()
}

/// Axis-aligned box object with its min corner at the origin
pub fn box_object(id: u32, size: [f64; 3]) -> String {
    let [x, y, z] = size;
    let corners = [
        [0.0, 0.0, 0.0],
        [x, 0.0, 0.0],
        [x, y, 0.0],
        [0.0, y, 0.0],
        [0.0, 0.0, z],
        [x, 0.0, z],
        [x, y, z],
        [0.0, y, z],
    ];
    let vertices: String = corners
        .iter()
        .map(|c| format!(r#"<vertex x="{}" y="{}" z="{}"/>"#, c[0], c[1], c[2]))
        .collect();
    let faces = [
        [0, 2, 1], [0, 3, 2], [4, 5, 6], [4, 6, 7], [0, 1, 5], [0, 5, 4],
        [1, 2, 6], [1, 6, 5], [2, 3, 7], [2, 7, 6], [3, 0, 4], [3, 4, 7],
    ];
    let triangles: String = faces
        .iter()
        .map(|f| format!(r#"<triangle v1="{}" v2="{}" v3="{}"/>"#, f[0], f[1], f[2]))
        .collect();
    format!(
        r#"<object id="{id}" type="model"><mesh><vertices>{vertices}</vertices><triangles>{triangles}</triangles></mesh></object>"#
    )
}

/// One build item: object id, XY translation and printable flag
pub struct Item {
    pub object_id: u32,
    pub x: f64,
    pub y: f64,
    pub printable: bool,
}

impl Item {
    pub fn at(object_id: u32, x: f64, y: f64) -> Self {
        Self {
            object_id,
            x,
            y,
            printable: true,
        }
    }

    pub fn hidden(mut self) -> Self {
        self.printable = false;
        self
    }
}

/// Main model with the given objects and build items
pub fn model_xml(objects: &[String], items: &[Item]) -> String {
    let items: String = items
        .iter()
        .map(|i| {
            let printable = if i.printable { "" } else { r#" printable="0""# };
            format!(
                r#"<item objectid="{}" transform="1 0 0 0 1 0 0 0 1 {} {} 0"{}/>"#,
                i.object_id, i.x, i.y, printable
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02">
 <resources>{}</resources>
 <build>{}</build>
</model>"#,
        objects.concat(),
        items
    )
}

/// Vendor `model_settings.config`: per-object extruders and plates of object ids
pub fn vendor_settings(extruders: &[(u32, u32)], plates: &[(u32, &[u32])]) -> String {
    let objects: String = extruders
        .iter()
        .map(|(id, ext)| {
            format!(
                r#"<object id="{id}"><metadata key="name" value="part{id}"/><metadata key="extruder" value="{ext}"/></object>"#
            )
        })
        .collect();
    let plates: String = plates
        .iter()
        .map(|(plater_id, ids)| {
            let instances: String = ids
                .iter()
                .map(|id| {
                    format!(r#"<model_instance><metadata key="object_id" value="{id}"/></model_instance>"#)
                })
                .collect();
            format!(r#"<plate><metadata key="plater_id" value="{plater_id}"/>{instances}</plate>"#)
        })
        .collect();
    format!("<config>{objects}{plates}</config>")
}

/// Two 20 mm cubes side by side on a 270 mm bed
pub fn two_cube_archive(dir: &Path) -> PathBuf {
    let model = model_xml(
        &[box_object(1, [20.0, 20.0, 20.0]), box_object(2, [20.0, 20.0, 20.0])],
        &[Item::at(1, 100.0, 100.0), Item::at(2, 150.0, 100.0)],
    );
    write_archive(&dir.join("two_cubes.3mf"), &[(MODEL_PATH, model)])
}

/// Write bundled profiles under `dir` and return the directory
pub fn write_profiles(dir: &Path, names: &plate_bridge::ProfileNames) -> PathBuf {
    let printer = serde_json::json!({
        "name": "U1",
        "printable_area": ["0x0", "270x0", "270x270", "0x270"],
    });
    let process = serde_json::json!({"name": "Standard", "layer_height": "0.2"});
    let filament = serde_json::json!({"filament_type": ["PLA"], "nozzle_temperature": ["210"]});
    for (sub, file, body) in [
        ("printer", names.printer_file(), printer),
        ("process", names.process_file(), process),
        ("filament", names.filament_file(), filament),
    ] {
        std::fs::create_dir_all(dir.join(sub)).unwrap();
        std::fs::write(dir.join(sub).join(file), body.to_string()).unwrap();
    }
    dir.to_path_buf()
}
