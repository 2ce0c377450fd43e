//! Event-driven model XML reader

use super::{BuildItem, Component, Mesh, ModelDoc, ObjectDef, ObjectKind};
use crate::affine::{Aabb, Affine3x4};
use crate::archive::member_name;
use crate::error::{Error, Result};
use crate::xml::{XML_BUFFER_CAPACITY, attr, element_name, parse_attributes};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// How much of each object to keep while reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Vertices and triangles are materialized
    #[default]
    Full,
    /// Only vertex bounds and counts are kept; triangles are skipped
    Bounds,
    /// Objects, components and build items only; mesh data is skipped
    Structure,
}

/// Parse one model file
///
/// Elements are matched by local name so prefixed documents read the same as
/// default-namespace ones. Build items are counted only inside `<build>`.
pub fn parse_model(xml: &str, mode: ParseMode) -> Result<ModelDoc> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut state = ReaderState::new(mode);
    let mut buf = Vec::with_capacity(XML_BUFFER_CAPACITY);

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                state.open(e)?;
            }
            Ok(Event::Empty(ref e)) => {
                let name = state.open(e)?;
                state.close(&name);
            }
            Ok(Event::End(ref e)) => {
                let name = std::str::from_utf8(e.local_name().into_inner())
                    .map_err(|err| Error::MalformedModel(err.to_string()))?
                    .to_string();
                state.close(&name);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::MalformedModel(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(state.finish())
}

struct ReaderState {
    mode: ParseMode,
    doc: ModelDoc,
    in_resources: bool,
    in_build: bool,
    in_components: bool,
    current: Option<ObjectDef>,
    mesh: Option<Mesh>,
    bounds: Aabb,
    items: Vec<BuildItem>,
}

impl ReaderState {
    fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            doc: ModelDoc::default(),
            in_resources: false,
            in_build: false,
            in_components: false,
            current: None,
            mesh: None,
            bounds: Aabb::empty(),
            items: Vec::new(),
        }
    }

    /// Handle a start tag; returns its local name
    fn open(&mut self, e: &BytesStart<'_>) -> Result<String> {
        let name = element_name(e)?;
        match name {
            "model" => {
                let attrs = parse_attributes(e)?;
                self.doc.unit = attr(&attrs, "unit").map(str::to_string);
            }
            "resources" => self.in_resources = true,
            "build" => {
                self.in_build = true;
                self.doc.build.get_or_insert_with(Vec::new);
            }
            "object" if self.in_resources => {
                self.current = Some(read_object(e)?);
                self.bounds = Aabb::empty();
                self.mesh = None;
            }
            "mesh" if self.current.is_some() && self.mode == ParseMode::Full => {
                self.mesh = Some(Mesh::default());
            }
            "components" if self.current.is_some() => self.in_components = true,
            "vertex" if self.mode != ParseMode::Structure => {
                if let Some(obj) = self.current.as_mut() {
                    let p = read_vertex(e)?;
                    obj.vertex_count += 1;
                    self.bounds.include(p);
                    if let Some(mesh) = self.mesh.as_mut() {
                        mesh.vertices.push(p);
                    }
                }
            }
            "vertex" => {
                if let Some(obj) = self.current.as_mut() {
                    obj.vertex_count += 1;
                }
            }
            "triangle" => {
                if let Some(mesh) = self.mesh.as_mut() {
                    if let Some(tri) = read_triangle(e)? {
                        mesh.triangles.push(tri);
                    }
                }
            }
            "component" if self.in_components => {
                if let Some(obj) = self.current.as_mut() {
                    if let Some(component) = read_component(e)? {
                        obj.components.push(component);
                    }
                }
            }
            "item" if self.in_build => {
                let index = self.items.len() + 1;
                self.items.push(read_item(e, index)?);
            }
            _ => {}
        }
        Ok(name.to_string())
    }

    fn close(&mut self, name: &str) {
        match name {
            "resources" => self.in_resources = false,
            "build" => self.in_build = false,
            "components" => self.in_components = false,
            "object" => {
                if let Some(mut obj) = self.current.take() {
                    if !self.bounds.is_empty() {
                        obj.mesh_bounds = Some(self.bounds);
                    }
                    obj.mesh = self.mesh.take();
                    self.doc.object_order.push(obj.id.clone());
                    self.doc.objects.insert(obj.id.clone(), obj);
                }
                self.in_components = false;
            }
            _ => {}
        }
    }

    fn finish(mut self) -> ModelDoc {
        if self.doc.build.is_some() {
            self.doc.build = Some(self.items);
        }
        self.doc
    }
}

fn read_object(e: &BytesStart<'_>) -> Result<ObjectDef> {
    let attrs = parse_attributes(e)?;
    let id = attr(&attrs, "id")
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::MalformedModel("object missing id attribute".to_string()))?;
    Ok(ObjectDef {
        id: id.to_string(),
        kind: ObjectKind::parse(&attr(&attrs, "type").unwrap_or("model").trim().to_ascii_lowercase()),
        name: attr(&attrs, "name").map(str::to_string),
        ..ObjectDef::default()
    })
}

fn read_vertex(e: &BytesStart<'_>) -> Result<[f64; 3]> {
    let attrs = parse_attributes(e)?;
    let coord = |key: &str| -> Result<f64> {
        match attr(&attrs, key) {
            Some(v) => Ok(v.trim().parse::<f64>()?),
            None => Ok(0.0),
        }
    };
    Ok([coord("x")?, coord("y")?, coord("z")?])
}

/// Unparseable or negative indices drop the triangle
fn read_triangle(e: &BytesStart<'_>) -> Result<Option<[usize; 3]>> {
    let attrs = parse_attributes(e)?;
    let index = |key: &str| attr(&attrs, key).unwrap_or("0").trim().parse::<usize>().ok();
    Ok(match (index("v1"), index("v2"), index("v3")) {
        (Some(a), Some(b), Some(c)) => Some([a, b, c]),
        _ => None,
    })
}

fn read_component(e: &BytesStart<'_>) -> Result<Option<Component>> {
    let attrs = parse_attributes(e)?;
    let Some(object_id) = attr(&attrs, "objectid").filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    Ok(Some(Component {
        object_id: object_id.to_string(),
        path: attr(&attrs, "path").filter(|p| !p.is_empty()).map(member_name),
        transform: Affine3x4::parse_opt(attr(&attrs, "transform")),
    }))
}

fn read_item(e: &BytesStart<'_>, index: usize) -> Result<BuildItem> {
    let attrs = parse_attributes(e)?;
    Ok(BuildItem {
        index,
        object_id: attr(&attrs, "objectid")
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| index.to_string()),
        path: attr(&attrs, "path").filter(|p| !p.is_empty()).map(member_name),
        printable: attr(&attrs, "printable").map(str::trim) != Some("0"),
        transform: Affine3x4::parse_opt(attr(&attrs, "transform")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUBE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<model unit="millimeter" xmlns="http://schemas.microsoft.com/3dmanufacturing/core/2015/02"
       xmlns:p="http://schemas.microsoft.com/3dmanufacturing/production/2015/06">
  <resources>
    <object id="1" type="model" name="Cube">
      <mesh>
        <vertices>
          <vertex x="0" y="0" z="0"/>
          <vertex x="10" y="0" z="0"/>
          <vertex x="10" y="20" z="0"/>
          <vertex x="0" y="0" z="5"/>
        </vertices>
        <triangles>
          <triangle v1="0" v2="1" v3="2"/>
          <triangle v1="0" v2="-1" v3="2"/>
          <triangle v1="0" v2="2" v3="3"/>
        </triangles>
      </mesh>
    </object>
    <object id="2" type="other"/>
    <object id="3">
      <components>
        <component objectid="1" transform="1 0 0 0 1 0 0 0 1 5 0 0"/>
        <component objectid="7" p:path="/3D/Objects/part%201.model"/>
      </components>
    </object>
  </resources>
  <build>
    <item objectid="3" transform="1 0 0 0 1 0 0 0 1 50 50 0"/>
    <item objectid="1" printable="0"/>
  </build>
</model>"#;

    #[test]
    fn test_parse_full() {
        let doc = parse_model(CUBE, ParseMode::Full).unwrap();
        assert_eq!(doc.unit.as_deref(), Some("millimeter"));
        assert_eq!(doc.object_order, vec!["1", "2", "3"]);

        let cube = doc.object("1").unwrap();
        let mesh = cube.mesh.as_ref().unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        // the triangle with a negative index is dropped
        assert_eq!(mesh.triangles.len(), 2);
        let b = cube.mesh_bounds.unwrap();
        assert_eq!(b.max, [10.0, 20.0, 5.0]);

        assert_eq!(doc.object("2").unwrap().kind, ObjectKind::Other);

        let comps = &doc.object("3").unwrap().components;
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].transform.translation(), [5.0, 0.0, 0.0]);
        assert_eq!(comps[1].path.as_deref(), Some("3D/Objects/part 1.model"));
    }

    #[test]
    fn test_build_items() {
        let doc = parse_model(CUBE, ParseMode::Structure).unwrap();
        let items = doc.items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].index, 1);
        assert_eq!(items[0].object_id, "3");
        assert!(items[0].printable);
        assert_eq!(items[0].transform.translation(), [50.0, 50.0, 0.0]);
        assert!(!items[1].printable);
        assert!(items[1].transform.is_identity(0.0));
    }

    #[test]
    fn test_bounds_mode_skips_mesh() {
        let doc = parse_model(CUBE, ParseMode::Bounds).unwrap();
        let cube = doc.object("1").unwrap();
        assert!(cube.mesh.is_none());
        assert_eq!(cube.vertex_count, 4);
        assert!(cube.mesh_bounds.is_some());
    }

    #[test]
    fn test_missing_build_section() {
        let doc = parse_model(r#"<model><resources/></model>"#, ParseMode::Full).unwrap();
        assert!(doc.build.is_none());
        assert!(doc.items().is_empty());
    }

    #[test]
    fn test_malformed_xml() {
        let err = parse_model("<model><resources></model>", ParseMode::Full).unwrap_err();
        assert!(matches!(err, Error::MalformedModel(_)));
    }
}
