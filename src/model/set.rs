//! Lazily parsed model files of one package

use super::{Mesh, ModelDoc, ObjectDef, ParseMode, parse_model};
use crate::affine::{Aabb, Affine3x4};
use crate::archive::{MODEL_PATH, Package};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Seek};
use std::rc::Rc;

/// Parsed model files keyed by archive path
///
/// The main model is parsed eagerly and must be valid. Sub-models referenced
/// through `p:path` are parsed on first use; a missing or malformed sub-model
/// is remembered as absent and contributes no geometry.
pub struct ModelSet {
    mode: ParseMode,
    depth_limit: usize,
    main: Rc<ModelDoc>,
    models: HashMap<String, Option<Rc<ModelDoc>>>,
}

impl ModelSet {
    /// Parse the main model of `package`
    pub fn load<R: Read + Seek>(
        package: &mut Package<R>,
        mode: ParseMode,
        depth_limit: usize,
    ) -> Result<Self> {
        let xml = package.read_model()?;
        let main = Rc::new(parse_model(&xml, mode)?);
        let mut models = HashMap::new();
        models.insert(MODEL_PATH.to_string(), Some(Rc::clone(&main)));
        Ok(Self {
            mode,
            depth_limit,
            main,
            models,
        })
    }

    /// The main `3D/3dmodel.model` document
    pub fn main(&self) -> &ModelDoc {
        &self.main
    }

    /// A model file by archive path, parsing it on first access
    pub fn model<R: Read + Seek>(
        &mut self,
        package: &mut Package<R>,
        path: &str,
    ) -> Option<Rc<ModelDoc>> {
        if let Some(cached) = self.models.get(path) {
            return cached.clone();
        }
        let parsed = package
            .read_string(path)
            .and_then(|xml| parse_model(&xml, self.mode));
        let doc = match parsed {
            Ok(doc) => Some(Rc::new(doc)),
            Err(e) => {
                tracing::debug!(path, error = %e, "sub-model unavailable");
                None
            }
        };
        self.models.insert(path.to_string(), doc.clone());
        doc
    }

    /// Local-space bounds of an object
    ///
    /// Inline vertices give the bounds directly. Composite objects union the
    /// transformed bounds of their components. Returns `None` when no vertex
    /// is reachable, including through cycles deeper than the nesting limit.
    pub fn object_bounds<R: Read + Seek>(
        &mut self,
        package: &mut Package<R>,
        path: &str,
        id: &str,
    ) -> Option<Aabb> {
        self.bounds_at(package, path, id, 0)
    }

    fn bounds_at<R: Read + Seek>(
        &mut self,
        package: &mut Package<R>,
        path: &str,
        id: &str,
        depth: usize,
    ) -> Option<Aabb> {
        if depth > self.depth_limit {
            tracing::warn!(path, object = id, "component nesting too deep while scanning bounds");
            return None;
        }
        let doc = self.model(package, path)?;
        let obj = doc.object(id)?;
        if obj.has_mesh() {
            return obj.mesh_bounds;
        }

        let mut combined = Aabb::empty();
        for comp in &obj.components {
            let child_path = comp.path.as_deref().unwrap_or(path);
            if let Some(b) = self.bounds_at(package, child_path, &comp.object_id, depth + 1) {
                combined = combined.union(&comp.transform.transform_aabb(&b));
            }
        }
        (!combined.is_empty()).then_some(combined)
    }

    /// Flatten an object into one vertex/triangle list under `transform`
    ///
    /// Component transforms compose as `transform ∘ component`. Triangles
    /// with out-of-range indices are skipped. Non-`model` objects contribute
    /// nothing unless `include_modifiers` is set. Fails with
    /// [`Error::GeometryTooDeep`] beyond the nesting limit.
    pub fn object_geometry<R: Read + Seek>(
        &mut self,
        package: &mut Package<R>,
        path: &str,
        id: &str,
        transform: &Affine3x4,
        include_modifiers: bool,
    ) -> Result<Mesh> {
        let mut out = Mesh::default();
        self.collect(package, path, id, transform, include_modifiers, 0, &mut out)?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn collect<R: Read + Seek>(
        &mut self,
        package: &mut Package<R>,
        path: &str,
        id: &str,
        transform: &Affine3x4,
        include_modifiers: bool,
        depth: usize,
        out: &mut Mesh,
    ) -> Result<()> {
        if depth > self.depth_limit {
            return Err(Error::GeometryTooDeep {
                limit: self.depth_limit,
            });
        }
        let Some(doc) = self.model(package, path) else {
            return Ok(());
        };
        let Some(obj) = doc.object(id) else {
            return Ok(());
        };
        if !include_modifiers && !obj.kind.is_model() {
            return Ok(());
        }

        if obj.has_mesh() {
            append_mesh(obj, transform, out);
            return Ok(());
        }

        for comp in &obj.components {
            let child_path = comp.path.as_deref().unwrap_or(path);
            let child_t = transform.compose(&comp.transform);
            self.collect(
                package,
                child_path,
                &comp.object_id,
                &child_t,
                include_modifiers,
                depth + 1,
                out,
            )?;
        }
        Ok(())
    }
}

fn append_mesh(obj: &ObjectDef, transform: &Affine3x4, out: &mut Mesh) {
    let Some(mesh) = obj.mesh.as_ref() else {
        return;
    };
    let base = out.vertices.len();
    let nv = mesh.vertices.len();
    out.vertices
        .extend(mesh.vertices.iter().map(|p| transform.transform_point(*p)));
    out.triangles.extend(
        mesh.triangles
            .iter()
            .filter(|tri| tri.iter().all(|&i| i < nv))
            .map(|tri| [base + tri[0], base + tri[1], base + tri[2]]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    const MAIN: &str = r#"<model xmlns:p="http://schemas.microsoft.com/3dmanufacturing/production/2015/06">
  <resources>
    <object id="5">
      <components>
        <component objectid="1" p:path="/3D/Objects/object_1.model" transform="1 0 0 0 1 0 0 0 1 10 0 0"/>
        <component objectid="2" p:path="/3D/Objects/object_1.model"/>
        <component objectid="9" p:path="/3D/Objects/missing.model"/>
      </components>
    </object>
    <object id="6"><components><component objectid="7"/></components></object>
    <object id="7"><components><component objectid="6"/></components></object>
  </resources>
  <build><item objectid="5"/></build>
</model>"#;

    const SUB: &str = r#"<model>
  <resources>
    <object id="1" type="model">
      <mesh>
        <vertices><vertex x="0" y="0" z="0"/><vertex x="1" y="0" z="0"/><vertex x="0" y="1" z="1"/></vertices>
        <triangles><triangle v1="0" v2="1" v3="2"/><triangle v1="0" v2="1" v3="9"/></triangles>
      </mesh>
    </object>
    <object id="2" type="other">
      <mesh>
        <vertices><vertex x="-5" y="-5" z="-5"/><vertex x="1" y="0" z="0"/><vertex x="0" y="1" z="0"/></vertices>
        <triangles><triangle v1="0" v2="1" v3="2"/></triangles>
      </mesh>
    </object>
  </resources>
</model>"#;

    fn package() -> Package<Cursor<Vec<u8>>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        zip.start_file(MODEL_PATH, options).unwrap();
        zip.write_all(MAIN.as_bytes()).unwrap();
        zip.start_file("3D/Objects/object_1.model", options).unwrap();
        zip.write_all(SUB.as_bytes()).unwrap();
        let bytes = zip.finish().unwrap().into_inner();
        Package::open(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn test_bounds_through_components() {
        let mut pkg = package();
        let mut set = ModelSet::load(&mut pkg, ParseMode::Bounds, 12).unwrap();
        let b = set.object_bounds(&mut pkg, MODEL_PATH, "5").unwrap();
        assert_eq!(b.min, [-5.0, -5.0, -5.0]);
        assert_eq!(b.max, [11.0, 1.0, 1.0]);
    }

    #[test]
    fn test_cycle_has_no_bounds() {
        let mut pkg = package();
        let mut set = ModelSet::load(&mut pkg, ParseMode::Bounds, 12).unwrap();
        assert!(set.object_bounds(&mut pkg, MODEL_PATH, "6").is_none());
    }

    #[test]
    fn test_geometry_skips_modifiers_and_bad_triangles() {
        let mut pkg = package();
        let mut set = ModelSet::load(&mut pkg, ParseMode::Full, 12).unwrap();
        let mesh = set
            .object_geometry(&mut pkg, MODEL_PATH, "5", &Affine3x4::IDENTITY, false)
            .unwrap();
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.triangles, vec![[0, 1, 2]]);
        assert_eq!(mesh.vertices[0], [10.0, 0.0, 0.0]);

        let with_modifiers = set
            .object_geometry(&mut pkg, MODEL_PATH, "5", &Affine3x4::IDENTITY, true)
            .unwrap();
        assert_eq!(with_modifiers.vertices.len(), 6);
        assert_eq!(with_modifiers.triangles[1], [3, 4, 5]);
    }

    #[test]
    fn test_geometry_cycle_too_deep() {
        let mut pkg = package();
        let mut set = ModelSet::load(&mut pkg, ParseMode::Full, 12).unwrap();
        let err = set
            .object_geometry(&mut pkg, MODEL_PATH, "6", &Affine3x4::IDENTITY, true)
            .unwrap_err();
        assert!(matches!(err, Error::GeometryTooDeep { limit: 12 }));
    }
}
