//! 3MF model documents
//!
//! A model file (`3D/3dmodel.model` or a sub-model under `3D/Objects/`) is
//! parsed into a [`ModelDoc`]: its objects keyed by id and, for the main
//! model, the ordered build items. Object ids are unique only within one
//! model file, so cross-file references are always `(path, id)` pairs.

mod geometry;
mod reader;
mod set;

pub use geometry::{DecimatedMesh, LevelOfDetail, decimate_mesh};
pub use reader::{ParseMode, parse_model};
pub use set::ModelSet;

use crate::affine::{Aabb, Affine3x4, Point3};
use std::collections::BTreeMap;

/// Core 3MF namespace
pub const CORE_NAMESPACE: &str = "http://schemas.microsoft.com/3dmanufacturing/core/2015/02";

/// Production extension namespace (`p:path`, `p:UUID`)
pub const PRODUCTION_NAMESPACE: &str =
    "http://schemas.microsoft.com/3dmanufacturing/production/2015/06";

/// Object `type` attribute
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObjectKind {
    /// Printable geometry (default)
    #[default]
    Model,
    /// Modifier / helper volume (`type="other"`)
    Other,
    /// Support geometry
    Support,
    /// Solid support geometry
    SolidSupport,
    /// Surface geometry
    Surface,
    /// Vendor-specific value kept verbatim
    Unknown(String),
}

impl ObjectKind {
    /// Parse a `type` attribute value
    pub fn parse(value: &str) -> Self {
        match value {
            "model" | "" => ObjectKind::Model,
            "other" => ObjectKind::Other,
            "support" => ObjectKind::Support,
            "solidsupport" => ObjectKind::SolidSupport,
            "surface" => ObjectKind::Surface,
            other => ObjectKind::Unknown(other.to_string()),
        }
    }

    /// Whether this is printable model geometry
    pub fn is_model(&self) -> bool {
        matches!(self, ObjectKind::Model)
    }
}

/// Inline mesh data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex coordinates
    pub vertices: Vec<Point3>,
    /// Triangles as vertex indices; may reference out-of-range vertices in bad files
    pub triangles: Vec<[usize; 3]>,
}

/// A reference from a composite object to another object
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Referenced object id (scoped to `path` or to the referencing file)
    pub object_id: String,
    /// Archive member holding the referenced object (`p:path`), normalized
    pub path: Option<String>,
    /// Placement of the referenced object inside this one
    pub transform: Affine3x4,
}

/// An `<object>` resource
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectDef {
    /// Object id (unique within its model file)
    pub id: String,
    /// Object type
    pub kind: ObjectKind,
    /// `name` attribute
    pub name: Option<String>,
    /// Inline mesh, present in [`ParseMode::Full`]
    pub mesh: Option<Mesh>,
    /// Bounds of inline vertices, present in full and bounds modes
    pub mesh_bounds: Option<Aabb>,
    /// Vertex count of the inline mesh
    pub vertex_count: usize,
    /// Component references
    pub components: Vec<Component>,
}

impl ObjectDef {
    /// Whether the object has inline mesh vertices
    pub fn has_mesh(&self) -> bool {
        self.vertex_count > 0
    }
}

/// A top-level `<build><item>`
#[derive(Debug, Clone, PartialEq)]
pub struct BuildItem {
    /// 1-based position within `<build>`
    pub index: usize,
    /// Referenced object id
    pub object_id: String,
    /// Member holding the object when the item itself carries `p:path`
    pub path: Option<String>,
    /// `printable` attribute; anything but `"0"` is printable
    pub printable: bool,
    /// Placement transform (identity when absent or malformed)
    pub transform: Affine3x4,
}

/// A parsed model file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelDoc {
    /// `unit` attribute of `<model>`
    pub unit: Option<String>,
    /// Objects keyed by id
    pub objects: BTreeMap<String, ObjectDef>,
    /// Object ids in document order
    pub object_order: Vec<String>,
    /// Build items in document order; `None` when the file has no `<build>`
    pub build: Option<Vec<BuildItem>>,
}

impl ModelDoc {
    /// Build items, empty when there is no build section
    pub fn items(&self) -> &[BuildItem] {
        self.build.as_deref().unwrap_or(&[])
    }

    /// Look up an object by id
    pub fn object(&self, id: &str) -> Option<&ObjectDef> {
        self.objects.get(id)
    }

    /// First object in document order that carries a name
    pub fn first_named_object(&self) -> Option<&str> {
        self.object_order
            .iter()
            .filter_map(|id| self.objects.get(id))
            .find_map(|o| o.name.as_deref().filter(|n| !n.trim().is_empty()))
    }
}
