//! Plates, build items and scene bounds
//!
//! A file is multi-plate when its build has more than one item; each item is
//! one plate keyed by its 1-based position. Vendor `plater_id` numbering is a
//! separate scheme reached only through [`ModelSettings`].

use crate::affine::{Aabb, Affine3x4, Point3};
use crate::archive::{MODEL_PATH, Package};
use crate::config::BedVolume;
use crate::error::{Error, Result};
use crate::model::{
    BuildItem, LevelOfDetail, ModelDoc, ModelSet, ParseMode, decimate_mesh,
};
use crate::vendor::ModelSettings;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

/// Tolerance below the bed before a scene is reported as sinking into it
const BELOW_BED_TOLERANCE: f64 = 0.001;

/// One plate of a multi-plate project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plate {
    /// 1-based build item position
    pub plate_id: usize,
    /// Referenced object id
    pub object_id: String,
    /// Display name
    pub name: String,
    /// `printable` flag of the build item
    pub printable: bool,
    /// Build item transform
    pub transform: Affine3x4,
    /// Translation part of `transform`
    pub translation: Point3,
    /// Vendor `plater_id` holding the object, when known
    pub vendor_plate_id: Option<u32>,
}

/// Plates of a file
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PlateSet {
    /// One entry per build item
    pub plates: Vec<Plate>,
    /// More than one build item
    pub is_multi_plate: bool,
}

impl PlateSet {
    /// Plate by 1-based id
    pub fn get(&self, plate_id: usize) -> Option<&Plate> {
        self.plates.iter().find(|p| p.plate_id == plate_id)
    }
}

/// Pose hint for the placement viewer
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BasePose {
    /// Bed-local X
    pub x: f64,
    /// Bed-local Y
    pub y: f64,
    /// Z from the build item
    pub z: f64,
    /// Always 0; rotation stays in the item transform
    pub rotate_z_deg: f64,
}

/// An editable build item with its bounds in every known frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutItem {
    /// 1-based build item position
    pub build_item_index: usize,
    /// Same as `build_item_index`
    pub plate_id: usize,
    /// Referenced object id
    pub object_id: String,
    /// Display name
    pub name: String,
    /// `printable` flag
    pub printable: bool,
    /// Build item transform
    pub transform: Affine3x4,
    /// Translation part of `transform`
    pub translation: Point3,
    /// Translation of the vendor assemble pose, when unambiguous
    pub assemble_translation: Option<Point3>,
    /// Z rotation of `transform` in degrees
    pub rotation_z_deg: f64,
    /// Object-space bounds
    pub local_bounds: Option<Aabb>,
    /// Bounds under the build item transform
    pub world_bounds: Option<Aabb>,
    /// Bounds under the vendor assemble transform
    pub assemble_world_bounds: Option<Aabb>,
    /// Viewer pose, filled in by the placement frame
    pub ui_base_pose: Option<BasePose>,
}

/// Preview mesh of one build item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemGeometry {
    /// 1-based build item position
    pub build_item_index: usize,
    /// Referenced object id
    pub object_id: String,
    /// Whether any triangle survived
    pub has_mesh: bool,
    /// The source mesh exceeded the triangle budget
    pub mesh_too_large: bool,
    /// Triangles were dropped to meet the budget
    pub mesh_decimated: bool,
    /// Vertices after decimation
    pub vertex_count: usize,
    /// Triangles after decimation
    pub triangle_count: usize,
    /// Vertices before decimation
    pub original_vertex_count: usize,
    /// Triangles before decimation
    pub original_triangle_count: usize,
    /// Vertex positions, rotation and scale applied, translation zeroed
    pub vertices: Vec<Point3>,
    /// Triangles into `vertices`
    pub triangles: Vec<[usize; 3]>,
    /// Modifier volumes were included
    pub include_modifiers: bool,
}

/// Result of checking a scene against the build volume
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneValidation {
    /// Union of item bounds, zero when nothing has geometry
    pub bounds: Aabb,
    /// Extent of `bounds`
    pub size: Point3,
    /// Size overflow warnings
    pub build_volume_warnings: Vec<String>,
    /// All warnings, size overflow first
    pub warnings: Vec<String>,
    /// `warnings` is empty
    pub fits: bool,
}

/// A package opened for plate and layout queries
///
/// Parsed model files and object bounds are cached for the lifetime of the
/// scene, so a layout request touches each sub-model once.
pub struct Scene<R: Read + Seek> {
    package: Package<R>,
    models: ModelSet,
    geometry: Option<ModelSet>,
    settings: Option<ModelSettings>,
    depth_limit: usize,
    bounds_cache: HashMap<(String, String), Option<Aabb>>,
}

impl Scene<File> {
    /// Open a 3MF file from disk
    pub fn open_path(path: &Path, depth_limit: usize) -> Result<Self> {
        Self::new(Package::open_path(path)?, depth_limit)
    }
}

impl<R: Read + Seek> Scene<R> {
    /// Wrap an opened package
    pub fn new(mut package: Package<R>, depth_limit: usize) -> Result<Self> {
        let models = ModelSet::load(&mut package, ParseMode::Bounds, depth_limit)?;
        let settings = ModelSettings::load_or_warn(&mut package);
        Ok(Self {
            package,
            models,
            geometry: None,
            settings,
            depth_limit,
            bounds_cache: HashMap::new(),
        })
    }

    /// The main model document
    pub fn model(&self) -> &ModelDoc {
        self.models.main()
    }

    /// Vendor settings, when present and readable
    pub fn settings(&self) -> Option<&ModelSettings> {
        self.settings.as_ref()
    }

    /// The underlying package
    pub fn package(&mut self) -> &mut Package<R> {
        &mut self.package
    }

    /// Build items of the main model
    pub fn items(&self) -> Vec<BuildItem> {
        self.models.main().items().to_vec()
    }

    /// Whether the build has more than one item
    pub fn is_multi_plate(&self) -> bool {
        self.models.main().items().len() > 1
    }

    /// Plates with resolved display names
    ///
    /// Name priority: vendor plate name for the same number, vendor object
    /// name, the object's own name (or the first named object of a component
    /// sub-model, or that sub-model's file stem), then `"Plate N"`.
    pub fn parse_plates(&mut self) -> Result<PlateSet> {
        let items = self.items();
        let mut plates = Vec::with_capacity(items.len());
        for item in &items {
            let plate_id = item.index;
            let vendor_name = self.settings.as_ref().and_then(|s| {
                s.plate_name(plate_id as u32)
                    .map(str::to_string)
                    .or_else(|| s.object_names.get(&item.object_id).cloned())
            });
            let name = match vendor_name {
                Some(name) => name,
                None => self
                    .model_object_name(&item.object_id)
                    .unwrap_or_else(|| format!("Plate {}", plate_id)),
            };
            let vendor_plate_id = self
                .settings
                .as_ref()
                .and_then(|s| s.bambu_plate_for_object(&item.object_id));
            tracing::debug!(
                plate = plate_id,
                object = %item.object_id,
                translation = ?item.transform.translation(),
                "plate"
            );
            plates.push(Plate {
                plate_id,
                object_id: item.object_id.clone(),
                name,
                printable: item.printable,
                transform: item.transform,
                translation: item.transform.translation(),
                vendor_plate_id,
            });
        }
        let is_multi_plate = plates.len() > 1;
        if is_multi_plate {
            tracing::info!(plates = plates.len(), "multi-plate file");
        }
        Ok(PlateSet {
            plates,
            is_multi_plate,
        })
    }

    /// Name from the 3MF resources: the object's own name, else the first
    /// named object of its first `p:path` component, else that file's stem
    fn model_object_name(&mut self, object_id: &str) -> Option<String> {
        let main = self.models.main();
        let obj = main.object(object_id)?;
        if let Some(name) = obj.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            return Some(name.to_string());
        }
        let path = obj.components.iter().find_map(|c| c.path.clone())?;
        let from_sub = self
            .models
            .model(&mut self.package, &path)
            .and_then(|doc| doc.first_named_object().map(|n| n.trim().to_string()));
        from_sub.or_else(|| {
            Path::new(&path)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .filter(|s| !s.is_empty())
        })
    }

    /// Display name for a build item: object name, vendor object name,
    /// sub-model name or stem, then `"Object {id}"`
    fn item_name(&mut self, object_id: &str) -> String {
        let own = self
            .models
            .main()
            .object(object_id)
            .and_then(|o| o.name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let known = own.or_else(|| {
            self.settings
                .as_ref()
                .and_then(|s| s.object_names.get(object_id).cloned())
        });
        match known {
            Some(name) => name,
            None => self
                .model_object_name(object_id)
                .unwrap_or_else(|| format!("Object {}", object_id)),
        }
    }

    fn check_plate(&self, plate_filter: Option<usize>) -> Result<Vec<BuildItem>> {
        let items = self.items();
        match plate_filter {
            Some(id) if id < 1 || id > items.len() => Err(Error::PlateNotFound(format!(
                "Plate {} not found (file has {} items)",
                id,
                items.len()
            ))),
            Some(id) => Ok(vec![items[id - 1].clone()]),
            None => Ok(items),
        }
    }

    /// Object-space bounds of a build item's object, cached
    pub fn item_local_bounds(&mut self, item: &BuildItem) -> Option<Aabb> {
        let path = item.path.clone().unwrap_or_else(|| MODEL_PATH.to_string());
        let key = (path, item.object_id.clone());
        if let Some(cached) = self.bounds_cache.get(&key) {
            return *cached;
        }
        let bounds = self
            .models
            .object_bounds(&mut self.package, &key.0, &key.1);
        self.bounds_cache.insert(key, bounds);
        bounds
    }

    /// Editable build items, optionally narrowed to one plate
    ///
    /// Fails with [`Error::PlateNotFound`] when `plate_filter` is out of range.
    pub fn list_build_items(&mut self, plate_filter: Option<usize>) -> Result<Vec<LayoutItem>> {
        let items = self.check_plate(plate_filter)?;
        let assemble = self
            .settings
            .as_ref()
            .map(ModelSettings::assemble_transforms_by_object)
            .unwrap_or_default();

        let mut out = Vec::with_capacity(items.len());
        for item in &items {
            let local_bounds = self.item_local_bounds(item);
            let world_bounds = local_bounds.map(|b| item.transform.transform_aabb(&b));
            let assemble_t = local_bounds.and(assemble.get(&item.object_id));
            out.push(LayoutItem {
                build_item_index: item.index,
                plate_id: item.index,
                object_id: item.object_id.clone(),
                name: self.item_name(&item.object_id),
                printable: item.printable,
                transform: item.transform,
                translation: item.transform.translation(),
                assemble_translation: assemble_t.map(Affine3x4::translation),
                rotation_z_deg: item.transform.rotation_z_deg(),
                local_bounds,
                world_bounds,
                assemble_world_bounds: assemble_t
                    .zip(local_bounds)
                    .map(|(t, b)| t.transform_aabb(&b)),
                ui_base_pose: None,
            });
        }
        Ok(out)
    }

    /// Preview meshes for the items in scope
    ///
    /// Each mesh carries the item's rotation and scale but not its
    /// translation; the viewer positions it from the layout pose. Objects
    /// whose geometry cannot be read yield an empty mesh.
    pub fn list_build_item_geometry(
        &mut self,
        plate_filter: Option<usize>,
        build_item_index: Option<usize>,
        lod: LevelOfDetail,
        include_modifiers: bool,
    ) -> Result<Vec<ItemGeometry>> {
        let mut scope = self.check_plate(plate_filter)?;
        if let Some(index) = build_item_index {
            let total = self.models.main().items().len();
            if index < 1 || index > total {
                return Err(Error::InvalidIndex(format!(
                    "Build item {} not found (file has {} items)",
                    index, total
                )));
            }
            if !scope.iter().any(|i| i.index == index) {
                return Err(Error::InvalidIndex(format!(
                    "Build item {} is not available in selected scope",
                    index
                )));
            }
            scope.retain(|i| i.index == index);
        }

        if self.geometry.is_none() {
            self.geometry = Some(ModelSet::load(
                &mut self.package,
                ParseMode::Full,
                self.depth_limit,
            )?);
        }
        let Some(models) = self.geometry.as_mut() else {
            return Ok(Vec::new());
        };

        let max_triangles = lod.max_triangles();
        let mut out = Vec::with_capacity(scope.len());
        for item in &scope {
            let rotscale = item.transform.with_translation([0.0; 3]);
            let path = item.path.as_deref().unwrap_or(MODEL_PATH);
            let mesh = models.object_geometry(
                &mut self.package,
                path,
                &item.object_id,
                &rotscale,
                include_modifiers,
            )?;
            let original_vertex_count = mesh.vertices.len();
            let original_triangle_count = mesh.triangles.len();
            let reduced = decimate_mesh(mesh, max_triangles);
            let mesh = reduced.mesh;
            out.push(ItemGeometry {
                build_item_index: item.index,
                object_id: item.object_id.clone(),
                has_mesh: !mesh.vertices.is_empty() && !mesh.triangles.is_empty(),
                mesh_too_large: original_triangle_count > max_triangles,
                mesh_decimated: reduced.decimated,
                vertex_count: mesh.vertices.len(),
                triangle_count: mesh.triangles.len(),
                original_vertex_count,
                original_triangle_count,
                vertices: mesh.vertices,
                triangles: mesh.triangles,
                include_modifiers,
            });
        }
        Ok(out)
    }

    /// Union of item-transformed object bounds, zero when nothing has geometry
    pub fn scene_bounds(&mut self, plate_filter: Option<usize>) -> Result<Aabb> {
        let items = self.check_plate(plate_filter)?;
        let mut combined = Aabb::empty();
        for item in &items {
            if let Some(b) = self.item_local_bounds(item) {
                combined = combined.union(&item.transform.transform_aabb(&b));
            }
        }
        Ok(if combined.is_empty() {
            Aabb::zero()
        } else {
            combined
        })
    }

    /// Check the scene footprint and height against the build volume
    pub fn validate_scene_bounds(
        &mut self,
        bed: &BedVolume,
        plate_filter: Option<usize>,
    ) -> Result<SceneValidation> {
        let bounds = self.scene_bounds(plate_filter)?;
        let size = bounds.size();
        let build_volume_warnings = check_build_volume(size, bed);
        let mut warnings = build_volume_warnings.clone();
        if bounds.min[2] < -BELOW_BED_TOLERANCE {
            warnings.push(format!(
                "Warning: Objects extend below bed (Z_min = {:.1}mm). This may cause printing issues.",
                bounds.min[2]
            ));
        }
        if warnings.is_empty() {
            tracing::debug!(?size, "scene fits build volume");
        } else {
            tracing::warn!(warnings = %warnings.join("; "), "scene validation warnings");
        }
        Ok(SceneValidation {
            bounds,
            size,
            fits: warnings.is_empty(),
            build_volume_warnings,
            warnings,
        })
    }
}

fn check_build_volume(size: Point3, bed: &BedVolume) -> Vec<String> {
    let mut warnings = Vec::new();
    if size[0] > bed.x {
        warnings.push(format!(
            "Width exceeds build volume: {:.1}mm > {:.1}mm (X-axis)",
            size[0], bed.x
        ));
    }
    if size[1] > bed.y {
        warnings.push(format!(
            "Depth exceeds build volume: {:.1}mm > {:.1}mm (Y-axis)",
            size[1], bed.y
        ));
    }
    if size[2] > bed.z {
        warnings.push(format!(
            "Height exceeds build volume: {:.1}mm > {:.1}mm (Z-axis)",
            size[2], bed.z
        ));
    }
    warnings
}

/// Open `path` and list its plates
pub fn parse_plates(path: &Path, depth_limit: usize) -> Result<PlateSet> {
    Scene::open_path(path, depth_limit)?.parse_plates()
}
