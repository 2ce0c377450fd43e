//! Preview mesh budgets and decimation

use super::Mesh;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Triangle budget presets for placement previews
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelOfDetail {
    /// 5 000 triangles
    #[default]
    Low,
    /// 10 000 triangles
    Medium,
    /// 15 000 triangles
    High,
    /// 50 000 triangles
    Full,
}

impl LevelOfDetail {
    /// Triangle budget per object
    pub fn max_triangles(self) -> usize {
        match self {
            LevelOfDetail::Low => 5_000,
            LevelOfDetail::Medium => 10_000,
            LevelOfDetail::High => 15_000,
            LevelOfDetail::Full => 50_000,
        }
    }

    /// Resolve a preset name; unknown names fall back to [`LevelOfDetail::Medium`]
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "low" | "placement_low" | "preview" => LevelOfDetail::Low,
            "high" | "placement_high" | "detail" => LevelOfDetail::High,
            "full" => LevelOfDetail::Full,
            _ => LevelOfDetail::Medium,
        }
    }
}

/// Result of [`decimate_mesh`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecimatedMesh {
    /// The (possibly reduced) mesh
    pub mesh: Mesh,
    /// Whether any triangle was dropped
    pub decimated: bool,
}

/// Reduce a mesh to at most `max_triangles` by uniform stride sampling
///
/// Keeps every `ceil(n / max)`-th triangle, truncates to `max`, and compacts
/// the vertex list in first-use order. Winding is preserved. A budget of 0
/// or a mesh already within budget is returned unchanged.
pub fn decimate_mesh(mesh: Mesh, max_triangles: usize) -> DecimatedMesh {
    let n = mesh.triangles.len();
    if max_triangles == 0 || n <= max_triangles {
        return DecimatedMesh {
            mesh,
            decimated: false,
        };
    }

    let stride = n.div_ceil(max_triangles).max(1);
    let mut used: HashMap<usize, usize> = HashMap::with_capacity(max_triangles * 3);
    let mut vertices = Vec::with_capacity(max_triangles * 3);
    let mut triangles = Vec::with_capacity(max_triangles);

    let nv = mesh.vertices.len();
    for tri in mesh.triangles.iter().step_by(stride).take(max_triangles) {
        if tri.iter().any(|&i| i >= nv) {
            continue;
        }
        let mut remapped = [0usize; 3];
        for (slot, old) in remapped.iter_mut().zip(tri.iter()) {
            *slot = *used.entry(*old).or_insert_with(|| {
                vertices.push(mesh.vertices[*old]);
                vertices.len() - 1
            });
        }
        triangles.push(remapped);
    }

    DecimatedMesh {
        mesh: Mesh {
            vertices,
            triangles,
        },
        decimated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip(n: usize) -> Mesh {
        let mut mesh = Mesh::default();
        for i in 0..n + 2 {
            mesh.vertices.push([i as f64, (i % 2) as f64, 0.0]);
        }
        for i in 0..n {
            mesh.triangles.push([i, i + 1, i + 2]);
        }
        mesh
    }

    #[test]
    fn test_within_budget_untouched() {
        let mesh = strip(10);
        let out = decimate_mesh(mesh.clone(), 10);
        assert!(!out.decimated);
        assert_eq!(out.mesh, mesh);
        assert!(!decimate_mesh(mesh, 0).decimated);
    }

    #[test]
    fn test_stride_and_compaction() {
        let mesh = strip(100);
        let out = decimate_mesh(mesh.clone(), 30);
        assert!(out.decimated);
        // stride ceil(100/30) = 4 gives 25 triangles
        assert_eq!(out.mesh.triangles.len(), 25);
        let nv = out.mesh.vertices.len();
        assert!(out.mesh.triangles.iter().flatten().all(|&i| i < nv));
        // first kept triangle is the original first one, same winding
        assert_eq!(out.mesh.triangles[0], [0, 1, 2]);
        assert_eq!(out.mesh.vertices[2], mesh.vertices[2]);
    }

    #[test]
    fn test_level_of_detail_budgets() {
        assert_eq!(LevelOfDetail::Low.max_triangles(), 5_000);
        assert_eq!(LevelOfDetail::from_name("FULL"), LevelOfDetail::Full);
        assert_eq!(LevelOfDetail::from_name("placement_low"), LevelOfDetail::Low);
        assert_eq!(LevelOfDetail::from_name("ultra"), LevelOfDetail::Medium);
    }
}
