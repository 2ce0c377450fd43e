//! # plate-bridge
//!
//! Geometric and metadata transforms for 3MF print jobs.
//!
//! 3MF files arrive from several slicers that disagree on where the bed
//! origin is, how multi-plate projects are packed and whether the build or
//! the vendor "assemble" transform is authoritative. This crate reads such
//! files, reconciles those conventions and rewrites them for a single local
//! printer without losing the per-object metadata (extruder assignments,
//! per-layer tool changes, paint) that a plain mesh re-export destroys.
//!
//! ## Features
//!
//! - Pure Rust with no unsafe code
//! - Streaming XML rewrites; untouched archive members are raw-copied
//! - Plate and origin detection for packed multi-plate projects
//! - Translate, rotate, scale, duplicate, extract and strip build items
//! - Profile merge into `Metadata/project_settings.config`
//! - G-code bounds, layer listing and preview rendering
//! - A staged slicing pipeline around an external slicer
//!
//! ## Example
//!
//! ```no_run
//! use plate_bridge::{BedVolume, Scene, layout};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut scene = Scene::open_path(Path::new("project.3mf"), 12)?;
//! let report = layout(&mut scene, BedVolume::default(), None)?;
//!
//! println!(
//!     "{} objects, frame confidence {:?}",
//!     report.objects.len(),
//!     report.placement_frame.confidence
//! );
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod affine;
pub mod archive;
pub mod config;
pub mod error;
pub mod gcode;
pub mod model;
pub mod mutate;
pub mod pipeline;
pub mod placement;
pub mod plates;
pub mod probe;
pub mod profile;
pub mod vendor;
mod xml;
pub mod xml_edit;

pub use affine::{Aabb, Affine3x4, Point3};
pub use archive::{ArchiveEdit, Package};
pub use config::{BedVolume, PipelineConfig, ProfileNames};
pub use error::{Error, Result};
pub use mutate::{
    ApplyReport, CopyLayout, ObjectTransform, apply_copies, apply_layout_scale,
    apply_object_transforms, apply_uniform_scale, extract_plate, strip_modifier_parts,
    strip_non_printable_items,
};
pub use pipeline::{JobOutput, JobSpec, ProcessSlicer, SliceOptions, SliceRun, Slicer, run_slice_job};
pub use placement::{LayoutReport, PlacementFrame, enforce_transformed_bounds, layout};
pub use plates::{PlateSet, Scene, parse_plates};
pub use probe::{ProbeCache, ProbeReport};
pub use profile::{EmbedOutcome, EmbedPath, EmbedRequest, ProfileEmbedder};
