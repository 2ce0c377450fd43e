//! Per-job slicing pipeline
//!
//! A job turns an uploaded 3MF into G-code through a fixed chain of stages,
//! each reading the previous stage's file from the job workspace:
//!
//! 1. profile embed
//! 2. object transforms, then the fully-on-bed check
//! 3. layout pre-scale (only when enlarging)
//! 4. copy duplication
//! 5. external slicer
//!
//! Intermediate archives are deleted when the job ends, whether it succeeded
//! or not. The only retry is a wipe-tower conflict reported by the slicer,
//! which rebuilds the chain from the source with the prime tower disabled.

use crate::archive::copy_archive;
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::gcode;
use crate::mutate::{ApplyReport, CopyLayout, ObjectTransform, apply_copies, apply_layout_scale, apply_object_transforms};
use crate::placement::enforce_transformed_bounds;
use crate::plates::parse_plates;
use crate::probe::{ProbeCache, ProbeReport};
use crate::profile::{EmbedOutcome, EmbedRequest, ProfileEmbedder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Scale percentages this close to 100 are treated as unscaled
const SCALE_EPSILON: f64 = 0.001;

/// Lower-cased output fragments that identify a wipe-tower conflict
const WIPE_TOWER_SIGNATURES: [&str; 2] = [
    "gcode path conflicts found between wipetower",
    "found slicing result conflict",
];

/// Fragments that identify a conflict only when both appear
const WIPE_TOWER_PAIRED_SIGNATURE: (&str, &str) = ("calc_exclude_triangles", "nothing to be sliced");

/// Settings forced when several tool heads are in use
const MULTI_TOOL_OVERRIDES: [(&str, &str); 2] = [
    ("machine_load_filament_time", "0"),
    ("machine_unload_filament_time", "0"),
];

/// How the slicer is asked to run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SliceOptions {
    /// Plate to slice, 0 for all
    pub plate: u32,
    /// Uniform scale factor the slicer applies to every object
    pub scale: f64,
    /// Keep object positions instead of auto-arranging
    pub disable_arrange: bool,
}

impl Default for SliceOptions {
    fn default() -> Self {
        Self {
            plate: 0,
            scale: 1.0,
            disable_arrange: false,
        }
    }
}

/// Captured result of one slicer run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SliceRun {
    /// Process exited successfully
    pub success: bool,
    /// Exit code, absent when killed by a signal
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// External slicer
///
/// Implementations write `plate_<n>.gcode` into `workdir`.
pub trait Slicer {
    /// Slice `input`; a failed run is reported in the [`SliceRun`], not as an error
    fn slice(&self, input: &Path, workdir: &Path, opts: &SliceOptions) -> Result<SliceRun>;
}

/// Slicer driven through its command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSlicer {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessSlicer {
    /// Run `program` for each slice
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments placed before the generated ones
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, input: &Path, workdir: &Path, opts: &SliceOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .arg("--slice")
            .arg(opts.plate.to_string())
            .arg("--outputdir")
            .arg(workdir);
        if (opts.scale - 1.0).abs() * 100.0 > SCALE_EPSILON {
            cmd.arg("--scale").arg(format!("{}", opts.scale));
        }
        if opts.disable_arrange {
            cmd.arg("--arrange").arg("0");
        }
        cmd.arg(input);
        cmd
    }
}

impl Slicer for ProcessSlicer {
    fn slice(&self, input: &Path, workdir: &Path, opts: &SliceOptions) -> Result<SliceRun> {
        let output = self.command(input, workdir, opts).output()?;
        Ok(SliceRun {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Whether a failed run was caused by the prime/wipe tower colliding with
/// the objects
pub fn is_wipe_tower_conflict(run: &SliceRun) -> bool {
    let combined = format!("{}\n{}", run.stdout, run.stderr).to_lowercase();
    let (first, second) = WIPE_TOWER_PAIRED_SIGNATURE;
    WIPE_TOWER_SIGNATURES.iter().any(|s| combined.contains(s))
        || (combined.contains(first) && combined.contains(second))
}

/// One slicing job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    /// Uploaded 3MF
    pub source: PathBuf,
    /// Where the G-code is written
    pub output: PathBuf,
    /// Workspace directory; a temporary one is created when absent
    pub workdir: Option<PathBuf>,
    /// Profile merge inputs
    pub embed: EmbedRequest,
    /// Moves applied after embedding
    pub object_transforms: Vec<ObjectTransform>,
    /// 1-based plate to slice; all plates when absent
    pub plate_id: Option<usize>,
    /// Object scale in percent
    pub scale_percent: f64,
    /// Copies laid out in a grid
    pub copies: usize,
    /// Gap between copies in millimetres
    pub copy_spacing: f64,
    /// Ask for a prime tower
    pub enable_prime_tower: bool,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            source: PathBuf::new(),
            output: PathBuf::from("output.gcode"),
            workdir: None,
            embed: EmbedRequest::default(),
            object_transforms: Vec::new(),
            plate_id: None,
            scale_percent: 100.0,
            copies: 1,
            copy_spacing: 5.0,
            enable_prime_tower: false,
        }
    }
}

impl JobSpec {
    fn scale_active(&self) -> bool {
        (self.scale_percent - 100.0).abs() > SCALE_EPSILON
    }

    fn layout_scale_active(&self) -> bool {
        self.scale_percent > 100.0 + SCALE_EPSILON
    }

    fn multi_tool(&self) -> bool {
        self.embed.requested_filament_count > 1
    }

    /// Prime tower wanted, either asked for or implied by multi-tool copies
    fn needs_prime_tower(&self) -> bool {
        self.enable_prime_tower || (self.copies > 1 && self.multi_tool())
    }

    fn validate(&self) -> Result<()> {
        if !self.scale_percent.is_finite() || self.scale_percent <= 0.0 {
            return Err(Error::InvalidRequest(format!(
                "scale_percent must be positive, got {}",
                self.scale_percent
            )));
        }
        if self.copies == 0 {
            return Err(Error::InvalidRequest("copies must be >= 1".to_string()));
        }
        if !self.source.is_file() {
            return Err(Error::InvalidRequest(format!(
                "Source 3MF file not found: {}",
                self.source.display()
            )));
        }
        Ok(())
    }
}

/// Outcome of a successful job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutput {
    /// Final G-code location
    pub gcode_path: PathBuf,
    /// How settings were embedded
    pub embed: EmbedOutcome,
    /// Moves applied to the build items
    pub transforms: Option<ApplyReport>,
    /// Copy grid, when copies were requested
    pub copy_layout: Option<CopyLayout>,
    /// Tools selected in the G-code
    pub tools_used: BTreeSet<u32>,
    /// Whether the prime tower was dropped after a conflict
    pub prime_tower_retry: bool,
    /// Plate number handed to the slicer
    pub sliced_plate: u32,
}

/// Per-job working directory
#[derive(Debug)]
pub enum JobWorkspace {
    /// Removed with everything in it when dropped
    Temporary(TempDir),
    /// Caller-owned; only files created through [`JobWorkspace::stage`] are removed
    Existing(PathBuf),
}

impl JobWorkspace {
    /// Use `dir` (created if missing) or a fresh temporary directory
    pub fn create(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(path) => {
                fs::create_dir_all(path)?;
                Ok(Self::Existing(path.to_path_buf()))
            }
            None => Ok(Self::Temporary(
                tempfile::Builder::new().prefix("plate-bridge-").tempdir()?,
            )),
        }
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        match self {
            Self::Temporary(dir) => dir.path(),
            Self::Existing(path) => path,
        }
    }

    /// Claim a named intermediate file; it is deleted when the guard drops
    pub fn stage(&self, name: &str) -> Stage {
        Stage {
            path: self.path().join(name),
        }
    }
}

/// Intermediate file owned by a job
#[derive(Debug)]
pub struct Stage {
    path: PathBuf,
}

impl Stage {
    /// File location
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "removed intermediate"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "could not remove intermediate"),
        }
    }
}

/// Files and facts produced by stages 1-4
struct Prepared {
    sliceable: PathBuf,
    embed: EmbedOutcome,
    transforms: Option<ApplyReport>,
    copy_layout: Option<CopyLayout>,
}

/// Runs the stage chain for one job
struct JobRunner<'a> {
    spec: &'a JobSpec,
    config: PipelineConfig,
    probes: ProbeCache,
    // dropped before the workspace
    stages: Vec<Stage>,
    workspace: JobWorkspace,
}

impl JobRunner<'_> {
    fn stage(&mut self, name: &str) -> PathBuf {
        let stage = self.workspace.stage(name);
        let path = stage.path().to_path_buf();
        self.stages.push(stage);
        path
    }

    /// Stages 1-4 from the source, with `suffix` naming this attempt's files
    fn prepare(&mut self, embedder: &mut ProfileEmbedder, request: &EmbedRequest, suffix: &str) -> Result<Prepared> {
        let spec = self.spec;
        let bed = self.config.bed;

        let mut request = request.clone();
        if request.probes.is_none() {
            request.probes = Some(self.probes.get_or_probe(&spec.source, &self.config)?.clone());
        }
        let embedded = self.stage(&format!("embedded{}.3mf", suffix));
        let embed = embedder.embed(&spec.source, &embedded, &request)?;
        tracing::info!(path = ?embed.path, slots = embed.filament_slots, "profile-embedded 3MF created");

        let mut current = embedded.clone();
        let mut transforms = None;
        if !spec.object_transforms.is_empty() {
            let moved = self.stage(&format!("embedded{}_transformed.3mf", suffix));
            let report = apply_object_transforms(&current, &moved, &spec.object_transforms)?;
            tracing::info!(applied = report.applied_count, "applied object transforms");
            enforce_transformed_bounds(
                &moved,
                &bed,
                spec.plate_id,
                Some(&embedded),
                self.config.nesting_depth_limit,
            )?;
            transforms = Some(report);
            current = moved;
        }

        if spec.layout_scale_active() {
            let scaled = self.stage(&format!("embedded{}_layout_scaled.3mf", suffix));
            apply_layout_scale(&current, &scaled, spec.scale_percent)?;
            tracing::info!(percent = spec.scale_percent, "pre-scaled assembly offsets");
            current = scaled;
        }

        let mut copy_layout = None;
        if spec.copies > 1 {
            let copied = self.stage(&format!("sliceable{}.3mf", suffix));
            let layout = apply_copies(
                &current,
                &copied,
                spec.copies,
                spec.copy_spacing,
                spec.scale_percent / 100.0,
                &bed,
            )?;
            if !layout.fits_bed {
                return Err(Error::OutOfBuildVolume(format!(
                    "{} copies at {:.0}% scale do not fit build plate. Reduce copies or scale.",
                    spec.copies, spec.scale_percent
                )));
            }
            tracing::info!(copies = spec.copies, cols = layout.cols, rows = layout.rows, "applied copies");
            copy_layout = Some(layout);
            current = copied;
        }

        Ok(Prepared {
            sliceable: current,
            embed,
            transforms,
            copy_layout,
        })
    }

    fn slice(&self, slicer: &dyn Slicer, input: &Path, opts: &SliceOptions) -> Result<SliceRun> {
        clear_plate_outputs(self.workspace.path())?;
        tracing::info!(input = %input.display(), plate = opts.plate, scale = opts.scale, "invoking slicer");
        let run = slicer.slice(input, self.workspace.path(), opts)?;
        if !run.success {
            tracing::warn!(exit_code = ?run.exit_code, "slicer run failed");
        }
        Ok(run)
    }
}

/// Slice one job end to end
///
/// # Errors
///
/// - [`Error::InvalidRequest`] for an unusable spec
/// - [`Error::OutOfBuildVolume`] when transforms or copies leave the bed
/// - [`Error::Slicer`] when the slicer fails or writes no G-code
/// - [`Error::MulticolorDegenerate`] when several filaments were requested
///   but only tool 0 was used
pub fn run_slice_job(spec: &JobSpec, slicer: &dyn Slicer, embedder: &mut ProfileEmbedder) -> Result<JobOutput> {
    spec.validate()?;
    let config = embedder.config().clone();
    let workspace = JobWorkspace::create(spec.workdir.as_deref())?;
    tracing::info!(workspace = %workspace.path().display(), source = %spec.source.display(), "starting slice job");

    let mut runner = JobRunner {
        spec,
        config,
        probes: ProbeCache::new(),
        stages: Vec::new(),
        workspace,
    };
    let probes = runner.probes.get_or_probe(&spec.source, &runner.config)?;
    let (request, sliced_plate) = job_request(spec, probes, &runner.config)?;
    let opts = SliceOptions {
        plate: sliced_plate,
        scale: if spec.scale_active() { spec.scale_percent / 100.0 } else { 1.0 },
        disable_arrange: !spec.object_transforms.is_empty(),
    };

    let mut prepared = runner.prepare(embedder, &request, "")?;
    let mut run = runner.slice(slicer, &prepared.sliceable, &opts)?;

    let mut prime_tower_retry = false;
    if !run.success && spec.needs_prime_tower() && is_wipe_tower_conflict(&run) {
        tracing::warn!("detected wipe-tower path conflict; retrying once with prime tower disabled");
        let mut retry = request.clone();
        retry
            .overrides
            .insert("enable_prime_tower".to_string(), Value::from("0"));
        prepared = runner.prepare(embedder, &retry, "_no_prime")?;
        run = runner.slice(slicer, &prepared.sliceable, &opts)?;
        prime_tower_retry = true;
    }

    if !run.success {
        tracing::error!(exit_code = ?run.exit_code, stdout = %run.stdout, stderr = %run.stderr, "slicer failed");
        return Err(Error::slicer_output(&run.stderr, runner.config.stderr_truncate));
    }

    let gcode_file = find_plate_output(runner.workspace.path())?
        .ok_or_else(|| Error::Slicer("G-code file not generated by Orca".to_string()))?;
    let gcode_stage = runner.stage(&file_name(&gcode_file));
    tracing::info!(gcode = %gcode_stage.display(), "found G-code file");

    let tools_used = gcode::tools_used(BufReader::new(fs::File::open(&gcode_stage)?))?;
    tracing::info!(tools = ?tools_used, "tools used in G-code");
    if spec.multi_tool() && tools_used.iter().all(|&t| t == 0) {
        return Err(Error::MulticolorDegenerate(
            "Multicolour requested, but slicer produced single-tool G-code (T0 only).".to_string(),
        ));
    }

    deliver(&gcode_stage, &spec.output)?;
    tracing::info!(output = %spec.output.display(), "slice job finished");

    Ok(JobOutput {
        gcode_path: spec.output.clone(),
        embed: prepared.embed,
        transforms: prepared.transforms,
        copy_layout: prepared.copy_layout,
        tools_used,
        prime_tower_retry,
        sliced_plate,
    })
}

/// The embed request for this job and the plate number the slicer sees
fn job_request(spec: &JobSpec, probes: &ProbeReport, config: &PipelineConfig) -> Result<(EmbedRequest, u32)> {
    let mut request = spec.embed.clone();

    let tower = if spec.needs_prime_tower() { "1" } else { "0" };
    if spec.needs_prime_tower() && !spec.enable_prime_tower {
        tracing::info!("auto-enabling prime tower for multi-color copies");
    }
    request
        .overrides
        .insert("enable_prime_tower".to_string(), Value::from(tower));
    if spec.multi_tool() {
        for (key, value) in MULTI_TOOL_OVERRIDES {
            request.overrides.insert(key.to_string(), Value::from(value));
        }
    }

    let Some(plate_id) = spec.plate_id else {
        return Ok((request, 0));
    };
    let plates = parse_plates(&spec.source, config.nesting_depth_limit)?;
    let plate = plates.get(plate_id).ok_or_else(|| {
        Error::PlateNotFound(format!("Plate {} out of range (1-{})", plate_id, plates.plates.len()))
    })?;
    let sliced = if probes.is_vendor_format {
        let vendor = plate.vendor_plate_id.unwrap_or_else(|| {
            tracing::info!(object = %plate.object_id, "no plater_id for object, slicing vendor plate 1");
            1
        });
        if request.vendor_plate_id.is_none() {
            request.vendor_plate_id = Some(vendor);
        }
        vendor
    } else {
        u32::try_from(plate_id).map_err(|_| Error::PlateNotFound(format!("Plate {} out of range", plate_id)))?
    };
    if sliced as usize != plate_id {
        tracing::info!(plate = plate_id, vendor_plate = sliced, "mapped plate to vendor plate");
    }
    Ok((request, sliced))
}

fn is_plate_output(path: &Path) -> bool {
    let name = file_name(path);
    name.starts_with("plate_") && name.ends_with(".gcode")
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// First `plate_*.gcode` in `dir` by name
fn find_plate_output(dir: &Path) -> Result<Option<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_plate_output(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

/// Remove G-code left by an earlier attempt
fn clear_plate_outputs(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_plate_output(&path) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Move the finished G-code out of the workspace
fn deliver(gcode: &Path, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(gcode, output).is_err() {
        copy_archive(gcode, output)?;
    }
    Ok(())
}
