//! plate-bridge: command-line host for the 3MF transform pipeline
//!
//! Every subcommand prints a JSON report on stdout. Failures print a JSON
//! object with the error kind and message on stderr and exit non-zero
//! (2 for caller-actionable errors, 1 otherwise).
//!
//! # Logging
//!
//! Set `RUST_LOG` to control log output, e.g. `RUST_LOG=plate_bridge=debug`.
//! Without it, `-v` raises the level to info and `-vv` to debug.

use clap::{Parser, Subcommand, ValueEnum};
use plate_bridge::gcode::{self, ParseOptions, RenderOptions};
use plate_bridge::pipeline::{JobSpec, ProcessSlicer, run_slice_job};
use plate_bridge::probe::{plate_json_ids, preview_index};
use plate_bridge::{
    BedVolume, EmbedRequest, ObjectTransform, Package, PipelineConfig, ProbeReport,
    ProfileEmbedder, Result, Scene, apply_copies, apply_layout_scale, apply_object_transforms,
    apply_uniform_scale, extract_plate, layout, parse_plates, strip_modifier_parts,
    strip_non_printable_items,
};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "plate-bridge")]
#[command(author, version, about = "3MF transform pipeline for multi-extruder printers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pipeline configuration JSON; missing keys take defaults
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScaleMode {
    /// Scale meshes and their positions
    Uniform,
    /// Scale only the spacing between parts and objects
    Layout,
}

#[derive(Subcommand)]
enum Commands {
    /// List the plates of a file
    Plates {
        /// Input 3MF
        input: PathBuf,
    },

    /// List build items with their bounds
    Items {
        /// Input 3MF
        input: PathBuf,

        /// Only items of this plate
        #[arg(long)]
        plate: Option<usize>,
    },

    /// Placement report for a viewer
    Layout {
        /// Input 3MF
        input: PathBuf,

        /// Narrow the report to one plate
        #[arg(long)]
        plate: Option<usize>,
    },

    /// Move and rotate build items
    Transform {
        /// Input 3MF
        input: PathBuf,

        /// Output 3MF
        #[arg(short, long)]
        output: PathBuf,

        /// JSON array of `{build_item_index, object_id?, translate_x_mm, translate_y_mm, rotate_z_deg}`
        #[arg(long, value_name = "JSON")]
        transforms: String,

        /// Check that the result still sits on the bed
        #[arg(long)]
        check_bounds: bool,
    },

    /// Scale objects
    Scale {
        /// Input 3MF
        input: PathBuf,

        /// Output 3MF
        #[arg(short, long)]
        output: PathBuf,

        /// Scale in percent
        #[arg(long)]
        percent: f64,

        /// What to scale
        #[arg(long, value_enum, default_value = "uniform")]
        mode: ScaleMode,
    },

    /// Keep one plate printable
    Extract {
        /// Input 3MF
        input: PathBuf,

        /// Output 3MF
        #[arg(short, long)]
        output: PathBuf,

        /// 1-based plate id
        #[arg(long)]
        plate: usize,
    },

    /// Remove modifier parts and non-printable items
    Strip {
        /// Input 3MF
        input: PathBuf,

        /// Output 3MF
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Lay out copies of the printable items in a grid
    Copies {
        /// Input 3MF
        input: PathBuf,

        /// Output 3MF
        #[arg(short, long)]
        output: PathBuf,

        /// Number of copies
        #[arg(long)]
        count: usize,

        /// Gap between copies (mm)
        #[arg(long, default_value = "5.0")]
        spacing: f64,

        /// Scale factor the slicer will apply
        #[arg(long, default_value = "1.0")]
        scale: f64,
    },

    /// Report vendor metadata probes
    Probe {
        /// Input 3MF
        input: PathBuf,
    },

    /// Embed merged profile settings
    Embed {
        /// Input 3MF
        input: PathBuf,

        /// Output 3MF
        #[arg(short, long)]
        output: PathBuf,

        /// Embed request JSON file
        #[arg(long, value_name = "FILE")]
        request: Option<PathBuf>,
    },

    /// Render a G-code preview PNG
    Render {
        /// Input G-code
        input: PathBuf,

        /// Output PNG
        #[arg(short, long)]
        output: PathBuf,

        /// Canvas height in pixels
        #[arg(long, default_value = "800")]
        size: u32,

        /// Tool colours, e.g. `#ff0000`
        #[arg(long, value_delimiter = ',')]
        colors: Vec<String>,
    },

    /// Bounds, tools and optionally layers of a G-code file
    GcodeInfo {
        /// Input G-code
        input: PathBuf,

        /// First layer to list
        #[arg(long, default_value = "0")]
        layer_start: i64,

        /// Layers to list; none by default
        #[arg(long, default_value = "0")]
        layer_count: usize,
    },

    /// Run a full slicing job with an external slicer
    Slice {
        /// Job spec JSON file
        job: PathBuf,

        /// Slicer executable
        #[arg(long, default_value = "orca-slicer")]
        slicer: PathBuf,
    },
}

/// Initialize the tracing subscriber from `RUST_LOG` or the verbosity flag
fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "plate_bridge=info",
            2 => "plate_bridge=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::from_json_file(p),
        None => Ok(PipelineConfig::default()),
    }
}

fn gcode_reader(path: &Path) -> Result<BufReader<File>> {
    Ok(BufReader::new(File::open(path)?))
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let bed: BedVolume = config.bed;
    let depth = config.nesting_depth_limit;

    match &cli.command {
        Commands::Plates { input } => print_json(&parse_plates(input, depth)?),
        Commands::Items { input, plate } => {
            let mut scene = Scene::open_path(input, depth)?;
            print_json(&scene.list_build_items(*plate)?)
        }
        Commands::Layout { input, plate } => {
            let mut scene = Scene::open_path(input, depth)?;
            print_json(&layout(&mut scene, bed, *plate)?)
        }
        Commands::Transform {
            input,
            output,
            transforms,
            check_bounds,
        } => {
            let transforms: Vec<ObjectTransform> = serde_json::from_str(transforms)?;
            let report = apply_object_transforms(input, output, &transforms)?;
            if *check_bounds {
                plate_bridge::enforce_transformed_bounds(output, &bed, None, Some(input), depth)?;
            }
            print_json(&report)
        }
        Commands::Scale {
            input,
            output,
            percent,
            mode,
        } => {
            match mode {
                ScaleMode::Uniform => apply_uniform_scale(input, output, *percent)?,
                ScaleMode::Layout => apply_layout_scale(input, output, *percent)?,
            }
            print_json(&json!({ "output": output, "scale_percent": percent }))
        }
        Commands::Extract {
            input,
            output,
            plate,
        } => {
            extract_plate(input, output, *plate)?;
            print_json(&json!({ "output": output, "plate_id": plate }))
        }
        Commands::Strip { input, output } => {
            let scratch = tempfile::NamedTempFile::new_in(
                output.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new(".")),
            )?;
            strip_modifier_parts(input, scratch.path())?;
            let removed = strip_non_printable_items(scratch.path(), output)?;
            if !removed {
                plate_bridge::archive::copy_archive(scratch.path(), output)?;
            }
            print_json(&json!({ "output": output, "non_printable_removed": removed }))
        }
        Commands::Copies {
            input,
            output,
            count,
            spacing,
            scale,
        } => print_json(&apply_copies(input, output, *count, *spacing, *scale, &bed)?),
        Commands::Probe { input } => {
            let mut package = Package::open_path(input)?;
            let report = ProbeReport::probe(&mut package, config.paint_scan_limit);
            let previews = preview_index(&package);
            let plate_json = plate_json_ids(&package);
            print_json(&json!({
                "probes": report,
                "previews": previews,
                "plate_json_ids": plate_json,
            }))
        }
        Commands::Embed {
            input,
            output,
            request,
        } => {
            let request: EmbedRequest = match request {
                Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
                None => EmbedRequest::default(),
            };
            let mut embedder = ProfileEmbedder::new(config.clone());
            print_json(&embedder.embed(input, output, &request)?)
        }
        Commands::Render {
            input,
            output,
            size,
            colors,
        } => {
            let set = gcode::parse_segments(gcode_reader(input)?, &ParseOptions::from(&config))?;
            let options = RenderOptions {
                size: *size,
                bed_size: bed.x.max(bed.y),
                filament_colors: colors.clone(),
                ..RenderOptions::default()
            };
            std::fs::write(output, gcode::render_png(&set, &options)?)?;
            print_json(&json!({
                "output": output,
                "extrusions": set.extrusions.len(),
                "travels": set.travels.len(),
                "stride": set.stride,
            }))
        }
        Commands::GcodeInfo {
            input,
            layer_start,
            layer_count,
        } => {
            let bounds = gcode::bounds(gcode_reader(input)?)?;
            let tools = gcode::tools_used(gcode_reader(input)?)?;
            let layers = gcode::layers(gcode_reader(input)?, *layer_start, *layer_count)?;
            print_json(&json!({
                "bounds": bounds,
                "tools_used": tools,
                "layers": layers,
            }))
        }
        Commands::Slice { job, slicer } => {
            let spec: JobSpec = serde_json::from_str(&std::fs::read_to_string(job)?)?;
            let mut embedder = ProfileEmbedder::new(config.clone());
            let output = run_slice_job(&spec, &ProcessSlicer::new(slicer), &mut embedder)?;
            print_json(&output)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let report = json!({
                "error": e.kind(),
                "message": e.to_string(),
            });
            eprintln!("{}", report);
            if e.is_user_error() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
