//! sphere: Command-line interface for spherical landmark registration.
//!
//! Registers an individual's spherical surface onto an atlas sphere using
//! paired borders, then carries per-node data across and analyses it.
//!
//! # Logging
//!
//! Set the `RUST_LOG` environment variable to control log output:
//! - `RUST_LOG=sphere_register=info` - Stage and cycle logging
//! - `RUST_LOG=sphere_register=debug` - Per-operation detail
//! - `RUST_LOG=sphere_register::timing=debug` - Performance timing
//! - `RUST_LOG=debug` - All debug output
//!
//! # Example
//!
//! ```bash
//! # Write a starting deformation map, then register
//! sphere init-map -o map.toml
//! sphere deform --source-sphere lh.sphere.obj --source-borders lh.border \
//!     --target-sphere atlas.sphere.obj --target-borders atlas.border \
//!     --map map.toml -o out/
//!
//! # Carry a metric onto the atlas and find its clusters
//! sphere apply --atlas atlas.sphere.obj --deformed out/deformed_lh.sphere.obj \
//!     --values thickness.csv -o atlas_thickness.csv
//! sphere cluster atlas.sphere.obj atlas_thickness.csv --column thickness --min 3.0 --max 10.0
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod commands;
mod output;

use commands::{apply, cluster, deform, info, init_map, sphere};

/// sphere - A command-line tool for spherical surface registration.
///
/// Register cortical surface spheres to an atlas with landmark borders.
#[derive(Parser)]
#[command(name = "sphere")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format for results
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Suppress all non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Display sphere statistics and crossovers
    Info {
        /// Input mesh file
        input: PathBuf,

        /// Also report surface area and bounds
        #[arg(long)]
        detailed: bool,
    },

    /// Write a canonical sphere
    Sphere {
        /// Node count (74, 290, 1154, 4610, 18434, 73730)
        #[arg(long, short, default_value = "4610")]
        resolution: usize,

        /// Output file path (format determined by extension)
        #[arg(short, long)]
        output: PathBuf,

        /// Sphere radius
        #[arg(long, default_value = "100.0")]
        radius: f64,
    },

    /// Write a deformation map with the default three-stage schedule
    InitMap {
        /// Output file path (.toml or .json)
        #[arg(short, long)]
        output: PathBuf,

        /// Register a right hemisphere onto a left atlas (or the reverse)
        #[arg(long)]
        different_hemispheres: bool,
    },

    /// Register a source sphere onto a target sphere
    Deform {
        /// Source (individual) spherical surface
        #[arg(long)]
        source_sphere: PathBuf,

        /// Source landmark borders
        #[arg(long)]
        source_borders: PathBuf,

        /// Target (atlas) spherical surface
        #[arg(long)]
        target_sphere: PathBuf,

        /// Target landmark borders
        #[arg(long)]
        target_borders: PathBuf,

        /// Deformation map (.toml or .json); defaults apply when omitted
        #[arg(long)]
        map: Option<PathBuf>,

        /// Directory for the deformed surface and intermediate files
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Source fiducial surface, for distortion correction
        #[arg(long, requires = "target_fiducial")]
        source_fiducial: Option<PathBuf>,

        /// Target fiducial surface, for distortion correction
        #[arg(long, requires = "source_fiducial")]
        target_fiducial: Option<PathBuf>,

        /// Directory of canonical sphere files (sphere.<N>.obj); generated when omitted
        #[arg(long)]
        sphere_dir: Option<PathBuf>,

        /// Stop at crossovers and ask whether to continue
        #[arg(long)]
        pause: bool,

        /// Keep intermediate files in the output directory
        #[arg(long)]
        keep_intermediates: bool,
    },

    /// Carry per-node values from a deformed source onto the target sphere
    Apply {
        /// Target (atlas) spherical surface
        #[arg(long)]
        atlas: PathBuf,

        /// Deformed source surface from `sphere deform`
        #[arg(long)]
        deformed: PathBuf,

        /// Per-node values on the source (CSV)
        #[arg(long, conflicts_with = "labels")]
        values: Option<PathBuf>,

        /// Per-node labels on the source (node,label CSV)
        #[arg(long, conflicts_with = "values")]
        labels: Option<PathBuf>,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Find connected clusters of thresholded per-node values
    Cluster {
        /// Surface the values live on
        mesh: PathBuf,

        /// Per-node values (CSV)
        values: PathBuf,

        /// Column to threshold; the first column when omitted
        #[arg(long)]
        column: Option<String>,

        /// Lower bound of the positive range
        #[arg(long, allow_hyphen_values = true)]
        min: f64,

        /// Upper bound of the positive range
        #[arg(long, allow_hyphen_values = true)]
        max: f64,

        /// Lower bound of the negative range
        #[arg(long, allow_hyphen_values = true, requires = "neg_max")]
        neg_min: Option<f64>,

        /// Upper bound of the negative range
        #[arg(long, allow_hyphen_values = true, requires = "neg_min")]
        neg_max: Option<f64>,

        /// Minimum cluster size in nodes
        #[arg(long, conflicts_with = "min_area")]
        min_nodes: Option<usize>,

        /// Minimum cluster size in surface area
        #[arg(long, conflicts_with = "min_nodes")]
        min_area: Option<f64>,

        /// Keep clusters below the minimum size instead of discarding them
        #[arg(long)]
        keep_small: bool,

        /// Write the values with discarded clusters zeroed
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Initialize the tracing subscriber based on verbosity level.
fn init_tracing(verbose: u8, quiet: bool) {
    if quiet {
        return;
    }

    // RUST_LOG wins over -v flags
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "sphere_register=info",
            2 => "sphere_register=debug",
            _ => "trace",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn main() -> Result<()> {
    #[cfg(debug_assertions)]
    miette::set_panic_hook();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = match &cli.command {
        Commands::Info { input, detailed } => info::run(input, *detailed, &cli),
        Commands::Sphere {
            resolution,
            output,
            radius,
        } => sphere::run(*resolution, output, *radius, &cli),
        Commands::InitMap {
            output,
            different_hemispheres,
        } => init_map::run(output, *different_hemispheres, &cli),
        Commands::Deform {
            source_sphere,
            source_borders,
            target_sphere,
            target_borders,
            map,
            output_dir,
            source_fiducial,
            target_fiducial,
            sphere_dir,
            pause,
            keep_intermediates,
        } => deform::run(
            &deform::DeformArgs {
                source_sphere,
                source_borders,
                target_sphere,
                target_borders,
                map: map.as_deref(),
                output_dir,
                fiducials: source_fiducial.as_deref().zip(target_fiducial.as_deref()),
                sphere_dir: sphere_dir.as_deref(),
                pause: *pause,
                keep_intermediates: *keep_intermediates,
            },
            &cli,
        ),
        Commands::Apply {
            atlas,
            deformed,
            values,
            labels,
            output,
        } => apply::run(
            atlas,
            deformed,
            values.as_deref(),
            labels.as_deref(),
            output,
            &cli,
        ),
        Commands::Cluster {
            mesh,
            values,
            column,
            min,
            max,
            neg_min,
            neg_max,
            min_nodes,
            min_area,
            keep_small,
            output,
        } => cluster::run(
            &cluster::ClusterArgs {
                mesh,
                values,
                column: column.as_deref(),
                positive: (*min, *max),
                negative: neg_min.zip(*neg_max),
                min_nodes: *min_nodes,
                min_area: *min_area,
                keep_small: *keep_small,
                output: output.as_deref(),
            },
            &cli,
        ),
    };

    if let Err(e) = &result {
        if !cli.quiet {
            if let Some(err) = e.downcast_ref::<sphere_register::RegisterError>() {
                eprintln!("{}: {}", "Error".red().bold(), err);
                eprintln!("  {}: {}", "Code".cyan(), err.code());
                eprintln!("  {}: {}", "Suggestion".green(), err.recovery_suggestion());
                if let Some(location) = err.location() {
                    eprintln!("  {}: {}", "Location".yellow(), location);
                }
            } else {
                eprintln!("{}: {}", "Error".red().bold(), e);
                for cause in e.chain().skip(1) {
                    eprintln!("  {}: {}", "Caused by".yellow(), cause);
                }
            }
        }
        let aborted = e
            .downcast_ref::<sphere_register::RegisterError>()
            .is_some_and(|err| err.is_user_abort());
        std::process::exit(if aborted { 2 } else { 1 });
    }

    Ok(())
}
