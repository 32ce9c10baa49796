//! sphere info command - display sphere statistics.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use sphere_register::{SurfaceHint, crossover_check, load_mesh};

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct SphereInfo {
    path: String,
    nodes: usize,
    tiles: usize,
    radius: f64,
    /// Largest deviation of any node from `radius`.
    radius_deviation: f64,
    crossover_tiles: usize,
    crossover_nodes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    bounds: Option<BoundsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    surface_area: Option<f64>,
}

#[derive(Serialize)]
struct BoundsInfo {
    min: [f64; 3],
    max: [f64; 3],
}

pub fn run(input: &Path, detailed: bool, cli: &Cli) -> Result<()> {
    let mesh = load_mesh(input).with_context(|| format!("Failed to load mesh from {:?}", input))?;

    let radius = mesh.spherical_radius();
    let radius_deviation = mesh
        .vertices
        .iter()
        .map(|v| (v.position.coords.norm() - radius).abs())
        .fold(0.0, f64::max);
    let crossovers = crossover_check(&mesh, SurfaceHint::Sphere);

    let bounds = if detailed {
        mesh.bounds().map(|(min, max)| BoundsInfo {
            min: [min.x, min.y, min.z],
            max: [max.x, max.y, max.z],
        })
    } else {
        None
    };

    let info = SphereInfo {
        path: input.display().to_string(),
        nodes: mesh.node_count(),
        tiles: mesh.tile_count(),
        radius,
        radius_deviation,
        crossover_tiles: crossovers.tiles,
        crossover_nodes: crossovers.nodes,
        bounds,
        surface_area: detailed.then(|| mesh.surface_area()),
    };

    match cli.format {
        OutputFormat::Json => {
            output::print(&info, cli.format, cli.quiet);
        }
        OutputFormat::Text => {
            if !cli.quiet {
                println!("{}", "Sphere Information".bold().underline());
                println!("  {}: {}", "File".cyan(), input.display());
                println!("  {}: {}", "Nodes".cyan(), info.nodes);
                println!("  {}: {}", "Tiles".cyan(), info.tiles);
                println!(
                    "  {}: {:.4} (max deviation {:.2e})",
                    "Radius".cyan(),
                    info.radius,
                    info.radius_deviation
                );

                let crossover_line = format!(
                    "{} nodes, {} tiles",
                    info.crossover_nodes, info.crossover_tiles
                );
                if info.crossover_nodes == 0 {
                    println!("  {}: {}", "Crossovers".cyan(), crossover_line.green());
                } else {
                    println!("  {}: {}", "Crossovers".cyan(), crossover_line.red());
                }

                if let Some(ref b) = info.bounds {
                    println!(
                        "  {}: ({:.2}, {:.2}, {:.2})",
                        "Min bounds".cyan(),
                        b.min[0],
                        b.min[1],
                        b.min[2]
                    );
                    println!(
                        "  {}: ({:.2}, {:.2}, {:.2})",
                        "Max bounds".cyan(),
                        b.max[0],
                        b.max[1],
                        b.max[2]
                    );
                }
                if let Some(area) = info.surface_area {
                    println!("  {}: {:.2}", "Surface area".cyan(), area);
                }
            }
        }
    }

    Ok(())
}
