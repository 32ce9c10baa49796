//! sphere sphere command - write a canonical sphere.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use sphere_register::sphere::SPHERE_RESOLUTIONS;
use sphere_register::{GeneratedSphereLibrary, SphereLibrary, save_mesh};

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct SphereResult {
    output: String,
    resolution: usize,
    tiles: usize,
    radius: f64,
}

pub fn run(resolution: usize, output_path: &Path, radius: f64, cli: &Cli) -> Result<()> {
    if radius <= 0.0 {
        anyhow::bail!("Radius must be positive, got {}", radius);
    }

    let mut mesh = GeneratedSphereLibrary.load(resolution).with_context(|| {
        format!(
            "No canonical sphere with {} nodes (available: {:?})",
            resolution, SPHERE_RESOLUTIONS
        )
    })?;
    mesh.project_to_sphere(radius);
    mesh.compute_normals();

    save_mesh(&mesh, output_path)
        .with_context(|| format!("Failed to save sphere to {:?}", output_path))?;

    let result = SphereResult {
        output: output_path.display().to_string(),
        resolution,
        tiles: mesh.tile_count(),
        radius,
    };

    match cli.format {
        OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
        OutputFormat::Text => {
            output::success(
                &format!("Sphere saved to {}", output_path.display()),
                cli.format,
                cli.quiet,
            );
            if !cli.quiet {
                println!(
                    "  {}: {} nodes, {} tiles, radius {}",
                    "Sphere".cyan(),
                    result.resolution,
                    result.tiles,
                    result.radius
                );
            }
        }
    }

    Ok(())
}
