//! sphere init-map command - write a starting deformation map.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use sphere_register::DeformationMap;

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct InitMapResult {
    output: String,
    stages: Vec<usize>,
    total_cycles: usize,
}

pub fn run(output_path: &Path, different_hemispheres: bool, cli: &Cli) -> Result<()> {
    let mut map = DeformationMap::default();
    map.different_hemispheres = different_hemispheres;
    map.save(output_path)
        .with_context(|| format!("Failed to save deformation map to {:?}", output_path))?;

    let result = InitMapResult {
        output: output_path.display().to_string(),
        stages: map.stages.iter().map(|s| s.resolution).collect(),
        total_cycles: map.total_cycles(),
    };

    match cli.format {
        OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
        OutputFormat::Text => {
            output::success(
                &format!("Deformation map saved to {}", output_path.display()),
                cli.format,
                cli.quiet,
            );
            if !cli.quiet {
                for (i, stage) in map.stages.iter().enumerate() {
                    println!(
                        "  {} {}: {} nodes, {} cycles",
                        "Stage".cyan(),
                        i + 1,
                        stage.resolution,
                        stage.cycles.len()
                    );
                }
            }
        }
    }

    Ok(())
}
