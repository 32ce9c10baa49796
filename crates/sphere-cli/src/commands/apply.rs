//! sphere apply command - carry per-node data onto the target sphere.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use sphere_register::io::{load_labels, load_scalars, save_labels, save_scalars};
use sphere_register::{NodeMapping, NodeScalars, load_mesh};

use crate::{Cli, OutputFormat, output};

#[derive(Serialize)]
struct ApplyResult {
    output: String,
    source_nodes: usize,
    target_nodes: usize,
    columns: Vec<String>,
}

pub fn run(
    atlas: &Path,
    deformed: &Path,
    values: Option<&Path>,
    labels: Option<&Path>,
    output_path: &Path,
    cli: &Cli,
) -> Result<()> {
    let atlas_mesh = load_mesh(atlas).with_context(|| format!("Failed to load atlas from {:?}", atlas))?;
    let deformed_mesh = load_mesh(deformed)
        .with_context(|| format!("Failed to load deformed surface from {:?}", deformed))?;
    let mapping = NodeMapping::build(&atlas_mesh, &deformed_mesh)
        .with_context(|| "Failed to map atlas nodes onto the deformed surface")?;

    let columns = match (values, labels) {
        (Some(path), _) => {
            let scalars =
                load_scalars(path).with_context(|| format!("Failed to load values from {:?}", path))?;
            let mut mapped = NodeScalars::new();
            for (name, column) in scalars.names.iter().zip(&scalars.columns) {
                let carried = mapping
                    .map_scalars(column)
                    .with_context(|| format!("Column {:?} does not match the deformed surface", name))?;
                mapped = mapped.with_column(name.clone(), carried);
            }
            save_scalars(&mapped, output_path)
                .with_context(|| format!("Failed to save values to {:?}", output_path))?;
            scalars.names
        }
        (None, Some(path)) => {
            let source_labels =
                load_labels(path).with_context(|| format!("Failed to load labels from {:?}", path))?;
            let carried = mapping.map_labels(&source_labels)?;
            save_labels(&carried, output_path)
                .with_context(|| format!("Failed to save labels to {:?}", output_path))?;
            vec!["labels".to_string()]
        }
        (None, None) => anyhow::bail!("Nothing to apply: pass --values or --labels"),
    };

    let result = ApplyResult {
        output: output_path.display().to_string(),
        source_nodes: deformed_mesh.node_count(),
        target_nodes: atlas_mesh.node_count(),
        columns,
    };

    match cli.format {
        OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
        OutputFormat::Text => {
            output::success(
                &format!("Mapped data saved to {}", output_path.display()),
                cli.format,
                cli.quiet,
            );
            if !cli.quiet {
                println!(
                    "  {}: {} → {} nodes",
                    "Nodes".cyan(),
                    result.source_nodes,
                    result.target_nodes
                );
                println!("  {}: {}", "Columns".cyan(), result.columns.join(", "));
            }
        }
    }

    Ok(())
}
