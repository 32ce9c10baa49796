//! sphere cluster command - connected clusters of thresholded values.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use sphere_register::io::{load_scalars, save_scalars};
use sphere_register::{
    Cluster, ClusterParams, MinimumSize, NodeScalars, SmallClusterPolicy, find_clusters, load_mesh,
    mask_small_clusters,
};

use crate::{Cli, OutputFormat, output};

pub struct ClusterArgs<'a> {
    pub mesh: &'a Path,
    pub values: &'a Path,
    pub column: Option<&'a str>,
    pub positive: (f64, f64),
    pub negative: Option<(f64, f64)>,
    pub min_nodes: Option<usize>,
    pub min_area: Option<f64>,
    pub keep_small: bool,
    pub output: Option<&'a Path>,
}

#[derive(Serialize)]
struct ClusterResult<'a> {
    mesh: String,
    column: String,
    qualifying_nodes: usize,
    kept: usize,
    clusters: &'a [Cluster],
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
}

pub fn run(args: &ClusterArgs<'_>, cli: &Cli) -> Result<()> {
    let mesh = load_mesh(args.mesh).with_context(|| format!("Failed to load mesh from {:?}", args.mesh))?;
    let scalars = load_scalars(args.values)
        .with_context(|| format!("Failed to load values from {:?}", args.values))?;

    let column_name = match args.column {
        Some(name) => name.to_string(),
        None => scalars
            .names
            .first()
            .cloned()
            .context("Values file has no columns")?,
    };
    let values = scalars
        .column(&column_name)
        .with_context(|| format!("No column {:?} in {:?}", column_name, args.values))?;

    let mut params = ClusterParams::positive(args.positive.0, args.positive.1);
    if let Some((min, max)) = args.negative {
        params = params.with_negative(min, max);
    }
    if let Some(nodes) = args.min_nodes {
        params = params.with_minimum(MinimumSize::Nodes(nodes));
    } else if let Some(area) = args.min_area {
        params = params.with_minimum(MinimumSize::Area(area));
    }
    if args.keep_small {
        params = params.with_policy(SmallClusterPolicy::Keep);
    }

    let analysis = find_clusters(&mesh, values, &params)?;

    if let Some(path) = args.output {
        let masked = mask_small_clusters(values, &analysis);
        save_scalars(&NodeScalars::new().with_column(column_name.clone(), masked), path)
            .with_context(|| format!("Failed to save masked values to {:?}", path))?;
    }

    let result = ClusterResult {
        mesh: args.mesh.display().to_string(),
        column: column_name,
        qualifying_nodes: analysis.qualifying_nodes,
        kept: analysis.kept().count(),
        clusters: &analysis.clusters,
        output: args.output.map(|p| p.display().to_string()),
    };

    match cli.format {
        OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
        OutputFormat::Text => {
            if !cli.quiet {
                print!("{}", analysis);
                if analysis.clusters.is_empty() {
                    println!("  {}", "No node falls in the threshold ranges".yellow());
                }
            }
            if let Some(path) = &result.output {
                output::success(&format!("Masked values saved to {}", path), cli.format, cli.quiet);
            }
        }
    }

    Ok(())
}
