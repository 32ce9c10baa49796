//! sphere deform command - register a source sphere onto a target sphere.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use sphere_register::{
    CrossoverReport, DeformationInputs, DeformationMap, DeformationOutcome, DirectorySphereLibrary,
    GeneratedSphereLibrary, SphereLibrary, SphericalDeformation, StageSummary, load_borders, load_mesh,
};
use tracing::info;

use crate::{Cli, OutputFormat, output};

/// File the filled-in deformation map is written to.
const MAP_FILE_NAME: &str = "deformation_map.json";

pub struct DeformArgs<'a> {
    pub source_sphere: &'a Path,
    pub source_borders: &'a Path,
    pub target_sphere: &'a Path,
    pub target_borders: &'a Path,
    pub map: Option<&'a Path>,
    pub output_dir: &'a Path,
    /// Source and target fiducial surfaces.
    pub fiducials: Option<(&'a Path, &'a Path)>,
    pub sphere_dir: Option<&'a Path>,
    pub pause: bool,
    pub keep_intermediates: bool,
}

#[derive(Serialize)]
struct DeformResult {
    deformed: String,
    map: String,
    nodes: usize,
    final_crossovers: usize,
    crossovers: Vec<CrossoverReport>,
    stages: Vec<StageSummary>,
    intermediate_files: Vec<String>,
}

pub fn run(args: &DeformArgs<'_>, cli: &Cli) -> Result<()> {
    let mut map = match args.map {
        Some(path) => DeformationMap::load(path)
            .with_context(|| format!("Failed to load deformation map from {:?}", path))?,
        None => DeformationMap::default(),
    };
    map.pause_for_crossovers |= args.pause;
    map.keep_intermediate_files |= args.keep_intermediates;

    let source_name = args
        .source_sphere
        .file_stem()
        .map_or_else(|| "source".to_string(), |s| s.to_string_lossy().into_owned());

    let mut inputs = DeformationInputs::new(
        load_mesh(args.source_sphere)
            .with_context(|| format!("Failed to load source sphere from {:?}", args.source_sphere))?,
        load_borders(args.source_borders)
            .with_context(|| format!("Failed to load source borders from {:?}", args.source_borders))?,
        load_mesh(args.target_sphere)
            .with_context(|| format!("Failed to load target sphere from {:?}", args.target_sphere))?,
        load_borders(args.target_borders)
            .with_context(|| format!("Failed to load target borders from {:?}", args.target_borders))?,
    )
    .with_source_name(source_name);

    if let Some((source, target)) = args.fiducials {
        inputs = inputs.with_fiducials(
            load_mesh(source).with_context(|| format!("Failed to load source fiducial from {:?}", source))?,
            load_mesh(target).with_context(|| format!("Failed to load target fiducial from {:?}", target))?,
        );
    }

    info!(
        source = %args.source_sphere.display(),
        target = %args.target_sphere.display(),
        stages = map.stages.len(),
        cycles = map.total_cycles(),
        "Starting registration"
    );
    let outcome = match args.sphere_dir {
        Some(dir) => register(map, DirectorySphereLibrary::new(dir), inputs, args, cli)?,
        None => register(map, GeneratedSphereLibrary, inputs, args, cli)?,
    };

    let map_path = args.output_dir.join(MAP_FILE_NAME);
    outcome
        .map
        .save_json(&map_path)
        .with_context(|| format!("Failed to save deformation map to {:?}", map_path))?;

    let deformed_name = outcome
        .map
        .source_deformed_coord_name
        .clone()
        .unwrap_or_default();
    let result = DeformResult {
        deformed: args
            .output_dir
            .join(format!("{deformed_name}.obj"))
            .display()
            .to_string(),
        map: map_path.display().to_string(),
        nodes: outcome.deformed.node_count(),
        final_crossovers: outcome.final_crossovers(),
        crossovers: outcome.crossovers.clone(),
        stages: outcome.stage_summaries.clone(),
        intermediate_files: outcome
            .intermediate_files
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
    };

    match cli.format {
        OutputFormat::Json => output::print(&result, cli.format, cli.quiet),
        OutputFormat::Text => print_text(&result, &outcome, cli),
    }

    Ok(())
}

fn register<L: SphereLibrary>(
    map: DeformationMap,
    library: L,
    inputs: DeformationInputs,
    args: &DeformArgs<'_>,
    cli: &Cli,
) -> Result<DeformationOutcome> {
    let mut deformation = SphericalDeformation::new(map, library).with_output_dir(args.output_dir);

    if args.pause {
        deformation = deformation.with_confirm(Box::new(|checkpoint| {
            eprint!("{} {}. Continue? [y/N] ", "Crossovers:".yellow().bold(), checkpoint);
            let _ = std::io::stderr().flush();
            let mut answer = String::new();
            if std::io::stdin().lock().read_line(&mut answer).is_err() {
                return false;
            }
            matches!(answer.trim(), "y" | "Y" | "yes")
        }));
    }

    if !cli.quiet && matches!(cli.format, OutputFormat::Text) {
        deformation = deformation.with_progress(Box::new(|progress| {
            eprintln!(
                "  [{:>3}%] {}",
                progress.percent(),
                progress.message
            );
            true
        }));
    }

    Ok(deformation.execute(inputs)?)
}

fn print_text(result: &DeformResult, outcome: &DeformationOutcome, cli: &Cli) {
    output::success(
        &format!("Deformed surface saved to {}", result.deformed),
        cli.format,
        cli.quiet,
    );
    if cli.quiet {
        return;
    }

    println!("  {}: {}", "Nodes".cyan(), result.nodes);
    println!("  {}: {}", "Map".cyan(), result.map);
    for stage in &outcome.stage_summaries {
        println!(
            "  {} {}: {} nodes, {} landmarks{}",
            "Stage".cyan(),
            stage.stage,
            stage.resolution,
            stage.landmarks,
            if stage.skipped_links > 0 {
                format!(", {} links skipped", stage.skipped_links)
            } else {
                String::new()
            }
        );
        for cycle in &stage.cycles {
            println!(
                "    cycle {}: landmark error {:.4}, {} crossover nodes",
                cycle.cycle, cycle.mean_landmark_error, cycle.crossover_nodes
            );
        }
    }
    if !result.intermediate_files.is_empty() {
        println!(
            "  {}: {} files",
            "Intermediates".cyan(),
            result.intermediate_files.len()
        );
    }
    if result.final_crossovers > 0 {
        output::warning(
            &format!("{} crossover nodes remain", result.final_crossovers),
            cli.format,
            cli.quiet,
        );
    }
}
