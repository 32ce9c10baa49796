//! Multi-stage spherical registration.
//!
//! [`SphericalDeformation`] drives the whole pipeline. Each stage rebuilds a
//! pair of deformation spheres at the stage's resolution, inserts the target
//! and source border links into them, and runs the stage's cycles:
//!
//! 1. Pull the source landmarks toward the target landmarks with a smoothed
//!    displacement field.
//! 2. Smooth the sphere around the landmarks.
//! 3. Morph the non-landmark nodes back toward the shape of the reference.
//! 4. Count crossovers and optionally ask whether to continue.
//! 5. Carry the user's source surface through the deformation.
//!
//! State that changes from cycle to cycle lives in an explicit stage state
//! threaded through the steps; the caller's inputs are never touched.
//!
//! # Example
//!
//! ```no_run
//! use sphere_register::deformation::{DeformationInputs, SphericalDeformation};
//! use sphere_register::deformation_map::DeformationMap;
//! use sphere_register::io::{load_borders, load_mesh};
//! use sphere_register::sphere::GeneratedSphereLibrary;
//! use std::path::Path;
//!
//! let inputs = DeformationInputs::new(
//!     load_mesh(Path::new("lh.sphere.obj")).unwrap(),
//!     load_borders(Path::new("lh.border")).unwrap(),
//!     load_mesh(Path::new("atlas.sphere.obj")).unwrap(),
//!     load_borders(Path::new("atlas.border")).unwrap(),
//! )
//! .with_source_name("lh.sphere");
//!
//! let outcome = SphericalDeformation::new(DeformationMap::default(), GeneratedSphereLibrary)
//!     .with_output_dir("out")
//!     .execute(inputs)
//!     .unwrap();
//! println!("{} crossovers", outcome.final_crossovers());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::border::{BorderSet, resample_border_pairs};
use crate::crossover::crossover_check;
use crate::deformation_map::{CycleParams, DeformationMap, SmoothingParams, VectorParams};
use crate::distortion::{DistortionSamples, sample_tile_values, tile_distortion};
use crate::error::{RegisterError, RegisterResult};
use crate::io::{MeshFormat, NodeScalars, save_borders, save_mesh, save_scalars};
use crate::morph::{MorphConstraints, MorphResult, Morpher};
use crate::progress::{ConfirmCallback, CrossoverCheckpoint, ProgressCallback, ProgressTracker};
use crate::projector::{PointProjector, SurfaceHint, unproject_point};
use crate::smoothing::{
    areal_smoothing, landmark_neighbor_constrained_smoothing, move_landmarks_to_neighbor_average,
    smooth_vectors,
};
use crate::sphere::SphereLibrary;
use crate::tessellate::{LinkMapping, tessellate_source, tessellate_target};
use crate::tracing_ext::{OperationTimer, log_crossovers, log_io_operation, log_mesh_stats, log_morph_result};
use crate::types::{Mesh, MeshSnapshot};

/// Strength of the neighbour averaging applied to displacement vectors.
const VECTOR_SMOOTHING_STRENGTH: f64 = 0.5;

/// Surfaces and borders of one registration.
#[derive(Debug, Clone)]
pub struct DeformationInputs {
    /// The individual's spherical surface.
    pub source_sphere: Mesh,
    /// The individual's fiducial surface, same nodes as `source_sphere`.
    pub source_fiducial: Option<Mesh>,
    /// Landmarks drawn on `source_sphere`.
    pub source_borders: BorderSet,
    /// The atlas spherical surface.
    pub target_sphere: Mesh,
    /// The atlas fiducial surface, same nodes as `target_sphere`.
    pub target_fiducial: Option<Mesh>,
    /// Landmarks drawn on `target_sphere`.
    pub target_borders: BorderSet,
    /// Name of the source coordinates, used to name the final output.
    pub source_name: String,
}

impl DeformationInputs {
    /// Inputs without fiducial surfaces.
    pub fn new(
        source_sphere: Mesh,
        source_borders: BorderSet,
        target_sphere: Mesh,
        target_borders: BorderSet,
    ) -> Self {
        Self {
            source_sphere,
            source_fiducial: None,
            source_borders,
            target_sphere,
            target_fiducial: None,
            target_borders,
            source_name: "source".to_string(),
        }
    }

    /// Attach fiducial surfaces for distortion correction.
    pub fn with_fiducials(mut self, source: Mesh, target: Mesh) -> Self {
        self.source_fiducial = Some(source);
        self.target_fiducial = Some(target);
        self
    }

    /// Set the name of the source coordinates.
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }
}

/// Crossovers left on the source deformation sphere after one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CrossoverReport {
    /// 1-based stage number.
    pub stage: usize,
    /// 1-based cycle number.
    pub cycle: usize,
    pub tiles: usize,
    pub nodes: usize,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle: usize,
    /// Name of the deformed coordinates the cycle produced.
    pub output_name: String,
    /// Linear residual before the first and after the last morphing cycle.
    pub morph_residual: Option<(f64, f64)>,
    /// Mean distance between source and target landmark nodes after morphing.
    pub mean_landmark_error: f64,
    pub crossover_nodes: usize,
}

/// What one stage did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageSummary {
    pub stage: usize,
    pub resolution: usize,
    /// Landmark nodes inserted into each deformation sphere.
    pub landmarks: usize,
    /// Target border links that could not be inserted.
    pub skipped_links: usize,
    /// Source sphere crossovers before and after landmark insertion.
    pub tessellation_crossovers: (usize, usize),
    pub cycles: Vec<CycleSummary>,
}

/// Result of [`SphericalDeformation::execute`].
#[derive(Debug, Clone)]
pub struct DeformationOutcome {
    /// The source surface carried into the target's landmark space. Same
    /// nodes, same order as the input source sphere.
    pub deformed: Mesh,
    /// The deformation map, with output names filled in.
    pub map: DeformationMap,
    /// One report per cycle, in run order.
    pub crossovers: Vec<CrossoverReport>,
    /// Intermediate files written to the output directory.
    pub intermediate_files: Vec<PathBuf>,
    pub stage_summaries: Vec<StageSummary>,
}

impl DeformationOutcome {
    /// Crossover nodes left after the last cycle.
    pub fn final_crossovers(&self) -> usize {
        self.crossovers.last().map_or(0, |r| r.nodes)
    }

    /// True if any cycle left crossovers.
    pub fn has_crossovers(&self) -> bool {
        self.crossovers.iter().any(|r| r.nodes > 0)
    }
}

/// Multi-stage landmark registration of a source sphere onto a target sphere.
pub struct SphericalDeformation<L: SphereLibrary> {
    map: DeformationMap,
    library: L,
    confirm: Option<ConfirmCallback>,
    progress: Option<ProgressCallback>,
    output_dir: Option<PathBuf>,
}

impl<L: SphereLibrary> SphericalDeformation<L> {
    /// Registration with `map`, building deformation spheres from `library`.
    pub fn new(map: DeformationMap, library: L) -> Self {
        Self {
            map,
            library,
            confirm: None,
            progress: None,
            output_dir: None,
        }
    }

    /// Ask `confirm` before continuing with crossovers.
    ///
    /// It is consulted after every cycle with crossovers when
    /// `pause_for_crossovers` is set, and once at the end of a run that
    /// left crossovers anywhere.
    pub fn with_confirm(mut self, confirm: ConfirmCallback) -> Self {
        self.confirm = Some(confirm);
        self
    }

    /// Report progress once per cycle. Returning `false` aborts the run.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Write the final output, and intermediates if enabled, to `dir`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// The deformation map this run uses.
    pub fn map(&self) -> &DeformationMap {
        &self.map
    }

    /// Run every stage and cycle.
    ///
    /// Configuration problems are reported before any mesh is touched.
    ///
    /// # Errors
    /// - Configuration errors from [`DeformationMap::validate`], a source
    ///   border missing for a target border, or fiducials whose node count
    ///   does not match their sphere.
    /// - Tessellation errors when border links cannot be inserted.
    /// - [`RegisterError::UserAborted`] when a callback declines to continue.
    /// - I/O errors while writing to the output directory.
    pub fn execute(&self, inputs: DeformationInputs) -> RegisterResult<DeformationOutcome> {
        let _timer = OperationTimer::with_context(
            "spherical_deformation",
            inputs.source_sphere.tile_count(),
            inputs.source_sphere.node_count(),
        );

        self.map.validate(&self.library)?;
        let strength = self.check_inputs(&inputs)?;

        if let Some(dir) = &self.output_dir {
            std::fs::create_dir_all(dir).map_err(|e| RegisterError::io_write(dir, e))?;
        }

        let DeformationInputs {
            mut source_sphere,
            source_fiducial,
            mut source_borders,
            target_sphere,
            target_fiducial,
            mut target_borders,
            source_name,
        } = inputs;

        let radius = target_sphere.spherical_radius();
        source_sphere.project_to_sphere(radius);
        source_borders.project_to_sphere(radius);
        target_borders.project_to_sphere(radius);
        if self.map.different_hemispheres {
            mirror_borders(&mut source_borders);
            info!("Source borders mirrored for the opposite hemisphere");
        }

        let distortion = match (strength, source_fiducial.as_ref(), target_fiducial.as_ref()) {
            (Some(strength), Some(source_fiducial), Some(target_fiducial)) => Some(DistortionInputs {
                strength,
                source_fiducial,
                target_tiles: tile_distortion(target_fiducial, &target_sphere),
            }),
            _ => None,
        };

        let context = RunContext {
            radius,
            target_surface: &target_sphere,
            target_borders: &target_borders,
            distortion,
            source_name: &source_name,
        };

        let mut run = RunState {
            working_source: source_sphere.clone(),
            source_surface: source_sphere,
            source_borders,
            map: self.map.clone(),
            crossovers: Vec::new(),
            intermediate_files: Vec::new(),
            stage_summaries: Vec::new(),
            deformed: None,
            tracker: ProgressTracker::with_interval(self.map.total_cycles() as u64, Duration::ZERO),
        };
        run.map.intermediate_files.clear();
        run.map.source_deformed_coord_name = None;

        info!(
            stages = self.map.stages.len(),
            cycles = self.map.total_cycles(),
            radius = format!("{:.3}", radius),
            "Starting spherical registration"
        );

        for stage_index in 0..self.map.stages.len() {
            self.run_stage(&context, &mut run, stage_index)?;
        }

        self.final_crossover_check(&run)?;

        let Some(deformed) = run.deformed else {
            return Err(RegisterError::invalid_parameter("stages", "no cycle produced output"));
        };

        Ok(DeformationOutcome {
            deformed,
            map: run.map,
            crossovers: run.crossovers,
            intermediate_files: run.intermediate_files,
            stage_summaries: run.stage_summaries,
        })
    }

    /// Check the inputs and decide whether distortion correction runs.
    fn check_inputs(&self, inputs: &DeformationInputs) -> RegisterResult<Option<f64>> {
        if inputs.source_sphere.tile_count() == 0 {
            return Err(RegisterError::empty_mesh("source sphere has no tiles"));
        }
        if inputs.target_sphere.tile_count() == 0 {
            return Err(RegisterError::empty_mesh("target sphere has no tiles"));
        }
        if inputs.target_sphere.spherical_radius() <= 0.0 {
            return Err(RegisterError::empty_mesh("target sphere has zero radius"));
        }

        for border in inputs.target_borders.iter().filter(|b| b.link_count() > 0) {
            if inputs.source_borders.find_by_name(&border.name).is_none() {
                return Err(RegisterError::MissingBorder {
                    name: border.name.clone(),
                });
            }
        }

        let Some(strength) = self.map.distortion_strength() else {
            return Ok(None);
        };
        match (&inputs.source_fiducial, &inputs.target_fiducial) {
            (Some(source), Some(target)) => {
                if source.node_count() != inputs.source_sphere.node_count() {
                    return Err(RegisterError::node_count_mismatch(
                        "source fiducial",
                        inputs.source_sphere.node_count(),
                        source.node_count(),
                    ));
                }
                if target.node_count() != inputs.target_sphere.node_count() {
                    return Err(RegisterError::node_count_mismatch(
                        "target fiducial",
                        inputs.target_sphere.node_count(),
                        target.node_count(),
                    ));
                }
                Ok(Some(strength))
            }
            _ => {
                warn!("Distortion correction needs both fiducial surfaces, running without it");
                Ok(None)
            }
        }
    }

    fn run_stage(&self, context: &RunContext<'_>, run: &mut RunState, stage_index: usize) -> RegisterResult<()> {
        let stage = &self.map.stages[stage_index];
        let stage_number = stage_index + 1;
        let span = info_span!("stage", stage = stage_number, resolution = stage.resolution);
        let _entered = span.enter();
        let radius = context.radius;

        let mut source_borders = run.source_borders.clone();
        let mut target_borders = context.target_borders.clone();
        resample_border_pairs(&mut source_borders, &mut target_borders, self.map.border_resampling);
        source_borders.project_to_sphere(radius);
        target_borders.project_to_sphere(radius);
        self.write_artifact(run, format!("source_after_resample_stage_{stage_number}.border"), |path| {
            save_borders(&source_borders, path)
        })?;
        self.write_artifact(run, format!("target_after_resample_stage_{stage_number}.border"), |path| {
            save_borders(&target_borders, path)
        })?;

        let mut target_sphere = self.library.load(stage.resolution)?;
        let base_tiles = target_sphere.tiles().to_vec();
        target_sphere.project_to_sphere(radius);
        let tessellation = tessellate_target(&mut target_sphere, &target_borders, radius)?;
        log_mesh_stats(&target_sphere, "target deformation sphere");

        let mut source_sphere = self.library.load(stage.resolution)?;
        source_sphere.project_to_sphere(radius);
        let source = tessellate_source(
            &mut source_sphere,
            &source_borders,
            &target_borders,
            &tessellation.mapping,
            &self.map.retry,
            stage.endpoint_factor,
            radius,
        )?;
        log_mesh_stats(&source_sphere, "source deformation sphere");
        assert_eq!(
            source_sphere.node_count(),
            target_sphere.node_count(),
            "deformation spheres must have the same nodes after tessellation"
        );

        let original_node_count = source.original_node_count;
        let landmarks: Vec<bool> = (0..source_sphere.node_count())
            .map(|n| n >= original_node_count)
            .collect();

        let mut original = source_sphere.clone();
        move_landmarks_to_neighbor_average(&mut original, &landmarks);
        original.project_to_sphere(radius);
        original.compute_normals();
        self.write_artifact(run, format!("source_with_landmarks_stage_{stage_number}.obj"), |path| {
            save_mesh(&original, path)
        })?;
        let original_projector = PointProjector::new(&original, SurfaceHint::Sphere);

        let mut state = StageState {
            stage: stage_number,
            target_sphere,
            source_sphere,
            landmarks,
            original_node_count,
            mapping: tessellation.mapping,
            variances: source.variances,
            base_tiles,
            source_borders,
            target_borders,
            reference: original.snapshot(),
            original,
            original_projector,
            distortion: None,
        };

        info!(
            landmarks = state.mapping.len(),
            skipped = tessellation.skipped.len(),
            nodes = state.source_sphere.node_count(),
            "Deformation spheres ready"
        );

        let mut cycles = Vec::with_capacity(stage.cycles.len());
        for cycle_index in 0..stage.cycles.len() {
            cycles.push(self.run_cycle(context, run, &mut state, cycle_index)?);
        }

        run.stage_summaries.push(StageSummary {
            stage: stage_number,
            resolution: stage.resolution,
            landmarks: state.mapping.len(),
            skipped_links: tessellation.skipped.len(),
            tessellation_crossovers: (source.crossovers_before, source.crossovers_after),
            cycles,
        });
        Ok(())
    }

    fn run_cycle(
        &self,
        context: &RunContext<'_>,
        run: &mut RunState,
        state: &mut StageState,
        cycle_index: usize,
    ) -> RegisterResult<CycleSummary> {
        let stage_count = self.map.stages.len();
        let cycles = &self.map.stages[state.stage - 1].cycles;
        let params = &cycles[cycle_index];
        let stage_number = state.stage;
        let cycle_number = cycle_index + 1;
        let last_cycle = cycle_number == cycles.len();
        let last_stage = stage_number == stage_count;
        let radius = context.radius;

        let span = info_span!("cycle", cycle = cycle_number);
        let _entered = span.enter();

        let displacement = displace_landmarks(state, &params.vector, radius);
        constrained_smoothing(state, &params.smoothing, radius);

        state.distortion = context
            .distortion
            .as_ref()
            .map(|d| sample_distortion(context, d, &run.working_source, state));

        let strength = context.distortion.as_ref().map(|d| d.strength);
        let morph = morph_cycles(state, params, cycle_index, strength, radius);
        state.reference = state.source_sphere.snapshot();

        let count = crossover_check(&state.source_sphere, SurfaceHint::Sphere);
        log_crossovers(stage_number, cycle_number, &count);
        run.crossovers.push(CrossoverReport {
            stage: stage_number,
            cycle: cycle_number,
            tiles: count.tiles,
            nodes: count.nodes,
        });
        if self.map.pause_for_crossovers
            && !count.is_clean()
            && let Some(confirm) = &self.confirm
        {
            let checkpoint = CrossoverCheckpoint {
                stage: stage_number,
                cycle: cycle_number,
                nodes: count.nodes,
                tiles: count.tiles,
                final_summary: false,
            };
            if !confirm(&checkpoint) {
                info!(%checkpoint, "Deformation cancelled at crossover checkpoint");
                return Err(RegisterError::UserAborted {
                    stage: stage_number,
                    cycle: cycle_number,
                });
            }
        }

        if stage_number == 1 && cycle_number == 1 && self.map.different_hemispheres {
            run.source_surface.negate_x();
            run.source_surface.reverse_winding();
            info!("Source surface mirrored for the opposite hemisphere");
        }
        let deformed = deform_surface(&run.source_surface, state, radius);

        let final_cycle = last_cycle && last_stage;
        let output_name = if final_cycle {
            format!("{}{}", self.map.deformed_prefix, context.source_name)
        } else {
            self.map.cycle_output_name(stage_number, cycle_number)
        };
        if final_cycle {
            run.map.source_deformed_coord_name = Some(output_name.clone());
            if let Some(dir) = &self.output_dir {
                let path = dir.join(mesh_file_name(&output_name));
                let result = save_mesh(&deformed, &path);
                log_io_operation("write", &path, Some("deformed"), result.is_ok());
                result?;
            }
        } else {
            self.write_artifact(run, mesh_file_name(&output_name), |path| save_mesh(&deformed, path))?;
        }
        self.write_cycle_artifacts(run, state, cycle_number, &displacement)?;

        let morphed_borders = morphed_landmark_borders(state);
        self.write_artifact(
            run,
            format!("source_landmarks_stage_{stage_number}_cycle_{cycle_number}.border"),
            |path| save_borders(&morphed_borders, path),
        )?;

        let summary = CycleSummary {
            cycle: cycle_number,
            output_name,
            morph_residual: morph.map(|r| (r.initial_residual, r.final_residual)),
            mean_landmark_error: mean_landmark_error(state),
            crossover_nodes: count.nodes,
        };
        info!(
            crossovers = summary.crossover_nodes,
            landmark_error = format!("{:.4}", summary.mean_landmark_error),
            output = %summary.output_name,
            "Cycle complete"
        );

        if last_cycle {
            run.source_borders = morphed_borders;
            if !last_stage {
                run.source_surface = deformed.clone();
            }
        }
        if final_cycle {
            run.deformed = Some(deformed.clone());
        }
        run.working_source = deformed;

        run.tracker.increment();
        let message = format!("Stage {stage_number} Cycle {cycle_number}");
        if !run.tracker.maybe_callback(self.progress.as_ref(), message) {
            return Err(RegisterError::UserAborted {
                stage: stage_number,
                cycle: cycle_number,
            });
        }

        Ok(summary)
    }

    /// Per-cycle diagnostics: landmark-free sphere, variances, distortion.
    fn write_cycle_artifacts(
        &self,
        run: &mut RunState,
        state: &StageState,
        cycle: usize,
        displacement: &[f64],
    ) -> RegisterResult<()> {
        if !self.keeps_intermediates() {
            return Ok(());
        }
        let stage = state.stage;

        let positions = state.source_sphere.positions()[..state.original_node_count].to_vec();
        let without_landmarks = Mesh::from_parts(positions, state.base_tiles.clone());
        self.write_artifact(run, format!("source_no_landmarks_stage_{stage}_cycle_{cycle}.obj"), |path| {
            save_mesh(&without_landmarks, path)
        })?;

        let variances = NodeScalars::new()
            .with_column("Border Variance", state.variances.clone())
            .with_column("Displacement", displacement.to_vec());
        self.write_artifact(run, format!("source_variance_stage_{stage}_cycle_{cycle}.csv"), |path| {
            save_scalars(&variances, path)
        })?;

        if let Some(samples) = &state.distortion {
            let table = samples
                .columns()
                .iter()
                .zip(DistortionSamples::COLUMN_NAMES)
                .fold(NodeScalars::new(), |table, (column, name)| {
                    table.with_column(name, column.to_vec())
                });
            self.write_artifact(run, format!("distortion_stage_{stage}_cycle_{cycle}.csv"), |path| {
                save_scalars(&table, path)
            })?;
        }
        Ok(())
    }

    fn final_crossover_check(&self, run: &RunState) -> RegisterResult<()> {
        let Some(last) = run.crossovers.last() else {
            return Ok(());
        };
        if last.nodes > 0 {
            warn!(
                nodes = last.nodes,
                tiles = last.tiles,
                "Registration finished with crossovers"
            );
        }
        if !run.crossovers.iter().any(|r| r.nodes > 0) {
            return Ok(());
        }
        if let Some(confirm) = &self.confirm {
            let checkpoint = CrossoverCheckpoint {
                stage: 0,
                cycle: 0,
                nodes: last.nodes,
                tiles: last.tiles,
                final_summary: true,
            };
            if !confirm(&checkpoint) {
                return Err(RegisterError::UserAborted { stage: 0, cycle: 0 });
            }
        }
        Ok(())
    }

    fn keeps_intermediates(&self) -> bool {
        self.map.keep_intermediate_files && self.output_dir.is_some()
    }

    /// Write an intermediate file and record it.
    fn write_artifact(
        &self,
        run: &mut RunState,
        file_name: String,
        write: impl FnOnce(&Path) -> RegisterResult<()>,
    ) -> RegisterResult<()> {
        let Some(dir) = self.output_dir.as_deref().filter(|_| self.map.keep_intermediate_files) else {
            return Ok(());
        };
        let path = dir.join(&file_name);
        let result = write(&path);
        log_io_operation("write", &path, None, result.is_ok());
        result?;
        run.map.intermediate_files.push(file_name);
        run.intermediate_files.push(path);
        Ok(())
    }
}

/// Everything fixed for the whole run.
struct RunContext<'a> {
    radius: f64,
    target_surface: &'a Mesh,
    target_borders: &'a BorderSet,
    distortion: Option<DistortionInputs<'a>>,
    source_name: &'a str,
}

struct DistortionInputs<'a> {
    strength: f64,
    source_fiducial: &'a Mesh,
    /// Fiducial/sphere area ratio per target tile.
    target_tiles: Vec<f64>,
}

/// State carried from stage to stage.
struct RunState {
    /// The surface projected through each cycle's deformation.
    source_surface: Mesh,
    /// Output of the most recent cycle.
    working_source: Mesh,
    source_borders: BorderSet,
    map: DeformationMap,
    crossovers: Vec<CrossoverReport>,
    intermediate_files: Vec<PathBuf>,
    stage_summaries: Vec<StageSummary>,
    deformed: Option<Mesh>,
    tracker: ProgressTracker,
}

/// State carried from cycle to cycle within a stage.
struct StageState {
    /// 1-based.
    stage: usize,
    target_sphere: Mesh,
    /// The sphere being deformed.
    source_sphere: Mesh,
    landmarks: Vec<bool>,
    original_node_count: usize,
    mapping: LinkMapping,
    variances: Vec<f64>,
    /// Tiles of the canonical sphere before landmark insertion.
    base_tiles: Vec<[u32; 3]>,
    source_borders: BorderSet,
    target_borders: BorderSet,
    /// Shape the morphing pulls toward.
    reference: MeshSnapshot,
    /// The source sphere at the start of the stage, landmarks averaged.
    original: Mesh,
    original_projector: PointProjector,
    distortion: Option<DistortionSamples>,
}

impl StageState {
    fn landmark_nodes(&self) -> std::ops::Range<usize> {
        self.original_node_count..self.source_sphere.node_count()
    }
}

/// Move the source sphere by the smoothed landmark displacement field.
///
/// Returns the per-node displacement length.
fn displace_landmarks(state: &mut StageState, params: &VectorParams, radius: f64) -> Vec<f64> {
    let mut vectors = vec![Vector3::zeros(); state.source_sphere.node_count()];
    for node in state.landmark_nodes() {
        let delta = state.target_sphere.position(node) - state.source_sphere.position(node);
        let variance = state.variances[node];
        vectors[node] = if variance != 0.0 { delta * variance } else { delta };
    }

    let topology = state.source_sphere.topology();
    smooth_vectors(&topology, &mut vectors, VECTOR_SMOOTHING_STRENGTH, params.smoothing_iterations);

    for (vertex, delta) in state.source_sphere.vertices.iter_mut().zip(&vectors) {
        vertex.position += delta * params.displacement_factor;
    }
    move_landmarks_to_neighbor_average(&mut state.source_sphere, &state.landmarks);
    state.source_sphere.project_to_sphere(radius);
    state.source_sphere.compute_normals();

    debug!(
        max = vectors.iter().map(|v| v.norm()).fold(0.0, f64::max),
        "Landmarks displaced"
    );
    vectors.iter().map(|v| v.norm() * params.displacement_factor).collect()
}

fn constrained_smoothing(state: &mut StageState, params: &SmoothingParams, radius: f64) {
    if params.cycles == 0 {
        return;
    }
    let sphere = &mut state.source_sphere;
    for _ in 0..params.cycles {
        landmark_neighbor_constrained_smoothing(
            sphere,
            params.strength,
            params.iterations,
            &state.landmarks,
            params.neighbor_iterations,
        );
        sphere.project_range_to_sphere(radius, 0..state.original_node_count);
    }
    areal_smoothing(sphere, params.strength, params.final_iterations, None, None);
    sphere.project_to_sphere(radius);
    sphere.compute_normals();
}

/// Sample fiducial/sphere distortion at the nodes of both deformation spheres.
fn sample_distortion(
    context: &RunContext<'_>,
    inputs: &DistortionInputs<'_>,
    working_source: &Mesh,
    state: &StageState,
) -> DistortionSamples {
    let source_tiles = tile_distortion(inputs.source_fiducial, working_source);
    let target = sample_tile_values(
        context.target_surface,
        &inputs.target_tiles,
        &state.target_sphere.positions(),
    );
    let source = sample_tile_values(working_source, &source_tiles, &state.source_sphere.positions());
    DistortionSamples::new(target, source)
}

fn morph_cycles(
    state: &mut StageState,
    params: &CycleParams,
    cycle_index: usize,
    distortion_strength: Option<f64>,
    radius: f64,
) -> Option<MorphResult> {
    let morphing = &params.morphing;
    if morphing.cycles == 0 {
        return None;
    }

    let should_morph = state.landmarks.iter().map(|&landmark| !landmark).collect();
    let mut constraints = MorphConstraints::anchored(should_morph, morphing.landmark_step_size);
    if cycle_index > 0
        && let Some(strength) = distortion_strength
        && let Some(samples) = &state.distortion
    {
        constraints = constraints.with_distortion(samples.correction.clone(), strength);
    }

    let morpher = Morpher::new(&state.reference, morphing.morph_params());
    let mut first_residual = None;
    let mut last = None;
    for morph_cycle in 0..morphing.cycles {
        let result = morpher.run(&mut state.source_sphere, &constraints);
        log_morph_result(state.stage, cycle_index + 1, morph_cycle + 1, &result);
        first_residual.get_or_insert(result.initial_residual);

        areal_smoothing(
            &mut state.source_sphere,
            params.smoothing.strength,
            morphing.smooth_iterations,
            None,
            None,
        );
        move_landmarks_to_neighbor_average(&mut state.source_sphere, &state.landmarks);
        state.source_sphere.project_to_sphere(radius);
        last = Some(result);
    }
    state.source_sphere.compute_normals();

    last.map(|mut result| {
        if let Some(first) = first_residual {
            result.initial_residual = first;
        }
        result
    })
}

/// Carry `surface` from the stage's original source sphere to the morphed one.
fn deform_surface(surface: &Mesh, state: &StageState, radius: f64) -> Mesh {
    let morphed = state.source_sphere.positions();
    let positions: Vec<Point3<f64>> = surface
        .vertices
        .par_iter()
        .map(|vertex| {
            let projection = state
                .original_projector
                .project_barycentric(&state.original, &vertex.position);
            projection.unproject(&morphed).unwrap_or(vertex.position)
        })
        .collect();

    let mut deformed = surface.clone();
    deformed.set_positions(&positions);
    deformed.project_to_sphere(radius);
    deformed.compute_normals();
    deformed
}

/// Source borders with every inserted link moved to its morphed landmark node.
fn morphed_landmark_borders(state: &StageState) -> BorderSet {
    let mut borders = state.source_borders.clone();
    for (k, link_ref) in state.mapping.iter().enumerate() {
        let Some(target) = state.target_borders.get(link_ref.border) else {
            continue;
        };
        if let Some(border) = borders.find_by_name_mut(&target.name)
            && let Some(link) = border.links.get_mut(link_ref.link)
        {
            *link = state.source_sphere.position(state.original_node_count + k);
        }
    }
    borders
}

fn mean_landmark_error(state: &StageState) -> f64 {
    let nodes = state.landmark_nodes();
    if nodes.is_empty() {
        return 0.0;
    }
    let count = nodes.len() as f64;
    nodes
        .map(|n| (state.source_sphere.position(n) - state.target_sphere.position(n)).norm())
        .sum::<f64>()
        / count
}

fn mirror_borders(borders: &mut BorderSet) {
    for border in borders.iter_mut() {
        for link in &mut border.links {
            link.x = -link.x;
        }
    }
}

/// File name for a coordinate name, adding `.obj` unless it names a mesh file.
fn mesh_file_name(name: &str) -> String {
    if MeshFormat::from_path(Path::new(name)).is_some() {
        name.to_string()
    } else {
        format!("{name}.obj")
    }
}

/// One target node located on the deformed source sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MappedNode {
    pub nodes: [usize; 3],
    /// Barycentric weights; `weights[i]` belongs to `nodes[i]`.
    pub weights: [f64; 3],
}

impl MappedNode {
    /// The node carrying the largest weight.
    pub fn dominant_node(&self) -> usize {
        let mut best = 0;
        for i in 1..3 {
            if self.weights[i] > self.weights[best] {
                best = i;
            }
        }
        self.nodes[best]
    }
}

/// Correspondence from target sphere nodes to a deformed source sphere.
///
/// Used to carry per-node data of the source individual into the target's
/// node space once a registration has run.
#[derive(Debug, Clone)]
pub struct NodeMapping {
    entries: Vec<MappedNode>,
    source_node_count: usize,
}

impl NodeMapping {
    /// Project every node of `target_sphere` onto `deformed_source`.
    ///
    /// Nodes that land in no tile take the nearest source node.
    ///
    /// # Errors
    /// [`RegisterError::EmptyMesh`] if `deformed_source` has no tiles.
    pub fn build(target_sphere: &Mesh, deformed_source: &Mesh) -> RegisterResult<Self> {
        if deformed_source.tile_count() == 0 {
            return Err(RegisterError::empty_mesh("deformed source sphere has no tiles"));
        }
        let _timer = OperationTimer::with_context(
            "node_mapping",
            deformed_source.tile_count(),
            target_sphere.node_count(),
        );

        let radius = deformed_source.spherical_radius();
        let projector = PointProjector::new(deformed_source, SurfaceHint::Sphere);

        let entries = target_sphere
            .vertices
            .par_iter()
            .map(|vertex| {
                let mut p = vertex.position;
                let len = p.coords.norm();
                if len > 0.0 {
                    p.coords *= radius / len;
                }
                let projection = projector.project_barycentric(deformed_source, &p);
                if projection.is_located() {
                    Some(MappedNode {
                        nodes: projection.nodes,
                        weights: projection.weights,
                    })
                } else {
                    projection.nearest_node.map(|n| MappedNode {
                        nodes: [n; 3],
                        weights: [1.0, 0.0, 0.0],
                    })
                }
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| RegisterError::empty_mesh("deformed source sphere has no connected nodes"))?;

        Ok(Self {
            entries,
            source_node_count: deformed_source.node_count(),
        })
    }

    /// Number of target nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Where target node `node` landed.
    pub fn entry(&self, node: usize) -> Option<&MappedNode> {
        self.entries.get(node)
    }

    /// Interpolate per-source-node values at every target node.
    pub fn map_scalars(&self, values: &[f64]) -> RegisterResult<Vec<f64>> {
        self.check_len("scalar column", values.len())?;
        Ok(self
            .entries
            .iter()
            .map(|e| (0..3).map(|i| values[e.nodes[i]] * e.weights[i]).sum())
            .collect())
    }

    /// Carry labels over, taking the label of the heaviest node.
    pub fn map_labels(&self, labels: &[u32]) -> RegisterResult<Vec<u32>> {
        self.check_len("label column", labels.len())?;
        Ok(self.entries.iter().map(|e| labels[e.dominant_node()]).collect())
    }

    /// Interpolate positions of another embedding of the source mesh.
    pub fn map_coordinates(&self, source: &Mesh) -> RegisterResult<Vec<Point3<f64>>> {
        self.check_len("coordinate surface", source.node_count())?;
        let coords = source.positions();
        Ok(self
            .entries
            .iter()
            .map(|e| unproject_point(&e.nodes, &e.weights, &coords))
            .collect())
    }

    fn check_len(&self, what: &str, actual: usize) -> RegisterResult<()> {
        if actual != self.source_node_count {
            return Err(RegisterError::node_count_mismatch(what, self.source_node_count, actual));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::border::Border;
    use crate::deformation_map::StageParams;
    use crate::sphere::{GeneratedSphereLibrary, regular_sphere};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const RADIUS: f64 = 100.0;

    fn on_sphere(lat: f64, lon: f64) -> Point3<f64> {
        let (lat, lon) = (lat.to_radians(), lon.to_radians());
        Point3::new(
            RADIUS * lat.cos() * lon.cos(),
            RADIUS * lat.cos() * lon.sin(),
            RADIUS * lat.sin(),
        )
    }

    fn border(name: &str, points: &[(f64, f64)]) -> Border {
        Border::new(name, points.iter().map(|&(lat, lon)| on_sphere(lat, lon)).collect())
    }

    fn borders(shift: f64) -> BorderSet {
        [
            border("central", &[(10.0, 10.0 + shift), (20.0, 12.0 + shift), (30.0, 14.0 + shift), (40.0, 16.0 + shift)]),
            border("calcarine", &[(-20.0, 150.0), (-25.0, 160.0), (-30.0, 170.0)]),
        ]
        .into_iter()
        .collect()
    }

    fn inputs(source_shift: f64) -> DeformationInputs {
        DeformationInputs::new(
            regular_sphere(2, RADIUS),
            borders(source_shift),
            regular_sphere(2, RADIUS),
            borders(0.0),
        )
        .with_source_name("lh.sphere")
    }

    /// Inserts landmarks but moves nothing.
    fn still_map() -> DeformationMap {
        let mut cycle = CycleParams::default().with_smoothing_cycles(0).with_morphing(0, 0);
        cycle.vector.displacement_factor = 0.0;
        DeformationMap::with_stages(vec![StageParams::new(74, vec![cycle])]).with_fiducial_ratio(None)
    }

    fn quick_map(cycles: usize) -> DeformationMap {
        let cycle = CycleParams::default()
            .with_smoothing_cycles(2)
            .with_morphing(1, 10)
            .with_vector_smoothing(2);
        DeformationMap::with_stages(vec![StageParams::new(74, vec![cycle; cycles])]).with_fiducial_ratio(None)
    }

    #[test]
    fn test_identical_landmarks_without_smoothing_keep_surface() {
        let source = regular_sphere(2, RADIUS);
        let outcome = SphericalDeformation::new(still_map(), GeneratedSphereLibrary)
            .execute(inputs(0.0))
            .unwrap();

        assert_eq!(outcome.deformed.node_count(), source.node_count());
        for n in 0..source.node_count() {
            assert!(
                (outcome.deformed.position(n) - source.position(n)).norm() < 1e-6,
                "node {n} moved"
            );
        }
        assert_eq!(
            outcome.map.source_deformed_coord_name.as_deref(),
            Some("deformed_lh.sphere")
        );
    }

    #[test]
    fn test_registration_keeps_sphere_and_reports_each_cycle() {
        let outcome = SphericalDeformation::new(quick_map(2), GeneratedSphereLibrary)
            .execute(inputs(6.0))
            .unwrap();

        assert_eq!(outcome.crossovers.len(), 2);
        assert_eq!(outcome.crossovers[1].stage, 1);
        assert_eq!(outcome.crossovers[1].cycle, 2);
        assert_eq!(outcome.stage_summaries.len(), 1);
        assert_eq!(outcome.stage_summaries[0].landmarks, 7);
        assert_eq!(outcome.stage_summaries[0].cycles[0].output_name, "deformed_sphere_stage_1_cycle_1");
        for v in &outcome.deformed.vertices {
            assert!((v.position.coords.norm() - RADIUS).abs() < 1e-4);
        }
    }

    #[test]
    fn test_resolution_20_fails_before_any_work() {
        let map = DeformationMap::with_stages(vec![StageParams::new(20, vec![CycleParams::default()])]);
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let err = SphericalDeformation::new(map, GeneratedSphereLibrary)
            .with_output_dir(&out)
            .execute(inputs(0.0))
            .unwrap_err();
        assert!(matches!(err, RegisterError::InvalidResolution { resolution: 20, .. }));
        assert!(!out.exists());
    }

    #[test]
    fn test_missing_source_border() {
        let mut inputs = inputs(0.0);
        inputs.source_borders = [border("central", &[(10.0, 10.0), (20.0, 12.0)])].into_iter().collect();
        let err = SphericalDeformation::new(still_map(), GeneratedSphereLibrary)
            .execute(inputs)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unable to find source border named \"calcarine\"");
    }

    #[test]
    fn test_progress_callback_aborts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let err = SphericalDeformation::new(quick_map(3), GeneratedSphereLibrary)
            .with_progress(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            }))
            .execute(inputs(3.0))
            .unwrap_err();
        assert!(err.is_user_abort());
        assert!(matches!(err, RegisterError::UserAborted { stage: 1, cycle: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_hemispheres_mirror_output() {
        let mut inputs = inputs(0.0);
        mirror_borders(&mut inputs.source_borders);
        let source = inputs.source_sphere.clone();

        let mut map = still_map();
        map.different_hemispheres = true;
        let outcome = SphericalDeformation::new(map, GeneratedSphereLibrary)
            .execute(inputs)
            .unwrap();

        for n in 0..source.node_count() {
            let p = source.position(n);
            let q = outcome.deformed.position(n);
            assert!((q - Point3::new(-p.x, p.y, p.z)).norm() < 1e-6, "node {n}");
        }
        let count = crossover_check(&outcome.deformed, SurfaceHint::Sphere);
        assert!(count.is_clean());
    }

    #[test]
    fn test_intermediate_files_written() {
        let dir = TempDir::new().unwrap();
        let map = quick_map(2).with_intermediate_files(true);
        let outcome = SphericalDeformation::new(map, GeneratedSphereLibrary)
            .with_output_dir(dir.path())
            .execute(inputs(4.0))
            .unwrap();

        assert!(dir.path().join("deformed_lh.sphere.obj").exists());
        assert!(dir.path().join("deformed_sphere_stage_1_cycle_1.obj").exists());
        assert!(dir.path().join("source_landmarks_stage_1_cycle_2.border").exists());
        assert!(!outcome.intermediate_files.is_empty());
        assert_eq!(outcome.intermediate_files.len(), outcome.map.intermediate_files.len());
        for path in &outcome.intermediate_files {
            assert!(path.exists(), "{} missing", path.display());
        }
    }

    #[test]
    fn test_fiducial_mismatch_rejected() {
        let inputs = inputs(0.0).with_fiducials(regular_sphere(1, RADIUS), regular_sphere(2, RADIUS));
        let map = still_map().with_fiducial_ratio(Some(0.5));
        let err = SphericalDeformation::new(map, GeneratedSphereLibrary)
            .execute(inputs)
            .unwrap_err();
        assert!(matches!(err, RegisterError::NodeCountMismatch { .. }));
    }

    #[test]
    fn test_node_mapping_on_same_sphere_is_identity() {
        let sphere = regular_sphere(2, RADIUS);
        let mapping = NodeMapping::build(&sphere, &sphere).unwrap();
        assert_eq!(mapping.len(), sphere.node_count());

        let values: Vec<f64> = (0..sphere.node_count()).map(|n| n as f64).collect();
        let mapped = mapping.map_scalars(&values).unwrap();
        for (a, b) in values.iter().zip(&mapped) {
            assert!((a - b).abs() < 1e-6);
        }

        let labels: Vec<u32> = (0..sphere.node_count() as u32).collect();
        assert_eq!(mapping.map_labels(&labels).unwrap(), labels);

        let coords = mapping.map_coordinates(&sphere).unwrap();
        assert!((coords[5] - sphere.position(5)).norm() < 1e-6);
    }

    #[test]
    fn test_node_mapping_rejects_wrong_length() {
        let sphere = regular_sphere(1, RADIUS);
        let mapping = NodeMapping::build(&sphere, &sphere).unwrap();
        assert!(matches!(
            mapping.map_scalars(&[1.0, 2.0]),
            Err(RegisterError::NodeCountMismatch { expected: 74, actual: 2, .. })
        ));
    }

    #[test]
    fn test_mesh_file_name() {
        assert_eq!(mesh_file_name("deformed_lh"), "deformed_lh.obj");
        assert_eq!(mesh_file_name("deformed_lh.ply"), "deformed_lh.ply");
    }
}
