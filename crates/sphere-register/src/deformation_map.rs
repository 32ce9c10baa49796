//! Deformation map: the parameters of a registration run and its record.
//!
//! The same structure configures a run and documents it afterwards: the run
//! fills in the name of the final deformed coordinate file and the list of
//! intermediate files it wrote, so a saved map is enough to reproduce or
//! re-apply the deformation.
//!
//! # Example
//!
//! ```
//! use sphere_register::deformation_map::DeformationMap;
//!
//! let toml = r#"
//!     [[stages]]
//!     resolution = 290
//!     endpoint_factor = 0.5
//!
//!     [[stages.cycles]]
//!     [stages.cycles.morphing]
//!     iterations = 40
//! "#;
//!
//! let map = DeformationMap::from_toml(toml).unwrap();
//! assert_eq!(map.stages[0].resolution, 290);
//! assert_eq!(map.stages[0].endpoint_factor, 0.5);
//! assert_eq!(map.stages[0].cycles[0].morphing.iterations, 40);
//! assert_eq!(map.stages[0].cycles[0].vector.smoothing_iterations, 10);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::border::BorderResampling;
use crate::error::{RegisterError, RegisterResult};
use crate::morph::{MorphParams, MorphSurface};
use crate::projector::RetryPolicy;
use crate::sphere::{SPHERE_RESOLUTIONS, SphereLibrary};

/// Resolution the multi-stage registration cannot use.
const UNSUPPORTED_MULTI_STAGE_RESOLUTION: usize = 20;

/// Landmark-constrained smoothing applied before morphing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingParams {
    pub strength: f64,
    /// Smoothing cycles; zero skips smoothing altogether.
    pub cycles: usize,
    /// Iterations per cycle.
    pub iterations: usize,
    /// Landmark neighbours are smoothed every this many iterations.
    pub neighbor_iterations: usize,
    /// Areal smoothing iterations after the last cycle.
    pub final_iterations: usize,
}

impl Default for SmoothingParams {
    fn default() -> Self {
        Self {
            strength: 1.0,
            cycles: 100,
            iterations: 20,
            neighbor_iterations: 10,
            final_iterations: 5,
        }
    }
}

/// Morphing applied after smoothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorphingParams {
    /// Morphing cycles; zero skips morphing.
    pub cycles: usize,
    pub linear_force: f64,
    pub angular_force: f64,
    pub step_size: f64,
    /// Step size of landmark nodes.
    pub landmark_step_size: f64,
    /// Iterations per morphing cycle.
    pub iterations: usize,
    /// Areal smoothing iterations after each morphing cycle.
    pub smooth_iterations: usize,
}

impl Default for MorphingParams {
    fn default() -> Self {
        Self {
            cycles: 1,
            linear_force: 0.3,
            angular_force: 0.4,
            step_size: 0.5,
            landmark_step_size: 0.5,
            iterations: 80,
            smooth_iterations: 5,
        }
    }
}

impl MorphingParams {
    /// Spherical morphing parameters for one morphing cycle.
    pub fn morph_params(&self) -> MorphParams {
        MorphParams {
            iterations: self.iterations,
            linear_force: self.linear_force,
            angular_force: self.angular_force,
            step_size: self.step_size,
            surface: MorphSurface::Spherical,
        }
    }
}

/// Landmark displacement vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorParams {
    /// Average-neighbour smoothing iterations of the displacement field.
    /// Must be at least one.
    pub smoothing_iterations: usize,
    /// Scale applied to the smoothed displacement.
    pub displacement_factor: f64,
}

impl Default for VectorParams {
    fn default() -> Self {
        Self {
            smoothing_iterations: 10,
            displacement_factor: 1.0,
        }
    }
}

/// Parameters of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleParams {
    pub smoothing: SmoothingParams,
    pub morphing: MorphingParams,
    pub vector: VectorParams,
}

impl CycleParams {
    /// First cycle of the default schedule: long morphing, heavy final smoothing.
    pub fn coarse() -> Self {
        Self {
            smoothing: SmoothingParams {
                final_iterations: 30,
                ..Default::default()
            },
            morphing: MorphingParams {
                angular_force: 0.6,
                iterations: 300,
                smooth_iterations: 20,
                ..Default::default()
            },
            vector: VectorParams::default(),
        }
    }

    /// Middle cycle of the default schedule.
    pub fn medium() -> Self {
        Self {
            morphing: MorphingParams {
                angular_force: 0.6,
                iterations: 300,
                smooth_iterations: 5,
                ..Default::default()
            },
            ..Self::coarse()
        }
        .with_final_smoothing(5)
    }

    /// Last cycle of the default schedule: light smoothing.
    pub fn fine() -> Self {
        let mut cycle = Self::medium();
        cycle.smoothing.cycles = 50;
        cycle.smoothing.final_iterations = 1;
        cycle.morphing.smooth_iterations = 2;
        cycle
    }

    fn with_final_smoothing(mut self, iterations: usize) -> Self {
        self.smoothing.final_iterations = iterations;
        self
    }

    /// Set the number of morphing cycles and iterations.
    pub fn with_morphing(mut self, cycles: usize, iterations: usize) -> Self {
        self.morphing.cycles = cycles;
        self.morphing.iterations = iterations;
        self
    }

    /// Set the number of smoothing cycles.
    pub fn with_smoothing_cycles(mut self, cycles: usize) -> Self {
        self.smoothing.cycles = cycles;
        self
    }

    /// Set the vector smoothing iterations.
    pub fn with_vector_smoothing(mut self, iterations: usize) -> Self {
        self.vector.smoothing_iterations = iterations;
        self
    }
}

/// Parameters of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageParams {
    /// Node count of the canonical sphere the stage registers on.
    pub resolution: usize,
    /// Variance multiplier for the first and last link of each border.
    pub endpoint_factor: f64,
    pub cycles: Vec<CycleParams>,
}

impl Default for StageParams {
    fn default() -> Self {
        Self {
            resolution: 4610,
            endpoint_factor: 1.0,
            cycles: vec![CycleParams::coarse(), CycleParams::medium(), CycleParams::fine()],
        }
    }
}

impl StageParams {
    /// A stage at `resolution` with the given cycles.
    pub fn new(resolution: usize, cycles: Vec<CycleParams>) -> Self {
        Self {
            resolution,
            cycles,
            ..Default::default()
        }
    }

    /// Set the endpoint factor of this stage.
    pub fn with_endpoint_factor(mut self, factor: f64) -> Self {
        self.endpoint_factor = factor;
        self
    }
}

/// Parameters and record of a multi-stage spherical registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeformationMap {
    pub stages: Vec<StageParams>,

    /// Apply fiducial/sphere distortion correction while morphing.
    pub fiducial_correction: bool,

    /// Strength of the distortion correction, in `[0, 1]`.
    pub fiducial_ratio: f64,

    /// Ask for confirmation whenever a cycle leaves crossovers.
    pub pause_for_crossovers: bool,

    /// Write per-cycle diagnostic files to the output directory.
    pub keep_intermediate_files: bool,

    /// Prefix of deformed coordinate names.
    pub deformed_prefix: String,

    /// Retry policy for projecting source border links.
    pub retry: RetryPolicy,

    /// Source and target are opposite hemispheres; mirror x once.
    pub different_hemispheres: bool,

    /// Per-stage border resampling.
    pub border_resampling: BorderResampling,

    /// Name of the final deformed coordinates, set by the run.
    pub source_deformed_coord_name: Option<String>,

    /// Intermediate files written by the run.
    pub intermediate_files: Vec<String>,
}

impl Default for DeformationMap {
    fn default() -> Self {
        Self {
            stages: vec![StageParams::default()],
            fiducial_correction: true,
            fiducial_ratio: 0.5,
            pause_for_crossovers: false,
            keep_intermediate_files: false,
            deformed_prefix: "deformed_".to_string(),
            retry: RetryPolicy::default(),
            different_hemispheres: false,
            border_resampling: BorderResampling::None,
            source_deformed_coord_name: None,
            intermediate_files: Vec::new(),
        }
    }
}

impl DeformationMap {
    /// A map with the given stages and default settings.
    pub fn with_stages(stages: Vec<StageParams>) -> Self {
        Self {
            stages,
            ..Default::default()
        }
    }

    /// Enable distortion correction with `strength`, or disable it with `None`.
    pub fn with_fiducial_ratio(mut self, strength: Option<f64>) -> Self {
        match strength {
            Some(strength) => {
                self.fiducial_correction = true;
                self.fiducial_ratio = strength;
            }
            None => self.fiducial_correction = false,
        }
        self
    }

    /// Distortion correction strength, if correction is enabled.
    pub fn distortion_strength(&self) -> Option<f64> {
        self.fiducial_correction.then_some(self.fiducial_ratio)
    }

    /// Ask before continuing with crossovers.
    pub fn with_pause_for_crossovers(mut self, pause: bool) -> Self {
        self.pause_for_crossovers = pause;
        self
    }

    /// Keep per-cycle diagnostic files.
    pub fn with_intermediate_files(mut self, keep: bool) -> Self {
        self.keep_intermediate_files = keep;
        self
    }

    /// Set the border resampling mode.
    pub fn with_border_resampling(mut self, resampling: BorderResampling) -> Self {
        self.border_resampling = resampling;
        self
    }

    /// Total number of cycles across all stages.
    pub fn total_cycles(&self) -> usize {
        self.stages.iter().map(|s| s.cycles.len()).sum()
    }

    /// Name of the output of a non-final cycle (1-based numbers).
    pub fn cycle_output_name(&self, stage: usize, cycle: usize) -> String {
        format!("{}sphere_stage_{}_cycle_{}", self.deformed_prefix, stage, cycle)
    }

    /// Check the map against a sphere library before anything runs.
    ///
    /// # Errors
    /// - [`RegisterError::InvalidParameter`] for missing stages/cycles or
    ///   out-of-range factors.
    /// - [`RegisterError::MissingVectorSmoothing`] listing every cycle with
    ///   zero vector smoothing iterations.
    /// - [`RegisterError::InvalidResolution`] for resolution 20 or one the
    ///   library cannot supply.
    pub fn validate<L: SphereLibrary + ?Sized>(&self, library: &L) -> RegisterResult<()> {
        if self.stages.is_empty() {
            return Err(RegisterError::invalid_parameter("stages", "at least one stage is required"));
        }
        if let Some(i) = self.stages.iter().position(|s| s.cycles.is_empty()) {
            return Err(RegisterError::invalid_parameter(
                "cycles",
                format!("stage {} has no cycles", i + 1),
            ));
        }

        let missing: Vec<(usize, usize)> = self
            .stages
            .iter()
            .enumerate()
            .flat_map(|(s, stage)| {
                stage
                    .cycles
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.vector.smoothing_iterations == 0)
                    .map(move |(c, _)| (s + 1, c + 1))
            })
            .collect();
        if !missing.is_empty() {
            return Err(RegisterError::MissingVectorSmoothing { cycles: missing });
        }

        for (i, stage) in self.stages.iter().enumerate() {
            check_resolution(stage.resolution, library)?;
            if !(stage.endpoint_factor.is_finite() && stage.endpoint_factor >= 0.0) {
                return Err(RegisterError::invalid_parameter(
                    "endpoint_factor",
                    format!(
                        "stage {}: {} is not a non-negative number",
                        i + 1,
                        stage.endpoint_factor
                    ),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.fiducial_ratio) {
            return Err(RegisterError::invalid_parameter(
                "fiducial_ratio",
                format!("strength {} is outside [0, 1]", self.fiducial_ratio),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(RegisterError::invalid_parameter("retry.attempts", "must be at least 1"));
        }
        if let BorderResampling::Spacing(spacing) = self.border_resampling
            && !(spacing.is_finite() && spacing > 0.0)
        {
            return Err(RegisterError::invalid_parameter(
                "border_resampling",
                format!("spacing {spacing} must be positive"),
            ));
        }
        Ok(())
    }

    /// Parse a map from TOML.
    pub fn from_toml(toml_str: &str) -> RegisterResult<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Load a map from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> RegisterResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RegisterError::io_read(path, e))?;
        Self::from_toml(&contents)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> RegisterResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save as a TOML file.
    pub fn save_toml(&self, path: impl AsRef<Path>) -> RegisterResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|e| RegisterError::io_write(path, e))
    }

    /// Parse a map from JSON.
    pub fn from_json(json_str: &str) -> RegisterResult<Self> {
        Ok(serde_json::from_str(json_str)?)
    }

    /// Load a map from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> RegisterResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| RegisterError::io_read(path, e))?;
        Self::from_json(&contents)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> RegisterResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save as a JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> RegisterResult<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?).map_err(|e| RegisterError::io_write(path, e))
    }

    /// Load from TOML or JSON depending on the extension (`.json` is JSON,
    /// anything else TOML).
    pub fn load(path: impl AsRef<Path>) -> RegisterResult<Self> {
        let path = path.as_ref();
        if is_json(path) {
            Self::from_json_file(path)
        } else {
            Self::from_toml_file(path)
        }
    }

    /// Save as TOML or JSON depending on the extension.
    pub fn save(&self, path: impl AsRef<Path>) -> RegisterResult<()> {
        let path = path.as_ref();
        if is_json(path) {
            self.save_json(path)
        } else {
            self.save_toml(path)
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Check that a canonical sphere resolution can be used.
pub fn check_resolution<L: SphereLibrary + ?Sized>(resolution: usize, library: &L) -> RegisterResult<()> {
    if resolution == UNSUPPORTED_MULTI_STAGE_RESOLUTION {
        return Err(RegisterError::InvalidResolution {
            resolution,
            message: format!(
                "Resolution {} not available for Multi-Stage Vector Deformation",
                resolution
            ),
        });
    }
    if !SPHERE_RESOLUTIONS.contains(&resolution) || !library.supports(resolution) {
        return Err(RegisterError::invalid_resolution(resolution));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere::GeneratedSphereLibrary;
    use tempfile::TempDir;

    #[test]
    fn test_default_schedule() {
        let map = DeformationMap::default();
        assert_eq!(map.stages.len(), 1);
        assert_eq!(map.stages[0].resolution, 4610);
        assert_eq!(map.total_cycles(), 3);
        assert_eq!(map.stages[0].cycles[0].morphing.iterations, 300);
        assert_eq!(map.stages[0].cycles[0].smoothing.final_iterations, 30);
        assert_eq!(map.stages[0].cycles[1].smoothing.final_iterations, 5);
        assert_eq!(map.stages[0].cycles[2].smoothing.cycles, 50);
        assert_eq!(map.stages[0].cycles[2].morphing.smooth_iterations, 2);
        assert!(map.validate(&GeneratedSphereLibrary).is_ok());
    }

    #[test]
    fn test_resolution_20_rejected() {
        let map = DeformationMap::with_stages(vec![StageParams::new(20, vec![CycleParams::default()])]);
        let err = map.validate(&GeneratedSphereLibrary).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Resolution 20 not available for Multi-Stage Vector Deformation"
        );
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_unknown_resolution_rejected() {
        let map = DeformationMap::with_stages(vec![StageParams::new(500, vec![CycleParams::default()])]);
        let err = map.validate(&GeneratedSphereLibrary).unwrap_err();
        assert_eq!(err.to_string(), "Invalid sphere resolution: 500");
    }

    #[test]
    fn test_zero_vector_smoothing_lists_cycles() {
        let map = DeformationMap::with_stages(vec![
            StageParams::new(74, vec![CycleParams::default(), CycleParams::default().with_vector_smoothing(0)]),
            StageParams::new(290, vec![CycleParams::default().with_vector_smoothing(0)]),
        ]);
        match map.validate(&GeneratedSphereLibrary) {
            Err(RegisterError::MissingVectorSmoothing { cycles }) => {
                assert_eq!(cycles, vec![(1, 2), (2, 1)]);
            }
            other => panic!("expected MissingVectorSmoothing, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_stage_rejected() {
        let map = DeformationMap::with_stages(vec![StageParams::new(74, vec![])]);
        assert!(matches!(
            map.validate(&GeneratedSphereLibrary),
            Err(RegisterError::InvalidParameter { .. })
        ));
        assert!(DeformationMap::with_stages(vec![]).validate(&GeneratedSphereLibrary).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let mut map = DeformationMap::with_stages(vec![
            StageParams::new(74, vec![CycleParams::coarse()]).with_endpoint_factor(0.5),
            StageParams::new(290, vec![CycleParams::fine().with_morphing(2, 50)]).with_endpoint_factor(2.0),
        ])
        .with_fiducial_ratio(None)
        .with_border_resampling(BorderResampling::Spacing(4.0));
        map.source_deformed_coord_name = Some("deformed_lh.sphere".into());

        let text = map.to_toml().unwrap();
        let parsed = DeformationMap::from_toml(&text).unwrap();
        assert_eq!(parsed.distortion_strength(), None);
        assert_eq!(parsed.stages[0].endpoint_factor, 0.5);
        assert_eq!(parsed.stages[1].endpoint_factor, 2.0);
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.json");
        let map = DeformationMap::with_stages(vec![
            StageParams::new(290, vec![CycleParams::medium()]).with_endpoint_factor(0.25),
            StageParams::default(),
        ])
        .with_pause_for_crossovers(true);
        map.save(&path).unwrap();
        let loaded = DeformationMap::load(&path).unwrap();
        assert_eq!(loaded.stages[0].endpoint_factor, 0.25);
        assert_eq!(loaded.stages[1].endpoint_factor, 1.0);
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_endpoint_factor_checked_per_stage() {
        let map = DeformationMap::with_stages(vec![
            StageParams::new(74, vec![CycleParams::default()]),
            StageParams::new(290, vec![CycleParams::default()]).with_endpoint_factor(-1.0),
        ]);
        let err = map.validate(&GeneratedSphereLibrary).unwrap_err();
        assert!(matches!(err, RegisterError::InvalidParameter { .. }));
        assert!(err.to_string().contains("stage 2"), "{err}");
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = DeformationMap::from_toml("stages = 3").unwrap_err();
        assert!(matches!(err, RegisterError::ConfigFormat { .. }));
    }

    #[test]
    fn test_cycle_output_name() {
        let map = DeformationMap::default();
        assert_eq!(map.cycle_output_name(2, 3), "deformed_sphere_stage_2_cycle_3");
    }
}
