//! Landmark-driven spherical registration of triangulated cortical surfaces.
//!
//! This crate registers an individual's spherical surface onto an atlas
//! sphere. Corresponding anatomical landmarks ("borders") are drawn on both
//! spheres; the registration pulls the individual's landmarks onto the
//! atlas's while keeping the rest of the surface as undistorted as possible,
//! and produces a deformed copy of the individual's sphere with the same
//! nodes in the same order.
//!
//! # Pipeline
//!
//! - **Canonical spheres** ([`sphere`]): regular tessellations at fixed
//!   resolutions, used as a common registration space.
//! - **Point projection** ([`projector`]): barycentric location of points on
//!   a triangulated surface and replay through another embedding.
//! - **Border tessellation** ([`tessellate`]): border links inserted into the
//!   deformation spheres as landmark nodes.
//! - **Morphing** ([`morph`]): force-based relaxation toward a reference shape.
//! - **Multi-stage controller** ([`deformation`]): stages, cycles, crossover
//!   checks and output surfaces, configured by a [`DeformationMap`].
//! - **Clustering** ([`clustering`]): connected regions of thresholded
//!   per-node values.
//!
//! # Units and Scale
//!
//! Coordinates are unitless. Every deformation sphere is pushed onto the
//! radius of the target sphere after each operation that can move nodes
//! off it; the canonical spheres are generated with radius 100.
//!
//! # Quick Start
//!
//! ```no_run
//! use sphere_register::{DeformationInputs, DeformationMap, GeneratedSphereLibrary, SphericalDeformation};
//! use sphere_register::io::{load_borders, load_mesh, save_mesh};
//! use std::path::Path;
//!
//! let map = DeformationMap::from_toml_file("map.toml").unwrap();
//! let inputs = DeformationInputs::new(
//!     load_mesh(Path::new("individual.sphere.obj")).unwrap(),
//!     load_borders(Path::new("individual.border")).unwrap(),
//!     load_mesh(Path::new("atlas.sphere.obj")).unwrap(),
//!     load_borders(Path::new("atlas.border")).unwrap(),
//! );
//!
//! let outcome = SphericalDeformation::new(map, GeneratedSphereLibrary)
//!     .execute(inputs)
//!     .unwrap();
//! if outcome.has_crossovers() {
//!     eprintln!("{} crossover nodes remain", outcome.final_crossovers());
//! }
//! save_mesh(&outcome.deformed, Path::new("deformed.obj")).unwrap();
//! ```
//!
//! ## Carrying data across
//!
//! ```no_run
//! use sphere_register::NodeMapping;
//! use sphere_register::io::load_mesh;
//! use std::path::Path;
//!
//! let atlas = load_mesh(Path::new("atlas.sphere.obj")).unwrap();
//! let deformed = load_mesh(Path::new("deformed.obj")).unwrap();
//! let mapping = NodeMapping::build(&atlas, &deformed).unwrap();
//! let thickness = vec![2.5; deformed.node_count()];
//! let on_atlas = mapping.map_scalars(&thickness).unwrap();
//! assert_eq!(on_atlas.len(), atlas.node_count());
//! ```
//!
//! # Errors
//!
//! Every fallible operation returns [`RegisterResult`]. Errors carry a
//! machine-readable code, a broad [`ErrorKind`] and a recovery suggestion;
//! a run stopped by the caller is [`ErrorKind::UserAborted`] rather than a
//! failure. Malformed meshes (tiles referencing missing nodes, nodes without
//! neighbours handed to the morphing engine) are programming errors and panic.
//!
//! # Logging
//!
//! The library emits [`tracing`] events; see [`tracing_ext`] for targets and
//! levels.

mod error;
mod types;
pub mod tracing_ext;

pub mod border;
pub mod clustering;
pub mod crossover;
pub mod deformation;
pub mod deformation_map;
pub mod distortion;
pub mod io;
pub mod morph;
pub mod progress;
pub mod projector;
pub mod smoothing;
pub mod sphere;
pub mod tessellate;
pub mod topology;

// Core types
pub use error::{ErrorCode, ErrorKind, ErrorLocation, RecoverySuggestion, RegisterError, RegisterResult};
pub use topology::Topology;
pub use types::{Mesh, MeshSnapshot, Triangle, Vertex};

// Registration
pub use deformation::{
    CrossoverReport, CycleSummary, DeformationInputs, DeformationOutcome, MappedNode, NodeMapping,
    SphericalDeformation, StageSummary,
};
pub use deformation_map::{
    CycleParams, DeformationMap, MorphingParams, SmoothingParams, StageParams, VectorParams,
};

// Building blocks
pub use border::{Border, BorderResampling, BorderSet};
pub use clustering::{
    Cluster, ClusterAnalysis, ClusterParams, MinimumSize, RangeSign, SmallClusterPolicy, ThresholdRange,
    find_clusters, mask_small_clusters,
};
pub use crossover::{CrossoverCount, crossover_check};
pub use distortion::DistortionSamples;
pub use morph::{MorphConstraints, MorphParams, MorphResult, MorphSurface, Morpher};
pub use progress::{ConfirmCallback, CrossoverCheckpoint, Progress, ProgressCallback};
pub use projector::{PointProjector, Projection, RetryPolicy, SurfaceHint};
pub use sphere::{DirectorySphereLibrary, GeneratedSphereLibrary, SphereLibrary};

// I/O
pub use io::{MeshFormat, NodeScalars, load_borders, load_mesh, save_borders, save_mesh};
