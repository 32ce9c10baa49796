//! Tracing helpers for registration runs.
//!
//! The library only emits events; installing a subscriber is up to the
//! application:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//!
//! // RUST_LOG=sphere_register=debug for per-step detail
//! ```
//!
//! # Log Levels
//!
//! - **INFO**: stage and cycle summaries, timing
//! - **WARN**: skipped border links, crossovers
//! - **DEBUG**: per-step detail
//! - **TRACE**: per-iteration residuals

use std::time::Instant;
use tracing::{Span, debug, info, trace, warn};

use crate::crossover::CrossoverCount;
use crate::morph::MorphResult;
use crate::types::Mesh;

/// Logs the duration of an operation when dropped.
///
/// ```rust,ignore
/// use sphere_register::tracing_ext::OperationTimer;
///
/// fn tessellate() {
///     let _timer = OperationTimer::new("tessellate");
///     // ...
/// }
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl OperationTimer {
    /// Start timing `name`.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("register_operation", operation = name);
        debug!(target: "sphere_register::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Start timing `name` on a mesh of the given size.
    pub fn with_context(name: &'static str, tile_count: usize, node_count: usize) -> Self {
        let span = tracing::info_span!(
            "register_operation",
            operation = name,
            tiles = tile_count,
            nodes = node_count
        );
        debug!(
            target: "sphere_register::timing",
            operation = name,
            tiles = tile_count,
            nodes = node_count,
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Milliseconds since the timer started.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed_ms();
        info!(
            target: "sphere_register::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", elapsed_ms),
            "Operation completed"
        );
    }
}

/// Log node/tile counts and the spherical radius of a mesh.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    debug!(
        target: "sphere_register::mesh_state",
        context = context,
        nodes = mesh.node_count(),
        tiles = mesh.tile_count(),
        radius = format!("{:.4}", mesh.spherical_radius()),
        "Mesh state"
    );
}

/// Log the crossover count after a cycle.
pub fn log_crossovers(stage: usize, cycle: usize, count: &CrossoverCount) {
    if count.is_clean() {
        debug!(
            target: "sphere_register::crossovers",
            stage = stage,
            cycle = cycle,
            "No crossovers"
        );
    } else {
        warn!(
            target: "sphere_register::crossovers",
            stage = stage,
            cycle = cycle,
            tiles = count.tiles,
            nodes = count.nodes,
            "Crossovers after morphing"
        );
    }
}

/// Log the outcome of one morphing cycle.
pub fn log_morph_result(stage: usize, cycle: usize, morph_cycle: usize, result: &MorphResult) {
    debug!(
        target: "sphere_register::morph",
        stage = stage,
        cycle = cycle,
        morph_cycle = morph_cycle,
        iterations = result.iterations,
        initial = format!("{:.4}", result.initial_residual),
        final_residual = format!("{:.4}", result.final_residual),
        elapsed_ms = format!("{:.2}", result.elapsed_ms),
        "Morph cycle completed"
    );
}

/// Log progress of a long-running operation.
pub fn log_progress(operation: &str, current: usize, total: usize, stage: Option<&str>) {
    let percent = if total > 0 {
        (current as f64 / total as f64 * 100.0) as u32
    } else {
        0
    };

    debug!(
        target: "sphere_register::progress",
        operation = operation,
        current = current,
        total = total,
        percent = percent,
        stage = stage.unwrap_or("processing"),
        "Progress update"
    );
}

/// Log a file read or write.
pub fn log_io_operation(operation: &str, path: &std::path::Path, format: Option<&str>, success: bool) {
    if success {
        info!(
            target: "sphere_register::io",
            operation = operation,
            path = path.display().to_string(),
            format = format.unwrap_or("auto"),
            "I/O operation completed"
        );
    } else {
        warn!(
            target: "sphere_register::io",
            operation = operation,
            path = path.display().to_string(),
            format = format.unwrap_or("auto"),
            "I/O operation failed"
        );
    }
}

/// Guard that logs the time spent in a section at trace level.
#[must_use]
pub fn log_perf_section(name: &'static str) -> impl Drop {
    struct PerfGuard {
        name: &'static str,
        start: Instant,
    }
    impl Drop for PerfGuard {
        fn drop(&mut self) {
            trace!(
                target: "sphere_register::perf",
                section = self.name,
                elapsed_us = self.start.elapsed().as_micros(),
                "Performance section completed"
            );
        }
    }
    PerfGuard {
        name,
        start: Instant::now(),
    }
}

/// Span carrying a mesh's node and tile counts.
#[macro_export]
macro_rules! mesh_span {
    ($name:expr, $mesh:expr) => {
        tracing::info_span!(
            $name,
            nodes = $mesh.node_count(),
            tiles = $mesh.tile_count()
        )
    };
    ($name:expr, $mesh:expr, $($field:tt)*) => {
        tracing::info_span!(
            $name,
            nodes = $mesh.node_count(),
            tiles = $mesh.tile_count(),
            $($field)*
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere::regular_sphere;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }

    #[test]
    fn test_logging_helpers_accept_empty_input() {
        log_mesh_stats(&Mesh::new(), "empty");
        log_crossovers(1, 1, &CrossoverCount::default());
        log_morph_result(1, 1, 1, &MorphResult::default());
        let _guard = log_perf_section("test");
    }

    #[test]
    fn test_mesh_span() {
        let mesh = regular_sphere(0, 1.0);
        let span = mesh_span!("test_span", mesh, stage = 1);
        let _entered = span.enter();
    }
}
