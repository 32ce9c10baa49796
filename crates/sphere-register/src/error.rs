//! Error types for spherical registration with rich diagnostics.
//!
//! Every failure carries:
//! - A machine-readable error code (`SREG-XXXX`)
//! - An [`ErrorKind`] so callers can separate a user abort from a real failure
//! - Optional location information (node, tile, border link, file)
//! - A recovery suggestion
//!
//! # Error Codes
//!
//! - `SREG-1xxx`: I/O errors (reading, writing, parsing)
//! - `SREG-2xxx`: Configuration errors (detected before any mesh is touched)
//! - `SREG-3xxx`: Projection errors (points that never landed in a tile)
//! - `SREG-4xxx`: Topology errors (tessellation produced nothing, bad inputs)
//! - `SREG-5xxx`: User-requested abort
//!
//! Programming errors (a tile naming a node that does not exist, a node
//! without neighbours handed to the morphing engine) are not represented
//! here. Those are assertions.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for registration operations.
pub type RegisterResult<T> = Result<T, RegisterError>;

/// Broad classification of a [`RegisterError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Reading or writing an external collaborator failed.
    Io,
    /// Parameters or inputs are unusable; no mesh was mutated.
    Configuration,
    /// A point could not be placed on a mesh after every retry.
    Projection,
    /// The mesh did not end up in the expected shape.
    Topology,
    /// The caller declined a confirmation checkpoint.
    UserAborted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Io => "I/O",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Projection => "projection",
            ErrorKind::Topology => "topology",
            ErrorKind::UserAborted => "user aborted",
        };
        write!(f, "{}", name)
    }
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// SREG-1001: Failed to read file
    IoRead = 1001,
    /// SREG-1002: Failed to write file
    IoWrite = 1002,
    /// SREG-1003: Failed to parse file contents
    ParseError = 1003,
    /// SREG-1004: Unsupported file format
    UnsupportedFormat = 1004,

    /// SREG-2001: Invalid parameter value
    InvalidParameter = 2001,
    /// SREG-2002: Sphere resolution not available
    InvalidResolution = 2002,
    /// SREG-2003: Cycle configured without vector smoothing
    MissingVectorSmoothing = 2003,
    /// SREG-2004: Landmark border missing from the source set
    MissingBorder = 2004,
    /// SREG-2005: Per-node data does not match the mesh
    NodeCountMismatch = 2005,
    /// SREG-2006: Deformation map could not be (de)serialized
    ConfigFormat = 2006,

    /// SREG-3001: Border link could not be projected into the source sphere
    UnableToTessellate = 3001,

    /// SREG-4001: No border link could be inserted into the sphere
    TessellationFailed = 4001,
    /// SREG-4002: Mesh has no nodes or tiles
    EmptyMesh = 4002,

    /// SREG-5001: Deformation cancelled by the user
    UserAborted = 5001,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `SREG-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::IoRead => "SREG-1001",
            ErrorCode::IoWrite => "SREG-1002",
            ErrorCode::ParseError => "SREG-1003",
            ErrorCode::UnsupportedFormat => "SREG-1004",
            ErrorCode::InvalidParameter => "SREG-2001",
            ErrorCode::InvalidResolution => "SREG-2002",
            ErrorCode::MissingVectorSmoothing => "SREG-2003",
            ErrorCode::MissingBorder => "SREG-2004",
            ErrorCode::NodeCountMismatch => "SREG-2005",
            ErrorCode::ConfigFormat => "SREG-2006",
            ErrorCode::UnableToTessellate => "SREG-3001",
            ErrorCode::TessellationFailed => "SREG-4001",
            ErrorCode::EmptyMesh => "SREG-4002",
            ErrorCode::UserAborted => "SREG-5001",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions for registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Check the file system.
    CheckFile { checks: Vec<String> },
    /// Adjust deformation parameters.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Fix the landmark borders.
    CheckBorders { details: String },
    /// Re-run without the confirmation checkpoint or accept the crossovers.
    RerunWithoutPause,
    /// No automatic recovery available.
    None,
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::CheckFile { checks } => {
                write!(f, "Check the file for: {}", checks.join(", "))
            }
            RecoverySuggestion::AdjustParameters { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Try adjusting: {}", params.join(", "))
            }
            RecoverySuggestion::CheckBorders { details } => write!(f, "{}", details),
            RecoverySuggestion::RerunWithoutPause => write!(
                f,
                "Accept the crossovers or rerun with different morphing parameters"
            ),
            RecoverySuggestion::None => write!(f, "No automatic recovery available"),
        }
    }
}

/// Where an error happened.
#[derive(Debug, Clone)]
pub enum ErrorLocation {
    /// A node of a mesh.
    Node { index: usize },
    /// A link of a landmark border.
    BorderLink { border: String, link: usize },
    /// A stage/cycle of the deformation run (1-based).
    Cycle { stage: usize, cycle: usize },
    /// A file on disk.
    File { path: PathBuf, line: Option<usize> },
}

impl std::fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorLocation::Node { index } => write!(f, "node {}", index),
            ErrorLocation::BorderLink { border, link } => {
                write!(f, "border \"{}\" link {}", border, link)
            }
            ErrorLocation::Cycle { stage, cycle } => write!(f, "stage {} cycle {}", stage, cycle),
            ErrorLocation::File { path, line } => match line {
                Some(l) => write!(f, "{}:{}", path.display(), l),
                None => write!(f, "{}", path.display()),
            },
        }
    }
}

/// Errors that can occur while registering surfaces.
#[derive(Debug, Error, Diagnostic)]
pub enum RegisterError {
    /// Error reading from a file.
    #[error("failed to read {path}")]
    #[diagnostic(
        code(register::io::read),
        help("Check that the file exists and is readable. Try: ls -la {}", path.display())
    )]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error writing to a file.
    #[error("failed to write {path}")]
    #[diagnostic(
        code(register::io::write),
        help("Check that the directory exists and is writable")
    )]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing a file.
    #[error("failed to parse {path}: {details}")]
    #[diagnostic(code(register::io::parse))]
    ParseError {
        path: PathBuf,
        line: Option<usize>,
        details: String,
    },

    /// Unsupported file format.
    #[error("unsupported file format: {extension:?}")]
    #[diagnostic(code(register::io::format), help("Supported mesh formats: OBJ, PLY"))]
    UnsupportedFormat { extension: Option<String> },

    /// A parameter has an unusable value.
    #[error("invalid parameter {name}: {details}")]
    #[diagnostic(code(register::config::parameter))]
    InvalidParameter { name: String, details: String },

    /// A canonical sphere resolution that cannot be used.
    #[error("{message}")]
    #[diagnostic(
        code(register::config::resolution),
        help("Available resolutions: 74, 290, 1154, 4610, 18434, 73730")
    )]
    InvalidResolution { resolution: usize, message: String },

    /// One or more cycles configured with zero vector-smoothing iterations.
    #[error(
        "Each cycle must have at least one iteration of vector smoothing (stage, cycle): {}",
        format_cycles(cycles)
    )]
    #[diagnostic(code(register::config::vector_smoothing))]
    MissingVectorSmoothing { cycles: Vec<(usize, usize)> },

    /// Source border set lacks a border that the target tessellated.
    #[error("Unable to find source border named \"{name}\"")]
    #[diagnostic(
        code(register::config::missing_border),
        help("Source and target border files must contain borders with matching names")
    )]
    MissingBorder { name: String },

    /// Per-node data whose length does not match the mesh.
    #[error("{what} has {actual} values but the mesh has {expected} nodes")]
    #[diagnostic(code(register::config::node_count))]
    NodeCountMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    /// Deformation map serialization failed.
    #[error("deformation map error: {details}")]
    #[diagnostic(code(register::config::format))]
    ConfigFormat { details: String },

    /// A source border link failed to project after every retry.
    #[error("Unable to tessellate border {border} link {link} into source surface.")]
    #[diagnostic(
        code(register::projection::tessellate),
        help("The source border may lie off the sphere or cross a hole in the mesh")
    )]
    UnableToTessellate { border: String, link: usize },

    /// No border link could be inserted into a deformation sphere.
    #[error("Tessellating in border nodes failed")]
    #[diagnostic(
        code(register::topology::tessellation),
        help("Check that the border links lie on the sphere surface")
    )]
    TessellationFailed,

    /// Mesh is empty.
    #[error("mesh is empty: {details}")]
    #[diagnostic(code(register::topology::empty))]
    EmptyMesh { details: String },

    /// The caller declined to continue after crossovers were found.
    ///
    /// Stage 0 marks the confirmation asked once the run is complete.
    #[error(
        "Deformation {} by user.",
        if *stage == 0 { "terminated" } else { "cancelled" }
    )]
    #[diagnostic(code(register::user::aborted))]
    UserAborted { stage: usize, cycle: usize },
}

fn format_cycles(cycles: &[(usize, usize)]) -> String {
    cycles
        .iter()
        .map(|(s, c)| format!("({}, {})", s, c))
        .collect::<Vec<_>>()
        .join(" ")
}

impl RegisterError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            RegisterError::IoRead { .. } => ErrorCode::IoRead,
            RegisterError::IoWrite { .. } => ErrorCode::IoWrite,
            RegisterError::ParseError { .. } => ErrorCode::ParseError,
            RegisterError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            RegisterError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            RegisterError::InvalidResolution { .. } => ErrorCode::InvalidResolution,
            RegisterError::MissingVectorSmoothing { .. } => ErrorCode::MissingVectorSmoothing,
            RegisterError::MissingBorder { .. } => ErrorCode::MissingBorder,
            RegisterError::NodeCountMismatch { .. } => ErrorCode::NodeCountMismatch,
            RegisterError::ConfigFormat { .. } => ErrorCode::ConfigFormat,
            RegisterError::UnableToTessellate { .. } => ErrorCode::UnableToTessellate,
            RegisterError::TessellationFailed => ErrorCode::TessellationFailed,
            RegisterError::EmptyMesh { .. } => ErrorCode::EmptyMesh,
            RegisterError::UserAborted { .. } => ErrorCode::UserAborted,
        }
    }

    /// Returns the broad category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegisterError::IoRead { .. }
            | RegisterError::IoWrite { .. }
            | RegisterError::ParseError { .. }
            | RegisterError::UnsupportedFormat { .. } => ErrorKind::Io,
            RegisterError::InvalidParameter { .. }
            | RegisterError::InvalidResolution { .. }
            | RegisterError::MissingVectorSmoothing { .. }
            | RegisterError::MissingBorder { .. }
            | RegisterError::NodeCountMismatch { .. }
            | RegisterError::ConfigFormat { .. } => ErrorKind::Configuration,
            RegisterError::UnableToTessellate { .. } => ErrorKind::Projection,
            RegisterError::TessellationFailed | RegisterError::EmptyMesh { .. } => {
                ErrorKind::Topology
            }
            RegisterError::UserAborted { .. } => ErrorKind::UserAborted,
        }
    }

    /// True when the run stopped because the caller said so.
    pub fn is_user_abort(&self) -> bool {
        self.kind() == ErrorKind::UserAborted
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            RegisterError::IoRead { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["file exists".into(), "file permissions".into()],
            },
            RegisterError::IoWrite { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["directory exists".into(), "write permissions".into()],
            },
            RegisterError::ParseError { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["file contents".into(), "file format".into()],
            },
            RegisterError::UnsupportedFormat { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["file extension (.obj or .ply)".into()],
            },
            RegisterError::InvalidParameter { name, .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![(name.clone(), "a valid value".into())],
            },
            RegisterError::InvalidResolution { .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![("resolution".into(), "74, 290, 1154, 4610, 18434 or 73730".into())],
            },
            RegisterError::MissingVectorSmoothing { .. } => RecoverySuggestion::AdjustParameters {
                parameters: vec![("vector.smoothing_iterations".into(), "at least 1".into())],
            },
            RegisterError::MissingBorder { name } => RecoverySuggestion::CheckBorders {
                details: format!("Add a border named \"{}\" to the source border file", name),
            },
            RegisterError::NodeCountMismatch { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["data was produced for this mesh".into()],
            },
            RegisterError::ConfigFormat { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["TOML/JSON syntax".into(), "field names".into()],
            },
            RegisterError::UnableToTessellate { border, .. } => RecoverySuggestion::CheckBorders {
                details: format!("Check that border \"{}\" lies on the source sphere", border),
            },
            RegisterError::TessellationFailed => RecoverySuggestion::CheckBorders {
                details: "Check that the target borders lie on the target sphere".into(),
            },
            RegisterError::EmptyMesh { .. } => RecoverySuggestion::CheckFile {
                checks: vec!["mesh has nodes and tiles".into()],
            },
            RegisterError::UserAborted { .. } => RecoverySuggestion::RerunWithoutPause,
        }
    }

    /// Returns location information if available.
    pub fn location(&self) -> Option<ErrorLocation> {
        match self {
            RegisterError::IoRead { path, .. } | RegisterError::IoWrite { path, .. } => {
                Some(ErrorLocation::File {
                    path: path.clone(),
                    line: None,
                })
            }
            RegisterError::ParseError { path, line, .. } => Some(ErrorLocation::File {
                path: path.clone(),
                line: *line,
            }),
            RegisterError::UnableToTessellate { border, link } => {
                Some(ErrorLocation::BorderLink {
                    border: border.clone(),
                    link: *link,
                })
            }
            RegisterError::UserAborted { stage, cycle } => Some(ErrorLocation::Cycle {
                stage: *stage,
                cycle: *cycle,
            }),
            _ => None,
        }
    }

    // Constructor helpers

    /// Create an IoRead error.
    pub fn io_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RegisterError::IoRead {
            path: path.into(),
            source,
        }
    }

    /// Create an IoWrite error.
    pub fn io_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RegisterError::IoWrite {
            path: path.into(),
            source,
        }
    }

    /// Create a ParseError without a line number.
    pub fn parse_error(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        RegisterError::ParseError {
            path: path.into(),
            line: None,
            details: details.into(),
        }
    }

    /// Create a ParseError pointing at a line (1-based).
    pub fn parse_error_at(path: impl Into<PathBuf>, line: usize, details: impl Into<String>) -> Self {
        RegisterError::ParseError {
            path: path.into(),
            line: Some(line),
            details: details.into(),
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(name: impl Into<String>, details: impl Into<String>) -> Self {
        RegisterError::InvalidParameter {
            name: name.into(),
            details: details.into(),
        }
    }

    /// Create an InvalidResolution error with the stock message.
    pub fn invalid_resolution(resolution: usize) -> Self {
        RegisterError::InvalidResolution {
            resolution,
            message: format!("Invalid sphere resolution: {}", resolution),
        }
    }

    /// Create a NodeCountMismatch error.
    pub fn node_count_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        RegisterError::NodeCountMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    /// Create a ConfigFormat error.
    pub fn config_format(details: impl Into<String>) -> Self {
        RegisterError::ConfigFormat {
            details: details.into(),
        }
    }

    /// Create an EmptyMesh error.
    pub fn empty_mesh(details: impl Into<String>) -> Self {
        RegisterError::EmptyMesh {
            details: details.into(),
        }
    }
}

impl From<toml::de::Error> for RegisterError {
    fn from(e: toml::de::Error) -> Self {
        RegisterError::config_format(format!("TOML parse error: {}", e))
    }
}

impl From<toml::ser::Error> for RegisterError {
    fn from(e: toml::ser::Error) -> Self {
        RegisterError::config_format(format!("TOML serialize error: {}", e))
    }
}

impl From<serde_json::Error> for RegisterError {
    fn from(e: serde_json::Error) -> Self {
        RegisterError::config_format(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_format() {
        assert_eq!(ErrorCode::IoRead.as_str(), "SREG-1001");
        assert_eq!(ErrorCode::InvalidResolution.to_string(), "SREG-2002");
        assert_eq!(ErrorCode::UserAborted.as_str(), "SREG-5001");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            RegisterError::invalid_resolution(12).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            RegisterError::UnableToTessellate {
                border: "CeS".into(),
                link: 3
            }
            .kind(),
            ErrorKind::Projection
        );
        assert_eq!(RegisterError::TessellationFailed.kind(), ErrorKind::Topology);

        let abort = RegisterError::UserAborted { stage: 1, cycle: 2 };
        assert!(abort.is_user_abort());
        assert_eq!(abort.to_string(), "Deformation cancelled by user.");
        assert_eq!(
            RegisterError::UserAborted { stage: 0, cycle: 0 }.to_string(),
            "Deformation terminated by user."
        );
        assert_eq!(abort.code(), ErrorCode::UserAborted);
    }

    #[test]
    fn test_messages() {
        let err = RegisterError::invalid_resolution(42);
        assert_eq!(err.to_string(), "Invalid sphere resolution: 42");

        let err = RegisterError::MissingVectorSmoothing {
            cycles: vec![(1, 2), (2, 1)],
        };
        let msg = err.to_string();
        assert!(msg.contains("at least one iteration of vector smoothing"));
        assert!(msg.contains("(1, 2) (2, 1)"));

        let err = RegisterError::MissingBorder {
            name: "LANDMARK.CeS".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unable to find source border named \"LANDMARK.CeS\""
        );
    }

    #[test]
    fn test_location() {
        let err = RegisterError::UnableToTessellate {
            border: "SF".into(),
            link: 7,
        };
        let location = err.location().unwrap();
        assert_eq!(location.to_string(), "border \"SF\" link 7");

        let err = RegisterError::parse_error_at("borders.txt", 12, "bad link");
        assert_eq!(err.location().unwrap().to_string(), "borders.txt:12");
    }
}
