//! File I/O for surfaces, borders and per-node values.
//!
//! Node order is identity here: a coordinate file only makes sense next to
//! the topology and per-node data it was written with, so every reader keeps
//! nodes exactly in file order.
//!
//! - Surfaces: Wavefront OBJ (`v` and `f` records) and PLY via `ply-rs`.
//! - Borders: a line-based text format, one block per border:
//!
//!   ```text
//!   border CeS 1.0
//!   12.5 40.1 88.0
//!   14.0 39.2 88.3
//!   end
//!   ```
//!
//! - Node values: CSV with a `node,<column>...` header.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use nalgebra::Point3;
use tracing::{debug, info};

use crate::border::{Border, BorderSet};
use crate::error::{RegisterError, RegisterResult};
use crate::tracing_ext::log_io_operation;
use crate::types::Mesh;

/// Supported surface file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshFormat {
    Obj,
    Ply,
}

impl MeshFormat {
    /// Detect format from file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .and_then(|ext| match ext.as_str() {
                "obj" => Some(MeshFormat::Obj),
                "ply" => Some(MeshFormat::Ply),
                _ => None,
            })
    }

    /// File extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            MeshFormat::Obj => "obj",
            MeshFormat::Ply => "ply",
        }
    }
}

fn format_for(path: &Path) -> RegisterResult<MeshFormat> {
    MeshFormat::from_path(path).ok_or_else(|| RegisterError::UnsupportedFormat {
        extension: path.extension().and_then(|e| e.to_str()).map(String::from),
    })
}

fn write_error(path: &Path) -> impl Fn(std::io::Error) -> RegisterError + '_ {
    move |e| RegisterError::io_write(path, e)
}

fn open(path: &Path) -> RegisterResult<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| RegisterError::io_read(path, e))
}

fn create(path: &Path) -> RegisterResult<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| RegisterError::io_write(path, e))
}

/// Load a surface, detecting the format from the extension.
///
/// # Errors
/// Fails on unreadable files, unknown extensions, malformed records, tiles
/// referencing missing nodes, or a surface without nodes or tiles.
pub fn load_mesh(path: &Path) -> RegisterResult<Mesh> {
    let format = format_for(path)?;
    info!("Loading surface from {:?} (format: {:?})", path, format);

    let (positions, tiles) = match format {
        MeshFormat::Obj => read_obj(path)?,
        MeshFormat::Ply => read_ply(path)?,
    };

    if positions.is_empty() || tiles.is_empty() {
        return Err(RegisterError::empty_mesh(format!(
            "{} has {} nodes and {} tiles",
            path.display(),
            positions.len(),
            tiles.len()
        )));
    }
    if let Some(bad) = tiles.iter().flatten().find(|&&n| n as usize >= positions.len()) {
        return Err(RegisterError::parse_error(
            path,
            format!("tile references node {} but the file has {} nodes", bad, positions.len()),
        ));
    }

    let mesh = Mesh::from_parts(positions, tiles);
    info!(
        "Loaded surface: {} nodes, {} tiles",
        mesh.node_count(),
        mesh.tile_count()
    );
    log_io_operation("load_mesh", path, Some(format.extension()), true);
    Ok(mesh)
}

type RawSurface = (Vec<Point3<f64>>, Vec<[u32; 3]>);

fn read_obj(path: &Path) -> RegisterResult<RawSurface> {
    let reader = open(path)?;
    let mut positions = Vec::new();
    let mut tiles = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| RegisterError::io_read(path, e))?;
        let line_no = i + 1;
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("v") => {
                let coords: Vec<f64> = parts
                    .take(3)
                    .map(str::parse)
                    .collect::<Result<_, _>>()
                    .map_err(|e| RegisterError::parse_error_at(path, line_no, format!("bad vertex: {e}")))?;
                if coords.len() != 3 {
                    return Err(RegisterError::parse_error_at(path, line_no, "vertex needs x y z"));
                }
                positions.push(Point3::new(coords[0], coords[1], coords[2]));
            }
            Some("f") => {
                let corners: Vec<u32> = parts
                    .map(|token| obj_index(token, positions.len()))
                    .collect::<Option<_>>()
                    .ok_or_else(|| RegisterError::parse_error_at(path, line_no, "bad face index"))?;
                if corners.len() < 3 {
                    return Err(RegisterError::parse_error_at(path, line_no, "face needs three corners"));
                }
                // Fan-triangulate polygons.
                for k in 1..corners.len() - 1 {
                    tiles.push([corners[0], corners[k], corners[k + 1]]);
                }
            }
            _ => {}
        }
    }

    debug!(
        "OBJ read: {} nodes, {} tiles",
        positions.len(),
        tiles.len()
    );
    Ok((positions, tiles))
}

/// Resolve an OBJ corner (`v`, `v/vt`, `v//vn`, `v/vt/vn`; 1-based or
/// negative-relative) to a 0-based node index.
fn obj_index(token: &str, vertex_count: usize) -> Option<u32> {
    let raw: i64 = token.split('/').next()?.parse().ok()?;
    let index = match raw {
        0 => return None,
        r if r > 0 => r - 1,
        r => vertex_count as i64 + r,
    };
    u32::try_from(index).ok()
}

fn read_ply(path: &Path) -> RegisterResult<RawSurface> {
    use ply_rs::parser::Parser;
    use ply_rs::ply::Property;

    let mut reader = open(path)?;
    let parser = Parser::<ply_rs::ply::DefaultElement>::new();
    let ply = parser
        .read_ply(&mut reader)
        .map_err(|e| RegisterError::parse_error(path, format!("PLY parse error: {e:?}")))?;

    let mut positions = Vec::new();
    if let Some(vertices) = ply.payload.get("vertex") {
        positions.reserve(vertices.len());
        for element in vertices {
            let x = ply_float(element.get("x"), "x", path)?;
            let y = ply_float(element.get("y"), "y", path)?;
            let z = ply_float(element.get("z"), "z", path)?;
            positions.push(Point3::new(x, y, z));
        }
    }

    let mut tiles = Vec::new();
    if let Some(faces) = ply.payload.get("face") {
        for element in faces {
            let corners: Vec<u32> = match element.get("vertex_indices").or_else(|| element.get("vertex_index")) {
                Some(Property::ListInt(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUInt(v)) => v.clone(),
                Some(Property::ListUChar(v)) => v.iter().map(|&i| i as u32).collect(),
                Some(Property::ListUShort(v)) => v.iter().map(|&i| i as u32).collect(),
                _ => {
                    return Err(RegisterError::parse_error(path, "face without vertex_indices"));
                }
            };
            if corners.len() >= 3 {
                for k in 1..corners.len() - 1 {
                    tiles.push([corners[0], corners[k], corners[k + 1]]);
                }
            }
        }
    }

    debug!("PLY read: {} nodes, {} tiles", positions.len(), tiles.len());
    Ok((positions, tiles))
}

fn ply_float(prop: Option<&ply_rs::ply::Property>, name: &str, path: &Path) -> RegisterResult<f64> {
    use ply_rs::ply::Property;

    match prop {
        Some(Property::Float(v)) => Ok(*v as f64),
        Some(Property::Double(v)) => Ok(*v),
        Some(Property::Int(v)) => Ok(*v as f64),
        Some(Property::UInt(v)) => Ok(*v as f64),
        Some(Property::Short(v)) => Ok(*v as f64),
        Some(Property::UShort(v)) => Ok(*v as f64),
        Some(Property::Char(v)) => Ok(*v as f64),
        Some(Property::UChar(v)) => Ok(*v as f64),
        _ => Err(RegisterError::parse_error(
            path,
            format!("missing or invalid PLY property: {name}"),
        )),
    }
}

/// Save a surface, detecting the format from the extension.
pub fn save_mesh(mesh: &Mesh, path: &Path) -> RegisterResult<()> {
    match format_for(path)? {
        MeshFormat::Obj => save_obj(mesh, path),
        MeshFormat::Ply => save_ply(mesh, path),
    }
}

/// Save a surface as OBJ, full double precision.
pub fn save_obj(mesh: &Mesh, path: &Path) -> RegisterResult<()> {
    info!("Saving surface to {:?} (OBJ format)", path);
    let err = write_error(path);
    let mut writer = create(path)?;

    writeln!(writer, "# sphere-register surface").map_err(&err)?;
    writeln!(writer, "# nodes: {}", mesh.node_count()).map_err(&err)?;
    writeln!(writer, "# tiles: {}", mesh.tile_count()).map_err(&err)?;
    for v in &mesh.vertices {
        writeln!(writer, "v {} {} {}", v.position.x, v.position.y, v.position.z).map_err(&err)?;
    }
    for [a, b, c] in mesh.tiles() {
        writeln!(writer, "f {} {} {}", a + 1, b + 1, c + 1).map_err(&err)?;
    }
    writer.flush().map_err(&err)?;

    log_io_operation("save_obj", path, Some("obj"), true);
    Ok(())
}

/// Save a surface as ASCII PLY with double-precision coordinates.
pub fn save_ply(mesh: &Mesh, path: &Path) -> RegisterResult<()> {
    use ply_rs::ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    };
    use ply_rs::writer::Writer;

    info!("Saving surface to {:?} (PLY format)", path);
    let mut ply = Ply::<DefaultElement>::new();
    ply.header.encoding = Encoding::Ascii;

    let mut vertex_def = ElementDef::new("vertex".to_string());
    for axis in ["x", "y", "z"] {
        vertex_def
            .properties
            .add(PropertyDef::new(axis.to_string(), PropertyType::Scalar(ScalarType::Double)));
    }
    vertex_def.count = mesh.node_count();
    ply.header.elements.add(vertex_def);

    let mut face_def = ElementDef::new("face".to_string());
    face_def.properties.add(PropertyDef::new(
        "vertex_indices".to_string(),
        PropertyType::List(ScalarType::UChar, ScalarType::Int),
    ));
    face_def.count = mesh.tile_count();
    ply.header.elements.add(face_def);

    let vertices = mesh
        .vertices
        .iter()
        .map(|v| {
            let mut element = DefaultElement::new();
            element.insert("x".to_string(), Property::Double(v.position.x));
            element.insert("y".to_string(), Property::Double(v.position.y));
            element.insert("z".to_string(), Property::Double(v.position.z));
            element
        })
        .collect();
    ply.payload.insert("vertex".to_string(), vertices);

    let faces = mesh
        .tiles()
        .iter()
        .map(|t| {
            let mut element = DefaultElement::new();
            element.insert(
                "vertex_indices".to_string(),
                Property::ListInt(vec![t[0] as i32, t[1] as i32, t[2] as i32]),
            );
            element
        })
        .collect();
    ply.payload.insert("face".to_string(), faces);

    ply.make_consistent().map_err(|e| {
        RegisterError::io_write(path, std::io::Error::other(format!("PLY consistency error: {e:?}")))
    })?;

    let mut writer = create(path)?;
    Writer::new()
        .write_ply(&mut writer, &mut ply)
        .map_err(|e| RegisterError::io_write(path, e))?;
    writer.flush().map_err(write_error(path))?;

    log_io_operation("save_ply", path, Some("ply"), true);
    Ok(())
}

/// Load borders from the text border format.
pub fn load_borders(path: &Path) -> RegisterResult<BorderSet> {
    let reader = open(path)?;
    let mut borders = BorderSet::new();
    let mut current: Option<Border> = None;

    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| RegisterError::io_read(path, e))?;
        let line_no = i + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(header) = trimmed.strip_prefix("border ") {
            if current.is_some() {
                return Err(RegisterError::parse_error_at(path, line_no, "border not closed with 'end'"));
            }
            let tokens: Vec<&str> = header.split_whitespace().collect();
            let (name, variance) = match tokens.as_slice() {
                [] => return Err(RegisterError::parse_error_at(path, line_no, "border needs a name")),
                [name] => (name.to_string(), 1.0),
                [rest @ .., last] => match last.parse::<f64>() {
                    Ok(v) => (rest.join(" "), v),
                    Err(_) => (tokens.join(" "), 1.0),
                },
            };
            current = Some(Border::new(name, Vec::new()).with_variance(variance));
        } else if trimmed == "end" {
            let border = current
                .take()
                .ok_or_else(|| RegisterError::parse_error_at(path, line_no, "'end' without 'border'"))?;
            borders.push(border);
        } else {
            let border = current
                .as_mut()
                .ok_or_else(|| RegisterError::parse_error_at(path, line_no, "link outside a border"))?;
            let coords: Vec<f64> = trimmed
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<_, _>>()
                .map_err(|e| RegisterError::parse_error_at(path, line_no, format!("bad link: {e}")))?;
            let [x, y, z] = coords[..] else {
                return Err(RegisterError::parse_error_at(path, line_no, "link needs x y z"));
            };
            border.links.push(Point3::new(x, y, z));
        }
    }

    if current.is_some() {
        return Err(RegisterError::parse_error(path, "last border not closed with 'end'"));
    }

    debug!(
        "Loaded {} borders with {} links from {:?}",
        borders.len(),
        borders.total_links(),
        path
    );
    log_io_operation("load_borders", path, Some("border"), true);
    Ok(borders)
}

/// Save borders in the text border format.
pub fn save_borders(borders: &BorderSet, path: &Path) -> RegisterResult<()> {
    let err = write_error(path);
    let mut writer = create(path)?;
    for border in borders {
        writeln!(writer, "border {} {}", border.name, border.variance).map_err(&err)?;
        for link in &border.links {
            writeln!(writer, "{} {} {}", link.x, link.y, link.z).map_err(&err)?;
        }
        writeln!(writer, "end").map_err(&err)?;
    }
    writer.flush().map_err(&err)?;
    log_io_operation("save_borders", path, Some("border"), true);
    Ok(())
}

/// Named per-node value columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeScalars {
    pub names: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl NodeScalars {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    ///
    /// # Panics
    /// Panics if the column length differs from the existing columns.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        if let Some(first) = self.columns.first() {
            assert_eq!(first.len(), values.len(), "columns must have one value per node");
        }
        self.names.push(name.into());
        self.columns.push(values);
        self
    }

    /// Number of nodes (rows).
    pub fn node_count(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
    }
}

/// Load per-node values from CSV.
pub fn load_scalars(path: &Path) -> RegisterResult<NodeScalars> {
    let reader = open(path)?;
    let mut lines = reader.lines().enumerate();

    let header = match lines.next() {
        Some((_, line)) => line.map_err(|e| RegisterError::io_read(path, e))?,
        None => return Err(RegisterError::parse_error(path, "missing header")),
    };
    let names: Vec<String> = header.split(',').skip(1).map(|s| s.trim().to_string()).collect();
    let mut columns = vec![Vec::new(); names.len()];

    for (i, line) in lines {
        let line = line.map_err(|e| RegisterError::io_read(path, e))?;
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let node: usize = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| RegisterError::parse_error_at(path, line_no, "bad node index"))?;
        if node != columns.first().map_or(0, Vec::len) {
            return Err(RegisterError::parse_error_at(
                path,
                line_no,
                format!("node {node} out of order"),
            ));
        }
        let values: Vec<f64> = fields
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|e| RegisterError::parse_error_at(path, line_no, format!("bad value: {e}")))?;
        if values.len() != names.len() {
            return Err(RegisterError::parse_error_at(
                path,
                line_no,
                format!("expected {} values, found {}", names.len(), values.len()),
            ));
        }
        for (column, value) in columns.iter_mut().zip(values) {
            column.push(value);
        }
    }

    log_io_operation("load_scalars", path, Some("csv"), true);
    Ok(NodeScalars { names, columns })
}

/// Save per-node values as CSV.
pub fn save_scalars(scalars: &NodeScalars, path: &Path) -> RegisterResult<()> {
    let err = write_error(path);
    let mut writer = create(path)?;
    write!(writer, "node").map_err(&err)?;
    for name in &scalars.names {
        write!(writer, ",{name}").map_err(&err)?;
    }
    writeln!(writer).map_err(&err)?;
    for node in 0..scalars.node_count() {
        write!(writer, "{node}").map_err(&err)?;
        for column in &scalars.columns {
            write!(writer, ",{}", column[node]).map_err(&err)?;
        }
        writeln!(writer).map_err(&err)?;
    }
    writer.flush().map_err(&err)?;
    log_io_operation("save_scalars", path, Some("csv"), true);
    Ok(())
}

/// Load per-node labels from a `node,label` CSV.
pub fn load_labels(path: &Path) -> RegisterResult<Vec<u32>> {
    let scalars = load_scalars(path)?;
    let column = scalars
        .columns
        .first()
        .ok_or_else(|| RegisterError::parse_error(path, "no label column"))?;
    column
        .iter()
        .map(|&v| {
            if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64 {
                Ok(v as u32)
            } else {
                Err(RegisterError::parse_error(path, format!("label {v} is not a non-negative integer")))
            }
        })
        .collect()
}

/// Save per-node labels as a `node,label` CSV.
pub fn save_labels(labels: &[u32], path: &Path) -> RegisterResult<()> {
    let err = write_error(path);
    let mut writer = create(path)?;
    writeln!(writer, "node,label").map_err(&err)?;
    for (node, label) in labels.iter().enumerate() {
        writeln!(writer, "{node},{label}").map_err(&err)?;
    }
    writer.flush().map_err(&err)?;
    log_io_operation("save_labels", path, Some("csv"), true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere::regular_sphere;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_format_detection() {
        assert_eq!(MeshFormat::from_path(Path::new("a.obj")), Some(MeshFormat::Obj));
        assert_eq!(MeshFormat::from_path(Path::new("a.PLY")), Some(MeshFormat::Ply));
        assert_eq!(MeshFormat::from_path(Path::new("a.stl")), None);
        assert!(matches!(
            load_mesh(Path::new("a.stl")),
            Err(RegisterError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn test_obj_keeps_node_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sphere.obj");
        let mesh = regular_sphere(1, 100.0);
        save_obj(&mesh, &path).unwrap();

        let loaded = load_mesh(&path).unwrap();
        assert_eq!(loaded.node_count(), mesh.node_count());
        assert_eq!(loaded.tiles(), mesh.tiles());
        for (a, b) in loaded.positions().iter().zip(mesh.positions()) {
            assert_eq!(*a, b);
        }
    }

    #[test]
    fn test_ply_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sphere.ply");
        let mesh = regular_sphere(0, 100.0);
        save_mesh(&mesh, &path).unwrap();

        let loaded = load_mesh(&path).unwrap();
        assert_eq!(loaded.tiles(), mesh.tiles());
        assert!((loaded.position(7) - mesh.position(7)).norm() < 1e-12);
    }

    #[test]
    fn test_obj_polygon_and_slash_indices() {
        let mut file = NamedTempFile::with_suffix(".obj").unwrap();
        writeln!(file, "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0").unwrap();
        writeln!(file, "f 1/1/1 2//2 3 -1").unwrap();
        file.flush().unwrap();

        let mesh = load_mesh(file.path()).unwrap();
        assert_eq!(mesh.tile_count(), 2);
        assert_eq!(mesh.tile(1), [0, 2, 3]);
    }

    #[test]
    fn test_obj_bad_index_is_parse_error() {
        let mut file = NamedTempFile::with_suffix(".obj").unwrap();
        writeln!(file, "v 0 0 0\nv 1 0 0\nv 1 1 0\nf 1 2 9").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_mesh(file.path()),
            Err(RegisterError::ParseError { .. })
        ));
    }

    #[test]
    fn test_border_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("landmarks.border");
        let borders: BorderSet = [
            Border::new("CeS", vec![Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)]).with_variance(2.5),
            Border::new("SF", vec![Point3::new(-1.0, 0.5, 9.0)]),
        ]
        .into_iter()
        .collect();

        save_borders(&borders, &path).unwrap();
        let loaded = load_borders(&path).unwrap();
        assert_eq!(loaded, borders);
    }

    #[test]
    fn test_unclosed_border_fails() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "border CeS 1.0\n1 2 3").unwrap();
        file.flush().unwrap();
        let err = load_borders(file.path()).unwrap_err();
        assert!(err.to_string().contains("end"));
    }

    #[test]
    fn test_scalar_and_label_round_trip() {
        let dir = TempDir::new().unwrap();
        let scalars = NodeScalars::new()
            .with_column("depth", vec![0.5, -1.25, 3.0])
            .with_column("variance", vec![1.0, 0.0, 2.0]);
        let path = dir.path().join("values.csv");
        save_scalars(&scalars, &path).unwrap();
        let loaded = load_scalars(&path).unwrap();
        assert_eq!(loaded, scalars);
        assert_eq!(loaded.column("variance"), Some(&[1.0, 0.0, 2.0][..]));

        let labels_path = dir.path().join("labels.csv");
        save_labels(&[3, 0, 7], &labels_path).unwrap();
        assert_eq!(load_labels(&labels_path).unwrap(), vec![3, 0, 7]);
    }
}
