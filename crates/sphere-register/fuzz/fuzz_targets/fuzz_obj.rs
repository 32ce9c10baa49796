#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Write;
use tempfile::NamedTempFile;

fuzz_target!(|data: &[u8]| {
    let mut file = match NamedTempFile::with_suffix(".obj") {
        Ok(f) => f,
        Err(_) => return,
    };
    if file.write_all(data).is_err() {
        return;
    }

    // Loading must not panic; a loaded mesh must be safe to build topology for.
    if let Ok(mesh) = sphere_register::load_mesh(file.path()) {
        let _ = mesh.topology();
    }
});
