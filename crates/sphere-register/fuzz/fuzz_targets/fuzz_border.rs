#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Write;
use tempfile::NamedTempFile;

fuzz_target!(|data: &[u8]| {
    let mut file = match NamedTempFile::with_suffix(".border") {
        Ok(f) => f,
        Err(_) => return,
    };
    if file.write_all(data).is_err() {
        return;
    }

    if let Ok(mut borders) = sphere_register::load_borders(file.path()) {
        borders.project_to_sphere(100.0);
    }
});
