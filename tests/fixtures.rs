use std::fs;
use std::path::Path;

use stencil::Engine;
use tempfile::TempDir;

/// An engine rooted in fresh temporary template and cache directories.
///
/// The `TempDir` guards must outlive the engine, so both are returned.
pub fn engine_with_dirs() -> (Engine, TempDir, TempDir) {
    let templates = tempfile::tempdir().expect("create template dir");
    let cache = tempfile::tempdir().expect("create cache dir");
    let engine = Engine::new(templates.path(), cache.path());
    (engine, templates, cache)
}

/// Write a template source file under the given template root.
pub fn write_template(root: &Path, name: &str, content: &str) {
    fs::write(root.join(name), content).expect("write template source");
}
