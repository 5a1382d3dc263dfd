//! Embedded template files for `.repodoc/` initialization.
//!
//! The workspace-level `templates/` directory is compiled into the binary
//! with `rust-embed`, so `repodoc init` works without any files on disk.

use rust_embed::RustEmbed;

/// Files under `templates/` at the workspace root.
///
/// - `CARGO_MANIFEST_DIR` = `crates/core`
/// - `../../templates` = workspace `templates/`
///
/// With the `debug-embed` feature, debug builds embed the files as well
/// instead of reading them from disk at runtime.
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/../../templates"]
pub struct TemplateAssets;

/// Template content by path relative to the templates root, e.g. `"agents/sde-writer.md"`.
///
/// # Example
/// ```
/// use rd_core::init::templates::get_template;
///
/// let config = get_template("config.toml").expect("config.toml should exist");
/// assert!(config.contains("pause_timeout_minutes"));
/// ```
pub fn get_template(path: &str) -> Option<String> {
    TemplateAssets::get(path).map(|file| String::from_utf8_lossy(file.data.as_ref()).to_string())
}

/// Template paths starting with `prefix`, sorted.
pub fn list_templates(prefix: &str) -> Vec<String> {
    let mut paths: Vec<String> = TemplateAssets::iter()
        .filter(|path| path.starts_with(prefix))
        .map(|path| path.to_string())
        .collect();
    paths.sort();
    paths
}
