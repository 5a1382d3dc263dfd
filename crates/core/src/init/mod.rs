//! Project scaffolding for the `.repodoc/` directory.
//!
//! `repodoc init` writes the embedded templates:
//! - Engine and storage settings (`config.toml`)
//! - Analysis agent profiles (`agents/*.md`)
//! - Pipeline definitions (`pipelines/*.yaml`)
//!
//! # Example
//!
//! ```no_run
//! use rd_core::init::{InitOptions, generate_project_structure};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = InitOptions {
//!     target_dir: PathBuf::from("."),
//!     force: false,
//!     minimal: false,
//! };
//!
//! generate_project_structure(options).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod generator;
pub mod templates;

pub use error::{InitError, InitResult};
pub use generator::{generate_project_structure, InitOptions};
pub use templates::{get_template, list_templates};
