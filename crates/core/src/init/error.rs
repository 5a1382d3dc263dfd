use std::path::PathBuf;
use thiserror::Error;

pub type InitResult<T> = Result<T, InitError>;

/// Failures while scaffolding `.repodoc/`.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("{} already exists; pass --force to overwrite it", .0.display())]
    DirectoryExists(PathBuf),

    /// The embedded template set does not contain `0`.
    #[error("No embedded template named '{0}'")]
    TemplateNotFound(String),

    #[error("Cannot create {}: {source}", path.display())]
    DirectoryCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write {}: {source}", path.display())]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}
