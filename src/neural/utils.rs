// projeto: finoexport
// file: src/neural/utils.rs
// Error handling and small file helpers shared by the export pipeline

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("{what} file not found: {}", path.display())]
    MissingFile { what: &'static str, path: PathBuf },

    #[error("Checkpoint does not match the declared architecture:\n{0}")]
    ArchitectureMismatch(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    #[error("Scaler error: {0}")]
    Scaler(String),

    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),
}

impl ExportError {
    pub fn is_missing_file(&self) -> bool {
        matches!(self, ExportError::MissingFile { .. })
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;

/// Fails with `MissingFile` unless `path` points at an existing file.
pub fn require_file(what: &'static str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ExportError::MissingFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

/// A complete file written next to its destination but not yet visible
/// under the destination name. Dropping it without `commit` removes it.
pub struct StagedFile {
    tmp: NamedTempFile,
    target: PathBuf,
}

impl StagedFile {
    pub fn write(target: &Path, bytes: &[u8]) -> Result<Self> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        Ok(Self {
            tmp,
            target: target.to_path_buf(),
        })
    }

    /// Where the staged bytes can be read before the commit.
    pub fn path(&self) -> &Path {
        self.tmp.path()
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Renames the staged file over the destination.
    pub fn commit(self) -> Result<PathBuf> {
        self.tmp.persist(&self.target).map_err(|e| ExportError::Io(e.error))?;
        Ok(self.target)
    }
}

/// Writes `bytes` to `path` through a temporary file in the same directory,
/// so readers see either the old file, no file, or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    StagedFile::write(path, bytes)?.commit()?;
    Ok(())
}
