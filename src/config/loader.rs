// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{RawPipelineDocument, RawPipelineFile};
use crate::errors::Result;

/// Document formats understood by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from the file extension; anything but `.toml` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

/// Parse a pipeline document from a string.
pub fn parse_str(contents: &str, format: ConfigFormat) -> Result<RawPipelineFile> {
    let doc: RawPipelineDocument = match format {
        ConfigFormat::Json => serde_json::from_str(contents)?,
        ConfigFormat::Toml => toml::from_str(contents)?,
    };
    Ok(doc.into())
}

/// Load a pipeline file from a given path and return the raw `RawPipelineFile`.
///
/// This only performs deserialization; names and references are resolved
/// by `PipelineConfig::try_from` or `Pipeline::prepare`.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPipelineFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    parse_str(&contents, ConfigFormat::from_path(path))
}
