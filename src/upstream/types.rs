// Wire types for the model catalog's JSON envelope.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::time;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelVersionInfo {
    pub id: i64,
    pub model_id: i64,
    pub name: String,
    #[serde(deserialize_with = "time::deserialize")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "time::deserialize")]
    pub updated_at: Option<DateTime<Utc>>,
    pub trained_words: Vec<String>,
    pub base_model: String,
    pub description: Option<String>,
    pub stats: VersionStats,
    pub model: ModelRef,
    pub files: Vec<VersionFile>,
    pub download_url: String,
}

impl ModelVersionInfo {
    /// Name of the file the catalog marks as primary, falling back to the
    /// first file that has a name at all.
    pub fn preferred_filename(&self) -> Option<&str> {
        self.files
            .iter()
            .find(|f| f.primary && !f.name.trim().is_empty())
            .or_else(|| self.files.iter().find(|f| !f.name.trim().is_empty()))
            .map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionStats {
    pub download_count: i64,
    pub rating_count: i64,
    pub rating: f64,
}

/// The parent model a version belongs to. `kind` drives folder selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelRef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub nsfw: bool,
    pub poi: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionFile {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size_kb: f64,
    pub primary: bool,
    #[serde(deserialize_with = "time::deserialize")]
    pub scanned_at: Option<DateTime<Utc>>,
    pub hashes: FileHashes,
    pub download_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileHashes {
    #[serde(rename = "SHA256")]
    pub sha256: String,
    #[serde(rename = "CRC32")]
    pub crc32: String,
    #[serde(rename = "BLAKE3")]
    pub blake3: String,
}
