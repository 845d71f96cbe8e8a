use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{ArtifactId, JobId, OwnerId};
use crate::error::{KilnError, Result};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    #[default]
    Output,
    Input,
    Temp,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Output => "output",
            ArtifactKind::Input => "input",
            ArtifactKind::Temp => "temp",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "output" => Ok(ArtifactKind::Output),
            "input" => Ok(ArtifactKind::Input),
            "temp" => Ok(ArtifactKind::Temp),
            other => Err(KilnError::InvalidInput(format!(
                "unknown artifact kind: {other}"
            ))),
        }
    }
}

/// Logical file identity within a job.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: ArtifactKind,
}

impl FileDescriptor {
    pub fn output(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            subfolder: String::new(),
            kind: ArtifactKind::Output,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(KilnError::InvalidInput("filename must not be empty".into()));
        }
        if self.filename.contains('/') || self.filename.contains("..") {
            return Err(KilnError::InvalidInput(format!(
                "filename must be a plain name: {}",
                self.filename
            )));
        }
        if self.subfolder.split('/').any(|segment| segment == "..") {
            return Err(KilnError::InvalidInput(format!(
                "subfolder must not traverse upwards: {}",
                self.subfolder
            )));
        }
        Ok(())
    }
}

/// Reference supplied by an upstream system that already wrote the bytes to
/// the object store.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageHints {
    pub object_key: Option<String>,
    pub external_path: Option<String>,
    pub byte_size: Option<u64>,
}

impl StorageHints {
    pub fn object(key: impl Into<String>, byte_size: u64) -> Self {
        Self {
            object_key: Some(key.into()),
            external_path: None,
            byte_size: Some(byte_size),
        }
    }
}

/// Where an artifact's bytes live. Exactly one location per artifact.
#[derive(Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    Inline(Vec<u8>),
    Object {
        key: String,
        external_path: Option<String>,
    },
}

impl ArtifactLocation {
    pub fn object_key(&self) -> Option<&str> {
        match self {
            ArtifactLocation::Object { key, .. } => Some(key),
            ArtifactLocation::Inline(_) => None,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, ArtifactLocation::Inline(_))
    }
}

impl fmt::Debug for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactLocation::Inline(data) => {
                f.debug_tuple("Inline").field(&data.len()).finish()
            }
            ArtifactLocation::Object { key, external_path } => f
                .debug_struct("Object")
                .field("key", key)
                .field("external_path", external_path)
                .finish(),
        }
    }
}

/// Lightweight metadata derived from bytes already in hand.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProbedMetadata {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Artifact {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub descriptor: FileDescriptor,
    pub location: ArtifactLocation,
    pub byte_size: u64,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub metadata: Option<Value>,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn to_ref(&self) -> ArtifactRef {
        let (storage, object_key, external_path) = match &self.location {
            ArtifactLocation::Inline(_) => (StorageTier::Inline, None, None),
            ArtifactLocation::Object { key, external_path } => (
                StorageTier::Object,
                Some(key.clone()),
                external_path.clone(),
            ),
        };
        ArtifactRef {
            id: self.id,
            job_id: self.job_id.clone(),
            filename: self.descriptor.filename.clone(),
            subfolder: self.descriptor.subfolder.clone(),
            kind: self.descriptor.kind,
            storage,
            object_key,
            external_path,
            byte_size: self.byte_size,
            format: self.format.clone(),
            width: self.width,
            height: self.height,
            usage_count: self.usage_count,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    Inline,
    Object,
}

/// Public view of an artifact; never carries the inline bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    pub id: ArtifactId,
    pub job_id: JobId,
    pub filename: String,
    pub subfolder: String,
    pub kind: ArtifactKind,
    pub storage: StorageTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_path: Option<String>,
    pub byte_size: u64,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub usage_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_rejects_path_traversal() {
        let mut descriptor = FileDescriptor::output("image.png");
        assert!(descriptor.validate().is_ok());

        descriptor.subfolder = "a/../../etc".into();
        assert!(descriptor.validate().is_err());

        assert!(FileDescriptor::output("../weights.bin").validate().is_err());
    }

    #[test]
    fn descriptor_reads_type_or_kind() {
        let a: FileDescriptor =
            serde_json::from_str(r#"{"filename":"a.png","type":"input"}"#).unwrap();
        let b: FileDescriptor =
            serde_json::from_str(r#"{"filename":"a.png","kind":"input"}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.kind, ArtifactKind::Input);
        assert_eq!(a.subfolder, "");
    }
}
