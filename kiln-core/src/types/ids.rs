use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KilnError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl TryFrom<String> for $name {
            type Error = KilnError;

            fn try_from(raw: String) -> Result<Self> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl $name {
            /// Validates and wraps a caller-supplied identifier.
            pub fn parse(raw: impl Into<String>) -> Result<Self> {
                let raw = raw.into();
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Err(KilnError::InvalidInput(format!(
                        "{} must not be empty",
                        $label
                    )));
                }
                if trimmed.len() > 256 {
                    return Err(KilnError::InvalidInput(format!(
                        "{} exceeds 256 characters",
                        $label
                    )));
                }
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Caller-assigned, globally unique generation job identifier.
    JobId,
    "jobId"
);
string_id!(
    /// Owner of jobs and artifacts, as established by the fronting auth layer.
    OwnerId,
    "ownerId"
);
string_id!(
    /// Client-chosen key for a chunked or multipart upload session.
    SessionId,
    "sessionId"
);

/// Identifier of a persisted artifact row.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
