//! Sensitivity labels
//!
//! A closed set of well-known levels plus an escape hatch for site-specific
//! labels. The textual form is what lands in sidecar tags and in the store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::error::DlpError;

/// Sensitivity label attached to a file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    Confidential,
    Secret,
    Internal,
    Restricted,
    /// Organisation-specific label, stored lowercase
    Custom(String),
}

impl Label {
    /// The four labels offered by the tagging tools
    pub const BUILTIN: [Label; 4] = [
        Label::Confidential,
        Label::Secret,
        Label::Internal,
        Label::Restricted,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Label::Confidential => "confidential",
            Label::Secret => "secret",
            Label::Internal => "internal",
            Label::Restricted => "restricted",
            Label::Custom(name) => name.as_str(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, Label::Custom(_))
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = DlpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(DlpError::InvalidInput("label must not be empty".to_string()));
        }
        if normalized.chars().any(|c| c.is_control()) {
            return Err(DlpError::InvalidInput(format!(
                "label contains control characters: {:?}",
                s
            )));
        }

        Ok(match normalized.as_str() {
            "confidential" => Label::Confidential,
            "secret" => Label::Secret,
            "internal" => Label::Internal,
            "restricted" => Label::Restricted,
            _ => Label::Custom(normalized),
        })
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
