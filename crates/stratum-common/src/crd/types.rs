//! Supporting types shared by the data-protection CRDs

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kind of backup an ActionSet produces
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum BackupType {
    /// Self-contained backup of all data
    #[default]
    Full,
    /// Changes since a parent backup; chains onto a Full base
    Incremental,
    /// Ongoing schedule-driven backup (e.g. log archiving)
    Continuous,
    /// Subset of the data (tables, databases)
    Selective,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Full"),
            Self::Incremental => write!(f, "Incremental"),
            Self::Continuous => write!(f, "Continuous"),
            Self::Selective => write!(f, "Selective"),
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Full" => Ok(Self::Full),
            "Incremental" => Ok(Self::Incremental),
            "Continuous" => Ok(Self::Continuous),
            "Selective" => Ok(Self::Selective),
            _ => Err(crate::Error::validation(format!(
                "invalid backup type: {s}, expected one of: Full, Incremental, Continuous, Selective"
            ))),
        }
    }
}

/// A user supplied name/value parameter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterPair {
    /// Parameter name, must be declared in the ActionSet schema
    pub name: String,
    /// Parameter value as a string
    pub value: String,
}

/// Environment variable passed to backup workloads
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Equality-based label selector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    /// Labels a pod must carry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Render as a Kubernetes label selector string
    pub fn to_selector_string(&self) -> String {
        crate::kube_utils::label_selector(&self.match_labels)
    }
}

/// Reference to a key inside a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,
    /// Key within the Secret
    pub key: String,
}
