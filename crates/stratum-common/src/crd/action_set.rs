//! ActionSet Custom Resource Definition
//!
//! An ActionSet is the recipe a BackupMethod runs: the backup type it
//! produces, the parameters it accepts, and the ordered job/exec actions.
//! ActionSets ship with database addons and are cluster-scoped.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BackupType, EnvVar, ParameterPair};

/// Value type of a declared parameter
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    /// Any string
    #[default]
    String,
    /// Signed integer
    Integer,
    /// Floating point number
    Number,
    /// "true" or "false"
    Boolean,
}

/// Declaration of one parameter
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterProperty {
    /// Value type
    #[serde(default, rename = "type")]
    pub kind: ParameterKind,

    /// Allowed values; empty allows any value of the type
    #[serde(default, rename = "enum", skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parameters an ActionSet accepts
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParametersSchema {
    /// Declared parameters by name
    #[serde(default)]
    pub properties: BTreeMap<String, ParameterProperty>,

    /// Parameters that must be supplied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
}

impl ParametersSchema {
    /// Validate user parameters against the schema.
    ///
    /// Returns a message naming the first offending parameter.
    pub fn validate(&self, parameters: &[ParameterPair]) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for param in parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(format!("duplicate parameter {:?}", param.name));
            }
            let Some(prop) = self.properties.get(&param.name) else {
                return Err(format!("parameter {:?} is not declared", param.name));
            };
            let type_ok = match prop.kind {
                ParameterKind::String => true,
                ParameterKind::Integer => param.value.parse::<i64>().is_ok(),
                ParameterKind::Number => param.value.parse::<f64>().is_ok(),
                ParameterKind::Boolean => param.value.parse::<bool>().is_ok(),
            };
            if !type_ok {
                return Err(format!(
                    "parameter {:?} value {:?} is not a valid {:?}",
                    param.name, param.value, prop.kind
                ));
            }
            if !prop.allowed.is_empty() && !prop.allowed.contains(&param.value) {
                return Err(format!(
                    "parameter {:?} value {:?} must be one of {:?}",
                    param.name, param.value, prop.allowed
                ));
            }
        }
        if let Some(missing) = self.required.iter().find(|r| !seen.contains(r.as_str())) {
            return Err(format!("required parameter {missing:?} is missing"));
        }
        Ok(())
    }
}

/// A job action: an image run next to the target pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobActionSpec {
    /// Container image
    pub image: String,

    /// Command and arguments
    #[serde(default)]
    pub command: Vec<String>,

    /// Schedule on the target pod's node (needed for hostPath data)
    #[serde(default)]
    pub run_on_target_pod_node: bool,
}

/// An exec action: a command run inside the target pod
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecActionSpec {
    /// Container to exec into; defaults to the target's container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Command and arguments
    pub command: Vec<String>,

    /// Timeout for the exec call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

/// A pre/post backup hook: exactly one of `job` or `exec`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSpec {
    /// Run as a job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobActionSpec>,

    /// Run as an exec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecActionSpec>,
}

/// Actions run to take a backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupActionSpec {
    /// Hooks run before the data is copied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_backup: Vec<ActionSpec>,

    /// The data-copy job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_data: Option<JobActionSpec>,

    /// Hooks run after the data is copied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_backup: Vec<ActionSpec>,
}

/// Specification for an ActionSet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataprotection.stratum.dev",
    version = "v1alpha1",
    kind = "ActionSet",
    plural = "actionsets",
    shortname = "as",
    printcolumn = r#"{"name":"Backup-Type","type":"string","jsonPath":".spec.backupType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ActionSetSpec {
    /// Backup type this ActionSet produces
    #[serde(default)]
    pub backup_type: BackupType,

    /// Parameters a Backup may supply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<ParametersSchema>,

    /// Environment for every action
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// Backup actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupActionSpec>,
}

impl ActionSetSpec {
    /// Validate parameters; an ActionSet without a schema accepts none
    pub fn validate_parameters(&self, parameters: &[ParameterPair]) -> Result<(), String> {
        match &self.parameters_schema {
            Some(schema) => schema.validate(parameters),
            None if parameters.is_empty() => Ok(()),
            None => Err("the ActionSet does not declare any parameters".to_string()),
        }
    }
}
