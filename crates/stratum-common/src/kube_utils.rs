//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction, typed handles for CRDs we do not own (VolumeSnapshot,
//! database Cluster), status patching with optimistic concurrency, and small
//! label/finalizer helpers used by every controller.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config, Resource, ResourceExt};

use crate::Error;

// =============================================================================
// ObjectMeta - metadata for resources serialized through DynamicObject
// =============================================================================

/// Minimal Kubernetes ObjectMeta for resources built as plain structs.
///
/// Automatically adds the Stratum managed-by label on construction.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Create new metadata with the managed-by label
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(crate::LABEL_MANAGED_BY.to_string(), crate::APP_NAME.to_string());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Merge in extra labels
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implement this for third-party CRD types so serialization and API calls
/// agree on the apiVersion.
pub trait HasApiResource {
    /// Full API version (e.g., "snapshot.storage.k8s.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "VolumeSnapshot")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion string and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split "group/version" into its parts; core types have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

// =============================================================================
// Client construction
// =============================================================================

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients (must exceed the watcher timeout)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

// =============================================================================
// Status and metadata patching
// =============================================================================

/// Patch the status sub-resource of a namespaced resource with a
/// resourceVersion precondition.
///
/// The API server rejects the merge patch with 409 Conflict when the object
/// changed since `resource_version` was observed, so a stale pass never
/// silently overwrites a newer status.
pub async fn patch_status_with_version<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    resource_version: Option<&str>,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<T, kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let mut patch = serde_json::json!({ "status": status });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
}

/// Merge-patch labels, annotations and finalizers onto a namespaced
/// resource's metadata.
///
/// Label and annotation keys are merged; the finalizer list is replaced as a
/// whole, so callers pass the complete desired list. Returns the updated object.
#[allow(clippy::too_many_arguments)]
pub async fn patch_metadata<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    resource_version: Option<&str>,
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    finalizers: &[String],
    field_manager: &str,
) -> std::result::Result<T, kube::Error>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let mut patch = serde_json::json!({
        "metadata": {
            "labels": labels,
            "annotations": annotations,
            "finalizers": finalizers,
        }
    });
    if let Some(rv) = resource_version {
        patch["metadata"]["resourceVersion"] = serde_json::json!(rv);
    }
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
}

/// Build a JSON merge patch that turns `old` into `new`.
///
/// Keys present in `old` but missing from `new` are set to `null` so the API
/// server removes them; nested objects are handled recursively and every
/// other value is replaced wholesale.
pub fn merge_patch_from(old: &serde_json::Value, new: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = serde_json::Map::new();
            for (key, new_value) in new_map {
                let value = match old_map.get(key) {
                    Some(old_value) => merge_patch_from(old_value, new_value),
                    None => new_value.clone(),
                };
                patch.insert(key.clone(), value);
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// Check if a resource carries the given finalizer
pub fn has_finalizer<K: ResourceExt>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Render a label map as a Kubernetes label selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Short stable hex digest (first 8 bytes of SHA-256) for generated names
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
