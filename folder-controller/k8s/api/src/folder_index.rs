use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A flattened view of the whole folder forest, stored as a single object.
///
/// Cluster folder entries are keyed by folder name. Namespaced folder entries
/// are keyed by `namespace/name`; the child folder names inside a namespaced
/// entry are bare names resolved in the entry's own namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirtfolderview.kubevirt.io.github.com",
    version = "v1alpha1",
    kind = "FolderIndex",
    status = "FolderIndexStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FolderIndexSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_folder_entries: BTreeMap<String, ClusterFolderEntry>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespaced_folder_entries: BTreeMap<String, NamespacedFolderEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFolderEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_folders: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedFolderEntry {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_folders: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_machines: Vec<String>,
}

/// Records the outcome of the last background consistency check.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FolderIndexStatus {
    /// Hash of the spec that last passed validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_spec_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency_error: Option<String>,
}

impl FolderIndex {
    /// Returns true when the status vouches for exactly the given spec hash.
    pub fn is_validated(&self, spec_hash: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.validated_spec_hash.as_deref())
            == Some(spec_hash)
    }
}

/// Splits a `namespace/name` namespaced entry key.
pub fn split_namespaced_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Some((ns, name))
        }
        _ => None,
    }
}

pub fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn parses_index() {
        let index: FolderIndexSpec = serde_json::from_value(serde_json::json!({
            "clusterFolderEntries": {
                "a": { "childFolders": ["b"], "namespaces": ["ns-1"] },
                "b": {}
            },
            "namespacedFolderEntries": {
                "ns-1/vms": { "virtualMachines": ["vm-0"] }
            }
        }))
        .expect("index must parse");

        assert_eq!(
            index.cluster_folder_entries,
            btreemap! {
                "a".to_string() => ClusterFolderEntry {
                    child_folders: vec!["b".to_string()],
                    namespaces: vec!["ns-1".to_string()],
                },
                "b".to_string() => ClusterFolderEntry::default(),
            }
        );
        assert_eq!(
            index.namespaced_folder_entries["ns-1/vms"].virtual_machines,
            vec!["vm-0"]
        );
    }

    #[test]
    fn namespaced_keys() {
        assert_eq!(split_namespaced_key("ns/f"), Some(("ns", "f")));
        assert_eq!(split_namespaced_key("f"), None);
        assert_eq!(split_namespaced_key("/f"), None);
        assert_eq!(split_namespaced_key("ns/"), None);
        assert_eq!(split_namespaced_key("ns/a/b"), None);
        assert_eq!(namespaced_key("ns", "f"), "ns/f");
    }

    #[test]
    fn validated_status() {
        let mut index = FolderIndex::new("root", FolderIndexSpec::default());
        assert!(!index.is_validated("abc"));
        index.status = Some(FolderIndexStatus {
            validated_spec_hash: Some("abc".to_string()),
            consistency_error: None,
        });
        assert!(index.is_validated("abc"));
        assert!(!index.is_validated("def"));
    }
}
