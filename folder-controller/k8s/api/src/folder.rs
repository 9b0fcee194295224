use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grants a subject the referenced roles over everything a folder contains.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FolderPermission {
    pub subject: Subject,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_refs: Vec<RoleRef>,
}

/// Groups namespaces and other cluster folders.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirtfolderview.kubevirt.io.github.com",
    version = "v1alpha1",
    kind = "ClusterFolder"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterFolderSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_cluster_folders: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folder_permissions: Vec<FolderPermission>,
}

/// Groups virtual machines and other folders within a single namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "kubevirtfolderview.kubevirt.io.github.com",
    version = "v1alpha1",
    kind = "NamespacedFolder",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedFolderSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_namespaced_folders: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub virtual_machines: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub folder_permissions: Vec<FolderPermission>,
}
