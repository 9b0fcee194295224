#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod folder;
pub mod folder_index;
pub mod labels;
pub mod virtual_machine;

pub use self::{
    folder::{
        ClusterFolder, ClusterFolderSpec, FolderPermission, NamespacedFolder, NamespacedFolderSpec,
    },
    folder_index::{
        namespaced_key, split_namespaced_key, ClusterFolderEntry, FolderIndex, FolderIndexSpec,
        FolderIndexStatus, NamespacedFolderEntry,
    },
    labels::Selector,
    virtual_machine::VirtualMachine,
};
pub use k8s_openapi::api::{
    self,
    core::v1::Namespace,
    rbac::v1::{ClusterRole, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};

/// The API group of every folder resource.
pub const API_GROUP: &str = "kubevirtfolderview.kubevirt.io.github.com";

/// The API group of RBAC objects referenced by derived role bindings.
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
