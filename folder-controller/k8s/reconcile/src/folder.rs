use crate::store::Object;
use folder_controller_core::Scope;
use folder_controller_k8s_api::{
    labels::{self, ClaimKeys},
    ClusterFolder, FolderPermission, Namespace, NamespacedFolder, ResourceExt, VirtualMachine,
};

/// The parts of a folder kind that claims, traversal and eviction work with.
///
/// A folder's children and leaves live in the folder's own namespace (none,
/// for cluster folders), so one namespace addresses everything a folder
/// declares.
pub trait Folder: Object {
    /// The kind of a folder's direct leaves.
    type Leaf: Object;

    const KIND: &'static str;

    const CLAIM: ClaimKeys;

    /// Labels objects derived from this kind of folder with the folder's UID.
    const OWNER_UID: &'static str;

    fn scope(namespace: Option<&str>) -> Scope;

    fn children(&self) -> &[String];

    fn leaves(&self) -> &[String];

    fn declared_mut(&mut self, slot: Slot) -> &mut Vec<String>;

    fn permissions(&self) -> &[FolderPermission];
}

/// Which declared list of a folder an entry belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Child,
    Leaf,
}

/// Reads a claim label from an object, if set.
pub(crate) fn claim_label<'o, K: ResourceExt>(obj: &'o K, key: &str) -> Option<&'o str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

impl Folder for ClusterFolder {
    type Leaf = Namespace;

    const KIND: &'static str = "ClusterFolder";
    const CLAIM: ClaimKeys = labels::CLUSTER_CLAIM;
    const OWNER_UID: &'static str = labels::CLUSTER_OWNER_UID;

    fn scope(_: Option<&str>) -> Scope {
        Scope::Cluster
    }

    fn children(&self) -> &[String] {
        &self.spec.child_cluster_folders
    }

    fn leaves(&self) -> &[String] {
        &self.spec.namespaces
    }

    fn declared_mut(&mut self, slot: Slot) -> &mut Vec<String> {
        match slot {
            Slot::Child => &mut self.spec.child_cluster_folders,
            Slot::Leaf => &mut self.spec.namespaces,
        }
    }

    fn permissions(&self) -> &[FolderPermission] {
        &self.spec.folder_permissions
    }
}

impl Folder for NamespacedFolder {
    type Leaf = VirtualMachine;

    const KIND: &'static str = "NamespacedFolder";
    const CLAIM: ClaimKeys = labels::NAMESPACED_CLAIM;
    const OWNER_UID: &'static str = labels::NAMESPACED_OWNER_UID;

    fn scope(namespace: Option<&str>) -> Scope {
        Scope::Namespaced(namespace.unwrap_or_default().to_string())
    }

    fn children(&self) -> &[String] {
        &self.spec.child_namespaced_folders
    }

    fn leaves(&self) -> &[String] {
        &self.spec.virtual_machines
    }

    fn declared_mut(&mut self, slot: Slot) -> &mut Vec<String> {
        match slot {
            Slot::Child => &mut self.spec.child_namespaced_folders,
            Slot::Leaf => &mut self.spec.virtual_machines,
        }
    }

    fn permissions(&self) -> &[FolderPermission] {
        &self.spec.folder_permissions
    }
}
