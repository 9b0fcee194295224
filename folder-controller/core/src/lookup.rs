//! Leaf resolution against a [`FolderIndexSpec`].
//!
//! An index entry that does not exist contributes nothing, so stale child
//! references left behind by deleted folders are tolerated.

use crate::{
    k8s::{namespaced_key, FolderIndexSpec},
    Resolution, Scope, Traversal,
};

/// Resolves the namespaces contained by a cluster folder and its descendants.
pub fn cluster_leaves(index: &FolderIndexSpec, folder: &str) -> Resolution {
    walk(Scope::Cluster, folder, move |name| {
        index
            .cluster_folder_entries
            .get(name)
            .map(|e| (&e.namespaces, &e.child_folders))
    })
}

/// Resolves the virtual machines contained by a namespaced folder and its
/// descendants.
pub fn namespaced_leaves(index: &FolderIndexSpec, namespace: &str, folder: &str) -> Resolution {
    walk(Scope::Namespaced(namespace.to_string()), folder, move |name| {
        index
            .namespaced_folder_entries
            .get(&namespaced_key(namespace, name))
            .map(|e| (&e.virtual_machines, &e.child_folders))
    })
}

fn walk<'a, F>(scope: Scope, root: &str, entry: F) -> Resolution
where
    F: Fn(&str) -> Option<(&'a Vec<String>, &'a Vec<String>)>,
{
    let mut walk = Traversal::new(scope, root);
    if let Some((leaves, children)) = entry(root) {
        walk.expand(leaves, children);
    }
    while let Some(name) = walk.next_folder() {
        if let Some((leaves, children)) = entry(&name) {
            walk.expand(leaves, children);
        }
    }
    walk.finish()
}
