//! Consistency checks for a [`FolderIndexSpec`].
//!
//! Each sub-forest is checked independently: every folder and every leaf may
//! have at most one parent, and no folder may be its own ancestor. The walk is
//! a depth-first search with an explicit stack, so that a deep index submitted
//! for admission cannot exhaust the thread's stack.

use crate::k8s::{namespaced_key, split_namespaced_key, FolderIndexSpec};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error(
        "folder loop detected. folder [{0}] cannot be both a parent and child within the same folder hierarchy"
    )]
    Loop(String),

    #[error("child folder [{child}] is the child of both folder [{first}] and folder [{second}]")]
    FolderParents {
        child: String,
        first: String,
        second: String,
    },

    #[error("namespace [{namespace}] is the child of both folder [{first}] and folder [{second}]")]
    NamespaceParents {
        namespace: String,
        first: String,
        second: String,
    },

    #[error(
        "virtual machine [{name}] in namespace [{namespace}] is the child of both folder [{first}] and folder [{second}]"
    )]
    VirtualMachineParents {
        namespace: String,
        name: String,
        first: String,
        second: String,
    },

    #[error("namespaced folder entry [{0}] must be keyed as namespace/name")]
    InvalidKey(String),
}

/// Validates both sub-forests of an index.
pub fn validate(index: &FolderIndexSpec) -> Result<(), ConsistencyError> {
    validate_cluster(index)?;
    validate_namespaced(index)
}

pub fn validate_cluster(index: &FolderIndexSpec) -> Result<(), ConsistencyError> {
    let entries = index
        .cluster_folder_entries
        .iter()
        .map(|(name, e)| (name.clone(), (&e.child_folders, &e.namespaces)))
        .collect::<BTreeMap<_, _>>();

    Forest {
        entries,
        child_key: |_parent: &str, child: &str| child.to_string(),
        leaf_conflict: |leaf: &str, first: String, second: String| {
            ConsistencyError::NamespaceParents {
                namespace: leaf.to_string(),
                first,
                second,
            }
        },
    }
    .check()
}

pub fn validate_namespaced(index: &FolderIndexSpec) -> Result<(), ConsistencyError> {
    if let Some(key) = index
        .namespaced_folder_entries
        .keys()
        .find(|key| split_namespaced_key(key).is_none())
    {
        return Err(ConsistencyError::InvalidKey(key.clone()));
    }

    let entries = index
        .namespaced_folder_entries
        .iter()
        .map(|(key, e)| (key.clone(), (&e.child_folders, &e.virtual_machines)))
        .collect::<BTreeMap<_, _>>();

    Forest {
        entries,
        child_key: |parent: &str, child: &str| {
            let (namespace, _) = split_namespaced_key(parent).unwrap_or_default();
            namespaced_key(namespace, child)
        },
        leaf_conflict: |leaf: &str, first: String, second: String| {
            let (namespace, name) = split_namespaced_key(leaf).unwrap_or_default();
            ConsistencyError::VirtualMachineParents {
                namespace: namespace.to_string(),
                name: name.to_string(),
                first,
                second,
            }
        },
    }
    .check()
}

/// One sub-forest, with keys resolved the way the sub-forest names things.
///
/// Leaves are qualified with the same function as child folders, so virtual
/// machines in different namespaces never collide.
struct Forest<'a, K, L> {
    entries: BTreeMap<String, (&'a Vec<String>, &'a Vec<String>)>,
    child_key: K,
    leaf_conflict: L,
}

enum Frame {
    Enter(String),
    Exit(String),
}

impl<K, L> Forest<'_, K, L>
where
    K: Fn(&str, &str) -> String,
    L: Fn(&str, String, String) -> ConsistencyError,
{
    fn check(&self) -> Result<(), ConsistencyError> {
        let mut visited = HashSet::<String>::new();
        let mut on_path = HashSet::<String>::new();
        let mut folder_parents = HashMap::<String, String>::new();
        let mut leaf_parents = HashMap::<String, String>::new();

        for root in self.entries.keys() {
            if visited.contains(root) {
                continue;
            }

            let mut stack = vec![Frame::Enter(root.clone())];
            while let Some(frame) = stack.pop() {
                let folder = match frame {
                    Frame::Exit(folder) => {
                        on_path.remove(&folder);
                        continue;
                    }
                    Frame::Enter(folder) => folder,
                };

                if on_path.contains(&folder) {
                    return Err(ConsistencyError::Loop(folder));
                }
                if !visited.insert(folder.clone()) {
                    continue;
                }
                on_path.insert(folder.clone());
                stack.push(Frame::Exit(folder.clone()));

                // References to folders without an entry end the walk there.
                let Some((children, leaves)) = self.entries.get(&folder) else {
                    continue;
                };

                for leaf in leaves.iter() {
                    let leaf = (self.child_key)(&folder, leaf);
                    if let Some(first) = assign(&mut leaf_parents, &leaf, &folder) {
                        return Err((self.leaf_conflict)(&leaf, first, folder));
                    }
                }

                for child in children.iter().rev() {
                    let child = (self.child_key)(&folder, child);
                    if let Some(first) = assign(&mut folder_parents, &child, &folder) {
                        return Err(ConsistencyError::FolderParents {
                            child,
                            first,
                            second: folder,
                        });
                    }
                    stack.push(Frame::Enter(child));
                }
            }
        }

        Ok(())
    }
}

/// Records `parent` as the parent of `child`, returning the previously
/// recorded parent if it differs.
fn assign(parents: &mut HashMap<String, String>, child: &str, parent: &str) -> Option<String> {
    match parents.get(child) {
        Some(first) if first != parent => Some(first.clone()),
        Some(_) => None,
        None => {
            parents.insert(child.to_string(), parent.to_string());
            None
        }
    }
}
