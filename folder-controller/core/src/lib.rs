//! Folder hierarchy algorithms
//!
//! Folders form two disjoint forests: cluster folders, whose leaves are namespaces, and namespaced
//! folders, whose leaves are virtual machines in the folder's namespace. This crate holds the parts
//! of the controller that do not talk to the API server:
//!
//! - [`traversal`] walks a folder's subtree with an explicit worklist, collecting leaves and
//!   reporting the first revisited folder instead of recursing forever.
//! - [`lookup`] drives that walk against a [`FolderIndex`](k8s::FolderIndex) rather than live
//!   objects.
//! - [`validate`] proves that an index describes a single-parent, acyclic forest.
//! - [`hash`] derives stable object names from a folder's identity and the access it grants.
//!
//! ```text
//! [ ClusterFolder ] -> [ ClusterFolder ] -> [ Namespace ]
//! [ NamespacedFolder ] -> [ NamespacedFolder ] -> [ VirtualMachine ]
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod hash;
pub mod lookup;
pub mod traversal;
pub mod validate;

pub use self::{
    hash::HashError,
    traversal::{Node, Resolution, Scope, Traversal},
    validate::ConsistencyError,
};
pub use folder_controller_k8s_api as k8s;
