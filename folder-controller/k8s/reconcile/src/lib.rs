//! Folder reconciliation against the Kubernetes API.
//!
//! A pass over a folder claims what it declares, resolves the leaves it
//! transitively contains, derives RBAC objects for those leaves and deletes
//! derived objects it no longer needs. Passes re-read everything they use, so
//! passes over different folders may race freely and still converge.
//!
//! Watches feed the routing [`Index`], which only decides which folders to
//! reconcile. The [`Controller`] drains those requests through a bounded work
//! queue and runs each pass with the [`Reconciler`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
pub mod claim;
mod controller;
pub mod folder;
mod index;
mod metrics;
pub mod rectify;
mod reconciler;
pub mod store;
pub mod synthesize;

#[cfg(test)]
mod tests;

pub use self::{
    controller::{Controller, ControllerConfig},
    index::{Index, SharedIndex},
    metrics::{PassResult, ReconcileMetrics},
    reconciler::{
        Action, HierarchySource, InvalidHierarchySource, Reconciler, Request, LOOP_REQUEUE_DELAY,
    },
    store::{KubeStore, Object, ResourceId, Store},
};
use folder_controller_core::HashError;
use folder_controller_k8s_api as k8s;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store request failed: {0}")]
    Kube(#[from] k8s::Error),

    #[error("{kind} {id} was modified concurrently")]
    Conflict { kind: String, id: ResourceId },

    #[error("{kind} {id} has no uid")]
    MissingUid { kind: String, id: ResourceId },

    #[error(transparent)]
    Hash(#[from] HashError),
}

// === impl Error ===

impl Error {
    pub(crate) fn from_kube<K: Object>(id: &ResourceId, error: k8s::Error) -> Self {
        match error {
            k8s::Error::Api(k8s::ErrorResponse { code: 409, .. }) => Self::Conflict {
                kind: K::kind(&()).to_string(),
                id: id.clone(),
            },
            error => Self::Kube(error),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
