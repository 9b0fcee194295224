use crate::{
    aggregate, claim,
    folder::Folder,
    metrics::ReconcileMetrics,
    rectify,
    store::{ResourceId, Store},
    synthesize, Result,
};
use folder_controller_core::{hash, validate, Node};
use folder_controller_k8s_api::{
    ClusterFolder, FolderIndex, FolderIndexSpec, FolderIndexStatus, NamespacedFolder,
};
use std::{fmt, str::FromStr, time::Duration};
use tracing::{debug, info, warn};

/// How long a pass that found a loop waits before running again, so that the
/// eviction it made can propagate.
pub const LOOP_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// An object to reconcile.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Request {
    ClusterFolder(String),
    NamespacedFolder { namespace: String, name: String },
    FolderIndex(String),
}

/// What to do once a pass completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

/// Where a folder's leaves are resolved from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum HierarchySource {
    /// Walk the folder objects themselves.
    #[default]
    Live,

    /// Look folders up in the validated FolderIndex.
    Index,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hierarchy source {0:?}; expected `live` or `index`")]
pub struct InvalidHierarchySource(String);

/// Runs reconcile passes against a [`Store`].
pub struct Reconciler<S> {
    store: S,
    source: HierarchySource,
    index_name: String,
    metrics: ReconcileMetrics,
}

// === impl Request ===

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClusterFolder(_) => "ClusterFolder",
            Self::NamespacedFolder { .. } => "NamespacedFolder",
            Self::FolderIndex(_) => "FolderIndex",
        }
    }

    pub(crate) fn namespaced_folder(namespace: impl ToString, name: impl ToString) -> Self {
        Self::NamespacedFolder {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterFolder(name) | Self::FolderIndex(name) => {
                write!(f, "{} {name}", self.kind())
            }
            Self::NamespacedFolder { namespace, name } => {
                write!(f, "{} {namespace}/{name}", self.kind())
            }
        }
    }
}

// === impl HierarchySource ===

impl FromStr for HierarchySource {
    type Err = InvalidHierarchySource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(Self::Live),
            "index" => Ok(Self::Index),
            s => Err(InvalidHierarchySource(s.to_string())),
        }
    }
}

impl fmt::Display for HierarchySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => "live".fmt(f),
            Self::Index => "index".fmt(f),
        }
    }
}

// === impl Reconciler ===

impl<S: Store> Reconciler<S> {
    pub fn new(
        store: S,
        source: HierarchySource,
        index_name: impl ToString,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            store,
            source,
            index_name: index_name.to_string(),
            metrics,
        }
    }

    pub(crate) fn metrics(&self) -> &ReconcileMetrics {
        &self.metrics
    }

    /// Runs one pass over the requested object.
    ///
    /// Steps run in order: claim, resolve, derive, collect garbage. Any store
    /// failure ends the pass early; everything written so far stays written,
    /// and the next pass picks up from there.
    pub async fn reconcile(&self, request: &Request) -> Result<Action> {
        match request {
            Request::ClusterFolder(name) => self.cluster_folder(name).await,
            Request::NamespacedFolder { namespace, name } => {
                self.namespaced_folder(namespace, name).await
            }
            Request::FolderIndex(name) => self.folder_index(name).await,
        }
    }

    async fn cluster_folder(&self, name: &str) -> Result<Action> {
        let id = ResourceId::cluster(name);
        let Some(folder) = self.store.get::<ClusterFolder>(&id).await? else {
            debug!("Folder no longer exists");
            return Ok(Action::Done);
        };

        claim::claim_declared(&self.store, &folder, now()).await?;

        let resolution = match self.source {
            HierarchySource::Live => aggregate::resolve_live(&self.store, &folder).await?,
            HierarchySource::Index => {
                let Some(index) = self.validated_index().await? else {
                    return Ok(Action::RequeueAfter(LOOP_REQUEUE_DELAY));
                };
                aggregate::resolve_cluster_indexed(&self.store, &index, name).await?
            }
        };
        if let Some(node) = resolution.cycle {
            return self.break_loop::<ClusterFolder>(None, node).await;
        }

        let changes = synthesize::cluster_folder(&self.store, &folder, &resolution.leaves).await?;
        self.metrics.changes(changes);
        debug!(namespaces = resolution.leaves.len(), ?changes, "Reconciled");
        Ok(Action::Done)
    }

    async fn namespaced_folder(&self, namespace: &str, name: &str) -> Result<Action> {
        let id = ResourceId::namespaced(namespace, name);
        let Some(folder) = self.store.get::<NamespacedFolder>(&id).await? else {
            debug!("Folder no longer exists");
            return Ok(Action::Done);
        };

        claim::claim_declared(&self.store, &folder, now()).await?;

        let resolution = match self.source {
            HierarchySource::Live => aggregate::resolve_live(&self.store, &folder).await?,
            HierarchySource::Index => {
                let Some(index) = self.validated_index().await? else {
                    return Ok(Action::RequeueAfter(LOOP_REQUEUE_DELAY));
                };
                aggregate::resolve_namespaced_indexed(&self.store, &index, namespace, name).await?
            }
        };
        if let Some(node) = resolution.cycle {
            return self
                .break_loop::<NamespacedFolder>(Some(namespace), node)
                .await;
        }

        let changes =
            synthesize::namespaced_folder(&self.store, &folder, &resolution.leaves).await?;
        self.metrics.changes(changes);
        debug!(vms = resolution.leaves.len(), ?changes, "Reconciled");
        Ok(Action::Done)
    }

    async fn break_loop<F: Folder>(&self, namespace: Option<&str>, node: Node) -> Result<Action> {
        warn!(folder = %node, "Folder loop detected");
        let evicted = rectify::rectify::<F, S>(&self.store, namespace, node.name()).await?;
        self.metrics.loop_detected(F::KIND, evicted.is_some());
        info!(evicted = ?evicted, "Requeuing after loop");
        Ok(Action::RequeueAfter(LOOP_REQUEUE_DELAY))
    }

    /// Validates an index and records the result in its status.
    async fn folder_index(&self, name: &str) -> Result<Action> {
        let id = ResourceId::cluster(name);
        let Some(index) = self.store.get::<FolderIndex>(&id).await? else {
            debug!("FolderIndex no longer exists");
            return Ok(Action::Done);
        };

        let spec_hash = hash::spec_hash(&index.spec)?;
        let status = match validate::validate(&index.spec) {
            Ok(()) => FolderIndexStatus {
                validated_spec_hash: Some(spec_hash),
                consistency_error: None,
            },
            Err(error) => {
                warn!(%error, "FolderIndex is inconsistent");
                FolderIndexStatus {
                    validated_spec_hash: None,
                    consistency_error: Some(error.to_string()),
                }
            }
        };

        if index.status.as_ref() == Some(&status) {
            debug!("FolderIndex status is current");
            return Ok(Action::Done);
        }
        self.store.patch_index_status(name, &status).await?;
        info!(
            valid = status.consistency_error.is_none(),
            "Updated FolderIndex status"
        );
        Ok(Action::Done)
    }

    /// Returns the configured index if its status vouches for its current spec.
    async fn validated_index(&self) -> Result<Option<FolderIndexSpec>> {
        let id = ResourceId::cluster(&self.index_name);
        let Some(index) = self.store.get::<FolderIndex>(&id).await? else {
            info!(index = %self.index_name, "FolderIndex not found");
            return Ok(None);
        };
        let spec_hash = hash::spec_hash(&index.spec)?;
        if !index.is_validated(&spec_hash) {
            info!(index = %self.index_name, "FolderIndex is not validated yet");
            return Ok(None);
        }
        Ok(Some(index.spec))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
