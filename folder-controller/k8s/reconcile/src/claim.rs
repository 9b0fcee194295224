//! Single-parent ownership of children and leaves.
//!
//! A folder claims what it declares by labeling each child with its own name
//! and the claim time. The last folder to claim a child owns it, and the
//! previous owner is told to let go by removing the child from its declared
//! lists. Claims that are already held are left untouched, since the claim
//! time decides which edge is evicted when a loop forms.

use crate::{
    folder::{claim_label, Folder, Slot},
    store::{Object, ResourceId, Store},
    Result,
};
use folder_controller_k8s_api::{labels, ResourceExt};
use tracing::{debug, info};

/// Claims every declared child folder and leaf of `folder`.
///
/// Returns the number of claims written. Objects that do not exist are
/// skipped; any other failure aborts the remaining claims.
pub async fn claim_declared<F, S>(store: &S, folder: &F, now: i64) -> Result<usize>
where
    F: Folder,
    S: Store,
{
    let owner = folder.name_any();
    let namespace = folder.namespace();
    let mut claimed = 0;

    for child in folder.children() {
        let id = ResourceId::new(namespace.as_deref(), child);
        if claim::<F, F, S>(store, &owner, &id, Slot::Child, now).await? {
            claimed += 1;
        }
    }
    for leaf in folder.leaves() {
        let id = ResourceId::new(namespace.as_deref(), leaf);
        if claim::<F, F::Leaf, S>(store, &owner, &id, Slot::Leaf, now).await? {
            claimed += 1;
        }
    }

    Ok(claimed)
}

async fn claim<F, K, S>(
    store: &S,
    owner: &str,
    id: &ResourceId,
    slot: Slot,
    now: i64,
) -> Result<bool>
where
    F: Folder,
    K: Object,
    S: Store,
{
    let Some(obj) = store.get::<K>(id).await? else {
        debug!(%id, kind = %K::kind(&()), "Skipping claim on missing object");
        return Ok(false);
    };

    let current = claim_label(&obj, F::CLAIM.owner_name);
    let stamped = claim_label(&obj, F::CLAIM.timestamp).is_some();
    if current == Some(owner) && stamped {
        return Ok(false);
    }

    if let Some(previous) = current.filter(|p| *p != owner) {
        info!(%id, kind = %K::kind(&()), %previous, "Taking over claim");
        evict::<F, S>(store, id.namespace.as_deref(), previous, &id.name, slot).await?;
    }

    let claim = labels::Map::from([
        (F::CLAIM.owner_name.to_string(), owner.to_string()),
        (F::CLAIM.timestamp.to_string(), now.to_string()),
    ]);
    store
        .patch_labels::<K>(id, &claim, obj.resource_version().as_deref())
        .await?;
    info!(%id, kind = %K::kind(&()), "Claimed");
    Ok(true)
}

/// Removes `entry` from the `slot` list of the folder named `parent`.
///
/// Returns true if the parent was updated. A parent that no longer exists, or
/// no longer declares the entry, is left alone.
pub async fn evict<F, S>(
    store: &S,
    namespace: Option<&str>,
    parent: &str,
    entry: &str,
    slot: Slot,
) -> Result<bool>
where
    F: Folder,
    S: Store,
{
    let id = ResourceId::new(namespace, parent);
    let Some(mut folder) = store.get::<F>(&id).await? else {
        debug!(%id, "Previous owner no longer exists");
        return Ok(false);
    };

    let declared = folder.declared_mut(slot);
    let before = declared.len();
    declared.retain(|name| name != entry);
    if declared.len() == before {
        return Ok(false);
    }

    store.replace(&folder).await?;
    info!(parent = %id, %entry, ?slot, "Removed entry from folder");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{cluster_folder, namespace, MemStore};
    use folder_controller_k8s_api::{ClusterFolder, Namespace};

    #[tokio::test]
    async fn claims_unclaimed_children_once() {
        let store = MemStore::default();
        store.insert(cluster_folder("parent", &["child"], &["ns-1", "missing"]));
        store.insert(cluster_folder("child", &[], &[]));
        store.insert(namespace("ns-1"));

        let parent = store.fetch::<ClusterFolder>(&ResourceId::cluster("parent"));
        assert_eq!(claim_declared(&store, &parent, 100).await.unwrap(), 2);

        let ns = store.fetch::<Namespace>(&ResourceId::cluster("ns-1"));
        assert_eq!(
            claim_label(&ns, labels::CLUSTER_CLAIM.owner_name),
            Some("parent")
        );
        assert_eq!(
            claim_label(&ns, labels::CLUSTER_CLAIM.timestamp),
            Some("100")
        );

        let writes = store.writes();
        assert_eq!(claim_declared(&store, &parent, 200).await.unwrap(), 0);
        assert_eq!(store.writes(), writes, "held claims must not be rewritten");
    }

    #[tokio::test]
    async fn restamps_claim_without_timestamp() {
        let store = MemStore::default();
        store.insert(cluster_folder("parent", &[], &["ns-1"]));
        let mut ns = namespace("ns-1");
        ns.metadata.labels = Some(labels::Map::from([(
            labels::CLUSTER_CLAIM.owner_name.to_string(),
            "parent".to_string(),
        )]));
        store.insert(ns);

        let parent = store.fetch::<ClusterFolder>(&ResourceId::cluster("parent"));
        assert_eq!(claim_declared(&store, &parent, 7).await.unwrap(), 1);
        let ns = store.fetch::<Namespace>(&ResourceId::cluster("ns-1"));
        assert_eq!(claim_label(&ns, labels::CLUSTER_CLAIM.timestamp), Some("7"));
    }

    #[tokio::test]
    async fn takeover_evicts_previous_owner() {
        let store = MemStore::default();
        store.insert(cluster_folder("a", &[], &["ns-x", "ns-y"]));
        store.insert(cluster_folder("b", &[], &["ns-x"]));
        store.insert(namespace("ns-x"));
        store.insert(namespace("ns-y"));

        let a = store.fetch::<ClusterFolder>(&ResourceId::cluster("a"));
        claim_declared(&store, &a, 1).await.unwrap();

        let b = store.fetch::<ClusterFolder>(&ResourceId::cluster("b"));
        claim_declared(&store, &b, 2).await.unwrap();

        let ns = store.fetch::<Namespace>(&ResourceId::cluster("ns-x"));
        assert_eq!(
            claim_label(&ns, labels::CLUSTER_CLAIM.owner_name),
            Some("b")
        );
        let a = store.fetch::<ClusterFolder>(&ResourceId::cluster("a"));
        assert_eq!(a.spec.namespaces, vec!["ns-y"]);
    }

    #[tokio::test]
    async fn eviction_tolerates_missing_parent() {
        let store = MemStore::default();
        let evicted = evict::<ClusterFolder, _>(&store, None, "gone", "ns-1", Slot::Leaf)
            .await
            .unwrap();
        assert!(!evicted);
        assert_eq!(store.writes(), 0);
    }
}
