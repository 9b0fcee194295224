//! Lazy repair of folder loops.
//!
//! Claims are not serialized across folders, so racing parents can create a
//! loop. When a traversal reaches a folder twice, the folder in the loop that
//! was claimed most recently is removed from the parent that claimed it. This
//! orphans that folder's subtree until someone re-parents it.

use crate::{
    claim::evict,
    folder::{claim_label, Folder, Slot},
    store::{ResourceId, Store},
    Result,
};
use ahash::AHashMap as HashMap;
use folder_controller_k8s_api::ResourceExt;
use std::collections::VecDeque;
use tracing::{debug, info};

/// Breaks the loop through the folder `looped`, if one still exists.
///
/// Returns the name of the evicted folder, or `None` when the folder is gone,
/// no path leads back to it, or the winner has no recorded owner.
pub async fn rectify<F, S>(
    store: &S,
    namespace: Option<&str>,
    looped: &str,
) -> Result<Option<String>>
where
    F: Folder,
    S: Store,
{
    let Some(start) = store.get::<F>(&ResourceId::new(namespace, looped)).await? else {
        return Ok(None);
    };
    let Some(path) = path_back::<F, S>(store, namespace, &start).await? else {
        debug!(folder = %looped, "No path leads back to folder");
        return Ok(None);
    };

    // Folders compete from the deepest up; on equal claim times the shallower
    // folder wins.
    let winner = path.into_iter().rev().fold(start, most_recent_claim);
    let name = winner.name_any();
    let Some(owner) = claim_label(&winner, F::CLAIM.owner_name) else {
        debug!(folder = %name, "Loop winner has no owner");
        return Ok(None);
    };

    info!(folder = %name, parent = %owner, "Breaking folder loop");
    evict::<F, S>(store, namespace, owner, &name, Slot::Child).await?;
    Ok(Some(name))
}

/// Picks whichever folder's claim is more recent.
///
/// A folder without a parseable claim time wins outright, so that it is
/// preferred for eviction; `current` is checked first.
pub fn most_recent_claim<F: Folder>(current: F, candidate: F) -> F {
    let key = F::CLAIM.timestamp;
    let Some(current_ts) = claim_label(&current, key) else {
        return current;
    };
    let Some(candidate_ts) = claim_label(&candidate, key) else {
        return candidate;
    };
    let Ok(current_ts) = current_ts.parse::<i64>() else {
        return current;
    };
    let Ok(candidate_ts) = candidate_ts.parse::<i64>() else {
        return candidate;
    };
    if current_ts > candidate_ts {
        current
    } else {
        candidate
    }
}

/// Finds the folders on a shortest path from `start` back to itself,
/// excluding `start`. An empty path means `start` lists itself.
async fn path_back<F, S>(store: &S, namespace: Option<&str>, start: &F) -> Result<Option<Vec<F>>>
where
    F: Folder,
    S: Store,
{
    let target = start.name_any();
    let mut folders = HashMap::<String, F>::new();
    folders.insert(target.clone(), start.clone());
    let mut reached_from = HashMap::<String, String>::new();
    let mut queue = VecDeque::from([target.clone()]);

    while let Some(name) = queue.pop_front() {
        let Some(folder) = folders.get(&name).cloned() else {
            continue;
        };
        for child in folder.children() {
            if *child == target {
                let mut path = Vec::new();
                let mut cursor = name;
                while cursor != target {
                    let (Some(f), Some(prev)) = (folders.get(&cursor), reached_from.get(&cursor))
                    else {
                        break;
                    };
                    path.push(f.clone());
                    cursor = prev.clone();
                }
                path.reverse();
                return Ok(Some(path));
            }
            if folders.contains_key(child) {
                continue;
            }
            if let Some(next) = store.get::<F>(&ResourceId::new(namespace, child)).await? {
                folders.insert(child.clone(), next);
                reached_from.insert(child.clone(), name.clone());
                queue.push_back(child.clone());
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{claimed_by, cluster_folder, MemStore};
    use folder_controller_k8s_api::ClusterFolder;

    fn stamped(name: &str, owner: &str, ts: &str) -> ClusterFolder {
        claimed_by(cluster_folder(name, &[], &[]), owner, ts)
    }

    #[test]
    fn newest_claim_wins() {
        let old = stamped("old", "p", "100");
        let new = stamped("new", "p", "200");
        assert_eq!(
            most_recent_claim(old.clone(), new.clone()).name_any(),
            "new"
        );
        assert_eq!(most_recent_claim(new, old).name_any(), "new");
    }

    #[test]
    fn equal_claims_prefer_candidate() {
        let a = stamped("a", "p", "100");
        let b = stamped("b", "p", "100");
        assert_eq!(most_recent_claim(a, b).name_any(), "b");
    }

    #[test]
    fn unstamped_or_unparseable_claims_win() {
        let dated = stamped("stamped", "p", "100");
        let bare = cluster_folder("bare", &[], &[]);
        let garbled = stamped("garbled", "p", "yesterday");

        assert_eq!(
            most_recent_claim(bare.clone(), dated.clone()).name_any(),
            "bare"
        );
        assert_eq!(most_recent_claim(dated.clone(), bare).name_any(), "bare");
        assert_eq!(
            most_recent_claim(garbled.clone(), dated.clone()).name_any(),
            "garbled"
        );
        assert_eq!(most_recent_claim(dated, garbled).name_any(), "garbled");
    }

    #[tokio::test]
    async fn diamond_is_not_rectified() {
        let store = MemStore::default();
        store.insert(cluster_folder("d", &[], &[]));
        store.insert(cluster_folder("b", &["d"], &[]));
        store.insert(cluster_folder("c", &["d"], &[]));

        let evicted = rectify::<ClusterFolder, _>(&store, None, "d").await.unwrap();
        assert_eq!(evicted, None);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn self_listing_folder_is_evicted_from_itself() {
        let store = MemStore::default();
        store.insert(claimed_by(cluster_folder("a", &["a", "b"], &[]), "a", "5"));

        let evicted = rectify::<ClusterFolder, _>(&store, None, "a").await.unwrap();
        assert_eq!(evicted.as_deref(), Some("a"));
        let a = store.fetch::<ClusterFolder>(&ResourceId::cluster("a"));
        assert_eq!(a.spec.child_cluster_folders, vec!["b"]);
    }
}
