use crate::{
    folder::Folder,
    store::{ResourceId, Store},
    Result,
};
use folder_controller_core::{lookup, Resolution, Traversal};
use folder_controller_k8s_api::{ClusterFolder, FolderIndexSpec, NamespacedFolder, ResourceExt};

/// Resolves the leaves contained by `folder` by reading every folder in its
/// subtree from the store.
///
/// Children and leaves that do not exist are skipped. A folder reached twice
/// stops the walk; the partial result carries the revisited folder.
pub async fn resolve_live<F, S>(store: &S, folder: &F) -> Result<Resolution>
where
    F: Folder,
    S: Store,
{
    let namespace = folder.namespace();
    let ns = namespace.as_deref();

    let mut walk = Traversal::new(F::scope(ns), &folder.name_any());
    let leaves = existing_leaves::<F, S>(store, ns, folder.leaves()).await?;
    walk.expand(&leaves, folder.children());

    while let Some(name) = walk.next_folder() {
        let Some(child) = store.get::<F>(&ResourceId::new(ns, &name)).await? else {
            tracing::trace!(folder = %name, "Skipping missing child folder");
            continue;
        };
        let leaves = existing_leaves::<F, S>(store, ns, child.leaves()).await?;
        walk.expand(&leaves, child.children());
    }

    Ok(walk.finish())
}

/// Resolves the leaves contained by the cluster folder `name` from an index,
/// dropping namespaces that do not exist.
pub async fn resolve_cluster_indexed<S: Store>(
    store: &S,
    index: &FolderIndexSpec,
    name: &str,
) -> Result<Resolution> {
    let mut resolution = lookup::cluster_leaves(index, name);
    resolution.leaves = existing_leaves::<ClusterFolder, S>(store, None, &resolution.leaves).await?;
    Ok(resolution)
}

/// Resolves the virtual machines contained by the namespaced folder
/// `namespace/name` from an index, dropping those that do not exist.
pub async fn resolve_namespaced_indexed<S: Store>(
    store: &S,
    index: &FolderIndexSpec,
    namespace: &str,
    name: &str,
) -> Result<Resolution> {
    let mut resolution = lookup::namespaced_leaves(index, namespace, name);
    resolution.leaves =
        existing_leaves::<NamespacedFolder, S>(store, Some(namespace), &resolution.leaves).await?;
    Ok(resolution)
}

async fn existing_leaves<F, S>(
    store: &S,
    namespace: Option<&str>,
    names: &[String],
) -> Result<Vec<String>>
where
    F: Folder,
    S: Store,
{
    let mut found = Vec::with_capacity(names.len());
    for name in names {
        let id = ResourceId::new(namespace, name);
        if store.get::<F::Leaf>(&id).await?.is_some() {
            found.push(name.clone());
        }
    }
    Ok(found)
}
