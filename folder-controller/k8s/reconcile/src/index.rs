use crate::{
    folder::{claim_label, Folder},
    reconciler::{HierarchySource, Request},
    store::ResourceId,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use folder_controller_k8s_api::{
    labels, ClusterFolder, FolderIndex, Namespace, NamespacedFolder, ResourceExt, VirtualMachine,
};
use parking_lot::RwLock;
use std::{collections::BTreeSet, sync::Arc};
use tokio::{
    sync::mpsc::UnboundedSender,
    time::{self, Duration},
};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Routes watch events to reconcile requests.
///
/// The index remembers what each folder declares so that a change to any
/// object can be traced to the folders whose resolved contents it affects. It
/// never decides what a pass does; passes re-read the store.
pub struct Index {
    requests: UnboundedSender<Request>,
    source: HierarchySource,
    index_name: String,

    cluster: Forest,
    namespaced: HashMap<String, Forest>,
    namespaces: HashSet<String>,
    virtual_machines: HashSet<ResourceId>,
}

/// The folders of one scope, by name.
#[derive(Debug, Default)]
struct Forest {
    folders: HashMap<String, Declared>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Declared {
    children: Vec<String>,
    leaves: Vec<String>,
}

// === impl Index ===

impl Index {
    pub fn shared(
        requests: UnboundedSender<Request>,
        source: HierarchySource,
        index_name: impl ToString,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            requests,
            source,
            index_name: index_name.to_string(),
            cluster: Forest::default(),
            namespaced: HashMap::new(),
            namespaces: HashSet::new(),
            virtual_machines: HashSet::new(),
        }))
    }

    /// Enqueues every known folder each `period`, so that derived objects
    /// changed out of band are restored.
    pub async fn run(index: SharedIndex, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately, while the watches are still
        // delivering their initial state.
        interval.tick().await;
        loop {
            interval.tick().await;
            let idx = index.read();
            tracing::debug!(
                cluster = idx.cluster.folders.len(),
                namespaced = idx.namespaced.values().map(|f| f.folders.len()).sum::<usize>(),
                "Resyncing folders"
            );
            idx.enqueue_all_folders();
        }
    }

    fn enqueue_all_folders(&self) {
        for name in self.cluster.folders.keys() {
            self.send(Request::ClusterFolder(name.clone()));
        }
        for (namespace, forest) in &self.namespaced {
            for name in forest.folders.keys() {
                self.send(Request::namespaced_folder(namespace, name));
            }
        }
    }

    fn send(&self, request: Request) {
        tracing::trace!(%request, "Enqueuing");
        if let Err(error) = self.requests.send(request) {
            tracing::warn!(request = %error.0, "Controller is no longer accepting requests");
        }
    }
}

impl kubert::index::IndexClusterResource<ClusterFolder> for Index {
    fn apply(&mut self, folder: ClusterFolder) {
        let name = folder.name_unchecked();
        self.cluster.insert(&name, &folder);

        // A folder's parent claims it and resolves it, so the parent and every
        // folder above it is reconciled along with it.
        for name in self.cluster.with_ancestors([name]) {
            self.send(Request::ClusterFolder(name));
        }
    }

    fn delete(&mut self, name: String) {
        self.cluster.folders.remove(&name);
        for name in self.cluster.ancestors_of_child(&name) {
            self.send(Request::ClusterFolder(name));
        }
    }
}

impl kubert::index::IndexNamespacedResource<NamespacedFolder> for Index {
    fn apply(&mut self, folder: NamespacedFolder) {
        let namespace = folder.namespace().unwrap_or_default();
        let name = folder.name_unchecked();
        let forest = self.namespaced.entry(namespace.clone()).or_default();
        forest.insert(&name, &folder);

        for name in forest.with_ancestors([name]) {
            self.send(Request::namespaced_folder(&namespace, name));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let Some(forest) = self.namespaced.get_mut(&namespace) else {
            return;
        };
        forest.folders.remove(&name);
        let ancestors = forest.ancestors_of_child(&name);
        if forest.folders.is_empty() {
            self.namespaced.remove(&namespace);
        }
        for name in ancestors {
            self.send(Request::namespaced_folder(&namespace, name));
        }
    }
}

impl kubert::index::IndexClusterResource<Namespace> for Index {
    fn apply(&mut self, ns: Namespace) {
        let name = ns.name_unchecked();
        let new = self.namespaces.insert(name.clone());
        let unclaimed = claim_label(&ns, labels::CLUSTER_CLAIM.owner_name).is_none();
        if !new && !unclaimed {
            return;
        }
        for folder in self.cluster.ancestors_of_leaf(&name) {
            self.send(Request::ClusterFolder(folder));
        }
    }

    fn delete(&mut self, name: String) {
        self.namespaces.remove(&name);
        for folder in self.cluster.ancestors_of_leaf(&name) {
            self.send(Request::ClusterFolder(folder));
        }
    }
}

impl kubert::index::IndexNamespacedResource<VirtualMachine> for Index {
    fn apply(&mut self, vm: VirtualMachine) {
        let id = ResourceId::of(&vm);
        let new = self.virtual_machines.insert(id.clone());
        let unclaimed = claim_label(&vm, labels::NAMESPACED_CLAIM.owner_name).is_none();
        if !new && !unclaimed {
            return;
        }
        self.route_leaf(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::namespaced(namespace, name);
        self.virtual_machines.remove(&id);
        self.route_leaf(id);
    }
}

impl Index {
    fn route_leaf(&self, id: ResourceId) {
        let Some(namespace) = id.namespace else {
            return;
        };
        let Some(forest) = self.namespaced.get(&namespace) else {
            return;
        };
        for folder in forest.ancestors_of_leaf(&id.name) {
            self.send(Request::namespaced_folder(&namespace, folder));
        }
    }
}

impl kubert::index::IndexClusterResource<FolderIndex> for Index {
    fn apply(&mut self, index: FolderIndex) {
        let name = index.name_unchecked();
        self.send(Request::FolderIndex(name.clone()));

        // Folders waiting on the index are retried once it validates; a
        // changed index may also move leaves between folders.
        if self.source == HierarchySource::Index && name == self.index_name {
            self.enqueue_all_folders();
        }
    }

    fn delete(&mut self, _: String) {}
}

// === impl Forest ===

impl Forest {
    fn insert<F: Folder>(&mut self, name: &str, folder: &F) {
        self.folders.insert(
            name.to_string(),
            Declared {
                children: folder.children().to_vec(),
                leaves: folder.leaves().to_vec(),
            },
        );
    }

    fn ancestors_of_child(&self, name: &str) -> BTreeSet<String> {
        let parents = self.declaring(|d| d.children.iter().any(|c| c == name));
        self.with_ancestors(parents)
    }

    fn ancestors_of_leaf(&self, name: &str) -> BTreeSet<String> {
        let parents = self.declaring(|d| d.leaves.iter().any(|l| l == name));
        self.with_ancestors(parents)
    }

    fn declaring(&self, matches: impl Fn(&Declared) -> bool) -> Vec<String> {
        self.folders
            .iter()
            .filter(|(_, declared)| matches(declared))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns `names` along with every folder that declares one of them,
    /// transitively. Loops are walked once.
    fn with_ancestors(&self, names: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut pending = names.into_iter().collect::<Vec<_>>();
        while let Some(name) = pending.pop() {
            if !found.insert(name.clone()) {
                continue;
            }
            pending.extend(self.declaring(|d| d.children.contains(&name)));
        }
        found
    }
}
