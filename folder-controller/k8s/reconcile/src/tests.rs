use crate::{
    store::{Object, ResourceId, Store},
    Error, Result,
};
use async_trait::async_trait;
use folder_controller_k8s_api::{
    self as k8s, labels, ClusterFolder, ClusterFolderSpec, ErrorResponse, FolderIndex,
    FolderIndexStatus, FolderPermission, Namespace, NamespacedFolder, NamespacedFolderSpec,
    ObjectMeta, ResourceExt, RoleRef, Selector, Subject, VirtualMachine, RBAC_API_GROUP,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};


/// An in-memory object store.
///
/// Objects are held as JSON, keyed by kind and id. Every write bumps the
/// object's resource version, writes carrying a stale resource version fail
/// with a conflict, and successful writes are counted. A write can be made to
/// fail once with a server error.
#[derive(Clone, Default)]
pub struct MemStore(Arc<Mutex<Inner>>);

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, ResourceId), serde_json::Value>,
    version: u64,
    writes: usize,
    failures: BTreeSet<(String, ResourceId)>,
}

// === impl MemStore ===

impl MemStore {
    /// Stores `obj` without counting a write, assigning a UID if it has none.
    pub fn insert<K: Object>(&self, mut obj: K) {
        let mut inner = self.0.lock();
        inner.stamp(&mut obj);
        let key = (K::kind(&()).to_string(), ResourceId::of(&obj));
        inner.objects.insert(key, to_value(&obj));
    }

    pub fn fetch<K: Object>(&self, id: &ResourceId) -> K {
        self.try_fetch(id)
            .unwrap_or_else(|| panic!("{} {id} must exist", K::kind(&())))
    }

    pub fn try_fetch<K: Object>(&self, id: &ResourceId) -> Option<K> {
        let inner = self.0.lock();
        inner
            .objects
            .get(&(K::kind(&()).to_string(), id.clone()))
            .map(from_value)
    }

    pub fn all<K: Object>(&self) -> Vec<K> {
        let kind = K::kind(&());
        let inner = self.0.lock();
        inner
            .objects
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| from_value(v))
            .collect()
    }

    pub fn writes(&self) -> usize {
        self.0.lock().writes
    }

    /// Fails the next write to the identified object with a server error.
    pub fn fail_next_write<K: Object>(&self, id: &ResourceId) {
        self.0
            .lock()
            .failures
            .insert((K::kind(&()).to_string(), id.clone()));
    }
}

impl Inner {
    fn take_failure<K: Object>(&mut self, id: &ResourceId) -> Result<()> {
        if !self.failures.remove(&(K::kind(&()).to_string(), id.clone())) {
            return Ok(());
        }
        Err(Error::Kube(k8s::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: request timed out".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        })))
    }

    fn stamp<K: Object>(&mut self, obj: &mut K) {
        self.version += 1;
        let version = self.version;
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{version}"));
        }
        meta.resource_version = Some(version.to_string());
    }

    fn check_version<K: Object>(
        &self,
        id: &ResourceId,
        resource_version: Option<&str>,
    ) -> Result<serde_json::Value> {
        let conflict = || Error::Conflict {
            kind: K::kind(&()).to_string(),
            id: id.clone(),
        };
        let current = self
            .objects
            .get(&(K::kind(&()).to_string(), id.clone()))
            .ok_or_else(conflict)?;
        if let Some(rv) = resource_version {
            if current["metadata"]["resourceVersion"].as_str() != Some(rv) {
                return Err(conflict());
            }
        }
        Ok(current.clone())
    }

    fn write<K: Object>(&mut self, mut obj: K) -> K {
        self.stamp(&mut obj);
        let key = (K::kind(&()).to_string(), ResourceId::of(&obj));
        self.objects.insert(key, to_value(&obj));
        self.writes += 1;
        obj
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<Option<K>> {
        Ok(self.try_fetch(id))
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>> {
        Ok(self
            .all::<K>()
            .into_iter()
            .filter(|obj| namespace.is_none() || obj.namespace().as_deref() == namespace)
            .filter(|obj| selector.matches(obj.meta().labels.as_ref()))
            .collect())
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let mut inner = self.0.lock();
        let id = ResourceId::of(obj);
        inner.take_failure::<K>(&id)?;
        if inner
            .objects
            .contains_key(&(K::kind(&()).to_string(), id.clone()))
        {
            return Err(Error::Conflict {
                kind: K::kind(&()).to_string(),
                id,
            });
        }
        let mut obj = obj.clone();
        obj.meta_mut().uid = None;
        Ok(inner.write(obj))
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K> {
        let mut inner = self.0.lock();
        let id = ResourceId::of(obj);
        inner.take_failure::<K>(&id)?;
        let current = inner.check_version::<K>(&id, obj.resource_version().as_deref())?;
        let mut obj = obj.clone();
        obj.meta_mut().uid = current["metadata"]["uid"].as_str().map(ToString::to_string);
        Ok(inner.write(obj))
    }

    async fn patch_labels<K: Object>(
        &self,
        id: &ResourceId,
        patch: &labels::Map,
        resource_version: Option<&str>,
    ) -> Result<K> {
        let mut inner = self.0.lock();
        inner.take_failure::<K>(id)?;
        let mut obj = from_value::<K>(&inner.check_version::<K>(id, resource_version)?);
        obj.meta_mut()
            .labels
            .get_or_insert_with(Default::default)
            .extend(patch.clone());
        Ok(inner.write(obj))
    }

    async fn delete<K: Object>(&self, id: &ResourceId) -> Result<()> {
        let mut inner = self.0.lock();
        inner.take_failure::<K>(id)?;
        if inner
            .objects
            .remove(&(K::kind(&()).to_string(), id.clone()))
            .is_some()
        {
            inner.writes += 1;
        }
        Ok(())
    }

    async fn patch_index_status(&self, name: &str, status: &FolderIndexStatus) -> Result<()> {
        let mut inner = self.0.lock();
        let id = ResourceId::cluster(name);
        inner.take_failure::<FolderIndex>(&id)?;
        let mut index = from_value::<FolderIndex>(&inner.check_version::<FolderIndex>(&id, None)?);
        index.status = Some(status.clone());
        inner.write(index);
        Ok(())
    }
}

fn to_value<K: Object>(obj: &K) -> serde_json::Value {
    serde_json::to_value(obj).expect("object must serialize")
}

fn from_value<K: Object>(value: &serde_json::Value) -> K {
    serde_json::from_value(value.clone()).expect("object must deserialize")
}

// === fixtures ===

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

pub fn cluster_folder(name: &str, children: &[&str], namespaces: &[&str]) -> ClusterFolder {
    ClusterFolder::new(
        name,
        ClusterFolderSpec {
            child_cluster_folders: strings(children),
            namespaces: strings(namespaces),
            folder_permissions: vec![],
        },
    )
}

pub fn namespaced_folder(
    namespace: &str,
    name: &str,
    children: &[&str],
    vms: &[&str],
) -> NamespacedFolder {
    let mut folder = NamespacedFolder::new(
        name,
        NamespacedFolderSpec {
            child_namespaced_folders: strings(children),
            virtual_machines: strings(vms),
            folder_permissions: vec![],
        },
    );
    folder.metadata.namespace = Some(namespace.to_string());
    folder
}

pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn virtual_machine(namespace: &str, name: &str) -> VirtualMachine {
    let mut vm = VirtualMachine::new(name, Default::default());
    vm.metadata.namespace = Some(namespace.to_string());
    vm
}

/// Grants the user `user` the cluster role `role`.
pub fn grant(user: &str, role: &str) -> FolderPermission {
    FolderPermission {
        subject: Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: user.to_string(),
            namespace: None,
        },
        role_refs: vec![RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        }],
    }
}

/// Labels `obj` as claimed by the cluster folder `owner` at `timestamp`.
pub fn claimed_by<K: ResourceExt>(mut obj: K, owner: &str, timestamp: &str) -> K {
    let labels = obj.labels_mut();
    labels.insert(
        labels::CLUSTER_CLAIM.owner_name.to_string(),
        owner.to_string(),
    );
    labels.insert(
        labels::CLUSTER_CLAIM.timestamp.to_string(),
        timestamp.to_string(),
    );
    obj
}
