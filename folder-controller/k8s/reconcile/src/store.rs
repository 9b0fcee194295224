use crate::{Error, Result};
use async_trait::async_trait;
use folder_controller_k8s_api::{
    self as k8s, labels, Api, ClusterFolder, ClusterRole, DeleteParams, FolderIndex,
    FolderIndexStatus, ListParams, Namespace, NamespacedFolder, Patch, PatchParams, PostParams,
    ResourceExt, Role, RoleBinding, Selector, VirtualMachine,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Identifies an object within its kind. Cluster-scoped objects have no
/// namespace.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: Option<String>,
    pub name: String,
}

/// A kind the controller reads or writes.
pub trait Object:
    k8s::Resource<DynamicType = ()>
    + Clone
    + fmt::Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
    /// Builds an API handle scoped to `namespace`, or to all namespaces when
    /// `namespace` is `None`.
    fn api(client: k8s::Client, namespace: Option<&str>) -> Api<Self>;
}

/// The object store a reconcile pass reads and writes.
///
/// A missing object is never an error: `get` returns `None` and `delete`
/// succeeds. Writes that carry a resource version fail with
/// [`Error::Conflict`] when the object changed since it was read.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<Option<K>>;

    async fn list<K: Object>(&self, namespace: Option<&str>, selector: &Selector)
        -> Result<Vec<K>>;

    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Replaces a whole object, conditional on its resource version.
    async fn replace<K: Object>(&self, obj: &K) -> Result<K>;

    /// Merges `labels` into an object's labels.
    async fn patch_labels<K: Object>(
        &self,
        id: &ResourceId,
        labels: &labels::Map,
        resource_version: Option<&str>,
    ) -> Result<K>;

    async fn delete<K: Object>(&self, id: &ResourceId) -> Result<()>;

    /// Overwrites both status fields of a FolderIndex, clearing unset ones.
    async fn patch_index_status(&self, name: &str, status: &FolderIndexStatus) -> Result<()>;
}

/// A [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: k8s::Client,
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: Option<&str>, name: impl ToString) -> Self {
        Self {
            namespace: namespace.map(ToString::to_string),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: impl ToString) -> Self {
        Self::new(None, name)
    }

    pub fn namespaced(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => self.name.fmt(f),
        }
    }
}

// === impl Object ===

macro_rules! cluster_objects {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Object for $ty {
                fn api(client: k8s::Client, _: Option<&str>) -> Api<Self> {
                    Api::all(client)
                }
            }
        )+
    };
}

macro_rules! namespaced_objects {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Object for $ty {
                fn api(client: k8s::Client, namespace: Option<&str>) -> Api<Self> {
                    match namespace {
                        Some(ns) => Api::namespaced(client, ns),
                        None => Api::all(client),
                    }
                }
            }
        )+
    };
}

cluster_objects!(ClusterFolder, ClusterRole, FolderIndex, Namespace);
namespaced_objects!(NamespacedFolder, Role, RoleBinding, VirtualMachine);

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<K> {
        K::api(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, id: &ResourceId) -> Result<Option<K>> {
        let obj = self
            .api::<K>(id.namespace.as_deref())
            .get_opt(&id.name)
            .await
            .map_err(|e| Error::from_kube::<K>(id, e))?;
        Ok(obj)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(&selector.to_string());
        let list = self.api::<K>(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let id = ResourceId::of(obj);
        self.api::<K>(id.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube::<K>(&id, e))
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K> {
        let id = ResourceId::of(obj);
        self.api::<K>(id.namespace.as_deref())
            .replace(&id.name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube::<K>(&id, e))
    }

    async fn patch_labels<K: Object>(
        &self,
        id: &ResourceId,
        labels: &labels::Map,
        resource_version: Option<&str>,
    ) -> Result<K> {
        let mut metadata = serde_json::json!({ "labels": labels });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = rv.into();
        }
        let patch = serde_json::json!({ "metadata": metadata });
        self.api::<K>(id.namespace.as_deref())
            .patch(&id.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| Error::from_kube::<K>(id, e))
    }

    async fn delete<K: Object>(&self, id: &ResourceId) -> Result<()> {
        match self
            .api::<K>(id.namespace.as_deref())
            .delete(&id.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(k8s::Error::Api(k8s::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(error) => Err(Error::from_kube::<K>(id, error)),
        }
    }

    async fn patch_index_status(&self, name: &str, status: &FolderIndexStatus) -> Result<()> {
        // Both fields are written explicitly so that a null clears a stale value.
        let patch = serde_json::json!({
            "status": {
                "validatedSpecHash": status.validated_spec_hash,
                "consistencyError": status.consistency_error,
            }
        });
        self.api::<FolderIndex>(None)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
