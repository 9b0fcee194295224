//! Derived RBAC objects.
//!
//! Every pass re-derives the complete set of objects a folder should own,
//! writes the ones that are missing or differ, and deletes any object carrying
//! the folder's owner label that was not derived this time.

use crate::{
    folder::Folder,
    store::{Object, ResourceId, Store},
    Error, Result,
};
use ahash::AHashSet as HashSet;
use folder_controller_core::hash;
use folder_controller_k8s_api::{
    labels,
    virtual_machine::{API_GROUPS, RESOURCES},
    ClusterFolder, ClusterRole, NamespacedFolder, ObjectMeta, PolicyRule, ResourceExt, Role,
    RoleBinding, RoleRef, Selector, Subject, RBAC_API_GROUP,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, info, warn};

/// Derived-object writes made by one pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Changes {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// The folder on whose behalf objects are derived.
struct Owner {
    uid: String,
    label: &'static str,
    reference: OwnerReference,
}

/// Derives one RoleBinding per namespace and grant.
pub async fn cluster_folder<S: Store>(
    store: &S,
    folder: &ClusterFolder,
    namespaces: &[String],
) -> Result<Changes> {
    let owner = Owner::of(folder)?;
    let mut changes = Changes::default();
    let mut expected = HashSet::new();

    for namespace in namespaces {
        for grant in folder.permissions() {
            for role_ref in &grant.role_refs {
                let Some(name) = owner.binding_name(namespace, &grant.subject, role_ref) else {
                    continue;
                };
                let id = ResourceId::namespaced(namespace, name);
                changes += apply_binding(store, &owner, &id, &grant.subject, role_ref).await?;
                expected.insert(id);
            }
        }
    }

    changes.deleted += collect_garbage::<RoleBinding, S>(store, &owner, None, &expected).await?;
    Ok(changes)
}

/// Derives, per grant, a Role whose VM rules are narrowed to `vms` and a
/// RoleBinding to it.
///
/// Grants whose role has no rules on virtual machines derive nothing. No Role
/// is derived at all when `vms` is empty, since a rule with an empty name
/// list would cover every virtual machine.
pub async fn namespaced_folder<S: Store>(
    store: &S,
    folder: &NamespacedFolder,
    vms: &[String],
) -> Result<Changes> {
    let owner = Owner::of(folder)?;
    let namespace = folder.namespace().unwrap_or_default();
    let mut vms = vms.to_vec();
    vms.sort();
    vms.dedup();

    let mut changes = Changes::default();
    let mut roles = HashSet::new();
    let mut bindings = HashSet::new();

    if vms.is_empty() {
        debug!(%namespace, "Folder contains no virtual machines");
    } else {
        for grant in folder.permissions() {
            for role_ref in &grant.role_refs {
                let Some(rules) = referenced_rules(store, &namespace, role_ref).await? else {
                    debug!(kind = %role_ref.kind, role = %role_ref.name, "Role not found");
                    continue;
                };
                let rules = scope_rules(&rules, &vms);
                if rules.is_empty() {
                    debug!(role = %role_ref.name, "Role grants nothing on virtual machines");
                    continue;
                }

                let role_name = match hash::role_name(&owner.uid, &namespace, &rules) {
                    Ok(name) => name,
                    Err(error) => {
                        warn!(%namespace, role = %role_ref.name, %error, "Skipping grant");
                        continue;
                    }
                };
                let role = ResourceId::namespaced(&namespace, &role_name);
                changes += apply_role(store, &owner, &role, rules).await?;
                roles.insert(role);

                let derived = RoleRef {
                    api_group: RBAC_API_GROUP.to_string(),
                    kind: "Role".to_string(),
                    name: role_name,
                };
                let Some(name) = owner.binding_name(&namespace, &grant.subject, &derived) else {
                    continue;
                };
                let binding = ResourceId::namespaced(&namespace, name);
                changes += apply_binding(store, &owner, &binding, &grant.subject, &derived).await?;
                bindings.insert(binding);
            }
        }
    }

    let ns = Some(namespace.as_str());
    changes.deleted += collect_garbage::<RoleBinding, S>(store, &owner, ns, &bindings).await?;
    changes.deleted += collect_garbage::<Role, S>(store, &owner, ns, &roles).await?;
    Ok(changes)
}

/// Keeps the rules that apply to virtual machines without naming any, and
/// restricts them to exactly `vms`.
pub fn scope_rules(rules: &[PolicyRule], vms: &[String]) -> Vec<PolicyRule> {
    rules
        .iter()
        .filter_map(|rule| {
            if rule.resource_names.as_ref().is_some_and(|n| !n.is_empty()) {
                return None;
            }

            let api_groups = rule
                .api_groups
                .iter()
                .flatten()
                .filter(|g| API_GROUPS.contains(&g.as_str()))
                .cloned()
                .collect::<Vec<_>>();
            let resources = rule
                .resources
                .iter()
                .flatten()
                .filter(|r| {
                    let base = r.split_once('/').map_or(r.as_str(), |(base, _)| base);
                    *r == "*" || RESOURCES.contains(&base)
                })
                .cloned()
                .collect::<Vec<_>>();
            if api_groups.is_empty() || resources.is_empty() {
                return None;
            }

            Some(PolicyRule {
                api_groups: Some(api_groups),
                resources: Some(resources),
                resource_names: Some(vms.to_vec()),
                verbs: rule.verbs.clone(),
                non_resource_urls: None,
            })
        })
        .collect()
}

async fn referenced_rules<S: Store>(
    store: &S,
    namespace: &str,
    role_ref: &RoleRef,
) -> Result<Option<Vec<PolicyRule>>> {
    match role_ref.kind.as_str() {
        "Role" => {
            let id = ResourceId::namespaced(namespace, &role_ref.name);
            let role = store.get::<Role>(&id).await?;
            Ok(role.map(|r| r.rules.unwrap_or_default()))
        }
        "ClusterRole" => {
            let id = ResourceId::cluster(&role_ref.name);
            let role = store.get::<ClusterRole>(&id).await?;
            Ok(role.map(|r| r.rules.unwrap_or_default()))
        }
        kind => {
            debug!(%kind, "Ignoring unsupported role kind");
            Ok(None)
        }
    }
}

async fn apply_binding<S: Store>(
    store: &S,
    owner: &Owner,
    id: &ResourceId,
    subject: &Subject,
    role_ref: &RoleRef,
) -> Result<Changes> {
    converge(store, owner, id, |binding: &mut RoleBinding| {
        binding.subjects = Some(vec![subject.clone()]);
        binding.role_ref = role_ref.clone();
    })
    .await
}

async fn apply_role<S: Store>(
    store: &S,
    owner: &Owner,
    id: &ResourceId,
    rules: Vec<PolicyRule>,
) -> Result<Changes> {
    converge(store, owner, id, move |role: &mut Role| {
        role.rules = Some(rules.clone());
    })
    .await
}

/// Creates the object `id`, or replaces it if it differs from what `apply`
/// makes of it.
async fn converge<K, S, A>(store: &S, owner: &Owner, id: &ResourceId, apply: A) -> Result<Changes>
where
    K: Object + Default + PartialEq,
    S: Store,
    A: Fn(&mut K) + Send + Sync,
{
    let existing = store.get::<K>(id).await?;
    let mut desired = existing.clone().unwrap_or_else(|| {
        let mut obj = K::default();
        obj.meta_mut().name = Some(id.name.clone());
        obj.meta_mut().namespace = id.namespace.clone();
        obj
    });
    owner.stamp(desired.meta_mut());
    apply(&mut desired);

    match existing {
        None => {
            store.create(&desired).await?;
            info!(%id, kind = %K::kind(&()), "Created");
            Ok(Changes {
                created: 1,
                ..Changes::default()
            })
        }
        Some(existing) if existing == desired => Ok(Changes::default()),
        Some(_) => {
            store.replace(&desired).await?;
            info!(%id, kind = %K::kind(&()), "Updated");
            Ok(Changes {
                updated: 1,
                ..Changes::default()
            })
        }
    }
}

/// Deletes every object labeled as owned by `owner` that is not `expected`.
async fn collect_garbage<K, S>(
    store: &S,
    owner: &Owner,
    namespace: Option<&str>,
    expected: &HashSet<ResourceId>,
) -> Result<usize>
where
    K: Object,
    S: Store,
{
    let mut deleted = 0;
    for obj in store.list::<K>(namespace, &owner.selector()).await? {
        let id = ResourceId::of(&obj);
        if expected.contains(&id) {
            continue;
        }
        store.delete::<K>(&id).await?;
        info!(%id, kind = %K::kind(&()), "Deleted");
        deleted += 1;
    }
    Ok(deleted)
}

// === impl Owner ===

impl Owner {
    fn of<F: Folder>(folder: &F) -> Result<Self> {
        let missing = || Error::MissingUid {
            kind: F::kind(&()).to_string(),
            id: ResourceId::of(folder),
        };
        let uid = folder.uid().ok_or_else(missing)?;
        let reference = folder.controller_owner_ref(&()).ok_or_else(missing)?;
        Ok(Self {
            uid,
            label: F::OWNER_UID,
            reference,
        })
    }

    fn stamp(&self, meta: &mut ObjectMeta) {
        meta.labels
            .get_or_insert_with(Default::default)
            .insert(self.label.to_string(), self.uid.clone());
        meta.owner_references = Some(vec![self.reference.clone()]);
    }

    fn selector(&self) -> Selector {
        let map = labels::Map::from([(self.label.to_string(), self.uid.clone())]);
        Selector::from_map(map)
    }

    /// Names the binding of `subject` to `role_ref` in `namespace`, or logs
    /// and skips a grant whose references cannot be hashed.
    fn binding_name(
        &self,
        namespace: &str,
        subject: &Subject,
        role_ref: &RoleRef,
    ) -> Option<String> {
        match hash::binding_name(&self.uid, namespace, subject, role_ref) {
            Ok(name) => Some(name),
            Err(error) => {
                warn!(%namespace, subject = %subject.name, %error, "Skipping grant");
                None
            }
        }
    }
}

// === impl Changes ===

impl std::ops::AddAssign for Changes {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Option<Vec<String>> {
        Some(items.iter().map(ToString::to_string).collect())
    }

    fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: strings(groups),
            resources: strings(resources),
            verbs: verbs.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn scopes_vm_rules_to_names() {
        let vms = vec!["vm-a".to_string(), "vm-b".to_string()];
        let rules = vec![
            rule(
                &["kubevirt.io", "apps"],
                &["virtualmachines", "deployments"],
                &["get", "list"],
            ),
            rule(
                &["subresources.kubevirt.io"],
                &["virtualmachineinstances/console"],
                &["get"],
            ),
            rule(&["kubevirt.io"], &["*"], &["watch"]),
            rule(&[""], &["pods"], &["get"]),
            rule(&["kubevirt.io"], &["virtualmachinepools"], &["get"]),
            PolicyRule {
                resource_names: strings(&["pinned"]),
                ..rule(&["kubevirt.io"], &["virtualmachines"], &["delete"])
            },
        ];

        assert_eq!(
            scope_rules(&rules, &vms),
            vec![
                PolicyRule {
                    resource_names: Some(vms.clone()),
                    ..rule(&["kubevirt.io"], &["virtualmachines"], &["get", "list"])
                },
                PolicyRule {
                    resource_names: Some(vms.clone()),
                    ..rule(
                        &["subresources.kubevirt.io"],
                        &["virtualmachineinstances/console"],
                        &["get"]
                    )
                },
                PolicyRule {
                    resource_names: Some(vms.clone()),
                    ..rule(&["kubevirt.io"], &["*"], &["watch"])
                },
            ]
        );
    }

    #[test]
    fn changes_accumulate() {
        let mut changes = Changes::default();
        changes += Changes {
            created: 1,
            updated: 0,
            deleted: 2,
        };
        changes += Changes {
            created: 1,
            updated: 1,
            deleted: 0,
        };
        assert_eq!(
            changes,
            Changes {
                created: 2,
                updated: 1,
                deleted: 2,
            }
        );
    }
}
