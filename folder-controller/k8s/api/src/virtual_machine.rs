use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// The leaf resource kind contained by namespaced folders.
///
/// Only metadata is interpreted; the spec is carried opaquely so that the
/// controller never depends on the VM schema.
#[derive(Clone, Debug, Default, CustomResource, Deserialize, Serialize)]
#[kube(
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    schema = "disabled"
)]
pub struct VirtualMachineSpec {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// API groups whose rules are narrowed to a folder's virtual machines.
pub const API_GROUPS: [&str; 2] = ["kubevirt.io", "subresources.kubevirt.io"];

/// Resources (before any `/subresource` suffix) governed by VM-scoped rules.
pub const RESOURCES: [&str; 2] = ["virtualmachines", "virtualmachineinstances"];
