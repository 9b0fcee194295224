use std::{collections::BTreeMap, fmt};

pub type Map = BTreeMap<String, String>;

/// Label keys recording which folder claims a child and when.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClaimKeys {
    pub owner_name: &'static str,
    pub timestamp: &'static str,
}

/// Claims on namespaces and child cluster folders.
pub const CLUSTER_CLAIM: ClaimKeys = ClaimKeys {
    owner_name: "cluster-owner-name.folderview.kubevirt.io",
    timestamp: "cluster-owner-claim-timestamp.folderview.kubevirt.io",
};

/// Claims on virtual machines and child namespaced folders.
pub const NAMESPACED_CLAIM: ClaimKeys = ClaimKeys {
    owner_name: "namespaced-owner-name.folderview.kubevirt.io",
    timestamp: "namespaced-owner-claim-timestamp.folderview.kubevirt.io",
};

/// Marks objects derived from a cluster folder with the folder's UID.
pub const CLUSTER_OWNER_UID: &str = "cluster-owner-uid.folderview.kubevirt.io";

/// Marks objects derived from a namespaced folder with the folder's UID.
pub const NAMESPACED_OWNER_UID: &str = "namespaced-owner-uid.folderview.kubevirt.io";

/// An equality-based label selector.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Map,
}

// === impl Selector ===

impl Selector {
    pub fn from_map(match_labels: Map) -> Self {
        Self { match_labels }
    }

    pub fn matches(&self, labels: Option<&Map>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.match_labels {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}
