use ahash::AHashSet as HashSet;
use std::fmt;

/// A node of the folder forest, tagged by kind.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Node {
    ClusterFolder(String),
    Namespace(String),
    NamespacedFolder { namespace: String, name: String },
    VirtualMachine { namespace: String, name: String },
}

/// The sub-forest a walk stays within.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Cluster,
    Namespaced(String),
}

/// The leaves reachable from a folder.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Leaf names in discovery order, without duplicates.
    pub leaves: Vec<String>,

    /// The first folder reached twice, if any. When set, `leaves` is partial.
    pub cycle: Option<Node>,
}

/// A depth-first walk over a folder subtree that is driven by the caller.
///
/// The caller expands the root with its own entry, then repeatedly takes the
/// next folder with [`Traversal::next_folder`] and expands it with whatever it
/// finds for that folder (or nothing, if the folder does not exist). Direct
/// leaves are recorded before children are visited, and children are visited
/// in declared order.
#[derive(Debug)]
pub struct Traversal {
    scope: Scope,
    pending: Vec<String>,
    visited: HashSet<Node>,
    leaves: Vec<String>,
    cycle: Option<Node>,
}

// === impl Node ===

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::ClusterFolder(name) => write!(f, "ClusterFolder {name}"),
            Node::Namespace(name) => write!(f, "Namespace {name}"),
            Node::NamespacedFolder { namespace, name } => {
                write!(f, "NamespacedFolder {namespace}/{name}")
            }
            Node::VirtualMachine { namespace, name } => {
                write!(f, "VirtualMachine {namespace}/{name}")
            }
        }
    }
}

impl Node {
    /// The name of the node within its namespace.
    pub fn name(&self) -> &str {
        match self {
            Node::ClusterFolder(name) | Node::Namespace(name) => name,
            Node::NamespacedFolder { name, .. } | Node::VirtualMachine { name, .. } => name,
        }
    }
}

// === impl Scope ===

impl Scope {
    pub fn folder(&self, name: &str) -> Node {
        match self {
            Scope::Cluster => Node::ClusterFolder(name.to_string()),
            Scope::Namespaced(namespace) => Node::NamespacedFolder {
                namespace: namespace.clone(),
                name: name.to_string(),
            },
        }
    }

    pub fn leaf(&self, name: &str) -> Node {
        match self {
            Scope::Cluster => Node::Namespace(name.to_string()),
            Scope::Namespaced(namespace) => Node::VirtualMachine {
                namespace: namespace.clone(),
                name: name.to_string(),
            },
        }
    }
}

// === impl Traversal ===

impl Traversal {
    pub fn new(scope: Scope, root: &str) -> Self {
        let mut visited = HashSet::new();
        visited.insert(scope.folder(root));
        Self {
            scope,
            pending: Vec::new(),
            visited,
            leaves: Vec::new(),
            cycle: None,
        }
    }

    /// Records a folder's direct leaves and schedules its children.
    pub fn expand<'a, L, C>(&mut self, leaves: L, children: C)
    where
        L: IntoIterator<Item = &'a String>,
        C: IntoIterator<Item = &'a String>,
        C::IntoIter: DoubleEndedIterator,
    {
        for leaf in leaves {
            if self.visited.insert(self.scope.leaf(leaf)) {
                self.leaves.push(leaf.clone());
            }
        }

        // The stack pops in reverse, so push in reverse to keep declared order.
        self.pending
            .extend(children.into_iter().rev().map(ToString::to_string));
    }

    /// Takes the next folder to expand.
    ///
    /// Returns `None` once the walk is exhausted or a folder is reached a second
    /// time; in the latter case the walk stops and the cycle is reported by
    /// [`Traversal::finish`].
    pub fn next_folder(&mut self) -> Option<String> {
        if self.cycle.is_some() {
            return None;
        }

        let name = self.pending.pop()?;
        let node = self.scope.folder(&name);
        if !self.visited.insert(node.clone()) {
            self.cycle = Some(node);
            return None;
        }
        Some(name)
    }

    pub fn finish(self) -> Resolution {
        Resolution {
            leaves: self.leaves,
            cycle: self.cycle,
        }
    }
}
