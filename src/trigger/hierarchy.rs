use crate::trigger::Trigger;
use std::fmt;

/// Index of a node in a [`TriggerHierarchy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Clone, Debug, PartialEq)]
struct Node {
    trigger: Trigger,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// Forest of triggers. Nodes are never removed, so a [`NodeId`] stays valid
/// for the lifetime of the hierarchy that issued it.
///
/// # Examples
///
/// ```
/// use trigsim::trigger::hierarchy::TriggerHierarchy;
/// use trigsim::trigger::{SourceId, Trigger, TriggerKey, TypeId};
///
/// let global = TriggerKey::new(SourceId::Global, TypeId::Throughput, None);
/// let smt = TriggerKey::new(SourceId::InIce, TypeId::SimpleMultiplicity, Some(1006));
///
/// let mut hierarchy = TriggerHierarchy::new();
/// let root = hierarchy.insert_root(Trigger::new(global, -4000.0, 10000.0));
/// let child = hierarchy.append_child(root, Trigger::new(smt, 0.0, 2000.0));
///
/// assert_eq!(hierarchy.len(), 2);
/// assert_eq!(hierarchy.children(root), &[child]);
/// assert_eq!(hierarchy.parent(child), Some(root));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TriggerHierarchy {
    nodes: Vec<Node>,
    roots: Vec<NodeId>,
}

impl TriggerHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_root(&mut self, trigger: Trigger) -> NodeId {
        let id = self.push(trigger, None);
        self.roots.push(id);
        id
    }
    /// Adds `trigger` as the last child of `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `parent` was not issued by this hierarchy.
    pub fn append_child(&mut self, parent: NodeId, trigger: Trigger) -> NodeId {
        assert!(parent.0 < self.nodes.len(), "invalid parent node");
        let id = self.push(trigger, Some(parent));
        self.nodes[parent.0].children.push(id);
        id
    }

    fn push(&mut self, trigger: Trigger, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            trigger,
            parent,
            children: Vec::new(),
        });
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Trigger> {
        self.nodes.get(id.0).map(|node| &node.trigger)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|node| node.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id.0)
            .map_or(&[], |node| node.children.as_slice())
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    /// Iterates over every trigger in depth-first pre-order, yielding the
    /// depth of each node (roots are at depth 0).
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Trigger)> + '_ {
        let mut stack: Vec<(usize, NodeId)> =
            self.roots.iter().rev().map(|&id| (0, id)).collect();
        std::iter::from_fn(move || {
            let (depth, id) = stack.pop()?;
            let node = &self.nodes[id.0];
            stack.extend(node.children.iter().rev().map(|&child| (depth + 1, child)));
            Some((depth, &node.trigger))
        })
    }
}

impl fmt::Display for TriggerHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, trigger) in self.iter() {
            writeln!(
                f,
                "{:indent$}{} time={} length={}",
                "",
                trigger.key,
                trigger.time,
                trigger.length,
                indent = 2 * depth
            )?;
        }
        Ok(())
    }
}
