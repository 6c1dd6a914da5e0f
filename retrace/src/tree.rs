//! Logical callback nodes and the causation tree
//!
//! Every callback occurrence the loop executes is registered here before it
//! runs. A node's identity under replay is *positional*: the sequence of
//! birth orders from the root ([`TreePath`]) plus the callback kind. Two runs
//! of the same program produce the same paths even though every allocation
//! differs, which is what lets a recorded schedule be matched against a live
//! execution.
//!
//! A synthetic root anchors top-level callbacks (those with no registering
//! parent); it is never executed and never emitted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use retrace_common::{CallbackKind, NodeId};

/// Position of a node in the causation tree: birth orders from the root.
/// Displays as dotted digits (`0.2.1`); the root is the empty path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TreePath(Vec<u32>);

impl TreePath {
    #[must_use]
    pub fn root() -> Self {
        TreePath(Vec::new())
    }

    #[must_use]
    pub fn child(&self, birth_order: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(birth_order);
        TreePath(segments)
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(TreePath(self.0[..self.0.len() - 1].to_vec()))
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        let mut first = true;
        for segment in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for TreePath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-" {
            return Ok(TreePath::root());
        }
        s.split('.')
            .map(|seg| seg.parse::<u32>().map_err(|_| format!("bad path segment `{seg}`")))
            .collect::<Result<Vec<_>, _>>()
            .map(TreePath)
    }
}

/// One registered callback occurrence.
#[derive(Debug, Clone)]
pub struct CallbackNode {
    pub id: NodeId,
    pub kind: CallbackKind,
    /// The loop handle this callback belongs to, when the caller supplied one.
    pub handle: Option<u64>,
    /// `None` only for the synthetic root.
    pub parent: Option<NodeId>,
    pub birth_order: u32,
    pub path: TreePath,
    /// Global execution index, assigned when the callback starts.
    pub exec_index: Option<u64>,
    children: Vec<NodeId>,
}

impl CallbackNode {
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    #[must_use]
    pub fn started(&self) -> bool {
        self.exec_index.is_some()
    }
}

/// Arena-backed causation tree. `NodeId` is an index into the arena; node 0
/// is the synthetic root.
#[derive(Debug)]
pub struct CallbackTree {
    nodes: Vec<CallbackNode>,
    by_path: HashMap<TreePath, NodeId>,
    executed: u64,
}

impl Default for CallbackTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackTree {
    #[must_use]
    pub fn new() -> Self {
        let root = CallbackNode {
            id: NodeId(0),
            kind: CallbackKind::Root,
            handle: None,
            parent: None,
            birth_order: 0,
            path: TreePath::root(),
            exec_index: None,
            children: Vec::new(),
        };
        let mut by_path = HashMap::new();
        by_path.insert(TreePath::root(), NodeId(0));
        CallbackTree { nodes: vec![root], by_path, executed: 0 }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Register a new callback occurrence. `parent = None` attaches it to the
    /// synthetic root (a top-level callback).
    pub fn register(
        &mut self,
        parent: Option<NodeId>,
        kind: CallbackKind,
        handle: Option<u64>,
    ) -> NodeId {
        let parent = parent.unwrap_or_else(|| self.root());
        let id = NodeId(self.nodes.len() as u64);
        #[allow(clippy::cast_possible_truncation)]
        let birth_order = self.nodes[parent.0 as usize].children.len() as u32;
        let path = self.nodes[parent.0 as usize].path.child(birth_order);
        self.nodes[parent.0 as usize].children.push(id);
        self.by_path.insert(path.clone(), id);
        self.nodes.push(CallbackNode {
            id,
            kind,
            handle,
            parent: Some(parent),
            birth_order,
            path,
            exec_index: None,
            children: Vec::new(),
        });
        id
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &CallbackNode {
        &self.nodes[id.0 as usize]
    }

    #[must_use]
    pub fn node_at(&self, path: &TreePath) -> Option<&CallbackNode> {
        self.by_path.get(path).map(|id| self.node(*id))
    }

    /// Kinds of a node's children, in registration order. This is what the
    /// divergence detector compares against the recorded schedule.
    #[must_use]
    pub fn children_kinds(&self, id: NodeId) -> Vec<CallbackKind> {
        self.nodes[id.0 as usize]
            .children
            .iter()
            .map(|child| self.node(*child).kind)
            .collect()
    }

    /// Mark a node as started, stamping its global execution index.
    pub fn mark_started(&mut self, id: NodeId, exec_index: u64) {
        self.nodes[id.0 as usize].exec_index = Some(exec_index);
    }

    /// Count a completed execution.
    pub fn mark_finished(&mut self) {
        self.executed += 1;
    }

    /// Registered callbacks, excluding the synthetic root.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.nodes.len() - 1
    }

    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Registered callbacks that have not started yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.nodes.iter().skip(1).filter(|n| !n.started()).count()
    }

    /// All nodes except the synthetic root, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &CallbackNode> {
        self.nodes.iter().skip(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_are_positional() {
        let mut tree = CallbackTree::new();
        let a = tree.register(None, CallbackKind::Timer, Some(1));
        let b = tree.register(None, CallbackKind::Timer, Some(2));
        let a_child = tree.register(Some(a), CallbackKind::Io, None);

        assert_eq!(tree.node(a).path.to_string(), "0");
        assert_eq!(tree.node(b).path.to_string(), "1");
        assert_eq!(tree.node(a_child).path.to_string(), "0.0");
    }

    #[test]
    fn test_path_round_trip() {
        let path: TreePath = "0.2.1".parse().unwrap();
        assert_eq!(path.to_string(), "0.2.1");
        assert_eq!(path.parent().unwrap().to_string(), "0.2");
        assert!("0.x.1".parse::<TreePath>().is_err());
    }

    #[test]
    fn test_node_lookup_by_path() {
        let mut tree = CallbackTree::new();
        let a = tree.register(None, CallbackKind::Timer, None);
        let child = tree.register(Some(a), CallbackKind::Work, None);

        let found = tree.node_at(&"0.0".parse().unwrap()).unwrap();
        assert_eq!(found.id, child);
        assert!(tree.node_at(&"3".parse().unwrap()).is_none());
    }

    #[test]
    fn test_children_kinds_in_registration_order() {
        let mut tree = CallbackTree::new();
        let a = tree.register(None, CallbackKind::Timer, None);
        tree.register(Some(a), CallbackKind::Work, None);
        tree.register(Some(a), CallbackKind::Io, None);

        assert_eq!(tree.children_kinds(a), vec![CallbackKind::Work, CallbackKind::Io]);
    }

    #[test]
    fn test_execution_bookkeeping() {
        let mut tree = CallbackTree::new();
        let a = tree.register(None, CallbackKind::Timer, None);
        assert_eq!(tree.pending(), 1);

        tree.mark_started(a, 0);
        tree.mark_finished();
        assert_eq!(tree.pending(), 0);
        assert_eq!(tree.executed(), 1);
        assert_eq!(tree.node(a).exec_index, Some(0));
    }
}
