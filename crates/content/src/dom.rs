//! Document mutation primitives.
//!
//! [`DomOps`] is the narrow surface the frame controller needs from a
//! document. [`MemoryDom`] is an arena-backed tree implementing it, used by
//! the runtime harness and tests.

use std::sync::Arc;

use tokio::sync::Mutex;

/// Handle to a node in a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A document shared between its owner and whatever else mutates the page.
pub type SharedDom<D> = Arc<Mutex<D>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("Node {reference} is not a child of {parent}")]
    NotAChild { parent: NodeId, reference: NodeId },

    #[error("Inserting {node} under {parent} would create a cycle")]
    HierarchyRequest { parent: NodeId, node: NodeId },
}

/// Tree mutation with DOM semantics: inserting a node that already has a
/// parent moves it.
pub trait DomOps: Send + Sync + 'static {
    /// The document root; a node is connected iff it descends from it.
    fn root(&self) -> NodeId;

    fn create_element(&mut self, tag: &str) -> NodeId;

    /// A comment node marking a position in the tree.
    fn create_anchor(&mut self, label: &str) -> NodeId;

    fn parent_of(&self, node: NodeId) -> Option<NodeId>;

    fn is_connected(&self, node: NodeId) -> bool;

    fn insert_before(
        &mut self,
        parent: NodeId,
        node: NodeId,
        reference: NodeId,
    ) -> Result<(), DomError>;

    fn append_child(&mut self, parent: NodeId, node: NodeId) -> Result<(), DomError>;

    /// Detach `node` from its parent. Returns false if it had none.
    fn remove(&mut self, node: NodeId) -> bool;

    fn set_hidden(&mut self, node: NodeId, hidden: bool) -> Result<(), DomError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeKind {
    Element(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    hidden: bool,
}

/// In-memory document tree.
#[derive(Debug, Clone)]
pub struct MemoryDom {
    nodes: Vec<Node>,
}

impl MemoryDom {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                kind: NodeKind::Element("html".into()),
                parent: None,
                children: Vec::new(),
                hidden: false,
            }],
        }
    }

    pub fn shared(self) -> SharedDom<Self> {
        Arc::new(Mutex::new(self))
    }

    pub fn children(&self, parent: NodeId) -> &[NodeId] {
        self.nodes
            .get(parent.0)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// `(parent, index)` of a node, if attached.
    pub fn position(&self, node: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.parent_of(node)?;
        let index = self.children(parent).iter().position(|&c| c == node)?;
        Some((parent, index))
    }

    pub fn is_hidden(&self, node: NodeId) -> bool {
        self.nodes.get(node.0).is_some_and(|n| n.hidden)
    }

    pub fn is_comment(&self, node: NodeId) -> bool {
        self.nodes
            .get(node.0)
            .is_some_and(|n| matches!(n.kind, NodeKind::Comment(_)))
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match &self.nodes.get(node.0)?.kind {
            NodeKind::Element(tag) => Some(tag),
            NodeKind::Comment(_) => None,
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
            hidden: false,
        });
        NodeId(self.nodes.len() - 1)
    }

    fn check(&self, node: NodeId) -> Result<(), DomError> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(DomError::UnknownNode(node))
        }
    }

    /// Whether `ancestor` is `node` or one of its ancestors.
    fn is_inclusive_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.parent_of(n);
        }
        false
    }

    fn prepare_insert(&mut self, parent: NodeId, node: NodeId) -> Result<(), DomError> {
        self.check(parent)?;
        self.check(node)?;
        if self.is_inclusive_ancestor(node, parent) {
            return Err(DomError::HierarchyRequest { parent, node });
        }
        self.remove(node);
        Ok(())
    }
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new()
    }
}

impl DomOps for MemoryDom {
    fn root(&self) -> NodeId {
        NodeId(0)
    }

    fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element(tag.to_string()))
    }

    fn create_anchor(&mut self, label: &str) -> NodeId {
        self.push(NodeKind::Comment(label.to_string()))
    }

    fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0)?.parent
    }

    fn is_connected(&self, node: NodeId) -> bool {
        node.0 < self.nodes.len() && self.is_inclusive_ancestor(self.root(), node)
    }

    fn insert_before(
        &mut self,
        parent: NodeId,
        node: NodeId,
        reference: NodeId,
    ) -> Result<(), DomError> {
        self.check(reference)?;
        if self.parent_of(reference) != Some(parent) {
            return Err(DomError::NotAChild { parent, reference });
        }
        if node == reference {
            return Ok(());
        }
        self.prepare_insert(parent, node)?;

        let children = &mut self.nodes[parent.0].children;
        let index = children
            .iter()
            .position(|&c| c == reference)
            .ok_or(DomError::NotAChild { parent, reference })?;
        children.insert(index, node);
        self.nodes[node.0].parent = Some(parent);
        Ok(())
    }

    fn append_child(&mut self, parent: NodeId, node: NodeId) -> Result<(), DomError> {
        self.prepare_insert(parent, node)?;
        self.nodes[parent.0].children.push(node);
        self.nodes[node.0].parent = Some(parent);
        Ok(())
    }

    fn remove(&mut self, node: NodeId) -> bool {
        let Some(parent) = self.parent_of(node) else {
            return false;
        };
        self.nodes[parent.0].children.retain(|&c| c != node);
        self.nodes[node.0].parent = None;
        true
    }

    fn set_hidden(&mut self, node: NodeId, hidden: bool) -> Result<(), DomError> {
        self.check(node)?;
        self.nodes[node.0].hidden = hidden;
        Ok(())
    }
}
