//! In-memory document tree standing in for the host page.
//!
//! Nodes live in an arena and are never freed; removing a node only detaches
//! it. Observers registered with [`Document::observe`] receive a
//! [`MutationBatch`] for every insertion under their target.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::error::MbtError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    text: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            text: None,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// Nodes inserted by one mutation, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    pub added: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

struct Observer {
    id: WatchId,
    target: NodeId,
    sender: UnboundedSender<MutationBatch>,
}

pub struct MutationWatch {
    pub id: WatchId,
    pub receiver: UnboundedReceiver<MutationBatch>,
}

pub struct Document {
    nodes: Vec<Node>,
    observers: Vec<Observer>,
    next_watch: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("body")],
            observers: Vec::new(),
            next_watch: 0,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Node::new(tag));
        NodeId(self.nodes.len() - 1)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), MbtError> {
        self.append_children(parent, &[child])
    }

    /// Inserts several nodes under `parent` and notifies observers once.
    pub fn append_children(&mut self, parent: NodeId, children: &[NodeId]) -> Result<(), MbtError> {
        self.node(parent)?;
        for &child in children {
            self.node(child)?;
            if child == parent || self.contains(child, parent) {
                return Err(MbtError::Render(format!(
                    "cannot insert {child} into its own subtree"
                )));
            }
        }
        for &child in children {
            self.detach(child);
            self.nodes[child.0].parent = Some(parent);
            self.nodes[parent.0].children.push(child);
        }
        self.notify(parent, children);
        Ok(())
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), MbtError> {
        self.node(parent)?;
        if self.node(child)?.parent != Some(parent) {
            return Err(MbtError::Render(format!("{child} is not a child of {parent}")));
        }
        self.detach(child);
        Ok(())
    }

    pub fn clear_children(&mut self, node: NodeId) -> Result<(), MbtError> {
        let children = std::mem::take(&mut self.node_mut(node)?.children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
        Ok(())
    }

    /// Replaces all content of `node` with `text`, like assigning `textContent`.
    pub fn set_text(&mut self, node: NodeId, text: &str) -> Result<(), MbtError> {
        self.clear_children(node)?;
        self.node_mut(node)?.text = (!text.is_empty()).then(|| text.to_string());
        Ok(())
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) -> Result<(), MbtError> {
        self.node_mut(node)?
            .attributes
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) -> Result<(), MbtError> {
        if self.has_class(node, class) {
            return Ok(());
        }
        let merged = match self.attribute(node, "class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {class}", existing.trim()),
            _ => class.to_string(),
        };
        self.set_attribute(node, "class", &merged)
    }

    pub fn remove_class(&mut self, node: NodeId, class: &str) -> Result<(), MbtError> {
        let Some(existing) = self.attribute(node, "class") else {
            return Ok(());
        };
        let kept = existing
            .split_whitespace()
            .filter(|name| *name != class)
            .collect::<Vec<_>>()
            .join(" ");
        self.set_attribute(node, "class", &kept)
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.0).map(|node| node.tag.as_str())
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes
            .get(node.0)
            .and_then(|node| node.attributes.get(name))
            .map(|value| value.as_str())
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .map(|classes| classes.split_whitespace().any(|name| name == class))
            .unwrap_or(false)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|node| node.parent)
    }

    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node.0)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    /// Own text followed by the text of all descendants, in document order.
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        if let Some(text) = self.nodes.get(node.0).and_then(|node| node.text.as_deref()) {
            out.push_str(text);
        }
        for descendant in self.descendants(node) {
            if let Some(text) = self.nodes[descendant.0].text.as_deref() {
                out.push_str(text);
            }
        }
        out
    }

    /// Descendants of `node` in pre-order, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    /// True when `ancestor` is a strict ancestor of `node`.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.parent(node);
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.parent(parent);
        }
        false
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        node == self.root() || self.contains(self.root(), node)
    }

    /// `content` of the first `<meta name=...>` in the document.
    pub fn meta_content(&self, name: &str) -> Option<&str> {
        self.descendants(self.root())
            .into_iter()
            .find(|&node| {
                self.tag(node) == Some("meta") && self.attribute(node, "name") == Some(name)
            })
            .and_then(|node| self.attribute(node, "content"))
    }

    pub fn observe(&mut self, target: NodeId) -> Result<MutationWatch, MbtError> {
        self.node(target)?;
        let (sender, receiver) = unbounded_channel();
        let id = WatchId(self.next_watch);
        self.next_watch += 1;
        self.observers.push(Observer { id, target, sender });
        Ok(MutationWatch { id, receiver })
    }

    /// Drops the observer; its receiver sees the channel close.
    pub fn disconnect(&mut self, id: WatchId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|observer| observer.id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn from_snapshot(snapshot: &NodeSnapshot) -> Self {
        let mut document = Self::new();
        let root = document.root();
        document.nodes[root.0] = Node::new(&snapshot.tag);
        document.fill(root, snapshot);
        document
    }

    pub fn snapshot(&self, node: NodeId) -> Result<NodeSnapshot, MbtError> {
        let current = self.node(node)?;
        let children = current
            .children
            .iter()
            .map(|&child| self.snapshot(child))
            .collect::<Result<Vec<_>, MbtError>>()?;
        Ok(NodeSnapshot {
            tag: current.tag.clone(),
            attributes: current.attributes.clone(),
            text: current.text.clone(),
            children,
        })
    }

    fn fill(&mut self, node: NodeId, snapshot: &NodeSnapshot) {
        self.nodes[node.0].attributes = snapshot.attributes.clone();
        self.nodes[node.0].text = snapshot.text.clone();
        for child in &snapshot.children {
            let id = self.create_element(&child.tag);
            self.nodes[id.0].parent = Some(node);
            self.nodes[node.0].children.push(id);
            self.fill(id, child);
        }
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node.0].parent.take() {
            self.nodes[parent.0].children.retain(|&child| child != node);
        }
    }

    fn notify(&mut self, parent: NodeId, added: &[NodeId]) {
        if added.is_empty() || self.observers.is_empty() {
            return;
        }
        let targets = self
            .observers
            .iter()
            .map(|observer| observer.target == parent || self.contains(observer.target, parent))
            .collect::<Vec<_>>();
        let batch = MutationBatch {
            added: added.to_vec(),
        };
        let mut index = 0;
        self.observers.retain(|observer| {
            let keep = !targets[index] || observer.sender.send(batch.clone()).is_ok();
            index += 1;
            keep
        });
    }

    fn node(&self, id: NodeId) -> Result<&Node, MbtError> {
        self.nodes.get(id.0).ok_or(MbtError::UnknownNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, MbtError> {
        self.nodes.get_mut(id.0).ok_or(MbtError::UnknownNode(id.0))
    }
}

/// Serialized form of a subtree, used by `mbt annotate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<NodeSnapshot>,
}

impl NodeSnapshot {
    pub fn from_json(content: &str) -> Result<Self, MbtError> {
        serde_json::from_str(content).map_err(|err| MbtError::Snapshot(err.to_string()))
    }
}

/// Document handle shared between the pipeline tasks and the host.
#[derive(Clone, Default)]
pub struct SharedDocument {
    inner: Arc<Mutex<Document>>,
}

impl SharedDocument {
    pub fn new(document: Document) -> Self {
        Self {
            inner: Arc::new(Mutex::new(document)),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&self.lock())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Document) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(document: &mut Document, parent: NodeId, tag: &str) -> NodeId {
        let node = document.create_element(tag);
        document.append_child(parent, node).unwrap();
        node
    }

    #[test]
    fn set_text_replaces_children() {
        let mut document = Document::new();
        let root = document.root();
        let div = element(&mut document, root, "div");
        let span = element(&mut document, div, "span");
        document.set_text(span, "Size").unwrap();
        assert_eq!(document.text_content(div), "Size");

        document.set_text(div, "Loading").unwrap();
        assert!(document.children(div).is_empty());
        assert_eq!(document.text_content(div), "Loading");
        assert!(!document.is_connected(span));
    }

    #[test]
    fn class_helpers() {
        let mut document = Document::new();
        let div = document.create_element("div");
        document.add_class(div, "a").unwrap();
        document.add_class(div, "b").unwrap();
        document.add_class(div, "a").unwrap();
        assert_eq!(document.attribute(div, "class"), Some("a b"));
        document.remove_class(div, "a").unwrap();
        assert!(!document.has_class(div, "a"));
        assert!(document.has_class(div, "b"));
    }

    #[test]
    fn observers_only_see_insertions_under_target() {
        let mut document = Document::new();
        let root = document.root();
        let catalog = element(&mut document, root, "main");
        let sidebar = element(&mut document, root, "aside");
        let mut watch = document.observe(catalog).unwrap();

        let inside = element(&mut document, catalog, "div");
        let _outside = element(&mut document, sidebar, "div");
        let nested = element(&mut document, inside, "span");

        assert_eq!(watch.receiver.try_recv().unwrap().added, vec![inside]);
        assert_eq!(watch.receiver.try_recv().unwrap().added, vec![nested]);
        assert!(watch.receiver.try_recv().is_err());

        assert!(document.disconnect(watch.id));
        assert_eq!(document.observer_count(), 0);
    }

    #[test]
    fn meta_lookup_and_snapshot() {
        let snapshot = NodeSnapshot::from_json(
            r#"{"tag":"body","children":[
                {"tag":"meta","attributes":{"name":"csrf-token","content":"abc"}},
                {"tag":"div","attributes":{"id":"5-item"},"text":"Fries"}
            ]}"#,
        )
        .unwrap();
        let document = Document::from_snapshot(&snapshot);
        assert_eq!(document.meta_content("csrf-token"), Some("abc"));
        assert_eq!(document.snapshot(document.root()).unwrap(), snapshot);
    }

    #[test]
    fn cannot_insert_ancestor_into_descendant() {
        let mut document = Document::new();
        let root = document.root();
        let outer = element(&mut document, root, "div");
        let inner = element(&mut document, outer, "div");
        assert!(document.append_child(inner, outer).is_err());
    }
}
