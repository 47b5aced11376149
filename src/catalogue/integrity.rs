use super::{Catalogue, Destination, NodeId, NodeKind, DEFAULT_OPTIONS_SET};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum IntegrityViolation {
    KeyMismatch { key: NodeId, id: NodeId },
    IdNotBelowCounter { id: NodeId, next_id: NodeId },
    MissingParent { node: NodeId, parent: NodeId },
    NotLinkedFromParent { node: NodeId, parent: NodeId },
    DanglingChild { parent: NodeId, child: NodeId },
    ChildParentMismatch { parent: NodeId, child: NodeId },
    DuplicateChildLink { parent: NodeId, child: NodeId },
    RootHasParent { node: NodeId },
    MissingRoot { node: NodeId },
    UnlistedRoot { node: NodeId },
    ParentCycle { node: NodeId },
    VideoHasChildren { node: NodeId },
    DestinationMissing { node: NodeId, target: NodeId },
    DestinationCycle { node: NodeId, target: NodeId },
    DuplicateSourceItem { item_id: String, nodes: Vec<NodeId> },
    DuplicateSiblingName { parent: Option<NodeId>, name: String },
    UnknownOptionsSet { node: NodeId, name: String },
    MissingDefaultOptions,
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityViolation::KeyMismatch { key, id } => {
                write!(f, "node stored under key {key} carries id {id}")
            }
            IntegrityViolation::IdNotBelowCounter { id, next_id } => {
                write!(f, "node id {id} is not below the id counter {next_id}")
            }
            IntegrityViolation::MissingParent { node, parent } => {
                write!(f, "node {node} points at missing parent {parent}")
            }
            IntegrityViolation::NotLinkedFromParent { node, parent } => {
                write!(f, "node {node} is not listed among the children of {parent}")
            }
            IntegrityViolation::DanglingChild { parent, child } => {
                write!(f, "node {parent} lists missing child {child}")
            }
            IntegrityViolation::ChildParentMismatch { parent, child } => {
                write!(f, "node {parent} lists child {child} whose parent is elsewhere")
            }
            IntegrityViolation::DuplicateChildLink { parent, child } => {
                write!(f, "node {parent} lists child {child} more than once")
            }
            IntegrityViolation::RootHasParent { node } => {
                write!(f, "root entry {node} has a parent")
            }
            IntegrityViolation::MissingRoot { node } => {
                write!(f, "root list names missing node {node}")
            }
            IntegrityViolation::UnlistedRoot { node } => {
                write!(f, "parentless node {node} is missing from the root list")
            }
            IntegrityViolation::ParentCycle { node } => {
                write!(f, "parent chain of node {node} loops")
            }
            IntegrityViolation::VideoHasChildren { node } => {
                write!(f, "video {node} has children")
            }
            IntegrityViolation::DestinationMissing { node, target } => {
                write!(f, "destination of node {node} points at missing node {target}")
            }
            IntegrityViolation::DestinationCycle { node, target } => {
                write!(f, "destination of node {node} points at its own subtree ({target})")
            }
            IntegrityViolation::DuplicateSourceItem { item_id, nodes } => {
                write!(f, "source item {item_id} is held by nodes {nodes:?}")
            }
            IntegrityViolation::DuplicateSiblingName { parent, name } => {
                write!(f, "name {name:?} is used twice under {parent:?}")
            }
            IntegrityViolation::UnknownOptionsSet { node, name } => {
                write!(f, "node {node} uses unknown options set {name}")
            }
            IntegrityViolation::MissingDefaultOptions => write!(f, "default options set is missing"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub fixed: Vec<IntegrityViolation>,
    /// Problems repair leaves for the user because fixing them would drop data.
    pub remaining: Vec<IntegrityViolation>,
}

impl Catalogue {
    /// Structural validation of the whole tree. Read-only.
    pub fn integrity_violations(&self) -> Vec<IntegrityViolation> {
        let mut out = Vec::new();

        if !self.options.contains_key(DEFAULT_OPTIONS_SET) {
            out.push(IntegrityViolation::MissingDefaultOptions);
        }

        let root_set: HashSet<NodeId> = self.roots.iter().copied().collect();
        for root in &self.roots {
            match self.nodes.get(root) {
                Some(node) if node.parent.is_some() => {
                    out.push(IntegrityViolation::RootHasParent { node: *root })
                }
                Some(_) => {}
                None => out.push(IntegrityViolation::MissingRoot { node: *root }),
            }
        }

        let mut by_item: HashMap<&str, Vec<NodeId>> = HashMap::new();
        for (key, node) in &self.nodes {
            if *key != node.id {
                out.push(IntegrityViolation::KeyMismatch { key: *key, id: node.id });
            }
            if node.id >= self.next_id {
                out.push(IntegrityViolation::IdNotBelowCounter {
                    id: node.id,
                    next_id: self.next_id,
                });
            }

            match node.parent {
                Some(parent) => match self.nodes.get(&parent) {
                    Some(parent_node) => {
                        if !parent_node.children.contains(&node.id) {
                            out.push(IntegrityViolation::NotLinkedFromParent {
                                node: node.id,
                                parent,
                            });
                        }
                    }
                    None => out.push(IntegrityViolation::MissingParent {
                        node: node.id,
                        parent,
                    }),
                },
                None => {
                    if !root_set.contains(&node.id) {
                        out.push(IntegrityViolation::UnlistedRoot { node: node.id });
                    }
                }
            }

            if self.parent_chain_loops(node.id) {
                out.push(IntegrityViolation::ParentCycle { node: node.id });
            }

            if node.kind == NodeKind::Video && !node.children.is_empty() {
                out.push(IntegrityViolation::VideoHasChildren { node: node.id });
            }

            let mut seen_children = HashSet::new();
            for child in &node.children {
                if !seen_children.insert(*child) {
                    out.push(IntegrityViolation::DuplicateChildLink {
                        parent: node.id,
                        child: *child,
                    });
                    continue;
                }
                match self.nodes.get(child) {
                    Some(child_node) if child_node.parent != Some(node.id) => {
                        out.push(IntegrityViolation::ChildParentMismatch {
                            parent: node.id,
                            child: *child,
                        })
                    }
                    Some(_) => {}
                    None => out.push(IntegrityViolation::DanglingChild {
                        parent: node.id,
                        child: *child,
                    }),
                }
            }

            if let Destination::Node(target) = node.destination {
                if !self.nodes.contains_key(&target) {
                    out.push(IntegrityViolation::DestinationMissing {
                        node: node.id,
                        target,
                    });
                } else if self.destination_passes_through(target, node.id) {
                    out.push(IntegrityViolation::DestinationCycle {
                        node: node.id,
                        target,
                    });
                }
            }

            if let Some(name) = node.options_set.as_deref() {
                if !self.options.contains_key(name) {
                    out.push(IntegrityViolation::UnknownOptionsSet {
                        node: node.id,
                        name: name.to_string(),
                    });
                }
            }

            if let Some(item_id) = node.source_item_id.as_deref() {
                by_item.entry(item_id).or_default().push(node.id);
            }
        }

        let mut duplicates: Vec<(&str, Vec<NodeId>)> =
            by_item.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
        duplicates.sort();
        for (item_id, nodes) in duplicates {
            out.push(IntegrityViolation::DuplicateSourceItem {
                item_id: item_id.to_string(),
                nodes,
            });
        }

        let mut groups: Vec<(Option<NodeId>, Vec<NodeId>)> = vec![(None, self.roots.clone())];
        for node in self.nodes.values() {
            groups.push((Some(node.id), node.children.clone()));
        }
        for (parent, children) in groups {
            let mut names = HashSet::new();
            for child in children {
                let Some(child_node) = self.nodes.get(&child) else {
                    continue;
                };
                if !child_node.kind.is_container() {
                    continue;
                }
                if !names.insert(child_node.name.to_ascii_lowercase()) {
                    out.push(IntegrityViolation::DuplicateSiblingName {
                        parent,
                        name: child_node.name.clone(),
                    });
                }
            }
        }

        out
    }

    fn parent_chain_loops(&self, id: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            if !seen.insert(node_id) {
                return true;
            }
            current = self.nodes.get(&node_id).and_then(|n| n.parent);
        }
        false
    }

    /// Fixes structural damage without deleting any node.
    pub fn repair(&mut self) -> RepairReport {
        let before = self.integrity_violations();
        if before.is_empty() {
            return RepairReport::default();
        }

        self.ensure_default_options();

        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for key in &ids {
            if let Some(node) = self.nodes.get_mut(key) {
                node.id = *key;
            }
        }
        if let Some(max) = ids.iter().max() {
            self.next_id = self.next_id.max(max + 1);
        }

        // Break parent loops and re-root orphans.
        for id in &ids {
            let orphan = match self.nodes.get(id).and_then(|n| n.parent) {
                Some(parent) => !self.nodes.contains_key(&parent) || self.parent_chain_loops(*id),
                None => false,
            };
            if orphan {
                if let Some(node) = self.nodes.get_mut(id) {
                    node.parent = None;
                }
            }
        }

        // Rebuild child lists from parent links, keeping the existing order where possible.
        let mut rebuilt: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in &ids {
            let existing = self.nodes.get(id).map(|n| n.children.clone()).unwrap_or_default();
            let mut children: Vec<NodeId> = Vec::new();
            for child in existing {
                let valid = self.nodes.get(&child).is_some_and(|c| c.parent == Some(*id));
                if valid && !children.contains(&child) {
                    children.push(child);
                }
            }
            rebuilt.insert(*id, children);
        }
        for id in &ids {
            if let Some(parent) = self.nodes.get(id).and_then(|n| n.parent) {
                let list = rebuilt.entry(parent).or_default();
                if !list.contains(id) {
                    list.push(*id);
                }
            }
        }
        // Video children move up to the video's own parent.
        for id in &ids {
            let is_video = self.nodes.get(id).is_some_and(|n| n.kind == NodeKind::Video);
            if !is_video {
                continue;
            }
            let stray = rebuilt.insert(*id, Vec::new()).unwrap_or_default();
            if stray.is_empty() {
                continue;
            }
            let new_parent = self.nodes.get(id).and_then(|n| n.parent);
            for child in stray {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.parent = new_parent;
                }
                if let Some(parent) = new_parent {
                    rebuilt.entry(parent).or_default().push(child);
                }
            }
        }
        for (id, children) in rebuilt {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.children = children;
            }
        }

        let mut roots: Vec<NodeId> = Vec::new();
        for root in self.roots.clone() {
            if self.nodes.get(&root).is_some_and(|n| n.parent.is_none()) && !roots.contains(&root) {
                roots.push(root);
            }
        }
        for id in &ids {
            if self.nodes.get(id).is_some_and(|n| n.parent.is_none()) && !roots.contains(id) {
                roots.push(*id);
            }
        }
        self.roots = roots;

        for id in &ids {
            let reset = match self.nodes.get(id).map(|n| n.destination.clone()) {
                Some(Destination::Node(target)) => {
                    !self.nodes.contains_key(&target) || self.destination_passes_through(target, *id)
                }
                _ => false,
            };
            let unknown_options = self
                .nodes
                .get(id)
                .and_then(|n| n.options_set.as_deref())
                .is_some_and(|name| !self.options.contains_key(name));
            if let Some(node) = self.nodes.get_mut(id) {
                if reset {
                    node.destination = Destination::SameAsParent;
                }
                if unknown_options {
                    node.options_set = None;
                }
            }
        }

        let after = self.integrity_violations();
        let fixed = before.into_iter().filter(|v| !after.contains(v)).collect();
        RepairReport {
            fixed,
            remaining: after,
        }
    }
}
