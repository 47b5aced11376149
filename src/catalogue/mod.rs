//! The in-memory catalogue tree and the single serialization point that guards it.

mod integrity;
mod node;
mod options;

pub use integrity::{IntegrityViolation, RepairReport};
pub use node::{
    CatalogueNode, Destination, DiscoveredItem, DownloadState, ItemMetadata, LivestreamState,
    NodeFlags, NodeId, NodeKind,
};
pub use options::{OptionValue, OptionsSet, ResolvedOptions, DEFAULT_OPTIONS_SET};

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CATALOGUE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredCatalogue")]
pub struct Catalogue {
    pub schema_version: u32,
    next_id: NodeId,
    #[serde(default)]
    roots: Vec<NodeId>,
    #[serde(default)]
    nodes: BTreeMap<NodeId, CatalogueNode>,
    #[serde(default)]
    options: BTreeMap<String, OptionsSet>,
    /// Upstream item id to its node. Derived from `nodes` on load.
    #[serde(skip)]
    item_index: HashMap<String, NodeId>,
}

#[derive(Deserialize)]
struct StoredCatalogue {
    schema_version: u32,
    next_id: NodeId,
    #[serde(default)]
    roots: Vec<NodeId>,
    #[serde(default)]
    nodes: BTreeMap<NodeId, CatalogueNode>,
    #[serde(default)]
    options: BTreeMap<String, OptionsSet>,
}

impl From<StoredCatalogue> for Catalogue {
    fn from(stored: StoredCatalogue) -> Self {
        let mut catalogue = Catalogue {
            schema_version: stored.schema_version,
            next_id: stored.next_id,
            roots: stored.roots,
            nodes: stored.nodes,
            options: stored.options,
            item_index: HashMap::new(),
        };
        catalogue.rebuild_item_index();
        catalogue
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub kind: NodeKind,
    pub name: String,
    pub parent: Option<NodeId>,
    pub source_url: Option<String>,
}

/// A change to the tree recorded by a job and applied at commit time.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    UpsertItem { parent: NodeId, item: DiscoveredItem },
    MarkChecked { node: NodeId },
    MarkDownloaded { node: NodeId, media_path: Option<PathBuf> },
    MarkFailed { node: NodeId, error: String },
    ClearFailure { node: NodeId },
    SetLivestream {
        node: NodeId,
        state: LivestreamState,
        scheduled_at_ms: Option<i64>,
    },
    SetMissing { node: NodeId, missing: bool },
    Delete { node: NodeId },
}

impl Mutation {
    pub fn node(&self) -> NodeId {
        match self {
            Mutation::UpsertItem { parent, .. } => *parent,
            Mutation::MarkChecked { node }
            | Mutation::MarkDownloaded { node, .. }
            | Mutation::MarkFailed { node, .. }
            | Mutation::ClearFailure { node }
            | Mutation::SetLivestream { node, .. }
            | Mutation::SetMissing { node, .. }
            | Mutation::Delete { node } => *node,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MutationBatch {
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn extend(&mut self, mutations: impl IntoIterator<Item = Mutation>) {
        self.mutations.extend(mutations);
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.mutations.iter()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionPolicy {
    pub max_age_days: Option<u32>,
    pub max_items_per_container: Option<usize>,
}

impl Default for Catalogue {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalogue {
    pub fn new() -> Self {
        let mut options = BTreeMap::new();
        options.insert(
            DEFAULT_OPTIONS_SET.to_string(),
            OptionsSet::new(DEFAULT_OPTIONS_SET),
        );
        Self {
            schema_version: CATALOGUE_SCHEMA_VERSION,
            next_id: 1,
            roots: Vec::new(),
            nodes: BTreeMap::new(),
            options,
            item_index: HashMap::new(),
        }
    }

    // Duplicates keep the lowest id, matching a scan in id order.
    fn rebuild_item_index(&mut self) {
        self.item_index.clear();
        for node in self.nodes.values() {
            if let Some(item_id) = node.source_item_id.as_deref() {
                self.item_index.entry(item_id.to_string()).or_insert(node.id);
            }
        }
    }

    fn unindex_item(&mut self, item_id: &str, node: NodeId) {
        if self.item_index.get(item_id) != Some(&node) {
            return;
        }
        self.item_index.remove(item_id);
        // A duplicate left over from an older file takes the slot.
        if let Some(other) = self
            .nodes
            .values()
            .find(|n| n.source_item_id.as_deref() == Some(item_id))
        {
            self.item_index.insert(item_id.to_string(), other.id);
        }
    }

    /// Older files may predate the default options set.
    pub(crate) fn ensure_default_options(&mut self) {
        if !self.options.contains_key(DEFAULT_OPTIONS_SET) {
            self.options.insert(
                DEFAULT_OPTIONS_SET.to_string(),
                OptionsSet::new(DEFAULT_OPTIONS_SET),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn options_set_count(&self) -> usize {
        self.options.len()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn node(&self, id: NodeId) -> Option<&CatalogueNode> {
        self.nodes.get(&id)
    }

    pub fn require(&self, id: NodeId) -> Result<&CatalogueNode> {
        self.nodes.get(&id).ok_or(EngineError::UnknownNode(id))
    }

    pub(crate) fn require_mut(&mut self, id: NodeId) -> Result<&mut CatalogueNode> {
        self.nodes.get_mut(&id).ok_or(EngineError::UnknownNode(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CatalogueNode> {
        self.nodes.values()
    }

    pub fn children(&self, id: NodeId) -> Vec<&CatalogueNode> {
        match self.nodes.get(&id) {
            Some(node) => node
                .children
                .iter()
                .filter_map(|child| self.nodes.get(child))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn add_node(&mut self, req: NewNode) -> Result<NodeId> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidEdit("node name is empty".to_string()));
        }
        if req.kind == NodeKind::Folder && req.source_url.is_some() {
            return Err(EngineError::InvalidEdit(
                "folders do not have a source URL".to_string(),
            ));
        }
        if let Some(parent) = req.parent {
            let parent_node = self.require(parent)?;
            if !parent_node.kind.is_container() {
                return Err(EngineError::InvalidEdit(format!(
                    "node {parent} is a video and cannot hold children"
                )));
            }
        }
        if req.kind.is_container() && self.sibling_name_taken(req.parent, &name, None) {
            return Err(EngineError::DuplicateName {
                parent: req.parent,
                name,
            });
        }

        let id = self.allocate_id();
        let mut node = CatalogueNode::new(id, req.kind, name, now_ms());
        node.parent = req.parent;
        node.source_url = req
            .source_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty());
        self.nodes.insert(id, node);
        self.link_child(req.parent, id);
        Ok(id)
    }

    pub fn rename_node(&mut self, id: NodeId, name: &str) -> Result<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::InvalidEdit("node name is empty".to_string()));
        }
        let node = self.require(id)?;
        let (kind, parent) = (node.kind, node.parent);
        if kind.is_container() && self.sibling_name_taken(parent, &name, Some(id)) {
            return Err(EngineError::DuplicateName { parent, name });
        }
        let node = self.require_mut(id)?;
        node.name = name;
        node.updated_at_ms = now_ms();
        Ok(())
    }

    /// Rejects overrides whose target resolves back through the node, whether
    /// through parents, further overrides or both.
    pub fn set_destination(&mut self, id: NodeId, destination: Destination) -> Result<()> {
        self.require(id)?;
        if let Destination::Node(target) = &destination {
            let target = *target;
            let target_node = self.require(target)?;
            if !target_node.kind.is_container() {
                return Err(EngineError::InvalidEdit(format!(
                    "destination node {target} is a video"
                )));
            }
            if self.destination_passes_through(target, id) {
                return Err(EngineError::DestinationCycle { node: id, target });
            }
        }
        let node = self.require_mut(id)?;
        node.destination = destination;
        node.updated_at_ms = now_ms();
        Ok(())
    }

    pub fn set_flags(&mut self, id: NodeId, edit: impl FnOnce(&mut NodeFlags)) -> Result<()> {
        let node = self.require_mut(id)?;
        edit(&mut node.flags);
        node.updated_at_ms = now_ms();
        Ok(())
    }

    pub fn set_node_options(&mut self, id: NodeId, set_name: Option<&str>) -> Result<()> {
        if let Some(name) = set_name {
            if !self.options.contains_key(name) {
                return Err(EngineError::UnknownOptionsSet(name.to_string()));
            }
        }
        let node = self.require_mut(id)?;
        node.options_set = set_name.map(str::to_string);
        node.updated_at_ms = now_ms();
        Ok(())
    }

    /// True when `candidate` is `ancestor` or sits somewhere below it.
    pub fn is_self_or_descendant(&self, candidate: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(candidate);
        let mut hops = 0_usize;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.nodes.len() {
                return false;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.nodes.get(&id).and_then(|n| n.parent);
        while let Some(parent) = current {
            if out.contains(&parent) || out.len() > self.nodes.len() {
                break;
            }
            out.push(parent);
            current = self.nodes.get(&parent).and_then(|n| n.parent);
        }
        out
    }

    /// Directory that downloads for `id` land in, following overrides.
    pub fn destination_dir(&self, id: NodeId, downloads_root: &Path) -> Result<PathBuf> {
        let mut seen = HashSet::new();
        let mut current = Some(id);
        while let Some(step) = current {
            if !seen.insert(step) {
                return Err(EngineError::DestinationCycle { node: id, target: step });
            }
            current = self.destination_step(step);
        }
        Ok(self.destination_dir_inner(id, downloads_root))
    }

    /// The node whose directory `id` resolves through: its override target,
    /// else its parent. `None` at a fixed path or a root.
    fn destination_step(&self, id: NodeId) -> Option<NodeId> {
        let node = self.nodes.get(&id)?;
        match &node.destination {
            Destination::Path(_) => None,
            Destination::Node(target) => Some(*target),
            Destination::SameAsParent => node.parent,
        }
    }

    /// True when resolving `from` reaches `id` or never terminates.
    pub(crate) fn destination_passes_through(&self, from: NodeId, id: NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(from);
        while let Some(step) = current {
            if step == id || !seen.insert(step) {
                return true;
            }
            current = self.destination_step(step);
        }
        false
    }

    // Callers have already ruled out loops.
    fn destination_dir_inner(&self, id: NodeId, root: &Path) -> PathBuf {
        let Some(node) = self.nodes.get(&id) else {
            return root.to_path_buf();
        };
        match &node.destination {
            Destination::Path(path) => path.clone(),
            Destination::Node(target) => self.destination_dir_inner(*target, root),
            Destination::SameAsParent => {
                let parent_dir = match node.parent {
                    Some(parent) => self.destination_dir_inner(parent, root),
                    None => root.to_path_buf(),
                };
                if node.kind.is_container() {
                    parent_dir.join(sanitize_dir_name(&node.name))
                } else {
                    parent_dir
                }
            }
        }
    }

    pub fn find_item(&self, item_id: &str) -> Option<NodeId> {
        let item_id = item_id.trim();
        if item_id.is_empty() {
            return None;
        }
        self.item_index.get(item_id).copied()
    }

    /// Creates or updates the node for an upstream item; returns `(id, already_known)`.
    pub fn upsert_item(&mut self, parent: NodeId, item: &DiscoveredItem) -> Result<(NodeId, bool)> {
        let item_id = item.item_id.trim();
        if item_id.is_empty() {
            return Err(EngineError::InvalidEdit(
                "discovered item has no id".to_string(),
            ));
        }
        let now = now_ms();

        if let Some(existing) = self.find_item(item_id) {
            let node = self.require_mut(existing)?;
            merge_item(node, item, now);
            return Ok((existing, true));
        }

        let parent_node = self.require(parent)?;
        if parent_node.kind == NodeKind::Video {
            // The job target was a single video: the item is the target itself.
            let node = self.require_mut(parent)?;
            let previous = node.source_item_id.replace(item_id.to_string());
            merge_item(node, item, now);
            if let Some(previous) = previous {
                self.unindex_item(&previous, parent);
            }
            self.item_index.insert(item_id.to_string(), parent);
            return Ok((parent, false));
        }

        let id = self.allocate_id();
        let name = item
            .metadata
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(item_id)
            .to_string();
        let mut node = CatalogueNode::new(id, NodeKind::Video, name, now);
        node.parent = Some(parent);
        node.source_item_id = Some(item_id.to_string());
        merge_item(&mut node, item, now);
        self.nodes.insert(id, node);
        self.item_index.insert(item_id.to_string(), id);
        self.link_child(Some(parent), id);
        Ok((id, false))
    }

    /// Removes a node and its whole subtree; returns the removed ids.
    pub fn delete_node(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        let parent = self.require(id)?.parent;
        let mut removed = Vec::new();
        let mut removed_items = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.iter().copied());
                if let Some(item_id) = node.source_item_id {
                    removed_items.push((item_id, current));
                }
                removed.push(current);
            }
        }
        for (item_id, node) in removed_items {
            self.unindex_item(&item_id, node);
        }
        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(parent_node) => parent_node.children.retain(|c| *c != id),
            None => self.roots.retain(|r| *r != id),
        }
        for node in self.nodes.values_mut() {
            if let Destination::Node(target) = node.destination {
                if removed.contains(&target) {
                    node.destination = Destination::SameAsParent;
                }
            }
        }
        Ok(removed)
    }

    pub fn options_set(&self, name: &str) -> Option<&OptionsSet> {
        self.options.get(name)
    }

    pub fn options_sets(&self) -> impl Iterator<Item = &OptionsSet> {
        self.options.values()
    }

    /// Inserts a brand-new set; existing names must go through `edit_options`.
    pub fn add_options_set(&mut self, set: OptionsSet) -> Result<()> {
        if set.name.trim().is_empty() {
            return Err(EngineError::InvalidEdit("options set name is empty".to_string()));
        }
        if self.options.contains_key(&set.name) {
            return Err(EngineError::InvalidEdit(format!(
                "options set {} already exists",
                set.name
            )));
        }
        self.options.insert(set.name.clone(), set);
        Ok(())
    }

    /// Copy-on-write edit: stores a new version of the set and returns it.
    pub fn edit_options(
        &mut self,
        name: &str,
        edit: impl FnOnce(&mut BTreeMap<String, OptionValue>),
    ) -> Result<u32> {
        let current = self
            .options
            .get(name)
            .ok_or_else(|| EngineError::UnknownOptionsSet(name.to_string()))?;
        let mut next = current.clone();
        edit(&mut next.values);
        next.version = current.version + 1;
        let version = next.version;
        self.options.insert(name.to_string(), next);
        Ok(version)
    }

    /// Merges the default set, every ancestor's set (root first) and the node's own set.
    pub fn resolve_options(&self, id: NodeId) -> Result<ResolvedOptions> {
        self.require(id)?;
        let mut chain: Vec<NodeId> = self.ancestors(id);
        chain.reverse();
        chain.push(id);

        let mut layers: Vec<&OptionsSet> = Vec::new();
        if let Some(default) = self.options.get(DEFAULT_OPTIONS_SET) {
            layers.push(default);
        }
        for node_id in chain {
            let Some(name) = self.nodes.get(&node_id).and_then(|n| n.options_set.as_deref()) else {
                continue;
            };
            if name == DEFAULT_OPTIONS_SET {
                continue;
            }
            let set = self
                .options
                .get(name)
                .ok_or_else(|| EngineError::UnknownOptionsSet(name.to_string()))?;
            layers.push(set);
        }
        Ok(ResolvedOptions::from_layers(layers))
    }

    pub fn default_options(&self) -> ResolvedOptions {
        ResolvedOptions::from_layers(self.options.get(DEFAULT_OPTIONS_SET))
    }

    /// Channels, playlists and videos reachable from `id`, expanding folders.
    pub fn job_targets_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.collect_job_targets(id, &mut out, &mut seen);
        out
    }

    fn collect_job_targets(&self, id: NodeId, out: &mut Vec<NodeId>, seen: &mut HashSet<NodeId>) {
        if !seen.insert(id) {
            return;
        }
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.kind == NodeKind::Folder {
            for child in &node.children {
                self.collect_job_targets(*child, out, seen);
            }
        } else {
            out.push(id);
        }
    }

    /// Videos under `id` (inclusive), descending into every container.
    pub fn videos_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if node.kind == NodeKind::Video {
                out.push(current);
            } else {
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    pub fn pending_livestreams(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.kind == NodeKind::Video && n.livestream.is_pending())
            .map(|n| n.id)
            .collect()
    }

    /// Videos below `container` that the retention policy would remove.
    pub fn retention_candidates(&self, container: NodeId, policy: &RetentionPolicy, now_ms: i64) -> Vec<NodeId> {
        let mut videos: Vec<&CatalogueNode> = self
            .children(container)
            .into_iter()
            .filter(|n| n.kind == NodeKind::Video && n.is_downloaded() && !n.flags.archived)
            .collect();
        let mut out: Vec<NodeId> = Vec::new();

        if let Some(days) = policy.max_age_days {
            let cutoff = now_ms - i64::from(days) * 24 * 60 * 60 * 1000;
            for video in &videos {
                let stamp = video.downloaded_at_ms.unwrap_or(video.created_at_ms);
                if stamp < cutoff {
                    out.push(video.id);
                }
            }
        }

        if let Some(max_items) = policy.max_items_per_container {
            videos.sort_by_key(|v| std::cmp::Reverse(v.downloaded_at_ms.unwrap_or(v.created_at_ms)));
            for video in videos.iter().skip(max_items) {
                if !out.contains(&video.id) {
                    out.push(video.id);
                }
            }
        }
        out
    }

    /// Applies one mutation; returns the ids whose state changed.
    ///
    /// Mutations that reference nodes deleted in the meantime are dropped.
    pub fn apply(&mut self, mutation: &Mutation) -> Vec<NodeId> {
        let now = now_ms();
        let node_id = mutation.node();
        if !self.nodes.contains_key(&node_id) {
            tracing::warn!(node_id, "dropping mutation for a node that no longer exists");
            return Vec::new();
        }

        match mutation {
            Mutation::UpsertItem { parent, item } => match self.upsert_item(*parent, item) {
                Ok((id, _)) => vec![id],
                Err(err) => {
                    tracing::warn!(node_id = parent, error = %err, "discovered item rejected");
                    Vec::new()
                }
            },
            Mutation::Delete { node } => self.delete_node(*node).unwrap_or_default(),
            other => {
                let Some(node) = self.nodes.get_mut(&node_id) else {
                    return Vec::new();
                };
                match other {
                    Mutation::MarkChecked { .. } => {
                        node.last_checked_at_ms = Some(now);
                    }
                    Mutation::MarkDownloaded { media_path, .. } => {
                        node.download_state = DownloadState::Downloaded;
                        node.downloaded_at_ms = Some(now);
                        node.last_checked_at_ms = Some(now);
                        node.flags.missing = false;
                        if media_path.is_some() {
                            node.media_path = media_path.clone();
                        }
                    }
                    Mutation::MarkFailed { error, .. } => {
                        node.flags.failed = true;
                        node.last_error = Some(error.clone());
                    }
                    Mutation::ClearFailure { .. } => {
                        node.flags.failed = false;
                        node.last_error = None;
                    }
                    Mutation::SetLivestream {
                        state,
                        scheduled_at_ms,
                        ..
                    } => {
                        node.livestream = *state;
                        if scheduled_at_ms.is_some() {
                            node.livestream_scheduled_at_ms = *scheduled_at_ms;
                        }
                    }
                    Mutation::SetMissing { missing, .. } => {
                        node.flags.missing = *missing;
                    }
                    Mutation::UpsertItem { .. } | Mutation::Delete { .. } => {}
                }
                node.updated_at_ms = now;
                vec![node_id]
            }
        }
    }

    pub fn apply_batch(&mut self, batch: &MutationBatch) -> Vec<NodeId> {
        let mut touched: Vec<NodeId> = Vec::new();
        for mutation in batch.iter() {
            for id in self.apply(mutation) {
                if !touched.contains(&id) {
                    touched.push(id);
                }
            }
        }
        touched
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = self.next_id.max(self.nodes.keys().next_back().map_or(1, |k| k + 1));
        self.next_id = id + 1;
        id
    }

    fn link_child(&mut self, parent: Option<NodeId>, id: NodeId) {
        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(parent_node) => parent_node.children.push(id),
            None => self.roots.push(id),
        }
    }

    fn sibling_name_taken(&self, parent: Option<NodeId>, name: &str, except: Option<NodeId>) -> bool {
        let siblings: Vec<NodeId> = match parent {
            Some(p) => self.nodes.get(&p).map(|n| n.children.clone()).unwrap_or_default(),
            None => self.roots.clone(),
        };
        siblings.iter().filter(|id| Some(**id) != except).any(|id| {
            self.nodes
                .get(id)
                .is_some_and(|n| n.kind.is_container() && n.name.eq_ignore_ascii_case(name))
        })
    }
}

fn merge_item(node: &mut CatalogueNode, item: &DiscoveredItem, now: i64) {
    let meta = &item.metadata;
    if meta.title.is_some() {
        node.metadata.title = meta.title.clone();
    }
    if meta.uploader.is_some() {
        node.metadata.uploader = meta.uploader.clone();
    }
    if meta.upload_date.is_some() {
        node.metadata.upload_date = meta.upload_date.clone();
    }
    if meta.duration_secs.is_some() {
        node.metadata.duration_secs = meta.duration_secs;
    }
    if node.source_url.is_none() {
        node.source_url = item.url.clone();
    }
    if let Some(state) = item.livestream {
        node.livestream = state;
    }
    if item.scheduled_at_ms.is_some() {
        node.livestream_scheduled_at_ms = item.scheduled_at_ms;
    }
    if let Some(path) = &item.media_path {
        node.media_path = Some(path.clone());
        node.download_state = DownloadState::Downloaded;
        node.flags.missing = false;
        if node.downloaded_at_ms.is_none() {
            node.downloaded_at_ms = Some(now);
        }
    }
    node.updated_at_ms = now;
}

fn sanitize_dir_name(input: &str) -> String {
    let cleaned: String = input
        .trim()
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').trim().to_string();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// The one place catalogue state may be read or changed from any thread.
#[derive(Debug, Default)]
pub struct SharedCatalogue {
    inner: Mutex<Catalogue>,
}

impl SharedCatalogue {
    pub fn new(catalogue: Catalogue) -> Self {
        Self {
            inner: Mutex::new(catalogue),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Catalogue> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn read<R>(&self, f: impl FnOnce(&Catalogue) -> R) -> R {
        f(&self.lock())
    }

    pub fn mutate<R>(&self, f: impl FnOnce(&mut Catalogue) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Catalogue {
        self.lock().clone()
    }

    pub(crate) fn replace(&self, catalogue: Catalogue) {
        *self.lock() = catalogue;
    }
}

pub(crate) fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}
