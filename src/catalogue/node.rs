use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Video,
    Channel,
    Playlist,
    Folder,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Video => "video",
            NodeKind::Channel => "channel",
            NodeKind::Playlist => "playlist",
            NodeKind::Folder => "folder",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "video" => Some(NodeKind::Video),
            "channel" => Some(NodeKind::Channel),
            "playlist" => Some(NodeKind::Playlist),
            "folder" => Some(NodeKind::Folder),
            _ => None,
        }
    }

    /// Channels, playlists and folders hold children; videos never do.
    pub fn is_container(&self) -> bool {
        !matches!(self, NodeKind::Video)
    }

    pub fn has_source(&self) -> bool {
        !matches!(self, NodeKind::Folder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Destination {
    #[default]
    SameAsParent,
    Node(NodeId),
    Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LivestreamState {
    #[default]
    NotLivestream,
    Waiting,
    LiveNow,
    Finished,
}

impl LivestreamState {
    pub fn is_pending(&self) -> bool {
        matches!(self, LivestreamState::Waiting | LivestreamState::LiveNow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    NotDownloaded,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeFlags {
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default)]
    pub favourite: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub missing: bool,
    #[serde(default)]
    pub blocked: bool,
    /// Set when the last job for this node failed for good.
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ItemMetadata {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub upload_date: Option<String>,
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub destination: Destination,
    pub source_url: Option<String>,
    pub source_item_id: Option<String>,
    #[serde(default)]
    pub flags: NodeFlags,
    #[serde(default)]
    pub livestream: LivestreamState,
    pub livestream_scheduled_at_ms: Option<i64>,
    #[serde(default)]
    pub download_state: DownloadState,
    pub media_path: Option<PathBuf>,
    pub options_set: Option<String>,
    #[serde(default)]
    pub metadata: ItemMetadata,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub last_checked_at_ms: Option<i64>,
    pub downloaded_at_ms: Option<i64>,
}

impl CatalogueNode {
    pub(crate) fn new(id: NodeId, kind: NodeKind, name: String, now_ms: i64) -> Self {
        Self {
            id,
            kind,
            name,
            parent: None,
            children: Vec::new(),
            destination: Destination::SameAsParent,
            source_url: None,
            source_item_id: None,
            flags: NodeFlags::default(),
            livestream: LivestreamState::NotLivestream,
            livestream_scheduled_at_ms: None,
            download_state: DownloadState::NotDownloaded,
            media_path: None,
            options_set: None,
            metadata: ItemMetadata::default(),
            last_error: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            last_checked_at_ms: None,
            downloaded_at_ms: None,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.download_state == DownloadState::Downloaded
    }
}

/// One upstream item reported by a downloader while listing a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DiscoveredItem {
    pub item_id: String,
    pub url: Option<String>,
    pub metadata: ItemMetadata,
    pub livestream: Option<LivestreamState>,
    pub scheduled_at_ms: Option<i64>,
    pub media_path: Option<PathBuf>,
}
