//! Item identity and request parameters.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Key of a virtual item: an opaque caller-supplied id plus the identity of
/// the list that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualKey {
    pub owner: u64,
    pub id: String,
}

impl VirtualKey {
    pub fn new(owner: u64, id: impl Into<String>) -> Self {
        Self {
            owner,
            id: id.into(),
        }
    }
}

/// Identity of a cached item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    /// A file on disk.
    Path(PathBuf),
    /// An item resolved through the decoder's virtual-key path.
    Virtual(VirtualKey),
}

impl ItemKey {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        ItemKey::Path(path.into())
    }

    pub fn virtual_item(owner: u64, id: impl Into<String>) -> Self {
        ItemKey::Virtual(VirtualKey::new(owner, id))
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, ItemKey::Virtual(_))
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            ItemKey::Path(p) => Some(p),
            ItemKey::Virtual(_) => None,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKey::Path(p) => write!(f, "{}", p.display()),
            ItemKey::Virtual(v) => write!(f, "virtual:{}/{}", v.owner, v.id),
        }
    }
}

/// Target thumbnail dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct ThumbSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ThumbSize {
    fn default() -> Self {
        Self::new(96, 96)
    }
}

impl fmt::Display for ThumbSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Whether a cheap embedded thumbnail may stand in for a full decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddedPolicy {
    /// Use the embedded thumbnail only when it is large enough for the request.
    #[default]
    Auto,
    /// Prefer the embedded thumbnail whenever the file carries one.
    Always,
    /// Always decode the full image.
    Never,
}
