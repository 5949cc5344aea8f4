//! Capabilities a plugin may implement, and the per-action argument
//! normalization applied before a capability is invoked.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PluginError;

/// One optional operation a plugin object may expose.
///
/// The serialized form is the name of the function the plugin defines,
/// which is also the protocol action that invokes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "search")]
    Search,
    #[serde(rename = "getMediaSource")]
    ResolveMedia,
    #[serde(rename = "getLyric")]
    Lyric,
    #[serde(rename = "getMusicInfo")]
    MusicInfo,
    #[serde(rename = "getAlbumInfo")]
    Album,
    #[serde(rename = "getMusicSheetInfo")]
    Playlist,
    #[serde(rename = "getArtistWorks")]
    ArtistWorks,
    #[serde(rename = "importMusicItem")]
    ImportItem,
    #[serde(rename = "importMusicSheet")]
    ImportSheet,
    #[serde(rename = "getTopLists")]
    TopLists,
    #[serde(rename = "getTopListDetail")]
    TopListDetail,
}

/// Shape a capability's return value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// `{isEnd, data: [...]}` with every item tagged by plugin name.
    SearchPage,
    /// Any object, or null.
    ObjectOrNull,
    /// An ordered sequence.
    Sequence,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::Search,
        Capability::ResolveMedia,
        Capability::Lyric,
        Capability::MusicInfo,
        Capability::Album,
        Capability::Playlist,
        Capability::ArtistWorks,
        Capability::ImportItem,
        Capability::ImportSheet,
        Capability::TopLists,
        Capability::TopListDetail,
    ];

    /// Name of the plugin function (and protocol action) for this capability.
    pub fn method(self) -> &'static str {
        match self {
            Capability::Search => "search",
            Capability::ResolveMedia => "getMediaSource",
            Capability::Lyric => "getLyric",
            Capability::MusicInfo => "getMusicInfo",
            Capability::Album => "getAlbumInfo",
            Capability::Playlist => "getMusicSheetInfo",
            Capability::ArtistWorks => "getArtistWorks",
            Capability::ImportItem => "importMusicItem",
            Capability::ImportSheet => "importMusicSheet",
            Capability::TopLists => "getTopLists",
            Capability::TopListDetail => "getTopListDetail",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.method() == action)
    }

    pub fn result_shape(self) -> ResultShape {
        match self {
            Capability::Search => ResultShape::SearchPage,
            Capability::ImportSheet | Capability::TopLists => ResultShape::Sequence,
            _ => ResultShape::ObjectOrNull,
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.method())
    }
}

/// Capabilities detected on a plugin at load time. Immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ─── Call normalization ─────────────────────────────────────────────────

/// A validated capability call, ready to be passed to the plugin function.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityCall {
    Search {
        keywords: String,
        page: u32,
        kind: String,
    },
    ResolveMedia {
        item: Value,
        quality: String,
    },
    Lyric {
        item: Value,
    },
    MusicInfo {
        item: Value,
    },
    Album {
        album: Value,
    },
    Playlist {
        sheet: Value,
    },
    ArtistWorks {
        artist: Value,
        page: u32,
        kind: String,
    },
    ImportItem {
        locator: String,
    },
    ImportSheet {
        locator: String,
    },
    TopLists,
    TopListDetail {
        list: Value,
        page: u32,
    },
}

const DEFAULT_KIND: &str = "music";
const DEFAULT_QUALITY: &str = "standard";

impl CapabilityCall {
    /// Build a call from a request payload, applying per-action defaults.
    pub fn from_payload(
        capability: Capability,
        payload: &Map<String, Value>,
    ) -> Result<Self, PluginError> {
        let action = capability.method();
        let call = match capability {
            Capability::Search => {
                let params = payload.get("params").unwrap_or(&Value::Null);
                match params {
                    Value::String(keywords) => CapabilityCall::Search {
                        keywords: keywords.clone(),
                        page: 1,
                        kind: DEFAULT_KIND.to_string(),
                    },
                    Value::Object(fields) => CapabilityCall::Search {
                        keywords: fields
                            .get("keywords")
                            .and_then(Value::as_str)
                            .ok_or_else(|| invalid(action, "params.keywords"))?
                            .to_string(),
                        page: page_of(fields.get("page")),
                        kind: kind_of(fields.get("type")),
                    },
                    _ => return Err(invalid(action, "params")),
                }
            }
            Capability::ResolveMedia => CapabilityCall::ResolveMedia {
                item: descriptor(payload, action, "musicItem")?,
                quality: payload
                    .get("quality")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_QUALITY)
                    .to_string(),
            },
            Capability::Lyric => CapabilityCall::Lyric {
                item: descriptor(payload, action, "musicItem")?,
            },
            Capability::MusicInfo => CapabilityCall::MusicInfo {
                item: descriptor(payload, action, "musicItem")?,
            },
            Capability::Album => CapabilityCall::Album {
                album: descriptor(payload, action, "albumInfo")?,
            },
            Capability::Playlist => CapabilityCall::Playlist {
                sheet: descriptor(payload, action, "playlistInfo")?,
            },
            Capability::ArtistWorks => CapabilityCall::ArtistWorks {
                artist: descriptor(payload, action, "artistItem")?,
                page: page_of(payload.get("page")),
                kind: kind_of(payload.get("type")),
            },
            Capability::ImportItem => CapabilityCall::ImportItem {
                locator: locator(payload, action)?,
            },
            Capability::ImportSheet => CapabilityCall::ImportSheet {
                locator: locator(payload, action)?,
            },
            Capability::TopLists => CapabilityCall::TopLists,
            Capability::TopListDetail => CapabilityCall::TopListDetail {
                list: descriptor(payload, action, "topListItem")?,
                page: page_of(payload.get("page")),
            },
        };
        Ok(call)
    }

    pub fn capability(&self) -> Capability {
        match self {
            CapabilityCall::Search { .. } => Capability::Search,
            CapabilityCall::ResolveMedia { .. } => Capability::ResolveMedia,
            CapabilityCall::Lyric { .. } => Capability::Lyric,
            CapabilityCall::MusicInfo { .. } => Capability::MusicInfo,
            CapabilityCall::Album { .. } => Capability::Album,
            CapabilityCall::Playlist { .. } => Capability::Playlist,
            CapabilityCall::ArtistWorks { .. } => Capability::ArtistWorks,
            CapabilityCall::ImportItem { .. } => Capability::ImportItem,
            CapabilityCall::ImportSheet { .. } => Capability::ImportSheet,
            CapabilityCall::TopLists => Capability::TopLists,
            CapabilityCall::TopListDetail { .. } => Capability::TopListDetail,
        }
    }

    /// Positional arguments for the plugin function.
    ///
    /// Album and playlist lookups always ask for the first page.
    pub fn into_args(self) -> Vec<Value> {
        match self {
            CapabilityCall::Search {
                keywords,
                page,
                kind,
            } => vec![keywords.into(), page.into(), kind.into()],
            CapabilityCall::ResolveMedia { item, quality } => vec![item, quality.into()],
            CapabilityCall::Lyric { item } | CapabilityCall::MusicInfo { item } => vec![item],
            CapabilityCall::Album { album } => vec![album, 1.into()],
            CapabilityCall::Playlist { sheet } => vec![sheet, 1.into()],
            CapabilityCall::ArtistWorks { artist, page, kind } => {
                vec![artist, page.into(), kind.into()]
            }
            CapabilityCall::ImportItem { locator } | CapabilityCall::ImportSheet { locator } => {
                vec![locator.into()]
            }
            CapabilityCall::TopLists => Vec::new(),
            CapabilityCall::TopListDetail { list, page } => vec![list, page.into()],
        }
    }
}

fn invalid(action: &str, field: &'static str) -> PluginError {
    PluginError::InvalidField {
        action: action.to_string(),
        field,
    }
}

fn descriptor(
    payload: &Map<String, Value>,
    action: &str,
    field: &'static str,
) -> Result<Value, PluginError> {
    match payload.get(field) {
        Some(value @ Value::Object(_)) => Ok(value.clone()),
        _ => Err(invalid(action, field)),
    }
}

fn locator(payload: &Map<String, Value>, action: &str) -> Result<String, PluginError> {
    payload
        .get("urlLike")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(action, "urlLike"))
}

/// Page numbers default to 1; numeric strings are accepted.
fn page_of(value: Option<&Value>) -> u32 {
    let page = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    page.filter(|p| *p >= 1)
        .map(|p| u32::try_from(p).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

fn kind_of(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_KIND)
        .to_string()
}
