//! Library model returned by a [`MediaCatalog`](crate::plugins::registry::MediaCatalog).

use crate::core::model::Category;
use serde::{Deserialize, Serialize};

/// A library section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    #[serde(default)]
    pub key: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "Location", default)]
    pub location: Vec<Location>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guid {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub container: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub bitrate: i64,
    #[serde(default)]
    pub video_resolution: String,
    #[serde(default)]
    pub container: String,
    #[serde(rename = "Part", default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub rating_key: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub parent_rating_key: String,
    #[serde(default)]
    pub grandparent_rating_key: String,
    /// Legacy agent guid, e.g. `com.plexapp.agents.thetvdb://12345?lang=en`.
    #[serde(default)]
    pub guid: String,
    #[serde(rename = "Guid", default)]
    pub guids: Vec<Guid>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub parent_title: String,
    #[serde(default)]
    pub grandparent_title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub index: Option<i32>,
    #[serde(default)]
    pub parent_index: Option<i32>,
    #[serde(default)]
    pub thumb: String,
    #[serde(rename = "Media", default)]
    pub media: Vec<Media>,
}

impl Metadata {
    /// `Show - Season 1 - Pilot` for episodes, plain title otherwise.
    pub fn display_title(&self) -> String {
        let mut t = String::new();
        if !self.grandparent_title.is_empty() {
            t.push_str(&self.grandparent_title);
            t.push_str(" - ");
        }
        if !self.parent_title.is_empty() {
            t.push_str(&self.parent_title);
            t.push_str(" - ");
        }
        t.push_str(&self.title);
        t
    }

    /// Parts of the first media version. Parts without a key or file path are skipped.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.media
            .first()
            .into_iter()
            .flat_map(|m| m.parts.iter())
            .filter(|p| !p.key.is_empty() && !p.file.is_empty())
    }

    /// TVDB id for series, IMDb id for movies.
    pub fn external_id(&self, category: Category) -> Option<String> {
        let (legacy, modern) = match category {
            Category::Series => ("com.plexapp.agents.thetvdb://", "tvdb://"),
            Category::Movie => ("com.plexapp.agents.imdb://", "imdb://"),
        };

        let candidates = std::iter::once(self.guid.as_str())
            .filter_map(|g| g.strip_prefix(legacy))
            .chain(self.guids.iter().filter_map(|g| g.id.strip_prefix(modern)));

        for rest in candidates {
            let id: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            let valid = match category {
                Category::Series => !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()),
                Category::Movie => id.starts_with("tt"),
            };
            if valid {
                return Some(id);
            }
        }
        None
    }
}
