use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = Uuid;
pub type SubscriberId = Uuid;

/// One file to transfer from the media server into local storage.
///
/// Every enqueue carries its own `id`; two jobs for the same `media_id` are
/// independent and are never coalesced.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: JobId,
    pub media_id: String,
    pub display_title: String,
    /// Remote part reference. `None` means the worker resolves it through the catalog.
    pub source_path: Option<String>,
    pub destination_path: PathBuf,
    pub expected_size: u64,
}

impl DownloadJob {
    pub fn new(
        media_id: impl Into<String>,
        display_title: impl Into<String>,
        source_path: Option<String>,
        destination_path: PathBuf,
        expected_size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            media_id: media_id.into(),
            display_title: display_title.into(),
            source_path,
            destination_path,
            expected_size,
        }
    }

    /// `movie.mkv` -> `movie.mkv.<job id>.tmp`, next to the final file. Scoped
    /// to the job so duplicate jobs for one destination never share a file.
    pub fn temp_path(&self) -> PathBuf {
        let mut os = self.destination_path.clone().into_os_string();
        os.push(format!(".{}.tmp", self.id.simple()));
        PathBuf::from(os)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Update,
    Complete,
    Failed,
    Ping,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Complete | EventKind::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Movie,
    Series,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Movie => "movie",
            Category::Series => "series",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "movie" | "movies" => Ok(Category::Movie),
            "series" | "show" | "tv" => Ok(Category::Series),
            other => anyhow::bail!("unknown category: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEntry {
    pub category: Category,
    pub external_id: String,
    pub media_key: String,
    #[serde(default)]
    pub title: String,
}
