use crate::core::media::{Directory, Metadata};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseRoot {
    #[serde(rename = "MediaContainer", default)]
    pub media_container: MediaContainer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContainer {
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub title1: String,
    #[serde(default)]
    pub title2: String,
    #[serde(rename = "Metadata", default)]
    pub metadata: Vec<Metadata>,
    #[serde(rename = "Directory", default)]
    pub directory: Vec<Directory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plex_json_envelope() {
        let body = r#"{"MediaContainer":{"size":1,"Metadata":[{
            "ratingKey":"123","type":"episode","title":"Pilot",
            "parentTitle":"Season 1","grandparentTitle":"Show",
            "guid":"plex://episode/abc",
            "Guid":[{"id":"tvdb://999"}],
            "Media":[{"id":1,"Part":[{"id":5,"key":"/library/parts/5/file.mkv","file":"/tv/Show/S01E01.mkv","size":1234}]}]
        }]}}"#;
        let root: ResponseRoot = serde_json::from_str(body).unwrap();
        let m = &root.media_container.metadata[0];
        assert_eq!(m.display_title(), "Show - Season 1 - Pilot");
        let parts: Vec<_> = m.parts().collect();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, 1234);
    }
}
