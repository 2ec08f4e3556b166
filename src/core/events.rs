use crate::core::model::{DownloadJob, EventKind, JobId};
use serde::{Deserialize, Serialize};

/// A single frame on the live status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_id: Option<JobId>,
    pub title: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn for_job(kind: EventKind, job_id: JobId, title: &str, downloaded: u64, total: u64) -> Self {
        Self {
            kind,
            job_id: Some(job_id),
            title: title.to_string(),
            bytes_downloaded: downloaded,
            total_bytes: total,
            message: None,
        }
    }

    pub fn start(job: &DownloadJob) -> Self {
        Self::for_job(EventKind::Start, job.id, &job.display_title, 0, job.expected_size)
    }

    pub fn ping() -> Self {
        Self {
            kind: EventKind::Ping,
            job_id: None,
            title: String::new(),
            bytes_downloaded: 0,
            total_bytes: 0,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
