use crate::plugins::plex::catalog::{PlexClient, PlexError};
use crate::plugins::registry::{ByteStream, PartSource};
use async_trait::async_trait;
use futures::TryStreamExt;
use std::io;
use tracing::debug;

#[async_trait]
impl PartSource for PlexClient {
    /// Streams a part body. Not retried: a failed transfer is abandoned by the worker.
    async fn open(&self, part_key: &str) -> anyhow::Result<ByteStream> {
        let url = self.url_for(part_key)?;
        let headers = self.build_headers()?;
        debug!(part_key, "opening part stream");

        let resp = self.client.get(url).headers(headers).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PlexError::Status { status, path: part_key.to_string() }.into());
        }

        let stream = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::pin(stream))
    }
}
