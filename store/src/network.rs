//! The content distribution seam.
//!
//! The real system replicates logs and archives over a peer-to-peer
//! network; the core only ever asks that layer to resolve a durable URL.
//! [`LocalNetwork`] is the in-process stand-in: resources announce
//! themselves at creation and fetches resolve against the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{AppendOnlyLog, StoreError, VersionedArchive};

/// Resolves durable URLs to ledger entries and archive handles.
#[async_trait]
pub trait ContentNetwork: Send + Sync {
    /// Fetch the full entry payload list of a log.
    async fn fetch_log(&self, url: &str) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Fetch a read handle onto an archive.
    async fn fetch_archive(&self, url: &str) -> Result<Arc<dyn VersionedArchive>, StoreError>;
}

/// In-process [`ContentNetwork`] registry.
#[derive(Default)]
pub struct LocalNetwork {
    logs: RwLock<HashMap<String, Arc<dyn AppendOnlyLog>>>,
    archives: RwLock<HashMap<String, Arc<dyn VersionedArchive>>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork").finish_non_exhaustive()
    }
}

impl LocalNetwork {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a log under its URL.
    pub async fn announce_log(&self, log: Arc<dyn AppendOnlyLog>) {
        let url = log.url().to_string();
        debug!(url = %url, "announcing log");
        self.logs.write().await.insert(url, log);
    }

    /// Announce an archive under its URL.
    pub async fn announce_archive(&self, archive: Arc<dyn VersionedArchive>) {
        let url = archive.url().to_string();
        debug!(url = %url, "announcing archive");
        self.archives.write().await.insert(url, archive);
    }
}

#[async_trait]
impl ContentNetwork for LocalNetwork {
    async fn fetch_log(&self, url: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let log = self
            .logs
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(url.to_string()))?;
        let mut records = Vec::with_capacity(log.len() as usize);
        for seq in 0..log.len() {
            let record = log
                .get(seq)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("{url} sequence {seq}")))?;
            records.push(record);
        }
        Ok(records)
    }

    async fn fetch_archive(&self, url: &str) -> Result<Arc<dyn VersionedArchive>, StoreError> {
        self.archives
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JournalLog;

    #[tokio::test]
    async fn fetch_round_trips_log_records() {
        let network = LocalNetwork::new();
        let log = Arc::new(JournalLog::memory("apl://x".to_string()));
        log.append(b"one").await.unwrap();
        log.append(b"two").await.unwrap();
        network.announce_log(log).await;

        let records = network.fetch_log("apl://x").await.unwrap();
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn unknown_url_is_not_found() {
        let network = LocalNetwork::new();
        assert!(matches!(
            network.fetch_log("apl://missing").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
