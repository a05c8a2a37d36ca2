use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::dedup::DedupStore;
use crate::pbx::{PbxClient, SessionManager};
use crate::pipeline::{CallRef, PipelineJob};
use crate::queue::QueueHandle;

const OUTBOUND: &str = "Outbound";

/// Startup scan over the PBX recording listing. An alternate producer into
/// the same pipeline: outbound entries not yet in the dedup store are marked
/// and enqueued exactly like live stream records, so a recording missed
/// while the process was down is still delivered.
pub struct BackfillScanner {
    client: Arc<PbxClient>,
    session: Arc<SessionManager>,
    dedup: Arc<dyn DedupStore>,
    dedup_ttl: Duration,
    queue: QueueHandle<PipelineJob>,
    page_size: u32,
}

impl BackfillScanner {
    pub fn new(
        client: Arc<PbxClient>,
        session: Arc<SessionManager>,
        dedup: Arc<dyn DedupStore>,
        dedup_ttl: Duration,
        queue: QueueHandle<PipelineJob>,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            session,
            dedup,
            dedup_ttl,
            queue,
            page_size,
        }
    }

    /// Runs one full scan, returning how many recordings were enqueued.
    pub async fn run(&self) -> Result<u64> {
        let credential = self
            .session
            .credential()
            .ok_or_else(|| anyhow!("no pbx session held"))?;

        let first = self
            .client
            .list_recordings(&credential.access_token, 1, self.page_size)
            .await?;
        let pages = first.total_number.div_ceil(self.page_size as u64);
        debug!(total = first.total_number, pages, "backfill scan started");

        let mut enqueued = 0u64;
        enqueued += self.scan_page(first.data).await?;
        for page in 2..=pages {
            let response = self
                .client
                .list_recordings(&credential.access_token, page as u32, self.page_size)
                .await?;
            enqueued += self.scan_page(response.data).await?;
        }

        info!(enqueued, "backfill scan finished");
        Ok(enqueued)
    }

    async fn scan_page(&self, entries: Vec<crate::pbx::RecordingEntry>) -> Result<u64> {
        let mut enqueued = 0u64;
        for entry in entries {
            if !entry.call_type.eq_ignore_ascii_case(OUTBOUND) {
                continue;
            }
            let key = entry.id.to_string();
            if self.dedup.is_seen(&key).await? {
                continue;
            }
            self.dedup.mark_seen(&key, self.dedup_ttl).await?;
            self.queue.enqueue(PipelineJob::ProcessRecording {
                call: CallRef::FromBackfill(entry),
            })?;
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::dedup::MemoryDedupStore;
    use crate::pbx::RecordingEntry;
    use crate::queue::JobQueue;

    fn entry(id: u64, call_type: &str) -> RecordingEntry {
        RecordingEntry {
            id,
            time: "2024-02-27T12:27:26Z".to_string(),
            uid: String::new(),
            call_from: "Jane<309>".to_string(),
            call_to: "0509999999".to_string(),
            duration: 30,
            size: 1024,
            call_type: call_type.to_string(),
            file: format!("{}.wav", id),
        }
    }

    fn scanner(dedup: Arc<MemoryDedupStore>) -> (BackfillScanner, JobQueue<PipelineJob>) {
        let config = crate::config::PbxConfig::default();
        let client = Arc::new(PbxClient::new(&config).unwrap());
        let session = Arc::new(SessionManager::new(client.clone(), &config));
        let queue = JobQueue::new(QueueConfig::default());
        let scanner = BackfillScanner::new(
            client,
            session,
            dedup,
            Duration::from_secs(3600),
            queue.handle(),
            50,
        );
        (scanner, queue)
    }

    #[tokio::test]
    async fn test_scan_page_filters_and_marks() {
        let dedup = Arc::new(MemoryDedupStore::new());
        dedup
            .mark_seen("7", Duration::from_secs(3600))
            .await
            .unwrap();
        let (scanner, _queue) = scanner(dedup.clone());

        let enqueued = scanner
            .scan_page(vec![
                entry(5, "Outbound"),
                entry(6, "Inbound"),
                entry(7, "Outbound"),
                entry(8, "outbound"),
            ])
            .await
            .unwrap();

        // 5 and 8 qualify; 6 is inbound, 7 already seen
        assert_eq!(enqueued, 2);
        assert!(dedup.is_seen("5").await.unwrap());
        assert!(dedup.is_seen("8").await.unwrap());
        assert!(!dedup.is_seen("6").await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_page_is_idempotent() {
        let dedup = Arc::new(MemoryDedupStore::new());
        let (scanner, _queue) = scanner(dedup);

        let first = scanner.scan_page(vec![entry(5, "Outbound")]).await.unwrap();
        let second = scanner.scan_page(vec![entry(5, "Outbound")]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
