use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::RelayError;
use crate::fsutil;
use crate::ingestion::{IngestionClient, UploadMetadata, UploadRequest, UploadTicket};
use crate::pbx::{DownloadDescriptor, PbxClient, RecordingEntry, SessionManager, StreamCall};
use crate::queue::{JobHandler, QueueHandle, QueueJob};
use crate::roster::{parse_caller, Roster};

const UPLOAD_TOPIC: &str = "New CDR";

/// A call reference entering the pipeline. The live stream and the backfill
/// scan produce different wire shapes; both are explicit variants with
/// normalized accessors instead of runtime field-sniffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallRef {
    FromStream(StreamCall),
    FromBackfill(RecordingEntry),
}

impl CallRef {
    pub fn dedup_key(&self) -> String {
        match self {
            CallRef::FromStream(call) => call.derived_id(),
            CallRef::FromBackfill(entry) => entry.id.to_string(),
        }
    }

    /// Numeric id the PBX signs download URLs against.
    pub fn recording_id(&self) -> Result<u64> {
        match self {
            CallRef::FromStream(call) => call
                .derived_id()
                .parse()
                .map_err(|_| anyhow!("call id {} has no numeric id", call.call_id)),
            CallRef::FromBackfill(entry) => Ok(entry.id),
        }
    }

    pub fn remote_file(&self) -> &str {
        match self {
            CallRef::FromStream(call) => &call.recording,
            CallRef::FromBackfill(entry) => &entry.file,
        }
    }

    pub fn started_at(&self) -> &str {
        match self {
            CallRef::FromStream(call) => &call.time_start,
            CallRef::FromBackfill(entry) => &entry.time,
        }
    }

    pub fn from_party(&self) -> &str {
        match self {
            CallRef::FromStream(call) => &call.call_from,
            CallRef::FromBackfill(entry) => &entry.call_from,
        }
    }

    pub fn to_party(&self) -> &str {
        match self {
            CallRef::FromStream(call) => &call.call_to,
            CallRef::FromBackfill(entry) => &entry.call_to,
        }
    }

    /// Recording type sent to the ingestion API: the file extension capped
    /// at three characters (`wav`, `mp3`).
    pub fn recording_type(&self) -> String {
        self.remote_file()
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .chars()
            .take(3)
            .collect()
    }
}

/// Delivery context carried into the success-logging stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSummary {
    pub user_id: String,
    pub team: String,
    pub timestamp: String,
    pub upload_url: String,
}

/// The five pipeline stages with their evolving payloads. Each stage enqueues
/// its successor, so one call's stages never run concurrently; different
/// calls fan out across queue workers.
#[derive(Debug, Clone)]
pub enum PipelineJob {
    ProcessRecording {
        call: CallRef,
    },
    DownloadRecording {
        call: CallRef,
        descriptor: DownloadDescriptor,
    },
    SendRecording {
        call: CallRef,
        local_path: PathBuf,
    },
    FinishRecording {
        call: CallRef,
        local_path: PathBuf,
        summary: UploadSummary,
    },
    DeleteRecording {
        local_path: PathBuf,
    },
}

impl QueueJob for PipelineJob {
    fn stage(&self) -> &'static str {
        match self {
            PipelineJob::ProcessRecording { .. } => "processRecording",
            PipelineJob::DownloadRecording { .. } => "downloadRecording",
            PipelineJob::SendRecording { .. } => "sendRecording",
            PipelineJob::FinishRecording { .. } => "finishRecording",
            PipelineJob::DeleteRecording { .. } => "deleteRecording",
        }
    }

    fn job_key(&self) -> String {
        match self {
            PipelineJob::ProcessRecording { call }
            | PipelineJob::DownloadRecording { call, .. }
            | PipelineJob::SendRecording { call, .. }
            | PipelineJob::FinishRecording { call, .. } => call.dedup_key(),
            PipelineJob::DeleteRecording { local_path } => local_path.display().to_string(),
        }
    }
}

/// PBX-side collaborator contract: sign a download URL, fetch the file.
#[async_trait]
pub trait RecordingFetcher: Send + Sync {
    async fn descriptor_for(&self, recording_id: u64) -> Result<DownloadDescriptor>;
    async fn fetch(&self, descriptor: &DownloadDescriptor) -> Result<PathBuf>;
}

/// Ingestion-side collaborator contract: sign an upload URL, PUT the bytes.
#[async_trait]
pub trait RecordingUploader: Send + Sync {
    async fn upload_ticket(&self, request: &UploadRequest) -> Result<UploadTicket>;
    async fn upload(&self, path: &Path, ticket: &UploadTicket) -> Result<()>;
}

/// Production fetcher: PBX REST client plus the live session's access token.
pub struct PbxRecordingFetcher {
    pub client: Arc<PbxClient>,
    pub session: Arc<SessionManager>,
    pub download_root: String,
}

#[async_trait]
impl RecordingFetcher for PbxRecordingFetcher {
    async fn descriptor_for(&self, recording_id: u64) -> Result<DownloadDescriptor> {
        let credential = self
            .session
            .credential()
            .ok_or_else(|| anyhow!("no pbx session held"))?;
        self.client
            .get_download_descriptor(&credential.access_token, recording_id)
            .await
    }

    async fn fetch(&self, descriptor: &DownloadDescriptor) -> Result<PathBuf> {
        self.client
            .download_recording(descriptor, &self.download_root)
            .await
    }
}

#[async_trait]
impl RecordingUploader for IngestionClient {
    async fn upload_ticket(&self, request: &UploadRequest) -> Result<UploadTicket> {
        self.generate_upload_url(request).await
    }

    async fn upload(&self, path: &Path, ticket: &UploadTicket) -> Result<()> {
        self.upload_recording(path, ticket).await
    }
}

/// Registered handler for every pipeline stage.
pub struct PipelineHandler {
    fetcher: Arc<dyn RecordingFetcher>,
    uploader: Arc<dyn RecordingUploader>,
    roster: Arc<Roster>,
    download_root: String,
    api_key: String,
}

impl PipelineHandler {
    pub fn new(
        fetcher: Arc<dyn RecordingFetcher>,
        uploader: Arc<dyn RecordingUploader>,
        roster: Arc<Roster>,
        download_root: String,
        api_key: String,
    ) -> Self {
        Self {
            fetcher,
            uploader,
            roster,
            download_root,
            api_key,
        }
    }

    async fn process_recording(
        &self,
        call: CallRef,
        queue: &QueueHandle<PipelineJob>,
    ) -> Result<()> {
        let local = fsutil::download_path(&self.download_root, call.remote_file());
        if fsutil::file_exists(&local).await {
            debug!(key = %call.dedup_key(), "recording already on disk, skipping");
            return Ok(());
        }

        let recording_id = call.recording_id()?;
        match self.fetcher.descriptor_for(recording_id).await {
            Ok(descriptor) => {
                queue.enqueue(PipelineJob::DownloadRecording { call, descriptor })?;
                Ok(())
            }
            Err(e) => {
                error!(key = %call.dedup_key(), "download URL was refused: {}", e);
                Err(RelayError::stage("processRecording", e).into())
            }
        }
    }

    async fn download_recording(
        &self,
        call: CallRef,
        descriptor: DownloadDescriptor,
        queue: &QueueHandle<PipelineJob>,
    ) -> Result<()> {
        let local_path = self
            .fetcher
            .fetch(&descriptor)
            .await
            .map_err(|e| RelayError::stage("downloadRecording", e))?;
        queue.enqueue(PipelineJob::SendRecording { call, local_path })?;
        Ok(())
    }

    /// Resolves upload metadata and ships the file. Any sub-step failure
    /// fails the job as a whole without scheduling deletion: the local file
    /// must survive so a redelivery reuses it instead of re-downloading.
    /// Once the retry budget runs out, `on_exhausted` schedules the delete.
    async fn send_recording(
        &self,
        call: CallRef,
        local_path: PathBuf,
        queue: &QueueHandle<PipelineJob>,
    ) -> Result<()> {
        let caller = parse_caller(call.from_party());
        let team = self.roster.resolve_team(&caller.extension);
        let timestamp = crate::ingestion::normalize_timestamp(call.started_at())
            .map_err(|e| RelayError::stage("sendRecording", e))?;

        let request = UploadRequest {
            user_id: caller.user_id.clone(),
            prospect_id: call.to_party().to_string(),
            unit_id: team.clone(),
            recording_type: call.recording_type(),
            timestamp: timestamp.clone(),
            topic: UPLOAD_TOPIC.to_string(),
            api_key: self.api_key.clone(),
            metadata: UploadMetadata {
                extension: caller.extension,
            },
        };

        let ticket = self
            .uploader
            .upload_ticket(&request)
            .await
            .map_err(|e| RelayError::stage("sendRecording", e))?;
        self.uploader
            .upload(&local_path, &ticket)
            .await
            .map_err(|e| RelayError::stage("sendRecording", e))?;

        queue.enqueue(PipelineJob::FinishRecording {
            call,
            local_path,
            summary: UploadSummary {
                user_id: request.user_id,
                team,
                timestamp,
                upload_url: ticket.url,
            },
        })?;
        Ok(())
    }

    fn finish_recording(
        &self,
        call: &CallRef,
        local_path: PathBuf,
        summary: &UploadSummary,
        queue: &QueueHandle<PipelineJob>,
    ) -> Result<()> {
        info!(
            key = %call.dedup_key(),
            user_id = %summary.user_id,
            team = %summary.team,
            timestamp = %summary.timestamp,
            upload_url = %summary.upload_url,
            "recording delivered"
        );
        queue.enqueue(PipelineJob::DeleteRecording { local_path })?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler<PipelineJob> for PipelineHandler {
    async fn handle(&self, job: PipelineJob, queue: &QueueHandle<PipelineJob>) -> Result<()> {
        match job {
            PipelineJob::ProcessRecording { call } => self.process_recording(call, queue).await,
            PipelineJob::DownloadRecording { call, descriptor } => {
                self.download_recording(call, descriptor, queue).await
            }
            PipelineJob::SendRecording { call, local_path } => {
                self.send_recording(call, local_path, queue).await
            }
            PipelineJob::FinishRecording {
                call,
                local_path,
                summary,
            } => self.finish_recording(&call, local_path, &summary, queue),
            PipelineJob::DeleteRecording { local_path } => {
                fsutil::cleanup_file(&local_path).await;
                Ok(())
            }
        }
    }

    /// A post-download job that spent its retry budget must still surrender
    /// its local file; nothing later in the pipeline would ever delete it.
    async fn on_exhausted(&self, job: PipelineJob, queue: &QueueHandle<PipelineJob>) {
        match job {
            PipelineJob::SendRecording { local_path, .. }
            | PipelineJob::FinishRecording { local_path, .. } => {
                if let Err(e) = queue.enqueue(PipelineJob::DeleteRecording { local_path }) {
                    error!("failed to schedule terminal cleanup: {}", e);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestionConfig, QueueConfig, TeamConfig};
    use crate::queue::JobQueue;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn stream_call(from: &str, time_start: &str) -> CallRef {
        CallRef::FromStream(
            serde_json::from_value(serde_json::json!({
                "call_id": "1709024846.15",
                "type": "CDR",
                "status": "ANSWERED",
                "recording": "20240227/call1.wav",
                "call_from": from,
                "call_to": "0501234567",
                "time_start": time_start,
            }))
            .unwrap(),
        )
    }

    fn backfill_call() -> CallRef {
        CallRef::FromBackfill(RecordingEntry {
            id: 4211,
            time: "2024-02-27T12:27:26Z".to_string(),
            uid: String::new(),
            call_from: "Jane<309>".to_string(),
            call_to: "0509999999".to_string(),
            duration: 30,
            size: 1024,
            call_type: "Outbound".to_string(),
            file: "20240227/call2.mp3".to_string(),
        })
    }

    #[test]
    fn test_call_ref_normalized_accessors() {
        let live = stream_call("John<2013>", "27/02/2024 12:27:26 PM");
        assert_eq!(live.dedup_key(), "1709024846");
        assert_eq!(live.recording_id().unwrap(), 1709024846);
        assert_eq!(live.remote_file(), "20240227/call1.wav");
        assert_eq!(live.recording_type(), "wav");

        let backfill = backfill_call();
        assert_eq!(backfill.dedup_key(), "4211");
        assert_eq!(backfill.recording_id().unwrap(), 4211);
        assert_eq!(backfill.recording_type(), "mp3");
    }

    #[test]
    fn test_recording_type_caps_at_three_chars() {
        let call = CallRef::FromBackfill(RecordingEntry {
            file: "call.webm".to_string(),
            ..match backfill_call() {
                CallRef::FromBackfill(e) => e,
                _ => unreachable!(),
            }
        });
        assert_eq!(call.recording_type(), "web");
    }

    struct StubFetcher {
        root: PathBuf,
    }

    #[async_trait]
    impl RecordingFetcher for StubFetcher {
        async fn descriptor_for(&self, recording_id: u64) -> Result<DownloadDescriptor> {
            Ok(DownloadDescriptor {
                remote_file: format!("{}.wav", recording_id),
                signed_url: "https://pbx/download".to_string(),
            })
        }

        async fn fetch(&self, descriptor: &DownloadDescriptor) -> Result<PathBuf> {
            let path = self.root.join(&descriptor.remote_file);
            tokio::fs::write(&path, b"audio").await?;
            Ok(path)
        }
    }

    struct StubUploader {
        fail_upload: bool,
        uploads: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl RecordingUploader for StubUploader {
        async fn upload_ticket(&self, _request: &UploadRequest) -> Result<UploadTicket> {
            Ok(UploadTicket {
                url: "https://sink/put".to_string(),
                headers: Default::default(),
            })
        }

        async fn upload(&self, path: &Path, _ticket: &UploadTicket) -> Result<()> {
            if self.fail_upload {
                anyhow::bail!("503 from storage");
            }
            self.uploads.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    fn test_handler(
        root: &Path,
        fail_upload: bool,
    ) -> (PipelineHandler, Arc<StubUploader>) {
        let uploader = Arc::new(StubUploader {
            fail_upload,
            uploads: Mutex::new(Vec::new()),
        });
        let ingestion = IngestionConfig {
            team_prefix: "org-".to_string(),
            team_suffix: "".to_string(),
            default_team: "fallback".to_string(),
            ..Default::default()
        };
        let roster = Arc::new(Roster::new(
            vec![TeamConfig {
                name: "team-1".to_string(),
                members: vec![2013, 309],
            }],
            &ingestion,
        ));
        let handler = PipelineHandler::new(
            Arc::new(StubFetcher {
                root: root.to_path_buf(),
            }),
            uploader.clone(),
            roster,
            root.to_string_lossy().to_string(),
            "api-key".to_string(),
        );
        (handler, uploader)
    }

    #[tokio::test]
    async fn test_send_recording_success_schedules_finish() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("call1.wav");
        tokio::fs::write(&local, b"audio").await.unwrap();
        let (handler, uploader) = test_handler(dir.path(), false);

        let queue = JobQueue::new(QueueConfig::default());
        let handle = queue.handle();
        handler
            .send_recording(
                stream_call("John<2013>", "27/02/2024 12:27:26 PM"),
                local.clone(),
                &handle,
            )
            .await
            .unwrap();

        assert_eq!(uploader.uploads.lock().unwrap().as_slice(), &[local]);
    }

    #[tokio::test]
    async fn test_send_recording_failure_keeps_file_and_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("call1.wav");
        tokio::fs::write(&local, b"audio").await.unwrap();
        let (handler, _uploader) = test_handler(dir.path(), true);

        let queue = JobQueue::new(QueueConfig::default());
        let handle = queue.handle();
        let result = handler
            .send_recording(
                stream_call("John<2013>", "27/02/2024 12:27:26 PM"),
                local.clone(),
                &handle,
            )
            .await;

        assert!(result.is_err());
        // the file must survive a transient upload failure for retry reuse
        assert!(fsutil::file_exists(&local).await);
    }

    #[tokio::test]
    async fn test_send_recording_bad_timestamp_is_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("call1.wav");
        tokio::fs::write(&local, b"audio").await.unwrap();
        let (handler, uploader) = test_handler(dir.path(), false);

        let queue = JobQueue::new(QueueConfig::default());
        let handle = queue.handle();
        let result = handler
            .send_recording(
                stream_call("John<2013>", "sometime last week"),
                local.clone(),
                &handle,
            )
            .await;

        assert!(result.is_err());
        assert!(uploader.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_recording_skips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("20240227/call1.wav");
        fsutil::ensure_parent_dir(&existing).await.unwrap();
        tokio::fs::write(&existing, b"audio").await.unwrap();
        let (handler, _uploader) = test_handler(dir.path(), false);

        let queue = JobQueue::new(QueueConfig::default());
        let handle = queue.handle();
        handler
            .process_recording(stream_call("John<2013>", "27/02/2024 12:27:26 PM"), &handle)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_send_schedules_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("abandoned.wav");
        tokio::fs::write(&local, b"audio").await.unwrap();
        let (handler, _uploader) = test_handler(dir.path(), true);
        let handler = Arc::new(handler);

        let queue = JobQueue::new(QueueConfig {
            workers: 1,
            retry_attempts: 1,
            retry_backoff_secs: 0,
        });
        let handle = queue.handle();
        let token = CancellationToken::new();
        let serve_token = token.clone();
        let serve_handler = handler.clone();
        let serve = tokio::spawn(async move {
            queue.serve(serve_handler, serve_token).await;
        });

        handler
            .on_exhausted(
                PipelineJob::SendRecording {
                    call: stream_call("John<2013>", "27/02/2024 12:27:26 PM"),
                    local_path: local.clone(),
                },
                &handle,
            )
            .await;

        // the scheduled delete stage surrenders the file
        for _ in 0..200 {
            if !fsutil::file_exists(&local).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!fsutil::file_exists(&local).await);

        token.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_stage_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("gone.wav");
        tokio::fs::write(&local, b"audio").await.unwrap();
        let (handler, _uploader) = test_handler(dir.path(), false);

        let queue = JobQueue::new(QueueConfig::default());
        let handle = queue.handle();
        handler
            .handle(
                PipelineJob::DeleteRecording {
                    local_path: local.clone(),
                },
                &handle,
            )
            .await
            .unwrap();
        assert!(!fsutil::file_exists(&local).await);
    }
}
