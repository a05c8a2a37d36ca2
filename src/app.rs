use anyhow::Result;
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backfill::BackfillScanner;
use crate::config::Config;
use crate::dedup::{self, DedupStore};
use crate::gateway::EventGateway;
use crate::ingestion::IngestionClient;
use crate::pbx::{PbxClient, SessionManager};
use crate::pipeline::{PbxRecordingFetcher, PipelineHandler, PipelineJob};
use crate::queue::JobQueue;
use crate::roster::Roster;

pub struct App {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    session: Arc<SessionManager>,
    gateway: Arc<EventGateway>,
    queue: Arc<JobQueue<PipelineJob>>,
    handler: Arc<PipelineHandler>,
    backfill: Arc<BackfillScanner>,
}

pub struct AppBuilder {
    config: Option<Config>,
    cancel_token: Option<CancellationToken>,
    dedup: Option<Arc<dyn DedupStore>>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            dedup: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_dedup_store(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.dedup = Some(store);
        self
    }

    pub async fn build(self) -> Result<App> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = self.cancel_token.unwrap_or_default();

        let pbx_client = Arc::new(PbxClient::new(&config.pbx)?);
        let ingestion_client = Arc::new(IngestionClient::new(&config.ingestion)?);
        let session = Arc::new(SessionManager::new(pbx_client.clone(), &config.pbx));
        let roster = Arc::new(Roster::new(config.teams.clone(), &config.ingestion));

        let dedup = match self.dedup {
            Some(store) => store,
            None => dedup::resolve_store(&config.dedup).await?,
        };
        let dedup_ttl = config.dedup.ttl();

        let queue = Arc::new(JobQueue::new(config.queue.clone()));
        let handler = Arc::new(PipelineHandler::new(
            Arc::new(PbxRecordingFetcher {
                client: pbx_client.clone(),
                session: session.clone(),
                download_root: config.download_path.clone(),
            }),
            ingestion_client,
            roster,
            config.download_path.clone(),
            config.ingestion.api_key.clone(),
        ));

        let gateway = Arc::new(EventGateway::new(
            config.pbx.clone(),
            dedup.clone(),
            dedup_ttl,
            queue.handle(),
            session.subscribe(),
        ));

        let backfill = Arc::new(BackfillScanner::new(
            pbx_client,
            session.clone(),
            dedup,
            dedup_ttl,
            queue.handle(),
            config.pbx.backfill_page_size,
        ));

        Ok(App {
            config,
            token,
            session,
            gateway,
            queue,
            handler,
            backfill,
        })
    }
}

impl App {
    /// Runs everything until cancellation: session refresh loop, event
    /// gateway, queue workers, plus the one-shot backfill scan.
    pub async fn run(&self) -> Result<()> {
        self.session.initialize().await?;

        let backfill = self.backfill.clone();
        tokio::spawn(async move {
            match backfill.run().await {
                Ok(enqueued) => info!(enqueued, "startup backfill complete"),
                Err(e) => error!("startup backfill failed: {}", e),
            }
        });

        select! {
            _ = self.session.serve(self.token.child_token()) => {}
            _ = self.gateway.serve(self.token.child_token()) => {}
            _ = self.queue.serve(self.handler.clone(), self.token.child_token()) => {}
            _ = self.token.cancelled() => {
                info!("application shutting down");
            }
        }
        self.token.cancel();
        Ok(())
    }
}
