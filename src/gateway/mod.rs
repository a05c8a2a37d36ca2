use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::PbxConfig;
use crate::dedup::DedupStore;
use crate::error::RelayError;
use crate::pbx::{Credential, CredentialReceiver};
use crate::pipeline::{CallRef, PipelineJob};
use crate::queue::QueueHandle;

mod frame;
pub use frame::{parse_frame, qualifies, InboundFrame};

/// Gateway connection states. There is no terminal state: a telephony event
/// feed must never permanently give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// FIFO buffer for outbound frames composed while the socket was not open.
/// Flushing is bounded: after `max_attempts` failed flush-oriented reconnects
/// the buffered frames are abandoned with a delivery error instead of growing
/// forever.
struct SendBuffer {
    pending: VecDeque<String>,
    /// Set by the first disconnect observed with frames pending; only
    /// disconnects after that point count against the attempt budget.
    flush_armed: bool,
    failed_attempts: u32,
    max_attempts: u32,
}

impl SendBuffer {
    fn new(max_attempts: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            flush_armed: false,
            failed_attempts: 0,
            max_attempts,
        }
    }

    fn push(&mut self, message: String) {
        self.pending.push_back(message);
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Takes every pending frame, oldest first. Counters are untouched until
    /// the caller reports the outcome via `mark_flushed` or `restore`.
    fn take(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    /// A full flush made it onto the wire; the attempt budget starts fresh
    /// for frames buffered later.
    fn mark_flushed(&mut self) {
        self.flush_armed = false;
        self.failed_attempts = 0;
    }

    /// Puts unsent frames back at the head, keeping their original order
    /// ahead of anything queued meanwhile.
    fn restore(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.pending.push_front(frame);
        }
    }

    /// Records one disconnect while frames were pending. The first such
    /// disconnect only arms the flush schedule; each later one means a
    /// reconnect made with pending frames failed and is charged against the
    /// budget. Returns the delivery error once the budget is spent, clearing
    /// the buffer.
    fn record_failed_attempt(&mut self) -> Option<RelayError> {
        if self.pending.is_empty() {
            return None;
        }
        if !self.flush_armed {
            self.flush_armed = true;
            return None;
        }
        self.failed_attempts += 1;
        if self.failed_attempts >= self.max_attempts {
            let attempts = self.failed_attempts;
            self.pending.clear();
            self.flush_armed = false;
            self.failed_attempts = 0;
            Some(RelayError::Delivery { attempts })
        } else {
            None
        }
    }
}

/// Owns the one streaming connection to the PBX: subscribes to the call-event
/// topic, heartbeats, reconnects on any disconnection, and feeds qualifying
/// records through the dedup gate into the pipeline queue.
pub struct EventGateway {
    config: PbxConfig,
    dedup: Arc<dyn DedupStore>,
    dedup_ttl: Duration,
    queue: QueueHandle<PipelineJob>,
    credentials: CredentialReceiver,
    state: Mutex<GatewayState>,
    send_buffer: Mutex<SendBuffer>,
    flush_notify: Notify,
}

enum ConnectionEnd {
    Shutdown,
    TokenRotated,
    Lost,
}

impl EventGateway {
    pub fn new(
        config: PbxConfig,
        dedup: Arc<dyn DedupStore>,
        dedup_ttl: Duration,
        queue: QueueHandle<PipelineJob>,
        credentials: CredentialReceiver,
    ) -> Self {
        let max_attempts = config.send_retry_attempts;
        Self {
            config,
            dedup,
            dedup_ttl,
            queue,
            credentials,
            state: Mutex::new(GatewayState::Disconnected),
            send_buffer: Mutex::new(SendBuffer::new(max_attempts)),
            flush_notify: Notify::new(),
        }
    }

    pub fn state(&self) -> GatewayState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: GatewayState) {
        *self.state.lock().unwrap() = state;
    }

    /// Queues an outbound frame. On a live connection the stream loop is
    /// woken and transmits it right away; while disconnected it waits in the
    /// bounded flush buffer for the next successful connect.
    pub fn queue_outbound(&self, message: String) {
        self.send_buffer.lock().unwrap().push(message);
        self.flush_notify.notify_one();
    }

    fn subscribe_url(&self, credential: &Credential) -> Result<Url> {
        let mut url = Url::parse(&format!(
            "{}/openapi/v1.0/subscribe",
            self.config.base_url.trim_end_matches('/')
        ))?;
        // the PBX exposes the stream on the same host; map the scheme over
        match url.scheme() {
            "https" => url.set_scheme("wss").ok(),
            "http" => url.set_scheme("ws").ok(),
            _ => Some(()),
        };
        url.set_query(Some(&format!("access_token={}", credential.access_token)));
        Ok(url)
    }

    /// Runs the gateway forever: connect, stream, reconnect after a delay.
    /// A credential rotation observed on the watch channel tears the session
    /// down and reconnects with the new token (the stream authenticates only
    /// at connect time).
    pub async fn serve(&self, cancel_token: CancellationToken) {
        let mut credentials = self.credentials.clone();
        loop {
            // bind first so the watch borrow is released before the select
            // below takes the receiver mutably again
            let current = credentials.borrow_and_update().clone();
            let credential = match current {
                Some(credential) => credential,
                None => {
                    select! {
                        _ = cancel_token.cancelled() => return,
                        r = credentials.changed() => {
                            if r.is_err() {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };

            match self
                .run_connection(&credential, &mut credentials, &cancel_token)
                .await
            {
                ConnectionEnd::Shutdown => {
                    self.set_state(GatewayState::Disconnected);
                    info!("gateway stopped");
                    return;
                }
                ConnectionEnd::TokenRotated => {
                    self.set_state(GatewayState::Disconnected);
                    info!("access token rotated, reconnecting with new session");
                }
                ConnectionEnd::Lost => {
                    self.set_state(GatewayState::Disconnected);
                    let delay = self.reconnect_delay();
                    warn!("disconnected from PBX stream, reconnecting in {:?}", delay);
                    select! {
                        _ = cancel_token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Pending outbound frames stretch the reconnect spacing to the bounded
    /// flush schedule; an exhausted budget abandons them.
    fn reconnect_delay(&self) -> Duration {
        let mut buffer = self.send_buffer.lock().unwrap();
        if buffer.is_empty() {
            return Duration::from_secs(self.config.reconnect_secs);
        }
        if let Some(e) = buffer.record_failed_attempt() {
            error!("{}", e);
            return Duration::from_secs(self.config.reconnect_secs);
        }
        Duration::from_secs(self.config.send_retry_spacing_secs)
    }

    async fn run_connection(
        &self,
        credential: &Credential,
        credentials: &mut CredentialReceiver,
        cancel_token: &CancellationToken,
    ) -> ConnectionEnd {
        self.set_state(GatewayState::Connecting);
        let url = match self.subscribe_url(credential) {
            Ok(url) => url,
            Err(e) => {
                error!("invalid subscribe url: {}", e);
                return ConnectionEnd::Lost;
            }
        };

        debug!("connecting to PBX stream");
        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("failed to connect to PBX stream: {}", e);
                return ConnectionEnd::Lost;
            }
        };
        let (mut write, mut read) = ws_stream.split();
        self.set_state(GatewayState::Open);
        info!("connected to PBX stream");

        let subscribe = serde_json::json!({ "topic_list": [self.config.topic] }).to_string();
        if let Err(e) = write.send(Message::Text(subscribe.into())).await {
            error!("failed to send subscribe frame: {}", e);
            return ConnectionEnd::Lost;
        }

        // frames buffered while disconnected go out before normal operation
        // resumes
        if !self.flush_buffered(&mut write).await {
            return ConnectionEnd::Lost;
        }

        // heartbeat lives inside this connection scope, so it is cancelled
        // exactly once per disconnect and can never leak across reconnects
        let mut heartbeat = tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            select! {
                _ = cancel_token.cancelled() => {
                    self.set_state(GatewayState::Closing);
                    write.send(Message::Close(None)).await.ok();
                    return ConnectionEnd::Shutdown;
                }
                changed = credentials.changed() => {
                    self.set_state(GatewayState::Closing);
                    write.send(Message::Close(None)).await.ok();
                    return match changed {
                        Ok(_) => ConnectionEnd::TokenRotated,
                        Err(_) => ConnectionEnd::Shutdown,
                    };
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Text("heartbeat".into())).await {
                        error!("heartbeat send failed: {}", e);
                        return ConnectionEnd::Lost;
                    }
                }
                _ = self.flush_notify.notified() => {
                    if !self.flush_buffered(&mut write).await {
                        return ConnectionEnd::Lost;
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(text.as_str()).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("PBX stream closed");
                            return ConnectionEnd::Lost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("{}", RelayError::Transport(e.to_string()));
                            return ConnectionEnd::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Sends every buffered frame, oldest first. The buffer lock is never
    /// held across a send; unsent frames return to the buffer head on
    /// failure so nothing is lost before its delivery budget runs out.
    async fn flush_buffered<S>(&self, write: &mut S) -> bool
    where
        S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        let frames = self.send_buffer.lock().unwrap().take();
        for (sent, frame) in frames.iter().enumerate() {
            if let Err(e) = write.send(Message::Text(frame.clone().into())).await {
                error!("failed to flush buffered frame: {}", e);
                self.send_buffer
                    .lock()
                    .unwrap()
                    .restore(frames[sent..].to_vec());
                return false;
            }
        }
        self.send_buffer.lock().unwrap().mark_flushed();
        true
    }

    /// Dispatches one inbound text frame. Returns the job id when a
    /// qualifying, previously unseen record was handed to the pipeline.
    /// No frame content can close the connection.
    pub async fn dispatch(&self, text: &str) -> Option<Uuid> {
        let parsed = match parse_frame(text) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("dropping unparseable frame: {}", e);
                return None;
            }
        };

        match parsed {
            InboundFrame::HeartbeatEcho => {
                debug!("heartbeat received");
                None
            }
            InboundFrame::Ack(msg) => {
                debug!("subscription acknowledged: {}", msg);
                None
            }
            InboundFrame::ErrorEnvelope(code, msg) => {
                error!("PBX stream error envelope: {} {}", code, msg);
                None
            }
            InboundFrame::NonRecord => {
                debug!("ignoring non-record frame");
                None
            }
            InboundFrame::Record(call) => {
                if !qualifies(&call) {
                    debug!(call_id = %call.call_id, "record does not qualify, dropped");
                    return None;
                }
                self.gate_and_enqueue(call).await
            }
        }
    }

    /// The dedup key is written at scheduling time, not pipeline completion,
    /// so a burst of duplicate frames inside the in-flight window is still
    /// suppressed.
    async fn gate_and_enqueue(&self, call: crate::pbx::StreamCall) -> Option<Uuid> {
        let key = call.derived_id();
        match self.dedup.is_seen(&key).await {
            Ok(true) => {
                debug!(%key, "call already scheduled, dropped");
                return None;
            }
            Ok(false) => {}
            Err(e) => {
                error!(%key, "dedup lookup failed, dropping frame: {}", e);
                return None;
            }
        }
        if let Err(e) = self.dedup.mark_seen(&key, self.dedup_ttl).await {
            error!(%key, "failed to mark call seen, dropping frame: {}", e);
            return None;
        }
        match self.queue.enqueue(PipelineJob::ProcessRecording {
            call: CallRef::FromStream(call),
        }) {
            Ok(job_id) => Some(job_id),
            Err(e) => {
                error!(%key, "failed to enqueue pipeline job: {}", e);
                None
            }
        }
    }
}
