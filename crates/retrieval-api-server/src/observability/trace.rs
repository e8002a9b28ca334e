use crate::config::Settings;
use crate::utils::timing::Timer;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

const QUEUE_CAPACITY: usize = 10_000;
const BATCH_SIZE: usize = 50;
const BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// One unit of observable work: agent call, retrieval, embedding.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSpan {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    pub name: String,
    pub run_type: &'static str,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
}

enum Command {
    Span(Box<TraceSpan>),
    Flush(oneshot::Sender<()>),
}

/// Asynchronous span exporter: bounded queue drained by a background
/// worker that batches spans and POSTs them to the configured tracing
/// endpoint. Spans are dropped, never blocked on, when the queue is full.
struct TraceProcessor {
    sender: flume::Sender<Command>,
}

static PROCESSOR: OnceCell<Option<TraceProcessor>> = OnceCell::new();

#[derive(Serialize)]
struct BatchPayload<'a> {
    post: &'a [TraceSpan],
}

async fn flush_batch(client: &reqwest::Client, endpoint: &str, api_key: &str, batch: &[TraceSpan]) {
    if batch.is_empty() {
        return;
    }

    let url = format!("{}/runs/batch", endpoint);
    let result = client
        .post(&url)
        .header("x-api-key", api_key)
        .json(&BatchPayload { post: batch })
        .send()
        .await;

    match result {
        Ok(response) if !response.status().is_success() => {
            warn!(
                status = %response.status(),
                spans = batch.len(),
                "trace export rejected"
            );
        }
        Ok(_) => debug!(spans = batch.len(), "trace batch exported"),
        Err(e) => warn!("trace export failed: {}", e),
    }
}

async fn run_worker(
    receiver: flume::Receiver<Command>,
    endpoint: String,
    api_key: String,
    project: String,
) {
    let client = reqwest::Client::new();
    let mut batch: Vec<TraceSpan> = Vec::with_capacity(BATCH_SIZE);

    let tag = |mut span: Box<TraceSpan>, project: &str| {
        span.session_name = Some(project.to_string());
        *span
    };

    loop {
        match tokio::time::timeout(BATCH_TIMEOUT, receiver.recv_async()).await {
            Ok(Ok(Command::Span(span))) => {
                batch.push(tag(span, &project));
                if batch.len() >= BATCH_SIZE {
                    flush_batch(&client, &endpoint, &api_key, &batch).await;
                    batch.clear();
                }
            }
            Ok(Ok(Command::Flush(ack))) => {
                // Drain whatever is still queued before acknowledging
                while let Ok(Command::Span(span)) = receiver.try_recv() {
                    batch.push(tag(span, &project));
                }
                flush_batch(&client, &endpoint, &api_key, &batch).await;
                batch.clear();
                let _ = ack.send(());
            }
            Ok(Err(_)) => {
                // All senders dropped; final flush and exit
                flush_batch(&client, &endpoint, &api_key, &batch).await;
                return;
            }
            Err(_) => {
                flush_batch(&client, &endpoint, &api_key, &batch).await;
                batch.clear();
            }
        }
    }
}

/// Initialises the global trace processor once. A second call is a
/// no-op, as is running without tracing configured.
pub fn initialize_tracing(settings: &Settings) {
    PROCESSOR.get_or_init(|| {
        let api_key = match (&settings.langsmith_api_key, settings.langsmith_tracing) {
            (Some(key), true) => key.clone(),
            _ => return None,
        };

        let (sender, receiver) = flume::bounded(QUEUE_CAPACITY);
        tokio::spawn(run_worker(
            receiver,
            settings.langsmith_endpoint.clone(),
            api_key,
            settings.langsmith_project.clone(),
        ));

        debug!(project = %settings.langsmith_project, "trace processor initialised");
        Some(TraceProcessor { sender })
    });
}

pub fn is_enabled() -> bool {
    matches!(PROCESSOR.get(), Some(Some(_)))
}

fn emit(span: TraceSpan) {
    if let Some(Some(processor)) = PROCESSOR.get() {
        if processor
            .sender
            .try_send(Command::Span(Box::new(span)))
            .is_err()
        {
            warn!("trace queue full, span dropped");
        }
    }
}

/// Forces queued spans out. No-op when tracing is not configured.
pub async fn force_flush() {
    if let Some(Some(processor)) = PROCESSOR.get() {
        let (ack, done) = oneshot::channel();
        if processor.sender.send_async(Command::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Shutdown hook: final flush before process exit.
pub async fn shutdown_tracing() {
    force_flush().await;
}

/// In-flight span. Created at the start of a unit of work, finished with
/// its success flag; emits on finish when a processor is configured.
pub struct SpanRecorder {
    id: Uuid,
    parent: Option<Uuid>,
    name: String,
    started_at: DateTime<Utc>,
    timer: Timer,
}

impl SpanRecorder {
    pub fn start(name: impl Into<String>, parent: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            name: name.into(),
            started_at: Utc::now(),
            timer: Timer::start(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn finish(self, success: bool) -> Uuid {
        let duration = chrono::Duration::milliseconds(self.timer.elapsed_ms() as i64);
        emit(TraceSpan {
            id: self.id,
            parent_run_id: self.parent,
            name: self.name,
            run_type: "chain",
            start_time: self.started_at,
            end_time: self.started_at + duration,
            error: (!success).then(|| "failed".to_string()),
            session_name: None,
        });
        self.id
    }
}
