use super::event::StreamEvent;
use crate::error::{PipelineError, PipelineResult};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

/// How a producer job ended when it did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Success { result: Value },
    /// The request finished, but with a recovered problem such as an
    /// unparseable tool payload.
    Degraded { result: Value, reason: String },
}

impl Completion {
    pub fn result(&self) -> &Value {
        match self {
            Completion::Success { result } | Completion::Degraded { result, .. } => result,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Completion::Degraded { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayKind {
    Event(StreamEvent),
    Finished(Result<Completion, PipelineError>),
}

/// One entry on the relay channel. Sequence numbers strictly increase in push order.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayItem {
    pub sequence: u64,
    pub kind: RelayKind,
}

/// Producer handle onto the relay channel.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RelayItem>,
    sequence: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl EventSink {
    /// Pushes one event. Fails once the consumer is gone, which also cancels the job.
    pub fn emit(&self, event: StreamEvent) -> PipelineResult<()> {
        self.push(RelayKind::Event(event))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn finish(&self, outcome: Result<Completion, PipelineError>) -> PipelineResult<()> {
        self.push(RelayKind::Finished(outcome))
    }

    fn push(&self, kind: RelayKind) -> PipelineResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.tx.send(RelayItem { sequence, kind }).map_err(|_| {
            self.cancel.cancel();
            PipelineError::ChannelClosedPrematurely
        })
    }
}

/// Runs one producer job on its own worker and hands back a blocking consumer.
#[derive(Debug, Clone, Default)]
pub struct StreamBridge {
    heartbeat: Option<Duration>,
}

impl StreamBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a `Heartbeat` every `interval` while the job is still running.
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval.filter(|d| !d.is_zero());
        self
    }

    /// Starts `job` on a dedicated thread with its own current-thread runtime.
    ///
    /// The job's future is built on that thread, so it does not need to be
    /// `Send`. Whatever the job returns becomes the terminal sentinel.
    pub fn spawn<F, Fut>(&self, job: F) -> RelayConsumer
    where
        F: FnOnce(EventSink) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Completion, PipelineError>> + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = EventSink {
            tx,
            sequence: Arc::new(AtomicU64::new(0)),
            cancel: cancel.clone(),
        };
        let heartbeat = self.heartbeat;

        let spawned = std::thread::Builder::new()
            .name("askstream-producer".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(error) => {
                        let _ = sink.finish(Err(PipelineError::upstream(format!(
                            "cannot start producer runtime: {error}"
                        ))));
                        return;
                    }
                };
                runtime.block_on(produce(job, sink, heartbeat));
            });
        if let Err(error) = spawned {
            tracing::error!(%error, "cannot spawn producer thread");
        }

        RelayConsumer::new(rx, cancel)
    }
}

async fn produce<F, Fut>(job: F, sink: EventSink, heartbeat: Option<Duration>)
where
    F: FnOnce(EventSink) -> Fut,
    Fut: Future<Output = Result<Completion, PipelineError>>,
{
    let cancel = sink.cancel.clone();
    let job_future = job(sink.clone());
    tokio::pin!(job_future);
    let mut ticker =
        heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("consumer went away; abandoning producer job");
                return;
            }
            outcome = &mut job_future => break outcome,
            _ = next_tick(&mut ticker) => {
                let ts = chrono::Utc::now().timestamp_millis();
                if sink.emit(StreamEvent::Heartbeat { ts }).is_err() {
                    return;
                }
            }
        }
    };

    if let Err(error) = &outcome {
        tracing::warn!(%error, "producer job failed");
    }
    if sink.finish(outcome).is_err() {
        tracing::debug!("consumer dropped before the terminal event");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Blocking, in-order view of the relay channel.
///
/// Yields exactly one `End` and then nothing. Dropping it cancels the producer.
pub struct RelayConsumer {
    rx: mpsc::UnboundedReceiver<RelayItem>,
    cancel: CancellationToken,
    queued: VecDeque<StreamEvent>,
    last_sequence: Option<u64>,
    outcome: Option<Result<Completion, PipelineError>>,
}

impl RelayConsumer {
    fn new(rx: mpsc::UnboundedReceiver<RelayItem>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            cancel,
            queued: VecDeque::new(),
            last_sequence: None,
            outcome: None,
        }
    }

    /// The terminal outcome, once `End` has been yielded.
    pub fn outcome(&self) -> Option<&Result<Completion, PipelineError>> {
        self.outcome.as_ref()
    }

    fn on_item(&mut self, item: RelayItem) -> StreamEvent {
        if let Some(last) = self.last_sequence {
            if item.sequence <= last {
                tracing::warn!(sequence = item.sequence, last, "relay item out of order");
            }
        }
        self.last_sequence = Some(item.sequence);

        match item.kind {
            RelayKind::Event(event) => event,
            RelayKind::Finished(Ok(completion)) => {
                if let Completion::Degraded { reason, .. } = &completion {
                    tracing::info!(%reason, "request finished degraded");
                }
                self.outcome = Some(Ok(completion));
                StreamEvent::End { ok: true }
            }
            RelayKind::Finished(Err(error)) => {
                let message = error.to_string();
                self.outcome = Some(Err(error));
                self.queued.push_back(StreamEvent::End { ok: false });
                StreamEvent::Error { message }
            }
        }
    }
}

impl Iterator for RelayConsumer {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.queued.pop_front() {
            return Some(event);
        }
        if self.outcome.is_some() {
            return None;
        }

        match self.rx.blocking_recv() {
            Some(item) => Some(self.on_item(item)),
            None => {
                tracing::warn!("relay channel closed without a terminal event");
                self.outcome = Some(Err(PipelineError::ChannelClosedPrematurely));
                Some(StreamEvent::End { ok: false })
            }
        }
    }
}

impl Drop for RelayConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
