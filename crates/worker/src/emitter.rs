//! Asynchronous event delivery
//!
//! Step execution never waits on the network: [`Emitter::emit`] only enqueues.
//! A background forwarder drains the queue in order, posts events in batches
//! and retries transient failures with exponential backoff.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use runcast_common::RunEvent;

use crate::config::RuntimeConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::source::check_status;

/// Delivers a batch of events belonging to one run
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn send(&self, run_id: &str, events: &[RunEvent]) -> WorkerResult<()>;
}

/// Posts events to the server's ingest endpoint
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: &str, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }
}

#[async_trait]
impl EventTransport for HttpTransport {
    async fn send(&self, run_id: &str, events: &[RunEvent]) -> WorkerResult<()> {
        let response = self
            .client
            .post(format!("{}/api/runs/{}/events", self.base_url, run_id))
            .timeout(self.request_timeout)
            .json(events)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Batching and retry policy of the forwarder
#[derive(Debug, Clone)]
pub struct EmitterConfig {
    pub batch_max: usize,
    pub attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

impl From<&RuntimeConfig> for EmitterConfig {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            batch_max: runtime.emit_batch_max.max(1),
            attempts: runtime.emit_attempts.max(1),
            retry_base: Duration::from_millis(runtime.emit_retry_base_ms),
            retry_cap: Duration::from_millis(runtime.emit_retry_cap_ms),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
}

enum Command {
    Event(RunEvent),
    Flush(oneshot::Sender<()>),
}

/// Handle for queueing events; cheap to clone
#[derive(Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
}

impl Emitter {
    /// Start the forwarder task. It stops once every handle is dropped and the
    /// queue is drained.
    pub fn spawn<T>(transport: T, config: EmitterConfig) -> (Emitter, JoinHandle<()>)
    where
        T: EventTransport + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let forwarder = Forwarder {
            transport,
            config,
            counters: counters.clone(),
            rx,
        };
        (Emitter { tx, counters }, tokio::spawn(forwarder.run()))
    }

    /// Queue an event; never blocks
    pub fn emit(&self, event: RunEvent) {
        if self.tx.send(Command::Event(event)).is_err() {
            warn!("Event forwarder stopped, dropping event");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wait until everything queued before this call was delivered (or given up on)
    pub async fn flush(&self) -> WorkerResult<()> {
        let (done, wait) = oneshot::channel();
        self.tx
            .send(Command::Flush(done))
            .map_err(|_| WorkerError::EmitterClosed)?;
        wait.await.map_err(|_| WorkerError::EmitterClosed)
    }

    pub fn sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.counters.retries.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

struct Forwarder<T> {
    transport: T,
    config: EmitterConfig,
    counters: Arc<Counters>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl<T: EventTransport> Forwarder<T> {
    async fn run(mut self) {
        let mut pending = Vec::new();
        let mut flushes = Vec::new();

        while let Some(command) = self.rx.recv().await {
            absorb(command, &mut pending, &mut flushes);
            // Gather what is already queued, but never past a flush marker
            while flushes.is_empty() && pending.len() < self.config.batch_max {
                match self.rx.try_recv() {
                    Ok(command) => absorb(command, &mut pending, &mut flushes),
                    Err(_) => break,
                }
            }

            self.deliver(std::mem::take(&mut pending)).await;
            for done in flushes.drain(..) {
                let _ = done.send(());
            }
        }
        debug!("Event forwarder stopped");
    }

    async fn deliver(&self, events: Vec<RunEvent>) {
        for (run_id, batch) in batches(events, self.config.batch_max) {
            self.send_with_retry(&run_id, &batch).await;
        }
    }

    async fn send_with_retry(&self, run_id: &str, batch: &[RunEvent]) {
        let mut delay = self.config.retry_base;
        for attempt in 1..=self.config.attempts {
            match self.transport.send(run_id, batch).await {
                Ok(()) => {
                    self.counters
                        .sent
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return;
                }
                Err(e) if e.is_retryable() && attempt < self.config.attempts => {
                    warn!(
                        "Posting {} events for run {} failed (attempt {}): {}",
                        batch.len(),
                        run_id,
                        attempt,
                        e
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.retry_cap);
                }
                Err(e) => {
                    error!(
                        "Dropping {} events for run {} after {} attempts: {}",
                        batch.len(),
                        run_id,
                        attempt,
                        e
                    );
                    self.counters
                        .dropped
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

fn absorb(command: Command, pending: &mut Vec<RunEvent>, flushes: &mut Vec<oneshot::Sender<()>>) {
    match command {
        Command::Event(event) => pending.push(event),
        Command::Flush(done) => flushes.push(done),
    }
}

/// Split events into consecutive same-run batches of at most `max` events
fn batches(events: Vec<RunEvent>, max: usize) -> Vec<(String, Vec<RunEvent>)> {
    let mut out: Vec<(String, Vec<RunEvent>)> = Vec::new();
    for event in events {
        match out.last_mut() {
            Some((run_id, batch)) if run_id.as_str() == event.run_id() && batch.len() < max => {
                batch.push(event)
            }
            _ => out.push((event.run_id().to_string(), vec![event])),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        posts: Mutex<Vec<(String, Vec<RunEvent>)>>,
        fail_first: Mutex<u32>,
        reject: bool,
    }

    #[async_trait]
    impl EventTransport for Arc<Recording> {
        async fn send(&self, run_id: &str, events: &[RunEvent]) -> WorkerResult<()> {
            if self.reject {
                return Err(WorkerError::Server {
                    status: 400,
                    body: "bad event".into(),
                });
            }
            {
                let mut fail = self.fail_first.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(WorkerError::Server {
                        status: 503,
                        body: "busy".into(),
                    });
                }
            }
            self.posts.lock().push((run_id.to_string(), events.to_vec()));
            Ok(())
        }
    }

    fn frame(run: &str, n: i64) -> RunEvent {
        RunEvent::Frame {
            run_id: run.into(),
            step_id: "s".into(),
            url: format!("http://a/{}.png", n),
            ts: n,
        }
    }

    fn fast() -> EmitterConfig {
        EmitterConfig {
            batch_max: 3,
            attempts: 4,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_batches_split_by_run_and_size() {
        let events = vec![frame("a", 1), frame("a", 2), frame("b", 3), frame("a", 4), frame("a", 5)];
        let out = batches(events, 1);
        assert_eq!(out.len(), 5);

        let events = vec![frame("a", 1), frame("a", 2), frame("b", 3), frame("a", 4), frame("a", 5)];
        let out = batches(events, 10);
        let runs: Vec<_> = out.iter().map(|(r, b)| (r.as_str(), b.len())).collect();
        assert_eq!(runs, vec![("a", 2), ("b", 1), ("a", 2)]);
    }

    #[tokio::test]
    async fn test_order_preserved_through_retries() {
        let transport = Arc::new(Recording {
            fail_first: Mutex::new(2),
            ..Recording::default()
        });
        let (emitter, handle) = Emitter::spawn(transport.clone(), fast());

        for n in 0..10 {
            emitter.emit(frame("r1", n));
        }
        emitter.flush().await.unwrap();

        let delivered: Vec<i64> = transport
            .posts
            .lock()
            .iter()
            .flat_map(|(_, batch)| batch.iter().map(RunEvent::ts))
            .collect();
        assert_eq!(delivered, (0..10).collect::<Vec<_>>());
        assert!(transport.posts.lock().iter().all(|(_, b)| b.len() <= 3));
        assert_eq!(emitter.sent(), 10);
        assert_eq!(emitter.retries(), 2);
        assert_eq!(emitter.dropped(), 0);

        drop(emitter);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_batch_is_dropped_and_flush_returns() {
        let transport = Arc::new(Recording {
            reject: true,
            ..Recording::default()
        });
        let (emitter, _handle) = Emitter::spawn(transport.clone(), fast());

        emitter.emit(frame("r1", 1));
        emitter.flush().await.unwrap();
        assert_eq!(emitter.dropped(), 1);
        assert_eq!(emitter.retries(), 0);
        assert!(transport.posts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let transport = Arc::new(Recording {
            fail_first: Mutex::new(100),
            ..Recording::default()
        });
        let (emitter, _handle) = Emitter::spawn(transport.clone(), fast());

        emitter.emit(frame("r1", 1));
        emitter.emit(frame("r1", 2));
        emitter.flush().await.unwrap();
        assert_eq!(emitter.retries(), 3);
        assert_eq!(emitter.dropped(), 2);
    }
}
