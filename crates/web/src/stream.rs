//! Event publisher / stream manager
//!
//! Maps run id to the set of live viewer sinks, folds every published event
//! into a live copy of the run, and finalizes runs into the store.
//!
//! Lock order per run: the channel's state mutex (async, held while an event
//! is folded, persisted and fanned out) then the sink list (sync, held only
//! to copy or edit the list). Sinks are written outside the sink lock and
//! never block.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runcast_common::{
    now_millis, Applied, Error, JobQueue, Result, Run, RunEvent, RunReducer, RunStore,
    StreamMessage,
};

use crate::config::StreamConfig;
use crate::sink::{Pushed, Sink, SinkReceiver};

/// What happened to one published event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    /// Folded and fanned out to `sinks` subscribers
    Delivered { sinks: usize },
    /// Event for a run that already is terminal; nothing was folded
    Duplicate,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    duplicates_dropped: AtomicU64,
    finalized: AtomicU64,
    finalized_by_guard: AtomicU64,
    sink_overflows: AtomicU64,
    store_retries: AtomicU64,
}

/// Point-in-time view of the stream manager counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    pub published: u64,
    pub duplicates_dropped: u64,
    pub finalized: u64,
    pub finalized_by_guard: u64,
    pub sink_overflows: u64,
    pub store_retries: u64,
    pub unflushed: usize,
    pub channels: usize,
    pub sinks: usize,
}

/// Live state of one run id
struct RunChannel {
    sinks: Mutex<Vec<Sink>>,
    /// `None` until loaded from the store
    state: tokio::sync::Mutex<Option<RunReducer>>,
    guard_armed: AtomicBool,
}

impl RunChannel {
    fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            state: tokio::sync::Mutex::new(None),
            guard_armed: AtomicBool::new(false),
        }
    }

    /// Copy of the open sinks; closed ones are purged on the way.
    fn live_sinks(&self) -> Vec<Sink> {
        let mut sinks = self.sinks.lock();
        sinks.retain(|sink| !sink.is_closed());
        sinks.clone()
    }
}

pub struct StreamManager {
    store: Arc<dyn RunStore>,
    /// Job leases; a run whose job is still leased has a live worker
    leases: Option<JobQueue>,
    config: StreamConfig,
    channels: DashMap<String, Arc<RunChannel>>,
    /// Finalized runs the store has not accepted yet
    unflushed: Mutex<HashMap<String, Run>>,
    counters: Counters,
    next_sink: AtomicU64,
}

impl StreamManager {
    pub fn new(store: Arc<dyn RunStore>, config: StreamConfig) -> Arc<Self> {
        Self::build(store, None, config)
    }

    /// Stream manager whose finalization guard waits for the job lease to lapse
    pub fn with_leases(store: Arc<dyn RunStore>, leases: JobQueue, config: StreamConfig) -> Arc<Self> {
        Self::build(store, Some(leases), config)
    }

    fn build(store: Arc<dyn RunStore>, leases: Option<JobQueue>, config: StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            leases,
            config,
            channels: DashMap::new(),
            unflushed: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            next_sink: AtomicU64::new(1),
        })
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// New sink/receiver pair with the configured capacity
    pub fn open_sink(&self) -> (Sink, SinkReceiver) {
        let id = self.next_sink.fetch_add(1, Ordering::Relaxed);
        Sink::channel(id, self.config.sink_capacity)
    }

    /// Current durable view of a run, including finalized runs still waiting
    /// for the store.
    pub fn snapshot(&self, run_id: &str) -> Result<Option<Run>> {
        if let Some(run) = self.unflushed.lock().get(run_id) {
            return Ok(Some(run.clone()));
        }
        self.store.get(run_id)
    }

    fn channel(&self, run_id: &str) -> Arc<RunChannel> {
        self.channels
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(RunChannel::new()))
            .clone()
    }

    fn load<'a>(
        &self,
        run_id: &str,
        state: &'a mut Option<RunReducer>,
    ) -> Result<&'a mut RunReducer> {
        let reducer = match state.take() {
            Some(reducer) => reducer,
            None => match self.snapshot(run_id)? {
                Some(run) => RunReducer::with_snapshot(run),
                None => RunReducer::new(run_id),
            },
        };
        Ok(state.insert(reducer))
    }

    /// Register a sink for a run. The sink gets a `connected` acknowledgement
    /// and nothing is replayed; a run that already is terminal is ended at once.
    pub async fn subscribe(&self, run_id: &str, sink: Sink) -> Result<()> {
        let channel = self.channel(run_id);
        let mut state = channel.state.lock().await;
        let reducer = self.load(run_id, &mut state)?;

        sink.push(StreamMessage::Connected {
            run_id: run_id.to_string(),
        });
        if reducer.is_terminal() {
            debug!("Run {} already finished, ending subscription {}", run_id, sink.id());
            sink.push(StreamMessage::End {
                run_id: run_id.to_string(),
            });
            sink.close();
            drop(state);
            self.prune(run_id, &channel);
            return Ok(());
        }

        channel.sinks.lock().push(sink);
        debug!("Subscribed sink to run {}", run_id);
        Ok(())
    }

    /// Remove and close a sink. Unknown ids are ignored.
    pub fn unsubscribe(&self, run_id: &str, sink_id: u64) {
        let Some(channel) = self.channels.get(run_id).map(|c| c.clone()) else {
            return;
        };
        {
            let mut sinks = channel.sinks.lock();
            if let Some(pos) = sinks.iter().position(|s| s.id() == sink_id) {
                sinks.swap_remove(pos).close();
                debug!("Unsubscribed sink {} from run {}", sink_id, run_id);
            }
        }
        self.prune(run_id, &channel);
    }

    /// Drop the channel once nobody listens and nothing more can happen to it.
    fn prune(&self, run_id: &str, channel: &Arc<RunChannel>) {
        if !channel.live_sinks().is_empty() {
            return;
        }
        let finished = match channel.state.try_lock() {
            Ok(state) => state.as_ref().map_or(true, RunReducer::is_terminal),
            Err(_) => false,
        };
        if finished {
            self.channels
                .remove_if(run_id, |_, current| Arc::ptr_eq(current, channel));
        }
    }

    /// Fold one event into the run and fan it out to every subscriber.
    pub async fn publish(self: &Arc<Self>, run_id: &str, event: RunEvent) -> Result<Published> {
        if event.run_id() != run_id {
            return Err(Error::InvalidEvent(format!(
                "event for run {} published to run {}",
                event.run_id(),
                run_id
            )));
        }

        let channel = self.channel(run_id);
        let mut state = channel.state.lock().await;
        let reducer = self.load(run_id, &mut state)?;

        if reducer.is_terminal() {
            self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            let status = reducer.run().map(|r| r.status.as_str()).unwrap_or("terminal");
            if event.is_run_finished() {
                info!("Dropping duplicate {} for run {} (already {})", event.kind(), run_id, status);
            } else {
                debug!("Dropping late {} for run {} (already {})", event.kind(), run_id, status);
            }
            drop(state);
            self.prune(run_id, &channel);
            return Ok(Published::Duplicate);
        }

        let applied = reducer.apply(&event);
        self.counters.published.fetch_add(1, Ordering::Relaxed);

        if event.is_run_finished() {
            if let Some(run) = reducer.run() {
                self.persist_final(run).await;
            }
            self.counters.finalized.fetch_add(1, Ordering::Relaxed);
            info!("Run {} finished", run_id);
            let sinks = self.fan_out(&channel, &event);
            self.close_out(run_id, &channel);
            return Ok(Published::Delivered { sinks });
        }

        if applied == Applied::Changed {
            if let Some(run) = reducer.run() {
                if let Err(e) = self.store.put(run) {
                    warn!("Failed to persist progress of run {}: {}", run_id, e);
                }
            }
        }
        let sinks = self.fan_out(&channel, &event);

        let needs_guard = matches!(event, RunEvent::StepEnd { .. })
            && reducer
                .run()
                .map_or(false, |run| !run.is_terminal() && run.all_steps_terminal());
        if needs_guard {
            if self.config.finalize_grace.is_zero() {
                self.finalize_if_complete(run_id, reducer, &channel).await;
            } else if !channel.guard_armed.swap(true, Ordering::AcqRel) {
                debug!(
                    "All steps of run {} terminal, finalizing in {:?} unless it finishes",
                    run_id, self.config.finalize_grace
                );
                tokio::spawn(Arc::clone(self).run_guard(run_id.to_string()));
            }
        }

        Ok(Published::Delivered { sinks })
    }

    /// Deferred guard. Re-armed every grace period while a worker still holds
    /// the job lease; the lease lapsing (or an ack) is the crash signal.
    async fn run_guard(self: Arc<Self>, run_id: String) {
        loop {
            tokio::time::sleep(self.config.finalize_grace).await;
            let Some(channel) = self.channels.get(&run_id).map(|c| c.clone()) else {
                return;
            };
            if self.lease_is_live(&run_id) {
                debug!("Run {} is still leased by a worker, deferring finalization", run_id);
                continue;
            }
            channel.guard_armed.store(false, Ordering::Release);
            let mut state = channel.state.lock().await;
            if let Some(reducer) = state.as_mut() {
                self.finalize_if_complete(&run_id, reducer, &channel).await;
            }
            return;
        }
    }

    fn lease_is_live(&self, run_id: &str) -> bool {
        let Some(leases) = &self.leases else {
            return false;
        };
        match leases.lease_holder(run_id) {
            Ok(holder) => holder.is_some(),
            Err(e) => {
                warn!("Cannot read job lease of run {}: {}", run_id, e);
                true
            }
        }
    }

    /// Finalization guard: a run whose steps all reached a terminal status is
    /// finished with the aggregate status and a synthetic `RunFinished`.
    async fn finalize_if_complete(
        &self,
        run_id: &str,
        reducer: &mut RunReducer,
        channel: &Arc<RunChannel>,
    ) {
        let status = match reducer.run() {
            Some(run) if !run.is_terminal() && run.all_steps_terminal() => run.aggregate_status(),
            _ => return,
        };

        let synthetic = RunEvent::RunFinished {
            run_id: run_id.to_string(),
            status,
            video: None,
            trace: None,
            ts: now_millis(),
        };
        reducer.apply(&synthetic);
        if let Some(run) = reducer.run() {
            self.persist_final(run).await;
        }
        self.counters.finalized.fetch_add(1, Ordering::Relaxed);
        self.counters.finalized_by_guard.fetch_add(1, Ordering::Relaxed);
        info!("Run {} finalized as {} without an explicit finish", run_id, status);

        self.fan_out(channel, &synthetic);
        self.close_out(run_id, channel);
    }

    /// Write a terminal run, retrying with exponential backoff. A run the
    /// store keeps refusing is parked for the background flusher.
    async fn persist_final(&self, run: &Run) -> bool {
        let mut delay = self.config.retry_base;
        for attempt in 1..=self.config.finalize_attempts {
            match self.store.put(run) {
                Ok(()) => {
                    if attempt > 1 {
                        info!("Persisted run {} on attempt {}", run.id, attempt);
                    }
                    return true;
                }
                Err(e) if attempt < self.config.finalize_attempts => {
                    self.counters.store_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Failed to persist finished run {} (attempt {}/{}): {}, retrying in {:?}",
                        run.id, attempt, self.config.finalize_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.config.retry_cap);
                }
                Err(e) => {
                    error!(
                        "Failed to persist finished run {} after {} attempts: {}",
                        run.id, attempt, e
                    );
                }
            }
        }
        self.unflushed.lock().insert(run.id.clone(), run.clone());
        false
    }

    /// One pass over parked runs. Returns how many are still parked.
    pub fn flush_unflushed(&self) -> usize {
        let parked: Vec<Run> = self.unflushed.lock().values().cloned().collect();
        for run in parked {
            match self.store.put(&run) {
                Ok(()) => {
                    info!("Flushed parked run {}", run.id);
                    self.unflushed.lock().remove(&run.id);
                }
                Err(e) => debug!("Run {} still not accepted by the store: {}", run.id, e),
            }
        }
        self.unflushed.lock().len()
    }

    /// Retry parked runs every `flush_interval` until cancelled, with a last
    /// pass on the way out.
    pub async fn run_flusher(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if !self.unflushed.lock().is_empty() {
                        self.flush_unflushed();
                    }
                }
            }
        }
        let left = self.flush_unflushed();
        if left > 0 {
            error!("{} finished runs could not be persisted before shutdown", left);
        }
    }

    fn fan_out(&self, channel: &RunChannel, event: &RunEvent) -> usize {
        let sinks = channel.live_sinks();
        for sink in &sinks {
            if sink.push(StreamMessage::Event(event.clone())) == Pushed::Overflowed {
                self.counters.sink_overflows.fetch_add(1, Ordering::Relaxed);
                debug!("Sink {} overflowed, dropped its oldest message", sink.id());
            }
        }
        sinks.len()
    }

    /// Send the end sentinel, close every sink and retire the channel.
    fn close_out(&self, run_id: &str, channel: &Arc<RunChannel>) {
        let sinks: Vec<Sink> = std::mem::take(&mut *channel.sinks.lock());
        for sink in sinks {
            sink.push(StreamMessage::End {
                run_id: run_id.to_string(),
            });
            sink.close();
        }
        self.channels
            .remove_if(run_id, |_, current| Arc::ptr_eq(current, channel));
    }

    pub fn stats(&self) -> StreamStats {
        let sinks = self
            .channels
            .iter()
            .map(|entry| entry.value().sinks.lock().len())
            .sum();
        StreamStats {
            published: self.counters.published.load(Ordering::Relaxed),
            duplicates_dropped: self.counters.duplicates_dropped.load(Ordering::Relaxed),
            finalized: self.counters.finalized.load(Ordering::Relaxed),
            finalized_by_guard: self.counters.finalized_by_guard.load(Ordering::Relaxed),
            sink_overflows: self.counters.sink_overflows.load(Ordering::Relaxed),
            store_retries: self.counters.store_retries.load(Ordering::Relaxed),
            unflushed: self.unflushed.lock().len(),
            channels: self.channels.len(),
            sinks,
        }
    }
}
