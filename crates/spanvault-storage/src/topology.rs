//! The streaming aggregation topology.
//!
//! Four worker stages, each a tokio task per owned log partition:
//!
//! ```text
//! spans topic ──(router)──> spans-by-trace ──(trace aggregator)──┬─> traces topic (changelog)
//!                                                                ├─> services topic ──(indexer)──> service_operations
//!                                                                └─> dependencies topic ──(aggregator)──> dependencies
//! ```
//!
//! Workers never share mutable state: partition ownership is disjoint, and
//! every mutation commits in one state-keyspace batch together with the
//! worker's consumed offset. Appends to downstream topics happen before that
//! commit, so a crash can only re-append — and every downstream stage is
//! idempotent (set union) or deduplicates by record identity (`link_seen`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spanvault_core::config::EngineConfig;
use spanvault_core::error::{LogError, StorageError};
use spanvault_core::span::{Span, SpanId, SpanKind, TraceId};
use spanvault_log::{FjallSpanLog, LogRecord};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::keys;
use crate::stores::{
    EdgeCounts, LinkState, StateStores, get_json, now_micros, offset_key, to_json,
};

pub(crate) const GROUP_ROUTER: &str = "span-router";
pub(crate) const GROUP_TRACES: &str = "trace-aggregator";
pub(crate) const GROUP_SERVICES: &str = "service-indexer";
pub(crate) const GROUP_DEPENDENCIES: &str = "dependency-aggregator";

const FETCH_BATCH: usize = 256;
const RETRY_DELAY: Duration = Duration::from_millis(500);
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// `(service, operation)` observation, published to the services topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServiceOpEvent {
    pub service: String,
    pub operation: String,
}

/// Completed client/server pair, published to the dependencies topic.
/// `trace_id`/`span_id` identify the pair for downstream deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct LinkEvent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent: String,
    pub child: String,
    pub errored: bool,
    pub timestamp_micros: u64,
}

#[derive(Debug, Error)]
enum WorkerError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone)]
pub(crate) struct Ctx {
    pub log: Arc<FjallSpanLog>,
    pub stores: Arc<StateStores>,
    pub cfg: Arc<EngineConfig>,
    /// Records skipped as malformed, across all workers.
    pub malformed: Arc<AtomicU64>,
}

type StepFn = fn(&Ctx, &str, u16, &LogRecord) -> Result<(), WorkerError>;

/// Handle to the running worker tasks.
pub(crate) struct Topology {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    malformed: Arc<AtomicU64>,
}

impl Topology {
    pub(crate) fn spawn(
        log: Arc<FjallSpanLog>,
        stores: Arc<StateStores>,
        cfg: Arc<EngineConfig>,
    ) -> Topology {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let malformed = Arc::new(AtomicU64::new(0));
        let ctx = Ctx {
            log,
            stores,
            cfg: cfg.clone(),
            malformed: malformed.clone(),
        };
        let mut handles = Vec::new();

        let stages: [(&'static str, String, u16, StepFn); 4] = [
            (
                GROUP_ROUTER,
                cfg.spans_topic.name.clone(),
                cfg.spans_topic.partitions,
                router_step,
            ),
            (
                GROUP_TRACES,
                cfg.repartition_topic().name,
                cfg.repartition_topic().partitions,
                trace_step,
            ),
            (
                GROUP_SERVICES,
                cfg.services_topic.name.clone(),
                cfg.services_topic.partitions,
                service_step,
            ),
            (
                GROUP_DEPENDENCIES,
                cfg.dependencies_topic.name.clone(),
                cfg.dependencies_topic.partitions,
                dependency_step,
            ),
        ];

        for (group, topic, partitions, step) in stages {
            for partition in 0..partitions {
                handles.push(tokio::spawn(run_worker(
                    ctx.clone(),
                    shutdown_rx.clone(),
                    group,
                    topic.clone(),
                    partition,
                    step,
                )));
            }
        }

        handles.push(tokio::spawn(run_janitor(ctx, shutdown_rx)));
        info!(workers = handles.len(), "aggregation topology started");

        Topology {
            shutdown_tx,
            handles,
            malformed,
        }
    }

    /// How many records have been skipped as malformed so far.
    pub(crate) fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Signal shutdown and wait up to `grace` per task; stragglers are
    /// aborted.
    pub(crate) async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let mut handle = handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("worker did not stop within the grace period; aborting");
                handle.abort();
            }
        }
        info!("aggregation topology stopped");
    }
}

/// One partition-owning worker: park on the log, apply records in order,
/// retry in place on transient failure without advancing the offset.
async fn run_worker(
    ctx: Ctx,
    mut shutdown: watch::Receiver<bool>,
    group: &'static str,
    topic: String,
    partition: u16,
    step: StepFn,
) {
    let mut next = match ctx.stores.committed_offset(group, &topic, partition) {
        Ok(offset) => offset,
        Err(e) => {
            warn!(group, partition, error = %e, "could not load committed offset; starting from the beginning");
            0
        }
    };
    debug!(group, topic = topic.as_str(), partition, from = next, "worker started");

    'outer: loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = ctx.log.wait_for(&topic, partition, next) => {
                if let Err(e) = res {
                    warn!(group, partition, error = %e, "log wait failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            }
        }

        let records = match ctx.log.fetch(&topic, partition, next, FETCH_BATCH) {
            Ok(records) => records,
            Err(e) => {
                warn!(group, partition, error = %e, "fetch failed");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        for record in records {
            match step(&ctx, &topic, partition, &record) {
                Ok(()) => next = record.offset + 1,
                Err(e) => {
                    // Offset was not committed; the record is retried as-is.
                    warn!(
                        group,
                        partition,
                        offset = record.offset,
                        error = %e,
                        "step failed; backing off"
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue 'outer;
                }
            }
            if *shutdown.borrow() {
                break 'outer;
            }
        }
    }
    debug!(group, topic = topic.as_str(), partition, "worker stopped");
}

fn commit_error(e: fjall::Error) -> WorkerError {
    WorkerError::Storage(StorageError::Write(e.to_string()))
}

/// Commit only the consumed offset; used when a record is skipped.
fn commit_offset(
    ctx: &Ctx,
    group: &str,
    topic: &str,
    partition: u16,
    next: u64,
) -> Result<(), WorkerError> {
    ctx.stores
        .offsets
        .insert(offset_key(group, topic, partition), next.to_be_bytes())
        .map_err(commit_error)
}

/// Stage 1: re-key spans by trace ID onto the repartition topic so every
/// span of a trace lands with exactly one aggregation worker.
fn router_step(ctx: &Ctx, topic: &str, partition: u16, record: &LogRecord) -> Result<(), WorkerError> {
    match serde_json::from_slice::<Span>(&record.value) {
        Ok(span) => {
            ctx.log.append(
                &ctx.cfg.repartition_topic().name,
                span.trace_id.as_bytes(),
                &record.value,
            )?;
        }
        Err(e) => {
            ctx.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(offset = record.offset, error = %e, "skipping malformed span record");
        }
    }
    commit_offset(ctx, GROUP_ROUTER, topic, partition, record.offset + 1)
}

/// Stage 2: merge the span into its trace, derive the service/operation and
/// dependency-link streams, and commit state + offset atomically.
fn trace_step(ctx: &Ctx, topic: &str, partition: u16, record: &LogRecord) -> Result<(), WorkerError> {
    let span = match serde_json::from_slice::<Span>(&record.value) {
        Ok(span) => span,
        Err(e) => {
            ctx.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(offset = record.offset, error = %e, "skipping malformed span record");
            return commit_offset(ctx, GROUP_TRACES, topic, partition, record.offset + 1);
        }
    };

    let stores = &ctx.stores;
    let offsets_key = offset_key(GROUP_TRACES, topic, partition);
    let trace_key = keys::trace_key(&span.trace_id);
    let mut trace: Vec<Span> = get_json(&stores.traces, &trace_key)?.unwrap_or_default();
    let new_trace = trace.is_empty();

    // A replayed span has already had all of its downstream effects; the
    // only thing left to do is advance the offset.
    let duplicate = trace
        .iter()
        .any(|s| s.span_id == span.span_id && s.kind == span.kind && s.service == span.service);
    if duplicate {
        let mut batch = stores.keyspace.batch();
        batch.insert(&stores.offsets, offsets_key, (record.offset + 1).to_be_bytes());
        return batch.commit().map_err(commit_error);
    }

    trace.push(span.clone());
    trace.sort_by(|a, b| {
        (a.timestamp_micros, a.span_id.0).cmp(&(b.timestamp_micros, b.span_id.0))
    });
    let trace_json = to_json(&trace)?;

    let mut batch = stores.keyspace.batch();
    batch.insert(&stores.traces, trace_key, trace_json.as_slice());
    if new_trace {
        batch.insert(
            &stores.trace_index,
            keys::trace_index_key(span.timestamp_micros, &span.trace_id),
            [],
        );
    }

    // Downstream appends go out before the batch commits. A crash in
    // between re-appends on replay; the indexer is idempotent and the
    // dependency aggregator deduplicates by (trace_id, span_id).
    ctx.log.append(
        &ctx.cfg.traces_topic.name,
        span.trace_id.as_bytes(),
        &trace_json,
    )?;

    let service_event = ServiceOpEvent {
        service: span.service.clone(),
        operation: span.operation.clone(),
    };
    ctx.log.append(
        &ctx.cfg.services_topic.name,
        &keys::service_op_key(&service_event.service, &service_event.operation),
        &to_json(&service_event)?,
    )?;

    if matches!(span.kind, SpanKind::Client | SpanKind::Server) {
        pair_link(ctx, &mut batch, &span)?;
    }

    batch.insert(&stores.offsets, offsets_key, (record.offset + 1).to_be_bytes());
    batch.commit().map_err(commit_error)
}

/// Correlate client/server spans sharing a span ID. One side waits in
/// `pending_links` until its peer arrives; the completed pair is published
/// once and the key is sealed so replays cannot re-open it.
fn pair_link(ctx: &Ctx, batch: &mut fjall::Batch, span: &Span) -> Result<(), WorkerError> {
    let stores = &ctx.stores;
    let link_key = keys::link_key(&span.trace_id, &span.span_id);

    match get_json::<LinkState>(&stores.pending_links, &link_key)? {
        None => {
            let awaiting = LinkState::AwaitingPeer {
                kind: span.kind,
                service: span.service.clone(),
                errored: span.is_errored(),
                timestamp_micros: span.timestamp_micros,
                since_micros: now_micros(),
            };
            batch.insert(&stores.pending_links, link_key, to_json(&awaiting)?);
        }
        Some(LinkState::AwaitingPeer {
            kind,
            service,
            errored,
            timestamp_micros,
            ..
        }) if kind != span.kind => {
            // Caller is always the client side.
            let (parent, child, timestamp) = if span.kind == SpanKind::Client {
                (span.service.clone(), service, span.timestamp_micros)
            } else {
                (service, span.service.clone(), timestamp_micros)
            };
            let event = LinkEvent {
                trace_id: span.trace_id,
                span_id: span.span_id,
                parent,
                child,
                errored: errored || span.is_errored(),
                timestamp_micros: timestamp,
            };
            ctx.log.append(
                &ctx.cfg.dependencies_topic.name,
                &keys::service_op_key(&event.parent, &event.child),
                &to_json(&event)?,
            )?;
            let sealed = LinkState::Completed {
                since_micros: now_micros(),
            };
            batch.insert(&stores.pending_links, link_key, to_json(&sealed)?);
        }
        // Same side again, or already completed: nothing to do.
        Some(_) => {}
    }
    Ok(())
}

/// Stage 3: idempotent set union into the service/operation index.
fn service_step(ctx: &Ctx, topic: &str, partition: u16, record: &LogRecord) -> Result<(), WorkerError> {
    let stores = &ctx.stores;
    let mut batch = stores.keyspace.batch();
    match serde_json::from_slice::<ServiceOpEvent>(&record.value) {
        Ok(event) => {
            batch.insert(
                &stores.service_operations,
                keys::service_op_key(&event.service, &event.operation),
                [],
            );
        }
        Err(e) => {
            ctx.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(offset = record.offset, error = %e, "skipping malformed service record");
        }
    }
    batch.insert(
        &stores.offsets,
        offset_key(GROUP_SERVICES, topic, partition),
        (record.offset + 1).to_be_bytes(),
    );
    batch.commit().map_err(commit_error)
}

/// Stage 4: bucketed edge counters, exact under replay thanks to the
/// `link_seen` markers committed in the same batch as the counts.
fn dependency_step(
    ctx: &Ctx,
    topic: &str,
    partition: u16,
    record: &LogRecord,
) -> Result<(), WorkerError> {
    let stores = &ctx.stores;
    let mut batch = stores.keyspace.batch();
    match serde_json::from_slice::<LinkEvent>(&record.value) {
        Ok(event) => {
            let link_key = keys::link_key(&event.trace_id, &event.span_id);
            let seen = stores
                .link_seen
                .get(link_key)
                .map_err(|e| StorageError::Read(e.to_string()))?
                .is_some();
            if !seen {
                let edge_key = keys::dependency_key(
                    keys::bucket_of(event.timestamp_micros),
                    &event.parent,
                    &event.child,
                );
                let mut counts: EdgeCounts =
                    get_json(&stores.dependencies, &edge_key)?.unwrap_or_default();
                counts.call_count += 1;
                if event.errored {
                    counts.error_count += 1;
                }
                batch.insert(&stores.dependencies, edge_key, to_json(&counts)?);
                batch.insert(&stores.link_seen, link_key, now_micros().to_be_bytes());
            }
        }
        Err(e) => {
            ctx.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(offset = record.offset, error = %e, "skipping malformed dependency record");
        }
    }
    batch.insert(
        &stores.offsets,
        offset_key(GROUP_DEPENDENCIES, topic, partition),
        (record.offset + 1).to_be_bytes(),
    );
    batch.commit().map_err(commit_error)
}

async fn run_janitor(ctx: Ctx, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweep(&ctx.stores, &ctx.cfg, now_micros()) {
                    warn!(error = %e, "retention sweep failed");
                }
            }
        }
    }
}

/// Retention sweep: evict traces past the retention window, dependency
/// buckets wholly behind the horizon, link-pairing state past the pairing
/// timeout, and dedup markers past retention.
pub(crate) fn sweep(stores: &StateStores, cfg: &EngineConfig, now: u64) -> Result<(), StorageError> {
    let read = |e: fjall::Error| StorageError::Read(e.to_string());
    let horizon = now.saturating_sub(cfg.retention.as_micros() as u64);
    let link_horizon = now.saturating_sub(cfg.link_timeout.as_micros() as u64);

    let mut batch = stores.keyspace.batch();
    let mut evicted_traces = 0usize;

    let index_end = keys::trace_index_key(horizon, &TraceId([0; 16]));
    for entry in stores.trace_index.range(..index_end) {
        let (key, _) = entry.map_err(read)?;
        let Some((_, trace_id)) = keys::split_trace_index_key(&key) else {
            continue;
        };
        batch.remove(&stores.traces, keys::trace_key(&trace_id));
        batch.remove(&stores.trace_index, key);
        evicted_traces += 1;
    }

    for entry in stores.dependencies.iter() {
        let (key, _) = entry.map_err(read)?;
        match keys::split_dependency_key(&key) {
            Some((bucket, _, _)) if bucket + keys::DEPENDENCY_BUCKET_MICROS <= horizon => {
                batch.remove(&stores.dependencies, key);
            }
            // Keys sort by bucket; the first live bucket ends the scan.
            Some(_) => break,
            None => continue,
        }
    }

    for entry in stores.pending_links.iter() {
        let (key, value) = entry.map_err(read)?;
        match serde_json::from_slice::<LinkState>(&value) {
            Ok(state) if state.since_micros() < link_horizon => {
                if matches!(state, LinkState::AwaitingPeer { .. }) {
                    debug!("expiring link that never saw its peer");
                }
                batch.remove(&stores.pending_links, key);
            }
            Ok(_) => {}
            Err(_) => batch.remove(&stores.pending_links, key),
        }
    }

    for entry in stores.link_seen.iter() {
        let (key, value) = entry.map_err(read)?;
        let seen = value
            .as_ref()
            .try_into()
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        if seen < horizon {
            batch.remove(&stores.link_seen, key);
        }
    }

    batch
        .commit()
        .map_err(|e| StorageError::Write(e.to_string()))?;
    if evicted_traces > 0 {
        debug!(evicted_traces, "evicted expired traces");
    }
    Ok(())
}
