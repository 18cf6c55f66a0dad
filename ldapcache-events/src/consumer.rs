//! Event consumer: feed to shards.
//!
//! Runs on a single task until the shutdown signal fires or the feed ends.
//! Per delivery:
//!
//! 1. Project and route the change in one write transaction
//! 2. Acknowledge only after the commit
//! 3. Count the message and run cleanup when the cadence says so
//!
//! Mapping errors are acknowledged and skipped. Transport errors are never
//! acknowledged; the consumer reconnects with backoff. Transient storage
//! errors, during a change or a cleanup pass, are retried with exponential
//! backoff; once retries run out, or on any other storage error, `run`
//! returns the error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ldapcache_core::{CacheError, ChangeEvent, ConsumerConfig, TransportError};
use tokio::sync::watch;

use crate::feed::{ChangeFeed, Delivery};
use crate::routing::{ChangeSink, RouteOutcome, Router};
use crate::scheduler::MaintenanceScheduler;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Waiting for the next message.
    Idle,
    /// Feed (re)established, nothing received yet.
    Connected,
    /// Applying a delivery.
    Processing,
    /// Feed failed; reconnecting.
    Disconnected,
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Committed and acknowledged.
    Applied(RouteOutcome),
    /// Mapping failed; acknowledged without changes.
    Skipped,
    /// Not acknowledged.
    Unacknowledged,
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for consumer activity since startup.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Deliveries received, decodable or not
    pub received: AtomicU64,
    /// Deliveries committed and acknowledged
    pub applied: AtomicU64,
    /// Deliveries acknowledged after a mapping error
    pub skipped: AtomicU64,
    /// Payloads that could not be decoded
    pub malformed: AtomicU64,
    /// Transient storage retries
    pub retries: AtomicU64,
    /// Successful reconnects
    pub reconnects: AtomicU64,
    /// Completed cleanup passes
    pub cleanup_runs: AtomicU64,
    /// Entries evicted by cleanup
    pub cleanup_removed: AtomicU64,
    /// Cleanup passes that failed
    pub cleanup_errors: AtomicU64,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            cleanup_removed: self.cleanup_removed.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ConsumerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSnapshot {
    pub received: u64,
    pub applied: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub retries: u64,
    pub reconnects: u64,
    pub cleanup_runs: u64,
    pub cleanup_removed: u64,
    pub cleanup_errors: u64,
}

// ============================================================================
// CONSUMER
// ============================================================================

pub struct EventConsumer<F, S = Router> {
    sink: S,
    feed: F,
    config: ConsumerConfig,
    scheduler: MaintenanceScheduler,
    state: ConsumerState,
    metrics: Arc<ConsumerMetrics>,
}

impl<F: ChangeFeed, S: ChangeSink> EventConsumer<F, S> {
    pub fn new(sink: S, feed: F, config: ConsumerConfig) -> Self {
        let scheduler = MaintenanceScheduler::new(config.cleanup_interval);
        Self {
            sink,
            feed,
            config,
            scheduler,
            state: ConsumerState::Idle,
            metrics: Arc::new(ConsumerMetrics::new()),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn scheduler(&self) -> &MaintenanceScheduler {
        &self.scheduler
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            tracing::trace!(from = ?self.state, to = ?next, "Consumer state change");
            self.state = next;
        }
    }

    /// Consume until shutdown or end of feed.
    ///
    /// Returns `Err` only for storage failures that need an operator.
    pub async fn run(
        &mut self,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<ConsumerSnapshot, CacheError> {
        tracing::info!(
            cleanup_interval = self.config.cleanup_interval,
            max_retries = self.config.retry.max_retries,
            "Event consumer started"
        );
        self.transition(ConsumerState::Connected);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown_rx.changed() => None,
                next = self.feed.next() => Some(next),
            };

            match next {
                None => {
                    // Sender dropped or shutdown requested.
                    if shutdown_rx.has_changed().is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(Ok(None)) => {
                    tracing::info!("Change feed ended");
                    break;
                }
                Some(Ok(Some(delivery))) => {
                    self.metrics.received.fetch_add(1, Ordering::Relaxed);
                    if self.handle(delivery, &mut shutdown_rx).await? == Disposition::Unacknowledged
                        && *shutdown_rx.borrow()
                    {
                        break;
                    }
                }
                Some(Err(TransportError::Malformed { delivery, reason })) => {
                    self.metrics.received.fetch_add(1, Ordering::Relaxed);
                    self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(delivery, reason = %reason, "Dropping malformed message without ack");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Change feed failed");
                    if !self.reconnect(&mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConsumerState::Idle);
        let snapshot = self.metrics.snapshot();
        tracing::info!(
            applied = snapshot.applied,
            skipped = snapshot.skipped,
            malformed = snapshot.malformed,
            cleanup_runs = snapshot.cleanup_runs,
            "Event consumer stopped"
        );
        Ok(snapshot)
    }

    /// Apply, acknowledge and count one delivery.
    async fn handle(
        &mut self,
        delivery: Delivery,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Disposition, CacheError> {
        self.transition(ConsumerState::Processing);
        let Delivery { id, event } = delivery;

        if event.kind().is_none() {
            self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(delivery = id, dn = %event.dn, "Change without old or new state, not acknowledged");
            self.transition(ConsumerState::Idle);
            return Ok(Disposition::Unacknowledged);
        }

        let Some(disposition) = self.apply_with_retry(&event, shutdown_rx).await? else {
            tracing::info!(delivery = id, dn = %event.dn, "Shutdown during retry, not acknowledged");
            self.transition(ConsumerState::Idle);
            return Ok(Disposition::Unacknowledged);
        };

        if let Err(e) = self.feed.ack(id).await {
            tracing::warn!(delivery = id, error = %e, "Acknowledgement failed");
            self.reconnect(shutdown_rx).await;
            return Ok(Disposition::Unacknowledged);
        }

        match disposition {
            Disposition::Applied(outcome) => {
                self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    delivery = id,
                    dn = %event.dn,
                    removed = outcome.removed,
                    stored = outcome.stored,
                    "Applied change"
                );
            }
            _ => {
                self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }

        if self.scheduler.record_processed() {
            self.run_cleanup(shutdown_rx).await?;
        }
        self.transition(ConsumerState::Idle);
        Ok(disposition)
    }

    /// Route the event, retrying transient storage failures.
    ///
    /// `Ok(None)` means shutdown interrupted a backoff.
    async fn apply_with_retry(
        &mut self,
        event: &ChangeEvent,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<Disposition>, CacheError> {
        let mut attempt = 0;
        loop {
            match self.sink.route(event) {
                Ok(outcome) => return Ok(Some(Disposition::Applied(outcome))),
                Err(CacheError::Mapping(e)) => {
                    tracing::warn!(dn = %e.dn(), error = %e, "Skipping change that cannot be mapped");
                    return Ok(Some(Disposition::Skipped));
                }
                Err(CacheError::Storage(e))
                    if e.is_transient() && attempt < self.config.retry.max_retries =>
                {
                    attempt += 1;
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.config.retry.backoff_for(attempt);
                    tracing::warn!(
                        dn = %event.dn,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient storage error, retrying"
                    );
                    if !sleep_unless_shutdown(backoff, shutdown_rx).await {
                        return Ok(None);
                    }
                }
                Err(e) => {
                    tracing::error!(dn = %event.dn, error = %e, "Storage failure, stopping consumer");
                    return Err(e);
                }
            }
        }
    }

    /// Run one cleanup pass, retrying transient failures like a change.
    ///
    /// A shutdown during backoff abandons the pass; the next interval runs
    /// it again.
    async fn run_cleanup(
        &mut self,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), CacheError> {
        let mut attempt = 0;
        loop {
            match self.sink.cleanup() {
                Ok(report) => {
                    self.metrics.cleanup_runs.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .cleanup_removed
                        .fetch_add(report.removed as u64, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.config.retry.max_retries => {
                    attempt += 1;
                    self.metrics.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.config.retry.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Cleanup failed, retrying"
                    );
                    if !sleep_unless_shutdown(backoff, shutdown_rx).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.metrics.cleanup_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %e, "Cleanup hit a storage failure");
                    return Err(e.into());
                }
            }
        }
    }

    /// Reconnect with backoff until it works or shutdown is requested.
    async fn reconnect(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        self.transition(ConsumerState::Disconnected);
        loop {
            if !sleep_unless_shutdown(self.config.reconnect_backoff, shutdown_rx).await {
                return false;
            }
            match self.feed.reconnect().await {
                Ok(()) => {
                    self.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Change feed reconnected");
                    self.transition(ConsumerState::Connected);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Reconnect failed");
                }
            }
        }
    }
}

/// Sleep for `duration`; `false` if shutdown was requested first.
async fn sleep_unless_shutdown(duration: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
        _ = tokio::time::sleep(duration) => true,
    }
}
