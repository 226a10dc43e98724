// =============================================================================
// TIDESWAP - Confirmation Tracker
// =============================================================================
//
// Watches each in-flight order's funding transaction and drives the
// engine as the chain moves: confirmation depth toward finality while
// the funding is broadcast, timelock expiry once it is confirmed. One
// cancellable task per order; polls back off exponentially while the
// gateway is unreachable and give up with an Unknown verdict after a
// bounded number of consecutive failures rather than guessing at chain
// state.
//
// A negative depth after a successful broadcast means the transaction
// may have been evicted. One indexer answering not-found is not proof
// (a lagging endpoint forgets transactions its peers still carry), so
// eviction is declared only after several consecutive not-found polls;
// anything less keeps the watch alive and the order recoverable.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SwapEngine;
use crate::error::SwapError;
use crate::gateway::ChainGateway;
use crate::order::{OrderId, OrderStatus};
use crate::{DEFAULT_POLL_INTERVAL_SECS, EVICTION_POLLS, MAX_BACKOFF_SECS, MAX_POLL_FAILURES};

// =============================================================================
// Configuration and Verdicts
// =============================================================================

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub poll_interval: Duration,
    /// Consecutive gateway failures before the verdict is Unknown
    pub max_failures: u32,
    /// Consecutive not-found polls before funding counts as evicted
    pub eviction_polls: u32,
    pub max_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_failures: MAX_POLL_FAILURES,
            eviction_polls: EVICTION_POLLS,
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECS),
        }
    }
}

/// Final verdict of a tracking run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Still watching
    Pending,
    /// Funding reached the configured depth
    Confirmed,
    /// Transaction evicted or order failed
    Failed,
    /// Gave up after repeated gateway failures; chain state unverified
    Unknown,
}

/// One poll's effect on the tracking loop
enum Step {
    Continue,
    Done(ConfirmationStatus),
}

/// Counters carried between polls of one watch
#[derive(Default)]
struct PollCounters {
    /// Consecutive gateway failures
    failures: u32,
    /// Consecutive not-found depth reads for broadcast funding
    not_found: u32,
}

// =============================================================================
// Tracker
// =============================================================================

pub struct ConfirmationTracker {
    engine: Arc<SwapEngine>,
    gateway: Arc<dyn ChainGateway>,
    config: TrackerConfig,
    tasks: Mutex<HashMap<OrderId, JoinHandle<ConfirmationStatus>>>,
}

impl ConfirmationTracker {
    pub fn new(
        engine: Arc<SwapEngine>,
        gateway: Arc<dyn ChainGateway>,
        config: TrackerConfig,
    ) -> Arc<Self> {
        Arc::new(ConfirmationTracker {
            engine,
            gateway,
            config,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start watching an order. Replaces any existing watch for the same
    /// order.
    pub fn track(self: &Arc<Self>, id: OrderId) {
        let tracker = self.clone();
        let handle = tokio::spawn(async move { tracker.run(id).await });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.insert(id, handle) {
            previous.abort();
        }
    }

    /// Stop watching an order
    pub fn untrack(&self, id: &OrderId) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(id) {
            handle.abort();
        }
    }

    /// Resume watches for every active order after a restart
    pub fn resume(self: &Arc<Self>) -> Result<usize, SwapError> {
        let active = self.engine.recover()?;
        let count = active.len();
        for order in active {
            if matches!(
                order.status,
                OrderStatus::FundingBroadcast | OrderStatus::FundingConfirmed
            ) {
                self.track(order.id);
            }
        }
        Ok(count)
    }

    /// Number of live watches. Handles whose run has ended are dropped
    /// here, so finished watches do not accumulate in the map.
    pub fn tracked_count(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|_, task| !task.is_finished());
        tasks.len()
    }

    // =========================================================================
    // Polling Loop
    // =========================================================================

    async fn run(&self, id: OrderId) -> ConfirmationStatus {
        let mut counters = PollCounters::default();

        loop {
            match self.step(id, &mut counters).await {
                Step::Done(status) => {
                    info!(target: "tracker", "order {} tracking done: {:?}", id, status);
                    return status;
                }
                Step::Continue => {}
            }
            tokio::time::sleep(self.backoff(counters.failures)).await;
        }
    }

    /// One poll: read chain state, drive the engine, decide whether to
    /// keep watching. Factored out of the loop so tests can step it
    /// without timers.
    async fn step(&self, id: OrderId, counters: &mut PollCounters) -> Step {
        let order = match self.engine.get_order(&id) {
            Ok(order) => order,
            Err(e) => {
                warn!(target: "tracker", "order {} unreadable: {}", id, e);
                return Step::Done(ConfirmationStatus::Failed);
            }
        };

        match order.status {
            OrderStatus::FundingBroadcast => {
                let txid = match order.funding_txid.as_deref() {
                    Some(txid) => txid.to_string(),
                    None => return Step::Done(ConfirmationStatus::Failed),
                };

                match self.gateway.confirmation_depth(&txid).await {
                    Ok(depth) if depth < 0 => {
                        // The gateway answered, so this is not a poll
                        // failure, but absence needs corroboration
                        counters.failures = 0;
                        counters.not_found += 1;
                        if counters.not_found < self.config.eviction_polls {
                            warn!(target: "tracker",
                                "order {} funding {} not found ({}/{})",
                                id, txid, counters.not_found, self.config.eviction_polls
                            );
                            return Step::Continue;
                        }
                        warn!(target: "tracker", "order {} funding {} evicted", id, txid);
                        if let Err(e) = self
                            .engine
                            .fail_order(id, "Funding transaction evicted after broadcast")
                            .await
                        {
                            warn!(target: "tracker", "order {} fail record: {}", id, e);
                        }
                        Step::Done(ConfirmationStatus::Failed)
                    }
                    Ok(depth) => {
                        counters.failures = 0;
                        counters.not_found = 0;
                        debug!(target: "tracker", "order {} depth {}", id, depth);
                        match self.engine.on_confirmation(id, depth).await {
                            // On FundingConfirmed the watch stays on for
                            // the timelock
                            Ok(_) => Step::Continue,
                            Err(e) if e.is_transient() => self.record_failure(id, counters, e),
                            Err(e) => {
                                warn!(target: "tracker", "order {}: {}", id, e);
                                Step::Done(ConfirmationStatus::Failed)
                            }
                        }
                    }
                    Err(e) => self.record_failure(id, counters, e),
                }
            }

            OrderStatus::FundingConfirmed => {
                // The relay may already have executed the destination
                // leg; an executed counter-order ends the watch
                match self.engine.reconcile_counter_order(id).await {
                    Ok(updated) if updated.status == OrderStatus::SecretRevealed => {
                        return Step::Done(ConfirmationStatus::Confirmed);
                    }
                    Ok(_) => {}
                    Err(e) if e.is_transient() => return self.record_failure(id, counters, e),
                    Err(e) => {
                        warn!(target: "tracker", "order {}: {}", id, e);
                        return Step::Done(ConfirmationStatus::Failed);
                    }
                }

                match self.engine.check_timelock(id).await {
                    Ok(updated) if updated.status == OrderStatus::TimelockExpired => {
                        Step::Done(ConfirmationStatus::Confirmed)
                    }
                    Ok(_) => {
                        counters.failures = 0;
                        Step::Continue
                    }
                    Err(e) if e.is_transient() => self.record_failure(id, counters, e),
                    Err(e) => {
                        warn!(target: "tracker", "order {}: {}", id, e);
                        Step::Done(ConfirmationStatus::Failed)
                    }
                }
            }

            // Past the phases this tracker owns
            OrderStatus::SecretRevealed
            | OrderStatus::Claimed
            | OrderStatus::TimelockExpired
            | OrderStatus::Refunded => Step::Done(ConfirmationStatus::Confirmed),

            OrderStatus::Failed | OrderStatus::Abandoned => {
                Step::Done(ConfirmationStatus::Failed)
            }

            OrderStatus::Created => Step::Done(ConfirmationStatus::Pending),
        }
    }

    fn record_failure(&self, id: OrderId, counters: &mut PollCounters, error: SwapError) -> Step {
        counters.failures += 1;
        warn!(target: "tracker",
            "order {} poll failure {}/{}: {}",
            id, counters.failures, self.config.max_failures, error
        );
        if counters.failures >= self.config.max_failures {
            // The chain may have moved while we were blind; report
            // Unknown rather than guessing Failed
            Step::Done(ConfirmationStatus::Unknown)
        } else {
            Step::Continue
        }
    }

    /// Poll delay doubled per consecutive failure, bounded
    fn backoff(&self, failures: u32) -> Duration {
        let base = self.config.poll_interval;
        let scaled = base.saturating_mul(2u32.saturating_pow(failures));
        scaled.min(self.config.max_backoff)
    }
}

// =============================================================================
// Tests
// =============================================================================
