//! Keeps a local snapshot of the portfolio in step with the remote service.
//!
//! A refresh cycle lists the holdings, quotes every ticker concurrently and
//! swaps the merged result in as a whole. Cycles may overlap when the poller
//! fires faster than the service answers; each cycle carries a sequence number
//! and a result is only applied if nothing newer has been applied already.
//! User mutations go to the service first and only touch the snapshot once the
//! service has confirmed them.

use crate::client::RemoteStore;
use crate::error::StoreError;
use crate::holding::{EnrichedHolding, Holding, HoldingDraft};
use crate::portfolio::{aggregate, MetricsSource, PortfolioMetrics};
use crate::scheduler::Poller;
use chrono::{DateTime, Local};
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Stages of one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    ListFetching,
    QuoteFetching(usize),
    Merged,
}

/// Whether a finished refresh made it into the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied,
    /// A newer update was applied while this one was in flight.
    Stale,
}

/// The state shown to the user.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Sequence number of the update that produced this snapshot; 0 before the first.
    pub cycle: u64,
    pub holdings: Vec<EnrichedHolding>,
    /// Recomputed from `holdings` on every change.
    pub metrics: PortfolioMetrics,
    pub remote_metrics: Option<PortfolioMetrics>,
    metrics_cycle: u64,
    pub updated_at: Option<DateTime<Local>>,
}

impl Snapshot {
    /// Metrics from `source`, falling back to the local figures until the
    /// remote ones have arrived.
    pub fn metrics_from(&self, source: MetricsSource) -> &PortfolioMetrics {
        match (source, &self.remote_metrics) {
            (MetricsSource::Remote, Some(remote)) => remote,
            _ => &self.metrics,
        }
    }

    pub fn find(&self, ticker: &str) -> Option<&EnrichedHolding> {
        self.holdings.iter().find(|h| h.ticker() == ticker)
    }
}

pub struct Synchronizer<S: RemoteStore> {
    store: Arc<S>,
    sequence: AtomicU64,
    metrics_sequence: AtomicU64,
    phase: std::sync::Mutex<RefreshPhase>,
    snapshot: watch::Sender<Snapshot>,
}

impl<S: RemoteStore + 'static> Synchronizer<S> {
    pub fn new(store: S) -> Self {
        Synchronizer {
            store: Arc::new(store),
            sequence: AtomicU64::new(0),
            metrics_sequence: AtomicU64::new(0),
            phase: std::sync::Mutex::new(RefreshPhase::Idle),
            snapshot: watch::Sender::new(Snapshot::default()),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Stage of the most recently started refresh cycle.
    pub fn phase(&self) -> RefreshPhase {
        self.phase.lock().map(|p| *p).unwrap_or(RefreshPhase::Idle)
    }

    fn set_phase(&self, phase: RefreshPhase) {
        debug!("Refresh phase: {phase:?}");
        if let Ok(mut p) = self.phase.lock() {
            *p = phase;
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Apply `update` to the snapshot if `seq` is newer than what it holds.
    fn apply(&self, seq: u64, update: impl FnOnce(&mut Snapshot)) -> RefreshOutcome {
        let applied = self.snapshot.send_if_modified(|snapshot| {
            if seq <= snapshot.cycle {
                return false;
            }
            update(snapshot);
            snapshot.cycle = seq;
            snapshot.metrics = aggregate(&snapshot.holdings);
            snapshot.updated_at = Some(Local::now());
            true
        });

        if applied {
            RefreshOutcome::Applied
        } else {
            debug!("Discarding stale update #{seq}");
            RefreshOutcome::Stale
        }
    }

    /// Run one full list, quote and merge cycle.
    ///
    /// A failed list fetch leaves the current snapshot in place. A failed quote
    /// only affects its own ticker, which falls back to its buy price.
    pub async fn refresh(&self) -> Result<RefreshOutcome, StoreError> {
        let seq = self.next_sequence();
        self.set_phase(RefreshPhase::ListFetching);

        let holdings = match self.store.list_holdings().await {
            Ok(holdings) => holdings,
            Err(e) => {
                warn!("Error fetching holdings: {e}");
                self.set_phase(RefreshPhase::Idle);
                return Err(e);
            }
        };

        self.set_phase(RefreshPhase::QuoteFetching(holdings.len()));
        let enriched = join_all(holdings.into_iter().map(|h| self.enrich(h))).await;

        let outcome = self.apply(seq, |snapshot| snapshot.holdings = enriched);
        self.set_phase(RefreshPhase::Merged);
        if outcome == RefreshOutcome::Applied {
            info!("Refresh #{seq} applied");
        }
        Ok(outcome)
    }

    async fn enrich(&self, holding: Holding) -> EnrichedHolding {
        match self.store.get_quote(&holding.ticker_symbol).await {
            Ok(price) => EnrichedHolding::with_quote(holding, price),
            Err(e) => {
                warn!("Error fetching real-time price: {e}");
                EnrichedHolding::unquoted(holding)
            }
        }
    }

    /// Fetch the service's own aggregate metrics.
    pub async fn refresh_metrics(&self) -> Result<RefreshOutcome, StoreError> {
        let seq = self.metrics_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let metrics = self.store.get_aggregate_metrics().await.map_err(|e| {
            warn!("Error fetching portfolio metrics: {e}");
            e
        })?;

        let applied = self.snapshot.send_if_modified(|snapshot| {
            if seq <= snapshot.metrics_cycle {
                return false;
            }
            snapshot.metrics_cycle = seq;
            snapshot.remote_metrics = Some(metrics);
            true
        });

        Ok(if applied {
            RefreshOutcome::Applied
        } else {
            RefreshOutcome::Stale
        })
    }

    /// Validate `draft`, create it remotely, then add it to the snapshot.
    ///
    /// A refresh that listed the server after the create committed may already
    /// have added the ticker, in which case that entry is replaced.
    pub async fn create(&self, draft: &HoldingDraft) -> Result<Holding, StoreError> {
        let holding = draft.validate()?;
        let created = self.store.create_holding(&holding).await?;
        info!("Created holding {}", created.ticker_symbol);

        let seq = self.next_sequence();
        let result = created.clone();
        self.apply(seq, |snapshot| {
            let ticker = created.ticker_symbol.clone();
            upsert(&mut snapshot.holdings, &ticker, created)
        });
        Ok(result)
    }

    /// Validate `draft`, update `ticker` remotely, then replace it in the snapshot.
    pub async fn update(
        &self,
        ticker: &str,
        draft: &HoldingDraft,
    ) -> Result<Holding, StoreError> {
        let mut holding = draft.validate()?;
        let current = self.snapshot.borrow().find(ticker).map(|h| h.holding.id);
        holding.id = current.flatten();

        let updated = self.store.update_holding(ticker, &holding).await?;
        info!("Updated holding {ticker}");

        let seq = self.next_sequence();
        let result = updated.clone();
        self.apply(seq, |snapshot| upsert(&mut snapshot.holdings, ticker, updated));
        Ok(result)
    }

    /// Delete `ticker` remotely, then drop it from the snapshot.
    pub async fn delete(&self, ticker: &str) -> Result<(), StoreError> {
        self.store.delete_holding(ticker).await?;
        info!("Deleted holding {ticker}");

        let seq = self.next_sequence();
        self.apply(seq, |snapshot| snapshot.holdings.retain(|h| h.ticker() != ticker));
        Ok(())
    }

    /// Have the service refresh the stored price of `ticker`, then re-quote it.
    pub async fn update_price(&self, ticker: &str) -> Result<Holding, StoreError> {
        let updated = self.store.update_price(ticker).await?;
        info!("Updated stored price for {ticker}");
        let entry = self.enrich(updated.clone()).await;

        let seq = self.next_sequence();
        self.apply(seq, |snapshot| {
            match snapshot.holdings.iter_mut().find(|h| h.ticker() == ticker) {
                Some(existing) => *existing = entry,
                None => snapshot.holdings.push(entry),
            }
        });
        Ok(updated)
    }

    /// Start polling holdings and remote metrics. Polling stops when the
    /// returned handle is dropped.
    pub fn start_polling(
        self: &Arc<Self>,
        holdings_every: Duration,
        metrics_every: Duration,
    ) -> Polling {
        let sync = Arc::clone(self);
        let holdings = Poller::start("holdings", holdings_every, move || {
            let sync = Arc::clone(&sync);
            async move {
                let _ = sync.refresh().await;
            }
        });

        let sync = Arc::clone(self);
        let metrics = Poller::start("metrics", metrics_every, move || {
            let sync = Arc::clone(&sync);
            async move {
                let _ = sync.refresh_metrics().await;
            }
        });

        Polling { holdings, metrics }
    }
}

/// Replace the entry for `ticker` with `holding`, keeping its last quote, or
/// append `holding` unquoted.
fn upsert(holdings: &mut Vec<EnrichedHolding>, ticker: &str, holding: Holding) {
    match holdings.iter_mut().find(|h| h.ticker() == ticker) {
        Some(entry) => {
            let current_price = entry.current_price;
            *entry = EnrichedHolding::with_quote(holding, current_price);
        }
        None => holdings.push(EnrichedHolding::unquoted(holding)),
    }
}

/// The two pollers behind a live view.
pub struct Polling {
    holdings: Poller,
    metrics: Poller,
}

impl Polling {
    pub fn is_running(&self) -> bool {
        self.holdings.is_running() && self.metrics.is_running()
    }

    pub fn stop(&mut self) {
        self.holdings.stop();
        self.metrics.stop();
    }
}
