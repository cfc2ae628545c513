//! The reconciliation cycle.
//!
//! One [`Keeper::run_cycle`] call moves the book one step toward its target:
//!
//! 1. Load tunables; stop if paused
//! 2. Snapshot accounts and positions across venues
//! 3. Record open times of newly hedged pairs
//! 4. Sync leverage
//! 5. Rebalance one-sided exposure, ending the cycle if anything fired
//! 6. Rank funding and fold the venues' decrease signals
//! 7. Decrease the book when signalled, otherwise run the settlement pass
//!
//! Cycles never overlap: a trigger that arrives while a cycle is running is
//! logged and dropped.

mod report;
mod tunables;

pub use report::{ExposureReport, VenueExposure};
pub use tunables::TunableSource;

use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::exchange::{DecreaseSignal, VenueId, VenueSet};
use crate::notify::{AlertDispatcher, AlertKind, Notifier};
use crate::persistence::{EquitySnapshot, PersistenceManager};
use crate::risk::{RiskAggregator, RiskSnapshot};
use crate::store::{KvStore, OrderBookCache, PositionClock};
use crate::strategy::{
    FundingAggregator, HedgeRebalancer, LeverageSync, OrderExecutor, PositionReducer,
    SettlementEngine,
};

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was still running
    Skipped,
    Paused,
    /// Rebalance orders fired; the rest of the cycle was skipped
    Rebalanced(usize),
    Decreased(usize),
    /// A decrease was signalled but no pair qualified
    NothingToDecrease,
    Settled(usize),
    /// Nothing to do
    Idle,
    Failed(String),
}

/// Releases the running flag when the cycle ends, including on unwind.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type PairKey = (String, VenueId, VenueId);

/// Drives the reconciliation and report cycles.
pub struct Keeper {
    venues: VenueSet,
    aggregator: RiskAggregator,
    leverage: LeverageSync,
    rebalancer: HedgeRebalancer,
    reducer: PositionReducer,
    settlement: SettlementEngine,
    tunables: TunableSource,
    clock: PositionClock,
    alerts: Arc<AlertDispatcher>,
    db: Arc<PersistenceManager>,
    running: AtomicBool,
    /// Pairs seen hedged by the previous cycle
    hedged: Mutex<BTreeSet<PairKey>>,
}

impl Keeper {
    pub fn new(
        config: &Config,
        venues: VenueSet,
        store: Arc<dyn KvStore>,
        db: Arc<PersistenceManager>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let keeper = &config.keeper;
        let alerts = Arc::new(AlertDispatcher::new(notifier, &config.notify.channel));
        let books = OrderBookCache::new(
            store.clone(),
            &keeper.namespace,
            Duration::from_secs(keeper.orderbook_max_age_secs),
        );
        let clock = PositionClock::new(store.clone(), &keeper.namespace);
        let executor = Arc::new(
            OrderExecutor::new(venues.clone(), config.execution.clone()).with_journal(db.clone()),
        );

        Self {
            aggregator: RiskAggregator::new(venues.clone()),
            leverage: LeverageSync::new(venues.clone(), keeper.target_leverage),
            rebalancer: HedgeRebalancer::new(venues.clone(), executor.clone()),
            reducer: PositionReducer::new(
                venues.clone(),
                books.clone(),
                executor.clone(),
                alerts.clone(),
                keeper,
            ),
            settlement: SettlementEngine::new(
                venues.clone(),
                books,
                clock.clone(),
                executor,
                alerts.clone(),
                keeper,
            ),
            tunables: TunableSource::new(
                store,
                db.clone(),
                &keeper.namespace,
                &keeper.project,
                Duration::from_secs(keeper.tunables_ttl_secs),
                config.tunables.clone(),
            ),
            venues,
            clock,
            alerts,
            db,
            running: AtomicBool::new(false),
            hedged: Mutex::new(BTreeSet::new()),
        }
    }

    /// Run one reconciliation cycle. Never returns an error: failures are
    /// logged, alerted and reported as [`CycleOutcome::Failed`].
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("[CYCLE] Previous cycle still running, trigger dropped");
            return CycleOutcome::Skipped;
        }
        let _guard = CycleGuard(&self.running);

        let started = Instant::now();
        let outcome = match self.cycle().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %format!("{:#}", e), "[CYCLE] Cycle failed");
                self.alerts
                    .alert(AlertKind::CycleError, &format!("[CYCLE] Cycle failed: {:#}", e))
                    .await;
                CycleOutcome::Failed(format!("{:#}", e))
            }
        };
        info!(
            ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[CYCLE] Complete"
        );
        outcome
    }

    #[instrument(skip_all, name = "cycle")]
    async fn cycle(&self) -> Result<CycleOutcome> {
        let tunables = self.tunables.load().await?;
        if tunables.paused {
            info!("[CYCLE] Paused by tunables");
            return Ok(CycleOutcome::Paused);
        }

        let snapshot = self.aggregator.snapshot().await?;
        self.track_open_pairs(&snapshot).await;
        self.leverage.sync(&snapshot).await;

        let fired = self
            .rebalancer
            .run(&snapshot, tunables.max_rebalance_usd)
            .await?;
        if fired > 0 {
            self.alerts
                .send(&format!("[REBALANCE] {} corrective order(s) filled", fired))
                .await;
            return Ok(CycleOutcome::Rebalanced(fired));
        }

        let rows = FundingAggregator::new(self.venues.clone()).rank(&snapshot).await;

        let mut signal = self
            .venues
            .iter()
            .fold(DecreaseSignal::None, |acc, (venue, adapter)| {
                acc.max(adapter.decrease_signal(venue, &snapshot, &tunables))
            });
        if tunables.reduce_only {
            signal = signal.max(DecreaseSignal::Decrease);
        }
        info!(?signal, rows = rows.len(), "[CYCLE] Decrease signal");

        let percent = match signal {
            DecreaseSignal::DecreasePercent(p) => Some(p),
            DecreaseSignal::Decrease => None,
            DecreaseSignal::None => {
                let settled = self.settlement.run(&snapshot, &rows, &tunables).await?;
                return Ok(if settled.is_empty() {
                    CycleOutcome::Idle
                } else {
                    CycleOutcome::Settled(settled.len())
                });
            }
        };

        let reduced = self.reducer.run(&snapshot, &rows, &tunables, percent).await?;
        if reduced.is_empty() {
            return Ok(CycleOutcome::NothingToDecrease);
        }
        let lines: Vec<String> = reduced
            .iter()
            .map(|intent| {
                format!(
                    "{} {}/{} {} {}",
                    intent.token,
                    self.venues.name(intent.base),
                    self.venues.name(intent.quote),
                    intent.direction,
                    intent.quantity
                )
            })
            .collect();
        self.alerts
            .send(&format!("[DECREASE] Reduced {} pair(s)\n{}", reduced.len(), lines.join("\n")))
            .await;
        Ok(CycleOutcome::Decreased(reduced.len()))
    }

    /// Stamp open times of hedged pairs and clear pairs that stopped being
    /// hedged. Cache errors are logged; the holding clock is advisory.
    async fn track_open_pairs(&self, snapshot: &RiskSnapshot) {
        let mut current = BTreeSet::new();
        let mut unhedged = BTreeSet::new();
        for row in snapshot.rows.values() {
            for (base, quote) in self.venues.pairs() {
                let key = (row.token.clone(), base, quote);
                if row.is_hedged(base, quote) {
                    current.insert(key);
                } else if row.get(base).is_some() || row.get(quote).is_some() {
                    unhedged.insert(key);
                }
            }
        }

        let mut previous = self.hedged.lock().await;
        for (token, base, quote) in &current {
            let (b, q) = (self.venues.name(*base), self.venues.name(*quote));
            if let Err(e) = self.clock.mark_opened(token, b, q, snapshot.taken_at).await {
                warn!(%token, base = %b, quote = %q, error = %e, "Failed to record open time");
            }
        }
        let closed = previous.difference(&current).cloned().collect::<Vec<_>>();
        for (token, base, quote) in unhedged.iter().chain(closed.iter()) {
            let (b, q) = (self.venues.name(*base), self.venues.name(*quote));
            if let Err(e) = self.clock.clear(token, b, q).await {
                warn!(%token, base = %b, quote = %q, error = %e, "Failed to clear open time");
            }
        }
        *previous = current;
    }

    /// Build the exposure report, persist an equity snapshot and send it.
    #[instrument(skip_all, name = "report")]
    pub async fn report(&self) -> Result<ExposureReport> {
        let tunables = self.tunables.load().await?;
        let snapshot = self.aggregator.snapshot().await?;
        let report = ExposureReport::build(&snapshot, &self.venues, &tunables);

        self.db.record_snapshot(&EquitySnapshot {
            timestamp: snapshot.taken_at,
            total_equity: snapshot.total_equity,
            gross_notional: snapshot.gross_notional(),
            token_count: snapshot.rows.len() as u32,
        })?;
        info!(
            equity = %report.total_equity.round_dp(2),
            gross = %report.gross_notional.round_dp(2),
            oversized = report.oversized.len(),
            "[REPORT] Exposure summary"
        );
        self.alerts.send(&report.to_string()).await;
        Ok(report)
    }
}
