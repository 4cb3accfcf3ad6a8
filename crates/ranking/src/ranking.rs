//! Cached top-products ranking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::ProductId;
use ledger::LedgerStore;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::error::{RankingError, Result};
use crate::recorder::SalesRecorder;

/// Ranking sizes kept in the cache. Requests are served from the smallest
/// size that covers them.
pub const CACHED_SIZES: [usize; 3] = [10, 20, 50];

/// How far back a resync looks.
const RESYNC_WINDOW_DAYS: i64 = 7;

/// One row of the ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedProduct {
    pub rank: usize,
    pub product_id: ProductId,
    pub units_sold: i64,
}

#[derive(Default)]
struct RankingState {
    units: HashMap<ProductId, i64>,
    cache: HashMap<usize, Arc<Vec<RankedProduct>>>,
}

impl RankingState {
    fn build(&self, size: usize) -> Vec<RankedProduct> {
        let mut sorted: Vec<_> = self
            .units
            .iter()
            .filter(|(_, units)| **units > 0)
            .map(|(id, units)| (*id, *units))
            .collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sorted
            .into_iter()
            .take(size)
            .enumerate()
            .map(|(i, (product_id, units_sold))| RankedProduct {
                rank: i + 1,
                product_id,
                units_sold,
            })
            .collect()
    }

    fn rebuild_cache(&mut self) {
        self.cache = CACHED_SIZES
            .iter()
            .map(|&size| (size, Arc::new(self.build(size))))
            .collect();
    }
}

/// Sales counters with a per-size snapshot cache.
///
/// Recording a sale invalidates the snapshots; the next [`top`] call
/// rebuilds the one it needs.
///
/// [`top`]: SalesRanking::top
#[derive(Clone)]
pub struct SalesRanking {
    ledger: Arc<dyn LedgerStore>,
    state: Arc<RwLock<RankingState>>,
}

impl SalesRanking {
    pub fn new(ledger: Arc<dyn LedgerStore>) -> Self {
        Self {
            ledger,
            state: Arc::new(RwLock::new(RankingState::default())),
        }
    }

    /// Returns the best sellers, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// `InvalidLimit` when `limit` is 0.
    pub async fn top(&self, limit: usize) -> Result<Vec<RankedProduct>> {
        if limit == 0 {
            return Err(RankingError::InvalidLimit);
        }
        let size = cache_size_for(limit);

        let cached = self.state.read().await.cache.get(&size).cloned();
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => {
                let mut state = self.state.write().await;
                let built = Arc::new(state.build(size));
                state.cache.insert(size, built.clone());
                built
            }
        };

        Ok(snapshot.iter().take(limit).cloned().collect())
    }

    /// Rebuilds counters and snapshots from the ledger's recent order lines.
    #[tracing::instrument(skip(self))]
    pub async fn resync(&self) -> Result<usize> {
        let since = Utc::now() - chrono::Duration::days(RESYNC_WINDOW_DAYS);
        let sales = self.ledger.product_sales_since(since).await?;

        let mut state = self.state.write().await;
        state.units = sales
            .iter()
            .map(|sale| (sale.product_id, sale.quantity))
            .collect();
        state.rebuild_cache();

        metrics::counter!("ranking_resync_total").increment(1);
        tracing::info!(products = sales.len(), "sales ranking resynced");
        Ok(sales.len())
    }
}

#[async_trait]
impl SalesRecorder for SalesRanking {
    async fn record_sale(&self, product_id: ProductId, quantity: u32) -> Result<()> {
        let mut state = self.state.write().await;
        *state.units.entry(product_id).or_default() += i64::from(quantity);
        state.cache.clear();
        Ok(())
    }
}

/// Maps a requested limit onto the smallest cached size covering it.
fn cache_size_for(limit: usize) -> usize {
    CACHED_SIZES
        .iter()
        .copied()
        .find(|&size| size >= limit)
        .unwrap_or(CACHED_SIZES[CACHED_SIZES.len() - 1])
}

/// Resyncs `ranking` now and then every `period` until cancelled.
pub fn spawn_resync(
    ranking: SalesRanking,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = ranking.resync().await {
                        tracing::warn!(error = %e, "sales ranking resync failed");
                    }
                }
            }
        }
        tracing::debug!("sales ranking resync stopped");
    })
}
