//! Shared application state and background task wiring.

use std::sync::Arc;

use allocation::{
    CouponCatalog, CouponStrategy, DirectAllocator, DirectMode, InventoryAllocator, QueueConsumer,
    QueuedAllocator, WaitingListAllocator, WorkSource, spawn_backlog_reporter, spawn_stuck_scanner,
};
use coordination::{InMemoryWaitingList, LockCoordinator, WaitingList};
use ledger::{InMemoryLedger, LedgerStore};
use ranking::{SalesRanking, spawn_resync};
use saga::{SettlementSaga, StockService, WalletService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub config: Config,
    pub catalog: CouponCatalog,
    /// The strategy selected by `COUPON_STRATEGY`.
    pub allocator: Arc<dyn InventoryAllocator>,
    pub queue: Arc<QueuedAllocator>,
    pub waiting: Arc<WaitingListAllocator>,
    pub saga: SettlementSaga,
    pub stock: StockService,
    pub wallet: WalletService,
    pub ranking: SalesRanking,
    locks: LockCoordinator,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        locks: LockCoordinator,
        waiting_list: Arc<dyn WaitingList>,
        config: Config,
    ) -> Self {
        let queue = Arc::new(QueuedAllocator::new(ledger.clone()));
        let waiting = Arc::new(WaitingListAllocator::new(ledger.clone(), waiting_list));
        let allocator: Arc<dyn InventoryAllocator> = match config.coupon_strategy {
            CouponStrategy::RowLock => {
                Arc::new(DirectAllocator::new(ledger.clone(), DirectMode::RowLock))
            }
            CouponStrategy::Conditional => Arc::new(DirectAllocator::new(
                ledger.clone(),
                DirectMode::ConditionalDecrement,
            )),
            CouponStrategy::Queue => queue.clone(),
            CouponStrategy::WaitingList => waiting.clone(),
        };
        let ranking = SalesRanking::new(ledger.clone());
        let saga = SettlementSaga::new(
            ledger.clone(),
            locks.clone(),
            Arc::new(ranking.clone()),
            config.settlement_config(),
        );

        Self {
            catalog: CouponCatalog::new(ledger.clone()),
            allocator,
            queue,
            waiting,
            saga,
            stock: StockService::new(ledger.clone()),
            wallet: WalletService::new(ledger),
            ranking,
            locks,
            config,
        }
    }

    /// State backed entirely by process-local stores.
    pub fn in_memory(config: Config) -> Self {
        let lock_options = config.lock_options();
        let waiting_list = Arc::new(InMemoryWaitingList::new(config.waiting_list_ttl));
        Self::new(
            Arc::new(InMemoryLedger::new()),
            LockCoordinator::in_memory().with_options(lock_options),
            waiting_list,
            config,
        )
    }

    /// Starts the queue consumers, the backlog reporters, the stuck-work
    /// scanner and the ranking resync. All of them stop when `cancel` fires.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let consumer_config = self.config.consumer_config();
        let mut sources: Vec<Arc<dyn WorkSource>> = vec![self.queue.clone()];
        if self.config.coupon_strategy == CouponStrategy::WaitingList {
            sources.push(self.waiting.clone());
        }

        let mut handles = Vec::new();
        for source in sources {
            handles.push(
                QueueConsumer::new(source.clone(), self.locks.clone(), consumer_config.clone())
                    .spawn(cancel.clone()),
            );
            handles.push(spawn_backlog_reporter(
                source,
                consumer_config.backlog_interval,
                cancel.clone(),
            ));
        }
        handles.push(spawn_stuck_scanner(
            self.queue.clone(),
            consumer_config,
            cancel.clone(),
        ));
        handles.push(spawn_resync(
            self.ranking.clone(),
            self.config.ranking_resync_interval,
            cancel.clone(),
        ));
        handles
    }
}
