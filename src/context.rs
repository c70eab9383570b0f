use std::sync::Arc;

use crate::app_database::AppDatabase;
use crate::chains::ChainRegistry;
use crate::chart_database::ChartDatabase;
use crate::exchange::Exchange;
use crate::kv::{Keys, KvStore};
use crate::locker::Locker;
use crate::notifier::Notifier;

/// Process-wide collaborators, built once in `main` and shared by every
/// system.
pub struct PoolContext {
    pub db: Arc<AppDatabase>,
    /// Replica for reads that never feed a ledger write.
    pub read_db: Arc<AppDatabase>,
    pub chart_db: Arc<ChartDatabase>,
    pub kv: Arc<dyn KvStore>,
    pub keys: Keys,
    pub locker: Arc<Locker>,
    pub notifier: Notifier,
    pub chains: Arc<ChainRegistry>,
    pub exchange: Option<Arc<dyn Exchange>>,
    pub pool_fee_percent: f64,
}
