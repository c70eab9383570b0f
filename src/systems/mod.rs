pub mod audit_system;
pub mod bank_system;
pub mod batch_system;
pub mod credit_system;
pub mod payout_system;
pub mod rollup_system;
pub mod share_system;
pub mod unlock_system;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::PoolContext;
use crate::error::PoolError;

/// Per-chain failure inside a cron tick. The tick moves on to the next
/// chain; business-rule violations also reach the notifier.
pub(crate) fn report_chain_error(ctx: &PoolContext, run_id: Uuid, job: &str, chain_id: &str, e: &PoolError) {
    if e.is_duplicate() {
        info!(target: "cron_log", "[{}] {} {}: already done: {}", run_id, job, chain_id, e);
    } else if e.is_business_rule() {
        error!(target: "cron_log", "[{}] {} {}: {:?}", run_id, job, chain_id, e);
        ctx.notifier.alert(format!("{} {}: {}", job, chain_id, e));
    } else {
        warn!(target: "cron_log", "[{}] {} {}: {:?}", run_id, job, chain_id, e);
    }
}
