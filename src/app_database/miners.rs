use diesel::sql_types::{BigInt, VarChar};
use diesel::{MysqlConnection, QueryResult, RunQueryDsl};
use tracing::info;

use super::{id_list, AppDatabase};
use crate::error::PoolResult;
use crate::models;

const MINER_COLUMNS: &str =
    "id, chain_id, address, email, threshold, recipient_fee_percent";

impl AppDatabase {
    /// Returns the miner id for `(chain, address)`, creating the miner on
    /// first sight.
    pub async fn get_or_insert_miner(&self, chain_id: String, address: String) -> PoolResult<i64> {
        self.transaction(move |conn| {
            diesel::sql_query("INSERT IGNORE INTO miners (chain_id, address) VALUES (?, ?)")
                .bind::<VarChar, _>(&chain_id)
                .bind::<VarChar, _>(&address)
                .execute(conn)?;

            let miner: models::Miner = diesel::sql_query(format!(
                "SELECT {} FROM miners WHERE chain_id = ? AND address = ?",
                MINER_COLUMNS
            ))
            .bind::<VarChar, _>(&chain_id)
            .bind::<VarChar, _>(&address)
            .get_result(conn)?;
            info!(target: "server_log", "resolved miner {} for {}:{}", miner.id, chain_id, address);
            Ok(miner.id)
        })
        .await
    }

    pub async fn get_or_insert_worker(&self, miner_id: i64, name: String) -> PoolResult<i64> {
        self.transaction(move |conn| {
            diesel::sql_query(
                "INSERT INTO workers (miner_id, name, active, notified) VALUES (?, ?, 1, 0) \
                 ON DUPLICATE KEY UPDATE active = 1",
            )
            .bind::<BigInt, _>(miner_id)
            .bind::<VarChar, _>(&name)
            .execute(conn)?;

            let worker: models::Worker = diesel::sql_query(
                "SELECT id, miner_id, name, active, notified FROM workers WHERE miner_id = ? AND name = ?",
            )
            .bind::<BigInt, _>(miner_id)
            .bind::<VarChar, _>(&name)
            .get_result(conn)?;
            Ok(worker.id)
        })
        .await
    }
}

pub fn get_miners_by_ids(conn: &mut MysqlConnection, ids: &[i64]) -> QueryResult<Vec<models::Miner>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    diesel::sql_query(format!(
        "SELECT {} FROM miners WHERE id IN ({})",
        MINER_COLUMNS,
        id_list(ids)
    ))
    .load(conn)
}

pub fn get_recipients(conn: &mut MysqlConnection) -> QueryResult<Vec<models::Miner>> {
    diesel::sql_query(format!(
        "SELECT {} FROM miners WHERE recipient_fee_percent IS NOT NULL ORDER BY id",
        MINER_COLUMNS
    ))
    .load(conn)
}
