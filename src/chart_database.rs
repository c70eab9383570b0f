//! The time-series store: a second MySQL database holding pre-aggregated
//! chart rows and the raw block index they are built from.

use chrono::NaiveDateTime;
use deadpool_diesel::mysql::{Manager, Pool};
use diesel::mysql::Mysql;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::{BigInt, Bool, Datetime, Double, Integer, Unsigned, VarChar};
use diesel::{MysqlConnection, QueryableByName, RunQueryDsl};
use tracing::error;

use crate::app_database::AppDatabaseError;
use crate::error::PoolResult;
use crate::models::{self, BlockChartRow, RawBlockRow, RoundChartRow, ShareChartRow};

/// A column value for generically built statements.
#[derive(Debug, Clone, PartialEq)]
pub enum ChartValue {
    Text(String),
    Int(i64),
    UInt(u64),
    Period(i32),
    Float(f64),
    Flag(bool),
    Time(NaiveDateTime),
}

type Query = BoxedSqlQuery<'static, Mysql, SqlQuery>;

fn bind(query: Query, value: ChartValue) -> Query {
    match value {
        ChartValue::Text(v) => query.bind::<VarChar, _>(v),
        ChartValue::Int(v) => query.bind::<BigInt, _>(v),
        ChartValue::UInt(v) => query.bind::<Unsigned<BigInt>, _>(v),
        ChartValue::Period(v) => query.bind::<Integer, _>(v),
        ChartValue::Float(v) => query.bind::<Double, _>(v),
        ChartValue::Flag(v) => query.bind::<Bool, _>(v),
        ChartValue::Time(v) => query.bind::<Datetime, _>(v),
    }
}

/// A row type stored in one chart table.
pub trait ChartRow: QueryableByName<Mysql> + Clone + Send + 'static {
    const TABLE: &'static str;
    /// Every column, in the order `values` yields them.
    const COLUMNS: &'static [&'static str];
    /// The unique key.
    const KEY: &'static [&'static str];
    /// Columns that partial rollups add up; they hold `mean * count` while
    /// the row is pending.
    const SUMS: &'static [&'static str];
    /// Columns that partial rollups add up as plain counts.
    const COUNTS: &'static [&'static str];

    fn values(&self) -> Vec<ChartValue>;
}

impl ChartRow for RawBlockRow {
    const TABLE: &'static str = "raw_blocks";
    const COLUMNS: &'static [&'static str] = &["chain_id", "height", "value", "difficulty", "uncle_count", "created_at"];
    const KEY: &'static [&'static str] = &["chain_id", "height"];
    const SUMS: &'static [&'static str] = &[];
    const COUNTS: &'static [&'static str] = &[];

    fn values(&self) -> Vec<ChartValue> {
        vec![
            ChartValue::Text(self.chain_id.clone()),
            ChartValue::UInt(self.height),
            ChartValue::Float(self.value),
            ChartValue::Float(self.difficulty),
            ChartValue::Int(self.uncle_count),
            ChartValue::Time(self.created_at),
        ]
    }
}

impl ChartRow for BlockChartRow {
    const TABLE: &'static str = "block_charts";
    const COLUMNS: &'static [&'static str] = &[
        "chain_id",
        "period",
        "start_time",
        "end_time",
        "value",
        "difficulty",
        "block_time",
        "hashrate",
        "uncle_rate",
        "profitability",
        "avg_profitability",
        "avg_difficulty",
        "avg_block_time",
        "avg_hashrate",
        "count",
        "uncle_count",
        "pending",
    ];
    const KEY: &'static [&'static str] = &["chain_id", "period", "end_time"];
    const SUMS: &'static [&'static str] = &["value", "difficulty", "block_time"];
    const COUNTS: &'static [&'static str] = &["uncle_count"];

    fn values(&self) -> Vec<ChartValue> {
        vec![
            ChartValue::Text(self.chain_id.clone()),
            ChartValue::Period(self.period),
            ChartValue::Time(self.start_time),
            ChartValue::Time(self.end_time),
            ChartValue::Float(self.value),
            ChartValue::Float(self.difficulty),
            ChartValue::Float(self.block_time),
            ChartValue::Float(self.hashrate),
            ChartValue::Float(self.uncle_rate),
            ChartValue::Float(self.profitability),
            ChartValue::Float(self.avg_profitability),
            ChartValue::Float(self.avg_difficulty),
            ChartValue::Float(self.avg_block_time),
            ChartValue::Float(self.avg_hashrate),
            ChartValue::Int(self.count),
            ChartValue::Int(self.uncle_count),
            ChartValue::Flag(self.pending),
        ]
    }
}

impl ChartRow for RoundChartRow {
    const TABLE: &'static str = "round_charts";
    const COLUMNS: &'static [&'static str] = &[
        "chain_id",
        "period",
        "start_time",
        "end_time",
        "value",
        "difficulty",
        "accepted_shares",
        "luck",
        "avg_luck",
        "uncle_rate",
        "count",
        "uncle_count",
        "orphan_count",
        "pending",
    ];
    const KEY: &'static [&'static str] = &["chain_id", "period", "end_time"];
    const SUMS: &'static [&'static str] = &["value", "difficulty", "accepted_shares"];
    const COUNTS: &'static [&'static str] = &["uncle_count", "orphan_count"];

    fn values(&self) -> Vec<ChartValue> {
        vec![
            ChartValue::Text(self.chain_id.clone()),
            ChartValue::Period(self.period),
            ChartValue::Time(self.start_time),
            ChartValue::Time(self.end_time),
            ChartValue::Float(self.value),
            ChartValue::Float(self.difficulty),
            ChartValue::Float(self.accepted_shares),
            ChartValue::Float(self.luck),
            ChartValue::Float(self.avg_luck),
            ChartValue::Float(self.uncle_rate),
            ChartValue::Int(self.count),
            ChartValue::Int(self.uncle_count),
            ChartValue::Int(self.orphan_count),
            ChartValue::Flag(self.pending),
        ]
    }
}

impl ChartRow for ShareChartRow {
    const TABLE: &'static str = "share_charts";
    const COLUMNS: &'static [&'static str] = &[
        "chain_id",
        "period",
        "miner_id",
        "worker_id",
        "start_time",
        "end_time",
        "miners",
        "workers",
        "accepted_shares",
        "rejected_shares",
        "invalid_shares",
        "hashrate",
        "avg_hashrate",
        "count",
        "pending",
    ];
    const KEY: &'static [&'static str] = &["chain_id", "period", "miner_id", "worker_id", "end_time"];
    const SUMS: &'static [&'static str] = &[
        "miners",
        "workers",
        "accepted_shares",
        "rejected_shares",
        "invalid_shares",
        "hashrate",
    ];
    const COUNTS: &'static [&'static str] = &[];

    fn values(&self) -> Vec<ChartValue> {
        vec![
            ChartValue::Text(self.chain_id.clone()),
            ChartValue::Period(self.period),
            ChartValue::Int(self.miner_id),
            ChartValue::Int(self.worker_id),
            ChartValue::Time(self.start_time),
            ChartValue::Time(self.end_time),
            ChartValue::Float(self.miners),
            ChartValue::Float(self.workers),
            ChartValue::Float(self.accepted_shares),
            ChartValue::Float(self.rejected_shares),
            ChartValue::Float(self.invalid_shares),
            ChartValue::Float(self.hashrate),
            ChartValue::Float(self.avg_hashrate),
            ChartValue::Int(self.count),
            ChartValue::Flag(self.pending),
        ]
    }
}

fn insert_prefix<R: ChartRow>(rows: usize) -> String {
    let tuple = format!("({})", vec!["?"; R::COLUMNS.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        R::TABLE,
        R::COLUMNS.join(", "),
        vec![tuple; rows].join(", ")
    )
}

/// `INSERT .. ON DUPLICATE KEY UPDATE` overwriting every non-key column.
pub fn replace_sql<R: ChartRow>(rows: usize) -> String {
    let updates = R::COLUMNS
        .iter()
        .filter(|c| !R::KEY.contains(c))
        .map(|c| format!("{c} = VALUES({c})"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{} ON DUPLICATE KEY UPDATE {}", insert_prefix::<R>(rows), updates)
}

/// `INSERT .. ON DUPLICATE KEY UPDATE` adding into an existing row. A row
/// that was already finalized holds means, so its sums are scaled back by
/// `count` first; `count` and `pending` are assigned last because MySQL
/// evaluates the assignments left to right.
pub fn accumulate_sql<R: ChartRow>(rows: usize) -> String {
    let mut updates: Vec<String> = R::SUMS
        .iter()
        .map(|c| format!("{c} = IF(pending = 1, {c}, {c} * count) + VALUES({c})"))
        .collect();
    updates.extend(R::COUNTS.iter().map(|c| format!("{c} = {c} + VALUES({c})")));
    updates.push("count = count + VALUES(count)".to_string());
    updates.push("pending = 1".to_string());
    format!(
        "{} ON DUPLICATE KEY UPDATE {}",
        insert_prefix::<R>(rows),
        updates.join(", ")
    )
}

pub struct ChartDatabase {
    connection_pool: Pool,
}

impl ChartDatabase {
    pub fn new(url: String) -> Self {
        let manager = Manager::new(url, deadpool_diesel::Runtime::Tokio1);

        let pool = Pool::builder(manager)
            .build()
            .expect("failed to build chart connection pool");

        ChartDatabase {
            connection_pool: pool,
        }
    }

    async fn interact<T, F>(&self, f: F) -> PoolResult<T>
    where
        F: FnOnce(&mut MysqlConnection) -> PoolResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if let Ok(db_conn) = self.connection_pool.get().await {
            match db_conn.interact(move |conn: &mut MysqlConnection| f(conn)).await {
                Ok(interaction) => interaction,
                Err(e) => {
                    error!(target: "cron_log", "chart db: {:?}", e);
                    Err(AppDatabaseError::InteractionFailed.into())
                }
            }
        } else {
            Err(AppDatabaseError::FailedToGetConnectionFromPool.into())
        }
    }

    async fn write<R: ChartRow>(&self, rows: Vec<R>, sql: String) -> PoolResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.interact(move |conn| {
            let mut query = diesel::sql_query(sql).into_boxed::<Mysql>();
            for row in rows.iter() {
                for value in row.values() {
                    query = bind(query, value);
                }
            }
            Ok(query.execute(conn)?)
        })
        .await
    }

    /// Writes rows, overwriting existing ones with the same key.
    pub async fn replace_rows<R: ChartRow>(&self, rows: Vec<R>) -> PoolResult<usize> {
        let sql = replace_sql::<R>(rows.len());
        self.write(rows, sql).await
    }

    /// Adds pending partial rows into their rollup period rows.
    pub async fn accumulate_rows<R: ChartRow>(&self, rows: Vec<R>) -> PoolResult<usize> {
        let sql = accumulate_sql::<R>(rows.len());
        self.write(rows, sql).await
    }

    /// Rows of one period with `start < end_time <= end`.
    pub async fn get_rows<R: ChartRow>(
        &self,
        chain_id: String,
        period: i32,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<R>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM {} WHERE chain_id = ? AND period = ? AND end_time > ? AND end_time <= ? \
                 ORDER BY end_time",
                R::COLUMNS.join(", "),
                R::TABLE
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Integer, _>(period)
            .bind::<Datetime, _>(start)
            .bind::<Datetime, _>(end)
            .load(conn)?)
        })
        .await
    }

    pub async fn get_pending_rows<R: ChartRow>(
        &self,
        chain_id: String,
        period: i32,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<R>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM {} WHERE chain_id = ? AND period = ? AND end_time = ? AND pending = 1",
                R::COLUMNS.join(", "),
                R::TABLE
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Integer, _>(period)
            .bind::<Datetime, _>(end)
            .load(conn)?)
        })
        .await
    }

    pub async fn delete_rows_before<R: ChartRow>(
        &self,
        chain_id: String,
        period: i32,
        cutoff: NaiveDateTime,
    ) -> PoolResult<usize> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "DELETE FROM {} WHERE chain_id = ? AND period = ? AND end_time < ?",
                R::TABLE
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Integer, _>(period)
            .bind::<Datetime, _>(cutoff)
            .execute(conn)?)
        })
        .await
    }

    pub async fn get_max_end_time<R: ChartRow>(&self, chain_id: String, period: i32) -> PoolResult<Option<NaiveDateTime>> {
        self.interact(move |conn| {
            let row: models::MaxTime = diesel::sql_query(format!(
                "SELECT MAX(end_time) AS value FROM {} WHERE chain_id = ? AND period = ?",
                R::TABLE
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Integer, _>(period)
            .get_result(conn)?;
            Ok(row.value)
        })
        .await
    }

    pub async fn get_max_block_height(&self, chain_id: String) -> PoolResult<Option<u64>> {
        self.interact(move |conn| {
            let rows: Vec<RawBlockRow> = diesel::sql_query(format!(
                "SELECT {} FROM raw_blocks WHERE chain_id = ? ORDER BY height DESC LIMIT 1",
                RawBlockRow::COLUMNS.join(", ")
            ))
            .bind::<VarChar, _>(chain_id)
            .load(conn)?;
            Ok(rows.first().map(|r| r.height))
        })
        .await
    }

    pub async fn get_first_block_time(&self, chain_id: String) -> PoolResult<Option<NaiveDateTime>> {
        self.interact(move |conn| {
            let row: models::MaxTime =
                diesel::sql_query("SELECT MIN(created_at) AS value FROM raw_blocks WHERE chain_id = ?")
                    .bind::<VarChar, _>(chain_id)
                    .get_result(conn)?;
            Ok(row.value)
        })
        .await
    }

    pub async fn get_raw_blocks_between(
        &self,
        chain_id: String,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> PoolResult<Vec<RawBlockRow>> {
        self.interact(move |conn| {
            Ok(diesel::sql_query(format!(
                "SELECT {} FROM raw_blocks WHERE chain_id = ? AND created_at >= ? AND created_at < ? \
                 ORDER BY height",
                RawBlockRow::COLUMNS.join(", ")
            ))
            .bind::<VarChar, _>(chain_id)
            .bind::<Datetime, _>(start)
            .bind::<Datetime, _>(end)
            .load(conn)?)
        })
        .await
    }

    pub async fn delete_raw_blocks_before(&self, chain_id: String, cutoff: NaiveDateTime) -> PoolResult<usize> {
        self.interact(move |conn| {
            Ok(
                diesel::sql_query("DELETE FROM raw_blocks WHERE chain_id = ? AND created_at < ?")
                    .bind::<VarChar, _>(chain_id)
                    .bind::<Datetime, _>(cutoff)
                    .execute(conn)?,
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_updates_every_non_key_column() {
        let sql = replace_sql::<RoundChartRow>(2);
        assert!(sql.starts_with("INSERT INTO round_charts (chain_id, period, start_time"));
        assert_eq!(sql.matches('?').count(), 2 * RoundChartRow::COLUMNS.len());
        assert!(sql.contains("luck = VALUES(luck)"));
        assert!(!sql.contains("chain_id = VALUES"));
        assert!(!sql.contains("end_time = VALUES"));
    }

    #[test]
    fn accumulate_rescales_finalized_rows_before_adding() {
        let sql = accumulate_sql::<BlockChartRow>(1);
        let value = sql.find("value = IF(pending = 1, value, value * count) + VALUES(value)").unwrap();
        let uncles = sql.find("uncle_count = uncle_count + VALUES(uncle_count)").unwrap();
        let count = sql.find("count = count + VALUES(count)").unwrap();
        let pending = sql.rfind("pending = 1").unwrap();
        assert!(value < uncles && uncles < count && count < pending);
        assert!(sql.ends_with(", pending = 1"));
        assert!(!sql.contains("hashrate = IF"));
    }

    #[test]
    fn values_follow_column_order() {
        for (columns, values) in [
            (BlockChartRow::COLUMNS.len(), BlockChartRow::default().values().len()),
            (RoundChartRow::COLUMNS.len(), RoundChartRow::default().values().len()),
            (ShareChartRow::COLUMNS.len(), ShareChartRow::default().values().len()),
            (RawBlockRow::COLUMNS.len(), RawBlockRow::default().values().len()),
        ] {
            assert_eq!(columns, values);
        }
        let row = ShareChartRow {
            miner_id: 3,
            worker_id: 4,
            ..Default::default()
        };
        assert_eq!(row.values()[2], ChartValue::Int(3));
        assert_eq!(row.values()[3], ChartValue::Int(4));
    }
}
