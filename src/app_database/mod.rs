//! The relational ledger.
//!
//! Query functions that take a `&mut MysqlConnection` are meant to be
//! composed inside one [`AppDatabase::transaction`]; the `async` methods on
//! [`AppDatabase`] are standalone reads or single-statement writes.

pub mod audit;
pub mod balances;
pub mod bank;
pub mod exchange;
pub mod miners;
pub mod payouts;
pub mod rounds;

use deadpool_diesel::mysql::{Manager, Pool};
use diesel::{Connection, MysqlConnection, RunQueryDsl};
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::{PoolError, PoolResult};
use crate::models;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppDatabaseError {
    FailedToGetConnectionFromPool,
    InteractionFailed,
    QueryFailed,
}

pub struct AppDatabase {
    connection_pool: Pool,
}

impl AppDatabase {
    pub fn new(url: String) -> Self {
        let manager = Manager::new(url, deadpool_diesel::Runtime::Tokio1);

        let pool = Pool::builder(manager)
            .build()
            .expect("failed to build ledger connection pool");

        AppDatabase {
            connection_pool: pool,
        }
    }

    /// Runs `f` on a pooled connection.
    pub async fn interact<T, F>(&self, f: F) -> PoolResult<T>
    where
        F: FnOnce(&mut MysqlConnection) -> PoolResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if let Ok(db_conn) = self.connection_pool.get().await {
            let res = db_conn.interact(move |conn: &mut MysqlConnection| f(conn)).await;

            match res {
                Ok(interaction) => interaction,
                Err(e) => {
                    error!(target: "server_log", "{:?}", e);
                    Err(AppDatabaseError::InteractionFailed.into())
                }
            }
        } else {
            Err(AppDatabaseError::FailedToGetConnectionFromPool.into())
        }
    }

    /// Runs `f` inside one database transaction. Any error rolls the whole
    /// closure back.
    pub async fn transaction<T, F>(&self, f: F) -> PoolResult<T>
    where
        F: FnOnce(&mut MysqlConnection) -> PoolResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let instant = Instant::now();
        let res = self
            .interact(move |conn: &mut MysqlConnection| {
                conn.transaction::<T, PoolError, _>(|conn| f(conn))
            })
            .await;
        let elapsed = instant.elapsed().as_millis();
        if elapsed > 1_000 {
            info!(target: "server_log", "slow db transaction: {}ms", elapsed);
        }
        res
    }

    pub async fn ping(&self) -> Result<(), AppDatabaseError> {
        if let Ok(db_conn) = self.connection_pool.get().await {
            let res = db_conn
                .interact(move |conn: &mut MysqlConnection| {
                    diesel::sql_query("SELECT 1").execute(conn)
                })
                .await;

            match res {
                Ok(interaction) => match interaction {
                    Ok(_) => {
                        return Ok(());
                    }
                    Err(e) => {
                        error!(target: "server_log", "{:?}", e);
                        return Err(AppDatabaseError::QueryFailed);
                    }
                },
                Err(e) => {
                    error!(target: "server_log", "{:?}", e);
                    return Err(AppDatabaseError::InteractionFailed);
                }
            }
        } else {
            return Err(AppDatabaseError::FailedToGetConnectionFromPool);
        };
    }
}

pub(crate) fn last_insert_id(conn: &mut MysqlConnection) -> diesel::QueryResult<i64> {
    let row: models::LastInsertId =
        diesel::sql_query("SELECT LAST_INSERT_ID() AS id").get_result(conn)?;
    Ok(row.id as i64)
}

/// Fails when an UPDATE that must touch exactly `expected` rows did not.
pub(crate) fn expect_rows(affected: usize, expected: usize, what: &str) -> PoolResult<()> {
    if affected != expected {
        return Err(PoolError::invalid(format!(
            "{}: updated {} rows, expected {}",
            what, affected, expected
        )));
    }
    Ok(())
}

pub(crate) fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_rows_flags_mismatch() {
        assert!(expect_rows(1, 1, "utxo").is_ok());
        let err = expect_rows(0, 1, "utxo").unwrap_err();
        assert!(err.is_business_rule());
    }

    #[test]
    fn builds_in_clauses() {
        assert_eq!(id_list(&[4, 5, 9]), "4,5,9");
        assert_eq!(id_list(&[]), "");
    }
}
