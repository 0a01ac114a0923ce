//! Postgres store
//!
//! Conditional writes are single `UPDATE ... WHERE <state> = $expected`
//! statements; the affected-row count decides between success and conflict.
//! Writes spanning several rows run in one transaction, and returning early
//! drops the transaction, which rolls it back.

mod definition;
mod execution;
mod request;
mod resource;

use colony_core::domain::RequestState;
use colony_core::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;

/// Store backed by a Postgres connection pool
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Wraps a database error
fn storage(err: sqlx::Error) -> Error {
    Error::storage_with_source("database operation failed", err)
}

/// Fails with a conflict when a conditional write touched no row
fn expect_row(rows_affected: u64, conflict: impl FnOnce() -> String) -> Result<()> {
    if rows_affected == 0 {
        Err(Error::Conflict(conflict()))
    } else {
        Ok(())
    }
}

fn parse_state(label: &str) -> Result<RequestState> {
    label.parse()
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expect_row() {
        assert!(expect_row(1, || "unused".into()).is_ok());
        let err = expect_row(0, || "job request 1 is not in state READY".into()).unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("READY"));
    }

    #[test]
    fn test_json_helpers() {
        let tasks = vec![colony_core::domain::TaskDefinition::execute("run")];
        let value = to_json(&tasks).unwrap();
        let back: Vec<colony_core::domain::TaskDefinition> = from_json(value).unwrap();
        assert_eq!(back, tasks);

        let err = from_json::<Vec<String>>(serde_json::json!({"not": "a list"})).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
