//! Connection pool + schema migrations.
//!
//! Grounded: `examples/adolfousier-opencrabs/Cargo.toml` pins
//! `deadpool-sqlite` (tokio runtime feature) + `rusqlite` (bundled) +
//! `rusqlite_migration`; this module wires them the conventional way those
//! three crates are composed — a `deadpool_sqlite::Pool` handing out
//! connections `interact()`-wrapped for blocking rusqlite calls, with
//! `rusqlite_migration::Migrations` applied once at startup.

use deadpool_sqlite::{Config as PoolConfig, Pool, Runtime};
use once_cell::sync::Lazy;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

static MIGRATIONS: Lazy<Migrations<'static>> = Lazy::new(|| {
    Migrations::new(vec![M::up(include_str!("schema.sql"))])
});

pub async fn open(path: &Path) -> CoreResult<Pool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let cfg = PoolConfig::new(path);
    let pool = cfg
        .create_pool(Runtime::Tokio1)
        .map_err(|e| CoreError::Config(format!("creating sqlite pool: {e}")))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| CoreError::Config(format!("acquiring connection for migration: {e}")))?;
    conn.interact(|conn: &mut Connection| MIGRATIONS.to_latest(conn))
        .await
        .map_err(|e| CoreError::Config(format!("migration task panicked: {e}")))?
        .map_err(|e| CoreError::Config(format!("applying migrations: {e}")))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_migrates_fresh_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = open(&path).await.unwrap();
        let conn = pool.get().await.unwrap();
        let count: i64 = conn
            .interact(|conn| {
                conn.query_row(
                    "select count(*) from sqlite_master where type='table' and name='threads'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count, 1);
    }
}
