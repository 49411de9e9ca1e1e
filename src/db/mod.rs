use std::path::Path;

use log::info;
use sqlx::{SqlitePool, sqlite::*};

pub mod ledger;
pub mod model;
pub mod product;

pub use model::*;

pub type Database = SqlitePool;

/// 批量插入时每条语句的行数，SQLite 单条语句最多绑定 32766 个参数
const BULK_CHUNK: usize = 1000;

pub async fn init_db(filename: impl AsRef<Path>) -> Result<Database, sqlx::Error> {
    let filename = filename.as_ref();
    info!("初始化数据库连接: {}", filename.display());

    if let Some(parent) = filename.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .filename(filename)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;

    info!("检查数据库迁移");
    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}

/// 把 ID 列表编码成 JSON 数组，配合 `json_each` 实现 `IN (...)` 查询
fn json_list<T: serde::Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}
