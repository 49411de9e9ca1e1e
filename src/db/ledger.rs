//! 元数据账本
//!
//! 每个图片索引对应 `image_ledger` 中的一组记录，文本索引对应 `text_ledger`。
//! 构建时先写入暂存表，发布时在一个事务中整体替换。

use sqlx::{Executor, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::{BULK_CHUNK, IndexState, ItemTextRecord, MetadataRecord, json_list};
use crate::embedding::Modality;
use crate::error::{Error, Result};
use crate::index::Position;

/// 图片账本的正式表或暂存表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerTable {
    Live,
    Staging,
}

impl LedgerTable {
    fn image(&self) -> &'static str {
        match self {
            Self::Live => "image_ledger",
            Self::Staging => "image_ledger_staging",
        }
    }

    fn text(&self) -> &'static str {
        match self {
            Self::Live => "text_ledger",
            Self::Staging => "text_ledger_staging",
        }
    }
}

fn check_position(position: Position) -> Result<()> {
    if position < 0 {
        return Err(Error::validation(format!("无效的索引偏移量: {position}")));
    }
    Ok(())
}

/// 添加一条图片元数据
pub async fn insert<'c, E>(executor: E, record: &MetadataRecord) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    check_position(record.position)?;
    sqlx::query(
        r#"
        INSERT INTO image_ledger (modality, position, image_id, item_id, image_path)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.modality)
    .bind(record.position)
    .bind(&record.image_id)
    .bind(&record.item_id)
    .bind(&record.image_path)
    .execute(executor)
    .await?;
    Ok(())
}

/// 批量添加图片元数据
pub async fn bulk_insert(
    conn: &mut SqliteConnection,
    table: LedgerTable,
    records: &[MetadataRecord],
) -> Result<()> {
    for record in records {
        check_position(record.position)?;
    }
    for chunk in records.chunks(BULK_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} (modality, position, image_id, item_id, image_path) ",
            table.image()
        ));
        builder.push_values(chunk, |mut b, record| {
            b.push_bind(record.modality)
                .push_bind(record.position)
                .push_bind(&record.image_id)
                .push_bind(&record.item_id)
                .push_bind(&record.image_path);
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub async fn lookup(
    executor: &SqlitePool,
    modality: Modality,
    position: Position,
) -> Result<Option<MetadataRecord>> {
    let record = sqlx::query_as::<_, MetadataRecord>(
        r#"
        SELECT modality, position, image_id, item_id, image_path
        FROM image_ledger WHERE modality = ? AND position = ?
        "#,
    )
    .bind(modality)
    .bind(position)
    .fetch_optional(executor)
    .await?;
    Ok(record)
}

/// 按偏移量批量查询，不存在的偏移量会被忽略，返回顺序不保证
pub async fn lookup_positions(
    executor: &SqlitePool,
    modality: Modality,
    positions: &[Position],
) -> Result<Vec<MetadataRecord>> {
    let records = sqlx::query_as::<_, MetadataRecord>(
        r#"
        SELECT modality, position, image_id, item_id, image_path
        FROM image_ledger
        WHERE modality = ? AND position IN (SELECT value FROM json_each(?))
        "#,
    )
    .bind(modality)
    .bind(json_list(positions))
    .fetch_all(executor)
    .await?;
    Ok(records)
}

pub async fn lookup_by_image_ids(
    executor: &SqlitePool,
    modality: Modality,
    image_ids: &[String],
) -> Result<Vec<MetadataRecord>> {
    let records = sqlx::query_as::<_, MetadataRecord>(
        r#"
        SELECT modality, position, image_id, item_id, image_path
        FROM image_ledger
        WHERE modality = ? AND image_id IN (SELECT value FROM json_each(?))
        "#,
    )
    .bind(modality)
    .bind(json_list(image_ids))
    .fetch_all(executor)
    .await?;
    Ok(records)
}

pub async fn lookup_by_item_ids(
    executor: &SqlitePool,
    modality: Modality,
    item_ids: &[String],
) -> Result<Vec<MetadataRecord>> {
    let records = sqlx::query_as::<_, MetadataRecord>(
        r#"
        SELECT modality, position, image_id, item_id, image_path
        FROM image_ledger
        WHERE modality = ? AND item_id IN (SELECT value FROM json_each(?))
        ORDER BY position
        "#,
    )
    .bind(modality)
    .bind(json_list(item_ids))
    .fetch_all(executor)
    .await?;
    Ok(records)
}

/// 账本中的记录数，文本模态统计 `text_ledger`
pub async fn count<'c, E>(executor: E, modality: Modality) -> Result<i64>
where
    E: Executor<'c, Database = Sqlite>,
{
    let count: i64 = match modality {
        Modality::JointText => {
            sqlx::query_scalar("SELECT COUNT(*) FROM text_ledger").fetch_one(executor).await?
        }
        _ => {
            sqlx::query_scalar("SELECT COUNT(*) FROM image_ledger WHERE modality = ?")
                .bind(modality)
                .fetch_one(executor)
                .await?
        }
    };
    Ok(count)
}

pub async fn insert_item_text<'c, E>(executor: E, record: &ItemTextRecord) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    check_position(record.position)?;
    sqlx::query("INSERT INTO text_ledger (position, item_id, metadata_text) VALUES (?, ?, ?)")
        .bind(record.position)
        .bind(&record.item_id)
        .bind(&record.metadata_text)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn bulk_insert_item_text(
    conn: &mut SqliteConnection,
    table: LedgerTable,
    records: &[ItemTextRecord],
) -> Result<()> {
    for record in records {
        check_position(record.position)?;
    }
    for chunk in records.chunks(BULK_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} (position, item_id, metadata_text) ",
            table.text()
        ));
        builder.push_values(chunk, |mut b, record| {
            b.push_bind(record.position)
                .push_bind(&record.item_id)
                .push_bind(&record.metadata_text);
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// 查询商品描述文本向量的偏移量
pub async fn item_text_positions(
    executor: &SqlitePool,
    item_ids: &[String],
) -> Result<Vec<ItemTextRecord>> {
    let records = sqlx::query_as::<_, ItemTextRecord>(
        r#"
        SELECT position, item_id, metadata_text
        FROM text_ledger
        WHERE item_id IN (SELECT value FROM json_each(?))
        "#,
    )
    .bind(json_list(item_ids))
    .fetch_all(executor)
    .await?;
    Ok(records)
}

/// 清空某个模态的暂存数据
pub async fn clear_staging<'c, E>(executor: E, modality: Modality) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    match modality {
        Modality::JointText => {
            sqlx::query("DELETE FROM text_ledger_staging").execute(executor).await?;
        }
        _ => {
            sqlx::query("DELETE FROM image_ledger_staging WHERE modality = ?")
                .bind(modality)
                .execute(executor)
                .await?;
        }
    }
    Ok(())
}

/// 用暂存数据替换正式账本，需要在事务中调用
pub async fn publish_staging(conn: &mut SqliteConnection, modality: Modality) -> Result<u64> {
    let rows = match modality {
        Modality::JointText => {
            sqlx::query("DELETE FROM text_ledger").execute(&mut *conn).await?;
            let r = sqlx::query(
                r#"
                INSERT INTO text_ledger (position, item_id, metadata_text)
                SELECT position, item_id, metadata_text FROM text_ledger_staging
                "#,
            )
            .execute(&mut *conn)
            .await?;
            sqlx::query("DELETE FROM text_ledger_staging").execute(&mut *conn).await?;
            r.rows_affected()
        }
        _ => {
            sqlx::query("DELETE FROM image_ledger WHERE modality = ?")
                .bind(modality)
                .execute(&mut *conn)
                .await?;
            let r = sqlx::query(
                r#"
                INSERT INTO image_ledger (modality, position, image_id, item_id, image_path)
                SELECT modality, position, image_id, item_id, image_path
                FROM image_ledger_staging WHERE modality = ?
                "#,
            )
            .bind(modality)
            .execute(&mut *conn)
            .await?;
            sqlx::query("DELETE FROM image_ledger_staging WHERE modality = ?")
                .bind(modality)
                .execute(&mut *conn)
                .await?;
            r.rows_affected()
        }
    };
    Ok(rows)
}

pub async fn index_state<'c, E>(executor: E, modality: Modality) -> Result<Option<IndexState>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let state = sqlx::query_as::<_, IndexState>(
        "SELECT modality, count, checksum FROM index_state WHERE modality = ?",
    )
    .bind(modality)
    .fetch_optional(executor)
    .await?;
    Ok(state)
}

/// 记录索引文件的发布状态，和账本写入放在同一个事务中
pub async fn set_index_state<'c, E>(executor: E, state: &IndexState) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO index_state (modality, count, checksum) VALUES (?, ?, ?)
        ON CONFLICT (modality) DO UPDATE SET count = excluded.count, checksum = excluded.checksum
        "#,
    )
    .bind(state.modality)
    .bind(state.count)
    .bind(&state.checksum)
    .execute(executor)
    .await?;
    Ok(())
}
