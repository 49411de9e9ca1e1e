use sqlx::types::Json;
use sqlx::{Executor, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use super::{BULK_CHUNK, Product};
use crate::error::Result;

pub async fn find_by_item_id(executor: &SqlitePool, item_id: &str) -> Result<Option<Product>> {
    let product = sqlx::query_as::<_, Product>(
        r#"
        SELECT item_id, product_type, item_name, main_image_id, other_image_id
        FROM product WHERE item_id = ?
        "#,
    )
    .bind(item_id)
    .fetch_optional(executor)
    .await?;
    Ok(product)
}

pub async fn exists<'c, E>(executor: E, item_id: &str) -> Result<bool>
where
    E: Executor<'c, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM product WHERE item_id = ?")
        .bind(item_id)
        .fetch_one(executor)
        .await?;
    Ok(count > 0)
}

/// 添加商品，item_id 重复时返回数据库错误
pub async fn insert<'c, E>(executor: E, product: &Product) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO product (item_id, product_type, item_name, main_image_id, other_image_id)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&product.item_id)
    .bind(Json(&product.product_type))
    .bind(Json(&product.item_name))
    .bind(&product.main_image_id)
    .bind(Json(&product.other_image_id))
    .execute(executor)
    .await?;
    Ok(())
}

/// 批量添加商品，调用方负责去重
pub async fn bulk_insert(conn: &mut SqliteConnection, products: &[Product]) -> Result<()> {
    for chunk in products.chunks(BULK_CHUNK) {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO product (item_id, product_type, item_name, main_image_id, other_image_id) ",
        );
        builder.push_values(chunk, |mut b, product| {
            b.push_bind(&product.item_id)
                .push_bind(Json(&product.product_type))
                .push_bind(Json(&product.item_name))
                .push_bind(&product.main_image_id)
                .push_bind(Json(&product.other_image_id));
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// 清空商品表
pub async fn clear<'c, E>(executor: E) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query("DELETE FROM product").execute(executor).await?;
    Ok(())
}
