//! 持久化向量集合
//!
//! 以字符串 ID 寻址，把索引和账本合二为一。数据保存在 SQLite 的 `store_entry` 表中，
//! 查询时使用内存中的镜像。

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use tokio::sync::RwLock;
use tokio::task::spawn_blocking;

use crate::db::Database;
use crate::embedding::{Modality, cosine_similarity, l2_norm};
use crate::error::{Error, Result};
use crate::index::{Neighbor, TopKNeighbors};

/// 纯视觉图片向量集合
pub const VISUAL_IMAGE_COLLECTION: &str = "visual_image";
/// 联合空间图片向量集合
pub const JOINT_IMAGE_COLLECTION: &str = "joint_image";
/// 联合空间商品文本向量集合
pub const JOINT_ITEM_COLLECTION: &str = "joint_item";

/// 模态对应的集合名
pub fn collection_name(modality: Modality) -> &'static str {
    match modality {
        Modality::Visual => VISUAL_IMAGE_COLLECTION,
        Modality::JointImage => JOINT_IMAGE_COLLECTION,
        Modality::JointText => JOINT_ITEM_COLLECTION,
    }
}

/// 每条语句写入的行数
const UPSERT_CHUNK: usize = 500;

/// 图片集合中每条记录的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    pub image_id: String,
    pub item_id: String,
    pub image_path: String,
}

/// 商品文本集合中每条记录的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub item_id: String,
    pub metadata_text: String,
}

/// `get` 需要返回的字段
#[derive(Debug, Clone, Copy, Default)]
pub struct Include {
    pub embeddings: bool,
    pub metadata: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetResult<M> {
    pub ids: Vec<String>,
    pub embeddings: Option<Vec<Vec<f32>>>,
    pub metadata: Option<Vec<M>>,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    id: String,
    embedding: Vec<u8>,
    metadata: String,
}

/// 一个集合在内存中的镜像，按 seq 升序排列
#[derive(Debug, Default)]
struct Collection {
    dimension: usize,
    ids: Vec<String>,
    rows: HashMap<String, usize>,
    data: Vec<f32>,
    metadata: Vec<String>,
}

impl Collection {
    fn vector(&self, row: usize) -> &[f32] {
        &self.data[row * self.dimension..(row + 1) * self.dimension]
    }

    /// 余弦距离最小的 k 个行号和距离，距离相同时 seq 小的在前
    fn nearest(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if self.ids.is_empty() || k == 0 {
            return vec![];
        }
        let mut topk = TopKNeighbors::new(k.min(self.ids.len()));
        for row in 0..self.ids.len() {
            let score = cosine_similarity(query, self.vector(row));
            topk.push(Neighbor { position: row as i64, score });
        }
        topk.into_sorted_vec().into_iter().map(|n| (n.position as usize, 1. - n.score)).collect()
    }
}

pub struct PersistentStore {
    db: Database,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

impl PersistentStore {
    pub fn new(db: Database) -> Self {
        Self { db, collections: RwLock::new(HashMap::new()) }
    }

    /// 写入或更新向量，已存在的 ID 保持原来的顺序
    pub async fn upsert<M: Serialize>(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadata: &[M],
    ) -> Result<()> {
        if ids.len() != vectors.len() || ids.len() != metadata.len() {
            return Err(Error::validation(format!(
                "ids, vectors 和 metadata 数量不一致: {}, {}, {}",
                ids.len(),
                vectors.len(),
                metadata.len()
            )));
        }
        if ids.is_empty() {
            return Ok(());
        }

        let mut collections = self.collections.write().await;
        let current = self.load(&mut collections, name).await?;
        let dimension = if current.dimension == 0 { vectors[0].len() } else { current.dimension };
        for v in vectors {
            if v.len() != dimension || dimension == 0 {
                return Err(Error::validation(format!(
                    "集合 {name} 的向量维度为 {dimension}, 实际 {}",
                    v.len()
                )));
            }
            if l2_norm(v) <= f32::EPSILON {
                return Err(Error::validation("不能写入零向量"));
            }
        }
        let metadata = metadata.iter().map(serde_json::to_string).collect::<Result<Vec<_>, _>>()?;

        let mut tx = self.db.begin().await?;
        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM store_entry WHERE collection = ?",
        )
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        let rows = ids.iter().zip(vectors).zip(&metadata).enumerate().collect::<Vec<_>>();
        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO store_entry (collection, id, seq, embedding, metadata) ",
            );
            builder.push_values(chunk, |mut b, (i, ((id, vector), meta))| {
                b.push_bind(name)
                    .push_bind(*id)
                    .push_bind(next_seq + *i as i64)
                    .push_bind(bytemuck::cast_slice::<f32, u8>(vector))
                    .push_bind(*meta);
            });
            builder.push(
                " ON CONFLICT (collection, id) DO UPDATE SET \
                 embedding = excluded.embedding, metadata = excluded.metadata",
            );
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        collections.remove(name);
        debug!("写入集合 {name}: {} 条", ids.len());
        Ok(())
    }

    /// 返回余弦距离最小的至多 k 条记录的元数据和距离
    pub async fn query<M: DeserializeOwned>(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(M, f32)>> {
        let collection = self.collection(name).await?;
        if collection.ids.is_empty() {
            return Ok(vec![]);
        }
        if vector.len() != collection.dimension {
            return Err(Error::validation(format!(
                "查询向量维度不匹配: 期望 {}, 实际 {}",
                collection.dimension,
                vector.len()
            )));
        }

        let query = vector.to_vec();
        let c = collection.clone();
        let nearest = spawn_blocking(move || c.nearest(&query, k)).await?;

        nearest
            .into_iter()
            .map(|(row, distance)| Ok((serde_json::from_str(&collection.metadata[row])?, distance)))
            .collect()
    }

    /// 按 ID 取回记录，不存在的 ID 会被忽略
    pub async fn get<M: DeserializeOwned>(
        &self,
        name: &str,
        ids: &[String],
        include: Include,
    ) -> Result<GetResult<M>> {
        let collection = self.collection(name).await?;
        let rows = ids.iter().filter_map(|id| collection.rows.get(id).copied()).collect::<Vec<_>>();

        let embeddings = include
            .embeddings
            .then(|| rows.iter().map(|&row| collection.vector(row).to_vec()).collect());
        let metadata = if include.metadata {
            Some(
                rows.iter()
                    .map(|&row| serde_json::from_str(&collection.metadata[row]))
                    .collect::<Result<Vec<M>, _>>()?,
            )
        } else {
            None
        };

        Ok(GetResult {
            ids: rows.iter().map(|&row| collection.ids[row].clone()).collect(),
            embeddings,
            metadata,
        })
    }

    pub async fn count(&self, name: &str) -> Result<usize> {
        Ok(self.collection(name).await?.ids.len())
    }

    /// 删除集合中的全部记录
    pub async fn reset_collection(&self, name: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        let r = sqlx::query("DELETE FROM store_entry WHERE collection = ?")
            .bind(name)
            .execute(&self.db)
            .await?;
        collections.remove(name);
        info!("清空集合 {name}: {} 条", r.rows_affected());
        Ok(())
    }

    /// 在一个事务中用 `staging` 集合替换 `name` 集合
    pub async fn publish_collection(&self, staging: &str, name: &str) -> Result<()> {
        let mut collections = self.collections.write().await;
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM store_entry WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let r = sqlx::query("UPDATE store_entry SET collection = ? WHERE collection = ?")
            .bind(name)
            .bind(staging)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        collections.remove(name);
        collections.remove(staging);
        info!("发布集合 {staging} -> {name}: {} 条", r.rows_affected());
        Ok(())
    }

    async fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        if let Some(c) = self.collections.read().await.get(name) {
            return Ok(c.clone());
        }
        let mut collections = self.collections.write().await;
        self.load(&mut collections, name).await
    }

    /// 从数据库加载集合镜像，调用方需要持有写锁
    async fn load(
        &self,
        collections: &mut HashMap<String, Arc<Collection>>,
        name: &str,
    ) -> Result<Arc<Collection>> {
        if let Some(c) = collections.get(name) {
            return Ok(c.clone());
        }

        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT id, embedding, metadata FROM store_entry WHERE collection = ? ORDER BY seq",
        )
        .bind(name)
        .fetch_all(&self.db)
        .await?;

        let mut collection = Collection::default();
        for row in rows {
            if row.embedding.len() % 4 != 0 {
                return Err(Error::persistence(format!("集合 {name} 中的向量已损坏: {}", row.id)));
            }
            let vector: Vec<f32> = bytemuck::pod_collect_to_vec(&row.embedding);
            if collection.dimension == 0 {
                collection.dimension = vector.len();
            } else if vector.len() != collection.dimension {
                return Err(Error::persistence(format!("集合 {name} 中的向量维度不一致: {}", row.id)));
            }
            collection.rows.insert(row.id.clone(), collection.ids.len());
            collection.ids.push(row.id);
            collection.data.extend_from_slice(&vector);
            collection.metadata.push(row.metadata);
        }
        debug!("加载集合 {name}: {} 条", collection.ids.len());

        let collection = Arc::new(collection);
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }
}
