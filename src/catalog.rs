use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, error, info};
use tokio::sync::{Mutex, RwLock};
use tokio::task::spawn_blocking;

use crate::config::ConfDir;
use crate::corpus::ItemName;
use crate::db::ledger::{self, LedgerTable};
use crate::db::{self, Database, ImageRef, IndexState, MetadataRecord, Product, ProductView};
use crate::embedding::{EmbeddingProvider, EmbeddingVector, Modality};
use crate::error::{Error, Result};
use crate::index::{FlatIndex, IndexFile};
use crate::utils::{decode_image, generate_image_id, image_extension};

/// 上传的文件
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// 添加商品的请求
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub item_id: String,
    pub product_type: Vec<String>,
    pub item_name: Vec<ItemName>,
    pub main_image: Upload,
    pub other_images: Vec<Upload>,
}

/// 一张待追加的图片，`vectors` 按 `Modality::IMAGE` 的顺序排列
#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub image_id: String,
    pub item_id: String,
    pub image_path: String,
    pub vectors: [EmbeddingVector; 2],
}

/// 一个模态的追加操作，临时文件已写入，等待提交
struct PendingAppend {
    modality: Modality,
    base: i64,
    checksum: String,
    extra: Vec<f32>,
}

/// 商品目录
///
/// 持有数据库连接和三个内存索引，所有对索引的修改都要先获取 `writer`
pub struct Catalog {
    db: Database,
    provider: Arc<dyn EmbeddingProvider>,
    images_root: PathBuf,
    files: [IndexFile; 3],
    indices: [Arc<RwLock<FlatIndex>>; 3],
    writer: Mutex<()>,
}

fn slot(modality: Modality) -> usize {
    match modality {
        Modality::Visual => 0,
        Modality::JointImage => 1,
        Modality::JointText => 2,
    }
}

impl Catalog {
    /// 加载三个索引并检查和账本是否一致
    pub async fn open(
        conf_dir: &ConfDir,
        images_root: impl Into<PathBuf>,
        db: Database,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let files = Modality::ALL.map(|m| IndexFile::new(conf_dir.index(m)));

        let mut indices = Vec::with_capacity(3);
        for (modality, file) in Modality::ALL.into_iter().zip(&files) {
            let state = ledger::index_state(&db, modality).await?;
            let dimension = provider.dimension(modality);
            let file = file.clone();
            let expected = state.map(|s| s.checksum);
            let index =
                spawn_blocking(move || file.load_verified(dimension, expected.as_deref())).await??;

            let recorded = ledger::count(&db, modality).await?;
            if recorded != index.count() as i64 {
                return Err(Error::persistence(format!(
                    "{modality} 索引有 {} 条向量，账本有 {recorded} 条记录",
                    index.count()
                )));
            }
            info!("加载 {modality} 索引: {} 条向量", index.count());
            indices.push(Arc::new(RwLock::new(index)));
        }
        let indices: [Arc<RwLock<FlatIndex>>; 3] = indices
            .try_into()
            .map_err(|_| Error::persistence("索引数量错误"))?;

        Ok(Self {
            db,
            provider,
            images_root: images_root.into(),
            files,
            indices,
            writer: Mutex::new(()),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn images_root(&self) -> &Path {
        &self.images_root
    }

    pub fn index(&self, modality: Modality) -> &Arc<RwLock<FlatIndex>> {
        &self.indices[slot(modality)]
    }

    pub async fn count(&self, modality: Modality) -> usize {
        self.index(modality).read().await.count()
    }

    /// 原子地追加图片向量和元数据，`product` 和账本在同一个事务中写入
    ///
    /// 提交之前的任何失败都不会改变索引和账本
    pub async fn append_images(
        &self,
        product: Option<&Product>,
        images: &[ImageEntry],
    ) -> Result<Vec<MetadataRecord>> {
        for image in images {
            for (m, v) in Modality::IMAGE.iter().zip(&image.vectors) {
                if v.modality() != *m {
                    return Err(Error::validation(format!(
                        "图片 {} 的向量模态错误: 期望 {m}, 实际 {}",
                        image.image_id,
                        v.modality()
                    )));
                }
            }
        }

        let _guard = self.writer.lock().await;

        let mut pending = vec![];
        let records = match self.prepare_appends(images, &mut pending).await {
            Ok(records) => records,
            Err(e) => {
                self.discard_pending(&pending);
                return Err(e);
            }
        };

        // 提交时持有索引写锁，搜索不会把旧索引的偏移量和新账本拼在一起
        let mut indices = vec![];
        for p in &pending {
            indices.push(self.index(p.modality).write().await);
        }
        if let Err(e) = self.commit_appends(product, &pending, &records).await {
            drop(indices);
            self.discard_pending(&pending);
            return Err(e);
        }

        for (p, mut index) in pending.iter().zip(indices) {
            for v in p.extra.chunks_exact(index.dimension()) {
                index.add(v)?;
            }
            drop(index);
            // 账本已经提交，重命名失败时下次打开会自动补完
            if let Err(e) = self.files[slot(p.modality)].publish() {
                error!("发布 {} 索引失败: {e}", p.modality);
            }
        }

        debug!("追加 {} 张图片", images.len());
        Ok(records)
    }

    fn discard_pending(&self, pending: &[PendingAppend]) {
        for p in pending {
            self.files[slot(p.modality)].discard_tmp();
        }
    }

    /// 为每个图片模态写入追加后的临时索引，返回待插入的账本记录
    async fn prepare_appends(
        &self,
        images: &[ImageEntry],
        pending: &mut Vec<PendingAppend>,
    ) -> Result<Vec<MetadataRecord>> {
        let mut records = vec![];
        for (i, modality) in Modality::IMAGE.into_iter().enumerate() {
            let index = self.index(modality).clone().read_owned().await;
            for image in images {
                index.check_vector(image.vectors[i].as_slice())?;
            }
            let extra = images
                .iter()
                .flat_map(|img| img.vectors[i].as_slice().iter().copied())
                .collect::<Vec<_>>();

            let base = index.count() as i64;
            let file = self.files[slot(modality)].clone();
            let (checksum, extra) = spawn_blocking(move || {
                let bytes = index.serialize_with(&extra);
                file.write_tmp(&bytes).map(|sum| (sum, extra))
            })
            .await??;

            records.extend(images.iter().enumerate().map(|(j, img)| MetadataRecord {
                modality,
                position: base + j as i64,
                image_id: img.image_id.clone(),
                item_id: img.item_id.clone(),
                image_path: img.image_path.clone(),
            }));
            pending.push(PendingAppend { modality, base, checksum, extra });
        }
        Ok(records)
    }

    async fn commit_appends(
        &self,
        product: Option<&Product>,
        pending: &[PendingAppend],
        records: &[MetadataRecord],
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        // 其他进程重新发布过索引时，内存中的偏移量已经失效
        for p in pending {
            let published = ledger::index_state(&mut *tx, p.modality).await?.map_or(0, |s| s.count);
            if published != p.base {
                return Err(Error::persistence(format!(
                    "{} 索引已被重新发布: 内存中有 {} 条向量，已发布 {published} 条，请重新加载",
                    p.modality, p.base
                )));
            }
        }
        ledger::bulk_insert(&mut tx, LedgerTable::Live, records)
            .await
            .map_err(unique_to_validation)?;
        if let Some(product) = product {
            db::product::insert(&mut *tx, product).await.map_err(unique_to_validation)?;
        }
        for p in pending {
            let count = p.base + (p.extra.len() / self.provider.dimension(p.modality)) as i64;
            let state = IndexState { modality: p.modality, count, checksum: p.checksum.clone() };
            ledger::set_index_state(&mut *tx, &state).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// 用新构建的索引整体替换一个模态，账本取自暂存表
    ///
    /// 暂存表的记录数必须和索引一致
    pub async fn replace_index(&self, modality: Modality, index: FlatIndex) -> Result<()> {
        if index.dimension() != self.provider.dimension(modality) {
            return Err(Error::validation(format!(
                "{modality} 索引维度错误: 期望 {}, 实际 {}",
                self.provider.dimension(modality),
                index.dimension()
            )));
        }

        let _guard = self.writer.lock().await;
        let file = self.files[slot(modality)].clone();

        let (checksum, index) = spawn_blocking(move || {
            let bytes = index.serialize();
            file.write_tmp(&bytes).map(|sum| (sum, index))
        })
        .await??;

        let mut live = self.index(modality).write().await;
        let result: Result<()> = async {
            let mut tx = self.db.begin().await?;
            let rows = ledger::publish_staging(&mut tx, modality).await?;
            if rows != index.count() as u64 {
                return Err(Error::persistence(format!(
                    "{modality} 暂存账本有 {rows} 条记录，索引有 {} 条向量",
                    index.count()
                )));
            }
            let state = IndexState { modality, count: index.count() as i64, checksum };
            ledger::set_index_state(&mut *tx, &state).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            drop(live);
            self.files[slot(modality)].discard_tmp();
            return Err(e);
        }

        let count = index.count();
        *live = index;
        drop(live);
        self.files[slot(modality)].publish()?;
        info!("发布 {modality} 索引: {count} 条向量");
        Ok(())
    }

    /// 添加商品
    ///
    /// 商品已存在时直接拒绝，不会调用向量模型
    pub async fn add_product(&self, request: NewProduct) -> Result<Product> {
        let item_id = request.item_id.trim().to_string();
        if item_id.is_empty() {
            return Err(Error::validation("item_id 不能为空"));
        }
        if db::product::exists(&self.db, &item_id).await? {
            return Err(Error::validation(format!("商品已存在: {item_id}")));
        }

        let uploads =
            std::iter::once(request.main_image).chain(request.other_images).collect::<Vec<_>>();
        for upload in &uploads {
            let is_image =
                upload.content_type.as_deref().is_some_and(|t| t.starts_with("image/"));
            if !is_image {
                return Err(Error::validation(format!(
                    "上传的文件不是图片: {}",
                    upload.file_name.as_deref().unwrap_or("<unnamed>")
                )));
            }
        }
        let uploads = spawn_blocking(move || {
            uploads
                .into_iter()
                .map(|upload| decode_image(&upload.bytes).map(|img| (upload, img)))
                .collect::<Result<Vec<_>>>()
        })
        .await??;

        let mut saved = vec![];
        let result = self
            .save_and_append(&item_id, request.product_type, request.item_name, uploads, &mut saved)
            .await;
        if result.is_err() {
            for path in saved {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
        result
    }

    async fn save_and_append(
        &self,
        item_id: &str,
        product_type: Vec<String>,
        item_name: Vec<ItemName>,
        uploads: Vec<(Upload, DynamicImage)>,
        saved: &mut Vec<PathBuf>,
    ) -> Result<Product> {
        let dir = self.images_root.join("new");
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = vec![];
        for (upload, image) in uploads {
            let image_id = generate_image_id(item_id);
            let file_name = format!("{image_id}.{}", image_extension(&upload.bytes));
            let path = dir.join(&file_name);
            tokio::fs::write(&path, &upload.bytes).await?;
            saved.push(path);

            let provider = self.provider.clone();
            let vectors = spawn_blocking(move || -> Result<[EmbeddingVector; 2]> {
                Ok([
                    provider.embed_image(Modality::Visual, &image)?,
                    provider.embed_image(Modality::JointImage, &image)?,
                ])
            })
            .await??;

            entries.push(ImageEntry {
                image_id,
                item_id: item_id.to_string(),
                image_path: format!("new/{file_name}"),
                vectors,
            });
        }

        let product = Product {
            item_id: item_id.to_string(),
            product_type,
            item_name,
            main_image_id: entries[0].image_id.clone(),
            other_image_id: entries[1..].iter().map(|e| e.image_id.clone()).collect(),
        };
        self.append_images(Some(&product), &entries).await?;
        info!("添加商品 {item_id}: {} 张图片", entries.len());
        Ok(product)
    }

    /// 查询商品详情，商品不存在时返回 `Error::NotFound`
    pub async fn product(&self, item_id: &str) -> Result<ProductView> {
        product_view(&self.db, item_id).await
    }
}

/// 查询商品详情，图片路径从视觉账本中解析
pub async fn product_view(db: &Database, item_id: &str) -> Result<ProductView> {
    let product = db::product::find_by_item_id(db, item_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("商品不存在: {item_id}")))?;

    let mut image_ids = vec![];
    if !product.main_image_id.is_empty() {
        image_ids.push(product.main_image_id.clone());
    }
    image_ids.extend(product.other_image_id.iter().cloned());
    let records = ledger::lookup_by_image_ids(db, Modality::Visual, &image_ids).await?;
    let path_of = |image_id: &str| {
        records.iter().find(|r| r.image_id == image_id).map(|r| r.image_path.clone())
    };

    Ok(ProductView {
        main_image: ImageRef {
            image_path: path_of(&product.main_image_id).unwrap_or_default(),
            image_id: product.main_image_id.clone(),
        },
        other_images: product
            .other_image_id
            .iter()
            .filter_map(|id| {
                path_of(id).map(|image_path| ImageRef { image_id: id.clone(), image_path })
            })
            .collect(),
        item_id: product.item_id,
        product_type: product.product_type,
        item_name: product.item_name,
    })
}

fn unique_to_validation(e: Error) -> Error {
    match e {
        Error::Database(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
            Error::validation(format!("记录已存在: {db_err}"))
        }
        e => e,
    }
}
