//! 批量构建索引
//!
//! 语料按批次顺序处理，每个批次在有界的线程池中提取特征，提取失败的记录会被跳过。
//! 账本先写入暂存表，所有批次完成后一次性构建索引并原子地发布。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indicatif::ProgressBar;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::catalog::Catalog;
use crate::config::BuildOptions;
use crate::corpus::{CorpusRecord, ProductEntry, metadata_to_text};
use crate::db::ledger::{self, LedgerTable};
use crate::db::{self, Database, ItemTextRecord, MetadataRecord};
use crate::embedding::{EmbeddingProvider, EmbeddingVector, Modality};
use crate::error::{Error, Result};
use crate::index::FlatIndex;
use crate::metrics;
use crate::store::{ImageMeta, ItemMeta, PersistentStore, collection_name};
use crate::utils::pb_style;

/// 一次构建的统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub target: String,
    pub total: usize,
    pub embedded: usize,
    pub skipped: usize,
    /// 每个批次的耗时，单位毫秒
    pub batches_ms: Vec<u64>,
    pub total_ms: u64,
}

impl BuildReport {
    fn new(target: impl Into<String>, total: usize) -> Self {
        Self { target: target.into(), total, ..Default::default() }
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

pub struct Builder {
    provider: Arc<dyn EmbeddingProvider>,
    images_root: PathBuf,
    options: BuildOptions,
    progress: bool,
}

impl Builder {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        images_root: impl Into<PathBuf>,
        options: BuildOptions,
    ) -> Self {
        Self { provider, images_root: images_root.into(), options, progress: false }
    }

    /// 是否显示进度条
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if self.progress {
            ProgressBar::new(len as u64).with_style(pb_style())
        } else {
            ProgressBar::hidden()
        }
    }

    /// 在线程池中为一个批次提取特征，结果顺序和输入一致
    async fn extract_batch<T, R, F>(
        &self,
        batch: Vec<T>,
        pb: &ProgressBar,
        f: F,
    ) -> Result<Vec<(T, Result<R>)>>
    where
        T: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&T) -> Result<R> + Send + Sync + 'static,
    {
        let workers = self.options.workers;
        let queue_depth = self.options.queue_depth;
        let pb = pb.clone();
        let results = spawn_blocking(move || {
            let results = extract_parallel(&batch, workers, queue_depth, &pb, f);
            batch.into_iter().zip(results).collect::<Vec<_>>()
        })
        .await?;
        Ok(results)
    }

    /// 为语料中的图片构建 `modality` 索引并发布
    ///
    /// 偏移量等于之前成功提取的数量，跳过的记录不会留下空位
    pub async fn build_images(
        &self,
        catalog: &Catalog,
        modality: Modality,
        records: Vec<CorpusRecord>,
    ) -> Result<BuildReport> {
        if !modality.is_image() {
            return Err(Error::validation(format!("{modality} 不是图片模态")));
        }
        let target = modality.as_str();
        let start = Instant::now();
        let mut report = BuildReport::new(target, records.len());
        let pb = self.progress_bar(records.len());

        ledger::clear_staging(catalog.db(), modality).await?;

        let mut seen = HashSet::new();
        let mut vectors = vec![];
        for (i, batch) in chunks(records, self.options.batch_size).into_iter().enumerate() {
            let batch_start = Instant::now();
            let provider = self.provider.clone();
            let root = self.images_root.clone();
            let results = self
                .extract_batch(batch, &pb, move |r: &CorpusRecord| {
                    embed_file(provider.as_ref(), modality, &root.join(&r.image_path))
                })
                .await?;

            let mut rows = vec![];
            for (record, result) in results {
                let vector = match result {
                    Ok(v) => v,
                    Err(e) => {
                        skip(target, &record.image_id, &e, &mut report);
                        continue;
                    }
                };
                if !seen.insert(record.image_id.clone()) {
                    skip(target, &record.image_id, "重复的 image_id", &mut report);
                    continue;
                }
                rows.push(MetadataRecord {
                    modality,
                    position: vectors.len() as i64,
                    image_id: record.image_id,
                    item_id: record.item_id,
                    image_path: record.image_path,
                });
                vectors.push(vector.into_vec());
            }

            let mut conn = catalog.db().acquire().await?;
            ledger::bulk_insert(&mut conn, LedgerTable::Staging, &rows).await?;
            self.finish_batch(target, i, rows.len(), batch_start, &mut report);
        }
        pb.finish_and_clear();

        report.embedded = vectors.len();
        if vectors.is_empty() {
            warn!("{target}: 没有成功提取的图片，不发布索引");
            ledger::clear_staging(catalog.db(), modality).await?;
        } else {
            let dimension = self.provider.dimension(modality);
            let index =
                spawn_blocking(move || FlatIndex::from_vectors(dimension, &vectors)).await??;
            catalog.replace_index(modality, index).await?;
        }

        report.total_ms = start.elapsed().as_millis() as u64;
        info!(
            "{target}: 共 {} 条，成功 {} 条，跳过 {} 条，耗时 {:.2}s",
            report.total,
            report.embedded,
            report.skipped,
            start.elapsed().as_secs_f32()
        );
        Ok(report)
    }

    /// 为商品描述文本构建联合文本索引并发布，没有描述的商品会被跳过
    pub async fn build_texts(
        &self,
        catalog: &Catalog,
        products: Vec<ProductEntry>,
    ) -> Result<BuildReport> {
        let target = Modality::JointText.as_str();
        let start = Instant::now();
        let mut report = BuildReport::new(target, products.len());
        let texts = item_texts(products);
        report.skipped = report.total - texts.len();
        let pb = self.progress_bar(texts.len());

        ledger::clear_staging(catalog.db(), Modality::JointText).await?;

        let mut seen = HashSet::new();
        let mut vectors = vec![];
        for (i, batch) in chunks(texts, self.options.batch_size).into_iter().enumerate() {
            let batch_start = Instant::now();
            let provider = self.provider.clone();
            let results = self
                .extract_batch(batch, &pb, move |(_, text): &(String, String)| {
                    provider.embed_text(text)
                })
                .await?;

            let mut rows = vec![];
            for ((item_id, metadata_text), result) in results {
                let vector = match result {
                    Ok(v) => v,
                    Err(e) => {
                        skip(target, &item_id, &e, &mut report);
                        continue;
                    }
                };
                if !seen.insert(item_id.clone()) {
                    skip(target, &item_id, "重复的 item_id", &mut report);
                    continue;
                }
                let position = vectors.len() as i64;
                rows.push(ItemTextRecord { position, item_id, metadata_text });
                vectors.push(vector.into_vec());
            }

            let mut conn = catalog.db().acquire().await?;
            ledger::bulk_insert_item_text(&mut conn, LedgerTable::Staging, &rows).await?;
            self.finish_batch(target, i, rows.len(), batch_start, &mut report);
        }
        pb.finish_and_clear();

        report.embedded = vectors.len();
        if vectors.is_empty() {
            warn!("{target}: 没有成功提取的描述文本，不发布索引");
            ledger::clear_staging(catalog.db(), Modality::JointText).await?;
        } else {
            let dimension = self.provider.dimension(Modality::JointText);
            let index =
                spawn_blocking(move || FlatIndex::from_vectors(dimension, &vectors)).await??;
            catalog.replace_index(Modality::JointText, index).await?;
        }

        report.total_ms = start.elapsed().as_millis() as u64;
        info!(
            "{target}: 共 {} 个商品，成功 {} 个，跳过 {} 个",
            report.total, report.embedded, report.skipped
        );
        Ok(report)
    }

    /// 把图片向量写入持久化集合，先写入暂存集合，完成后整体替换
    pub async fn build_store_images(
        &self,
        store: &PersistentStore,
        modality: Modality,
        records: Vec<CorpusRecord>,
    ) -> Result<BuildReport> {
        if !modality.is_image() {
            return Err(Error::validation(format!("{modality} 不是图片模态")));
        }
        let name = collection_name(modality);
        let staging = format!("{name}_staging");
        let start = Instant::now();
        let mut report = BuildReport::new(name, records.len());
        let pb = self.progress_bar(records.len());

        store.reset_collection(&staging).await?;

        let mut seen = HashSet::new();
        for (i, batch) in chunks(records, self.options.batch_size).into_iter().enumerate() {
            let batch_start = Instant::now();
            let provider = self.provider.clone();
            let root = self.images_root.clone();
            let results = self
                .extract_batch(batch, &pb, move |r: &CorpusRecord| {
                    embed_file(provider.as_ref(), modality, &root.join(&r.image_path))
                })
                .await?;

            let (mut ids, mut vectors, mut metas) = (vec![], vec![], vec![]);
            for (record, result) in results {
                match result {
                    Err(e) => skip(name, &record.image_id, &e, &mut report),
                    Ok(_) if !seen.insert(record.image_id.clone()) => {
                        skip(name, &record.image_id, "重复的 image_id", &mut report)
                    }
                    Ok(v) => {
                        ids.push(record.image_id.clone());
                        vectors.push(v.into_vec());
                        metas.push(ImageMeta {
                            image_id: record.image_id,
                            item_id: record.item_id,
                            image_path: record.image_path,
                        });
                    }
                }
            }

            store.upsert(&staging, &ids, &vectors, &metas).await?;
            report.embedded += ids.len();
            self.finish_batch(name, i, ids.len(), batch_start, &mut report);
        }
        pb.finish_and_clear();

        self.publish_store(store, &staging, name, &report).await?;
        report.total_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// 把商品描述文本向量写入持久化集合
    pub async fn build_store_texts(
        &self,
        store: &PersistentStore,
        products: Vec<ProductEntry>,
    ) -> Result<BuildReport> {
        let name = collection_name(Modality::JointText);
        let staging = format!("{name}_staging");
        let start = Instant::now();
        let mut report = BuildReport::new(name, products.len());
        let texts = item_texts(products);
        report.skipped = report.total - texts.len();
        let pb = self.progress_bar(texts.len());

        store.reset_collection(&staging).await?;

        let mut seen = HashSet::new();
        for (i, batch) in chunks(texts, self.options.batch_size).into_iter().enumerate() {
            let batch_start = Instant::now();
            let provider = self.provider.clone();
            let results = self
                .extract_batch(batch, &pb, move |(_, text): &(String, String)| {
                    provider.embed_text(text)
                })
                .await?;

            let (mut ids, mut vectors, mut metas) = (vec![], vec![], vec![]);
            for ((item_id, metadata_text), result) in results {
                match result {
                    Err(e) => skip(name, &item_id, &e, &mut report),
                    Ok(_) if !seen.insert(item_id.clone()) => {
                        skip(name, &item_id, "重复的 item_id", &mut report)
                    }
                    Ok(v) => {
                        ids.push(item_id.clone());
                        vectors.push(v.into_vec());
                        metas.push(ItemMeta { item_id, metadata_text });
                    }
                }
            }

            store.upsert(&staging, &ids, &vectors, &metas).await?;
            report.embedded += ids.len();
            self.finish_batch(name, i, ids.len(), batch_start, &mut report);
        }
        pb.finish_and_clear();

        self.publish_store(store, &staging, name, &report).await?;
        report.total_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn publish_store(
        &self,
        store: &PersistentStore,
        staging: &str,
        name: &str,
        report: &BuildReport,
    ) -> Result<()> {
        if report.embedded == 0 {
            warn!("{name}: 没有成功提取的记录，不发布集合");
            return store.reset_collection(staging).await;
        }
        store.publish_collection(staging, name).await?;
        info!(
            "{name}: 共 {} 条，成功 {} 条，跳过 {} 条",
            report.total, report.embedded, report.skipped
        );
        Ok(())
    }

    fn finish_batch(
        &self,
        target: &str,
        batch: usize,
        written: usize,
        start: Instant,
        report: &mut BuildReport,
    ) {
        let elapsed = start.elapsed();
        report.batches_ms.push(elapsed.as_millis() as u64);
        metrics::observe_build_batch(target, elapsed.as_secs_f32());
        info!("{target}: 批次 {batch} 写入 {written} 条，耗时 {:.2}s", elapsed.as_secs_f32());
    }
}

/// 导入商品数据，替换现有的商品表
pub async fn import_products(db: &Database, products: Vec<ProductEntry>) -> Result<usize> {
    let products = crate::corpus::dedup_products(products)
        .into_iter()
        .map(ProductEntry::into_product)
        .collect::<Vec<_>>();

    let mut tx = db.begin().await?;
    db::product::clear(&mut *tx).await?;
    db::product::bulk_insert(&mut tx, &products).await?;
    tx.commit().await?;

    info!("导入商品: {} 条", products.len());
    Ok(products.len())
}

/// 在 `workers` 个线程中对 `items` 逐个调用 `f`，结果顺序和输入一致
///
/// 任务队列和结果队列的长度都不超过 `queue_depth`
fn extract_parallel<T, R, F>(
    items: &[T],
    workers: usize,
    queue_depth: usize,
    pb: &ProgressBar,
    f: F,
) -> Vec<Result<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync,
{
    let (job_tx, job_rx) = crossbeam_channel::bounded::<(usize, &T)>(queue_depth.max(1));
    let (res_tx, res_rx) = crossbeam_channel::bounded::<(usize, Result<R>)>(queue_depth.max(1));
    let mut results = (0..items.len()).map(|_| None).collect::<Vec<Option<Result<R>>>>();

    std::thread::scope(|s| {
        s.spawn(move || {
            for job in items.iter().enumerate() {
                if job_tx.send(job).is_err() {
                    break;
                }
            }
        });
        for _ in 0..workers.max(1) {
            let job_rx = job_rx.clone();
            let res_tx = res_tx.clone();
            let f = &f;
            s.spawn(move || {
                for (i, item) in job_rx {
                    if res_tx.send((i, f(item))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(job_rx);
        drop(res_tx);

        for (i, result) in res_rx {
            results[i] = Some(result);
            pb.inc(1);
        }
    });

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(Error::extraction("提取线程提前退出"))))
        .collect()
}

fn chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// 每个商品的 (item_id, 描述文本)，没有描述的商品直接丢弃
fn item_texts(products: Vec<ProductEntry>) -> Vec<(String, String)> {
    products
        .into_iter()
        .filter_map(|p| {
            let text = metadata_to_text(&p.metadata);
            if text.is_empty() {
                debug!("商品 {} 没有描述文本", p.item_id);
                None
            } else {
                Some((p.item_id, text))
            }
        })
        .collect()
}

fn embed_file(
    provider: &dyn EmbeddingProvider,
    space: Modality,
    path: &Path,
) -> Result<EmbeddingVector> {
    let bytes =
        std::fs::read(path).map_err(|e| Error::extraction(format!("{}: {e}", path.display())))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| Error::extraction(format!("{}: {e}", path.display())))?;
    provider.embed_image(space, &image)
}

fn skip(target: &str, id: &str, reason: impl std::fmt::Display, report: &mut BuildReport) {
    warn!("{target}: 跳过 {id}: {reason}");
    metrics::inc_build_skipped(target);
    report.skipped += 1;
}
