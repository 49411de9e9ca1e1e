use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use log::{debug, info};
use serde::Serialize;
use tokio::task::spawn_blocking;
use utoipa::ToSchema;

use crate::cancel::{CancelExt, CancellationToken};
use crate::catalog::Catalog;
use crate::db::ledger;
use crate::embedding::{EmbeddingProvider, EmbeddingVector, Modality, cosine_similarity};
use crate::error::{Error, Result};
use crate::metrics;
use crate::store::{ImageMeta, Include, JOINT_ITEM_COLLECTION, PersistentStore, collection_name};

/// 融合搜索时从图片索引召回的候选数量
pub const DEFAULT_CANDIDATES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    /// 纯视觉相似度
    Visual,
    /// 图文联合空间中的图片相似度
    Joint,
    /// 联合空间图片相似度和描述文本相似度加权融合
    Fused,
}

impl SearchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Joint => "joint",
            Self::Fused => "fused",
        }
    }

    /// 查询图片需要嵌入的空间
    pub fn space(&self) -> Modality {
        match self {
            Self::Visual => Modality::Visual,
            Self::Joint | Self::Fused => Modality::JointImage,
        }
    }
}

impl fmt::Display for SearchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "visual" | "cnn" | "cnn_faiss" => Ok(Self::Visual),
            "joint" | "clip" | "clip_faiss" => Ok(Self::Joint),
            "fused" | "clip_text" | "clip_gemini_faiss" | "clip_gemini_chroma" => {
                Ok(Self::Fused)
            }
            _ => Err(Error::validation(format!("未知的搜索方法: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub image: f32,
    pub text: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self { image: 0.6, text: 0.4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SearchHit {
    pub image_id: String,
    pub item_id: String,
    pub image_path: String,
    /// 越大越相似
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct FusedHit {
    pub image_id: String,
    pub item_id: String,
    pub image_path: String,
    pub image_score: f32,
    /// 商品没有描述文本时为 0
    pub text_score: f32,
    pub combined_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(untagged)]
pub enum SearchResults {
    Image(Vec<SearchHit>),
    Fused(Vec<FusedHit>),
}

impl SearchResults {
    pub fn len(&self) -> usize {
        match self {
            Self::Image(hits) => hits.len(),
            Self::Fused(hits) => hits.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 搜索的数据来源
#[derive(Clone)]
pub enum Backend {
    /// 本地索引和账本，得分为内积
    Index(Arc<Catalog>),
    /// 持久化集合，得分为 `1 - 余弦距离`
    Store(Arc<PersistentStore>),
}

pub struct SearchOrchestrator {
    backend: Backend,
    provider: Arc<dyn EmbeddingProvider>,
    candidates: usize,
    weights: FusionWeights,
}

impl SearchOrchestrator {
    pub fn new(backend: Backend, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            backend,
            provider,
            candidates: DEFAULT_CANDIDATES,
            weights: FusionWeights::default(),
        }
    }

    pub fn candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn weights(mut self, weights: FusionWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// 在单个图片空间中搜索，账本中找不到的结果会被丢弃
    pub async fn search_single(
        &self,
        space: Modality,
        query: &EmbeddingVector,
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if !space.is_image() || query.modality() != space {
            return Err(Error::validation(format!(
                "无法在 {space} 空间中使用 {} 向量搜索",
                query.modality()
            )));
        }
        cancel.check()?;
        if k == 0 {
            return Ok(vec![]);
        }

        match &self.backend {
            Backend::Index(catalog) => {
                // 读锁一直持有到账本查询结束，发布新索引时偏移量和账本不会错位
                let index = catalog.index(space).clone().read_owned().await;
                let q = query.as_slice().to_vec();
                let c = cancel.clone();
                let (neighbors, index) = spawn_blocking(move || {
                    index.search_cancellable(&q, k, &c).map(|neighbors| (neighbors, index))
                })
                .await??;
                cancel.check()?;

                let positions = neighbors.iter().map(|n| n.position).collect::<Vec<_>>();
                let mut records = ledger::lookup_positions(catalog.db(), space, &positions)
                    .await?
                    .into_iter()
                    .map(|r| (r.position, r))
                    .collect::<HashMap<_, _>>();
                drop(index);

                Ok(neighbors
                    .into_iter()
                    .filter_map(|n| match records.remove(&n.position) {
                        Some(r) => Some(SearchHit {
                            image_id: r.image_id,
                            item_id: r.item_id,
                            image_path: r.image_path,
                            score: n.score,
                        }),
                        None => {
                            debug!("{space} 偏移量 {} 没有元数据，已丢弃", n.position);
                            None
                        }
                    })
                    .collect())
            }
            Backend::Store(store) => {
                let result: Vec<(ImageMeta, f32)> =
                    store.query(collection_name(space), query.as_slice(), k).await?;
                cancel.check()?;
                Ok(result
                    .into_iter()
                    .map(|(meta, distance)| SearchHit {
                        image_id: meta.image_id,
                        item_id: meta.item_id,
                        image_path: meta.image_path,
                        score: 1. - distance,
                    })
                    .collect())
            }
        }
    }

    /// 图片和文本的融合搜索
    ///
    /// 没有文本时等价于在联合图片空间中的单独搜索
    pub async fn search_fused(
        &self,
        query: &EmbeddingVector,
        text: Option<&str>,
        k: usize,
        weights: FusionWeights,
        cancel: &CancellationToken,
    ) -> Result<SearchResults> {
        let text = text.map(str::trim).filter(|t| !t.is_empty());
        let Some(text) = text else {
            let hits = self.search_single(Modality::JointImage, query, k, cancel).await?;
            return Ok(SearchResults::Image(hits));
        };

        let candidates = self
            .search_single(Modality::JointImage, query, self.candidates.max(k), cancel)
            .await?;
        cancel.check()?;

        let provider = self.provider.clone();
        let owned = text.to_string();
        let text_vector = spawn_blocking(move || provider.embed_text(&owned)).await??;
        cancel.check()?;

        let mut item_ids = vec![];
        let mut seen = HashSet::new();
        for hit in &candidates {
            if seen.insert(hit.item_id.as_str()) {
                item_ids.push(hit.item_id.clone());
            }
        }
        let text_vectors = self.item_text_vectors(&item_ids).await?;
        cancel.check()?;

        let mut hits = candidates
            .into_iter()
            .map(|hit| {
                let text_score = text_vectors
                    .get(&hit.item_id)
                    .map(|v| cosine_similarity(text_vector.as_slice(), v))
                    .unwrap_or(0.);
                FusedHit {
                    combined_score: weights.image * hit.score + weights.text * text_score,
                    image_score: hit.score,
                    text_score,
                    image_id: hit.image_id,
                    item_id: hit.item_id,
                    image_path: hit.image_path,
                }
            })
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| {
            b.combined_score
                .total_cmp(&a.combined_score)
                .then_with(|| a.item_id.cmp(&b.item_id))
                .then_with(|| a.image_id.cmp(&b.image_id))
        });
        hits.truncate(k);
        Ok(SearchResults::Fused(hits))
    }

    /// 嵌入查询图片并按 `method` 搜索
    pub async fn search_image(
        &self,
        method: SearchMethod,
        image: DynamicImage,
        text: Option<&str>,
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchResults> {
        let start = Instant::now();

        let provider = self.provider.clone();
        let space = method.space();
        let query = spawn_blocking(move || provider.embed_image(space, &image)).await??;
        cancel.check()?;

        let results = match method {
            SearchMethod::Visual | SearchMethod::Joint => {
                SearchResults::Image(self.search_single(space, &query, k, cancel).await?)
            }
            SearchMethod::Fused => {
                self.search_fused(&query, text, k, self.weights, cancel).await?
            }
        };

        let elapsed = start.elapsed().as_secs_f32();
        metrics::observe_search(method.as_str(), elapsed);
        info!("{method} 搜索完成: {} 条结果，耗时 {:.3}s", results.len(), elapsed);
        Ok(results)
    }

    /// 一次取回多个商品的描述文本向量，没有描述的商品不在结果中
    async fn item_text_vectors(&self, item_ids: &[String]) -> Result<HashMap<String, Vec<f32>>> {
        match &self.backend {
            Backend::Index(catalog) => {
                let index = catalog.index(Modality::JointText).read().await;
                let records = ledger::item_text_positions(catalog.db(), item_ids).await?;
                let positions = records.iter().map(|r| r.position).collect::<Vec<_>>();
                Ok(records
                    .into_iter()
                    .zip(index.vectors(&positions))
                    .filter_map(|(r, v)| v.map(|v| (r.item_id, v.to_vec())))
                    .collect())
            }
            Backend::Store(store) => {
                let include = Include { embeddings: true, metadata: false };
                let result = store
                    .get::<serde_json::Value>(JOINT_ITEM_COLLECTION, item_ids, include)
                    .await?;
                Ok(result.ids.into_iter().zip(result.embeddings.unwrap_or_default()).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("visual", SearchMethod::Visual)]
    #[case("cnn", SearchMethod::Visual)]
    #[case("cnn_faiss", SearchMethod::Visual)]
    #[case("joint", SearchMethod::Joint)]
    #[case("CLIP", SearchMethod::Joint)]
    #[case("fused", SearchMethod::Fused)]
    #[case("clip_text", SearchMethod::Fused)]
    #[case("clip_gemini_faiss", SearchMethod::Fused)]
    #[case("clip_gemini_chroma", SearchMethod::Fused)]
    fn test_parse_method(#[case] s: &str, #[case] method: SearchMethod) {
        assert_eq!(s.parse::<SearchMethod>().unwrap(), method);
    }

    #[test]
    fn test_parse_unknown_method() {
        assert!(matches!("sift".parse::<SearchMethod>(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_results_serialize_untagged() {
        let results = SearchResults::Image(vec![SearchHit {
            image_id: "i".to_string(),
            item_id: "p".to_string(),
            image_path: "a.jpg".to_string(),
            score: 0.5,
        }]);
        let value = serde_json::to_value(&results).unwrap();
        assert_eq!(value[0]["image_id"], "i");
        assert_eq!(value[0]["score"], 0.5);
    }
}
