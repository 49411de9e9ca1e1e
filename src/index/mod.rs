mod file;
mod topk;

use std::cmp::Ordering;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;

pub use self::file::{IndexFile, checksum};
pub use self::topk::TopKNeighbors;
use crate::cancel::{CancelExt, CancellationToken};
use crate::embedding::{inner_product, l2_norm};
use crate::error::{Error, Result};

/// 向量在索引中的偏移量，-1 表示没有匹配
pub type Position = i64;

const MAGIC: &[u8; 4] = b"PSIX";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

/// 每个并行任务扫描的向量数量，任务之间检查一次取消标记
const SCAN_CHUNK: usize = 4096;

/// 归一化检查允许的误差
const NORM_TOLERANCE: f32 = 1e-3;

#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub position: Position,
    /// 内积
    pub score: f32,
}

impl Default for Neighbor {
    fn default() -> Self {
        Self { position: -1, score: f32::NEG_INFINITY }
    }
}

// 得分低的更大，得分相同时偏移量大的更大
impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        other.score.total_cmp(&self.score).then(self.position.cmp(&other.position))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

/// 暴力内积索引
///
/// 向量按添加顺序连续存放，只能追加，不能修改或删除
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "索引维度不能为 0");
        Self { dimension, data: vec![] }
    }

    /// 一次性用多条向量构建索引
    pub fn from_vectors<V: AsRef<[f32]>>(dimension: usize, vectors: &[V]) -> Result<Self> {
        let mut index = Self::new(dimension);
        for v in vectors {
            index.check_vector(v.as_ref())?;
        }
        index.data.reserve(vectors.len() * dimension);
        for v in vectors {
            index.data.extend_from_slice(v.as_ref());
        }
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn count(&self) -> usize {
        self.data.len() / self.dimension
    }

    /// 追加一条向量，返回它的偏移量，也就是追加之前的向量数量
    pub fn add(&mut self, vector: &[f32]) -> Result<Position> {
        self.check_vector(vector)?;
        let position = self.count() as Position;
        self.data.extend_from_slice(vector);
        Ok(position)
    }

    /// 检查向量的维度和模长
    pub fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::validation(format!(
                "向量维度不匹配: 期望 {}, 实际 {}",
                self.dimension,
                vector.len()
            )));
        }
        let norm = l2_norm(vector);
        if !norm.is_finite() || (norm - 1.).abs() > NORM_TOLERANCE {
            return Err(Error::validation(format!("向量未归一化: |v| = {norm}")));
        }
        Ok(())
    }

    pub fn vector(&self, position: Position) -> Option<&[f32]> {
        if position < 0 || position as usize >= self.count() {
            return None;
        }
        let start = position as usize * self.dimension;
        Some(&self.data[start..start + self.dimension])
    }

    /// 取回指定偏移量上的向量，越界的偏移量返回 `None`
    pub fn vectors(&self, positions: &[Position]) -> Vec<Option<&[f32]>> {
        positions.iter().map(|&p| self.vector(p)).collect()
    }

    /// 返回内积最大的至多 k 个结果，按得分降序，得分相同时偏移量小的在前
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.search_cancellable(query, k, &CancellationToken::new())
    }

    pub fn search_cancellable(
        &self,
        query: &[f32],
        k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Neighbor>> {
        let neighbors = self.scan(query, k, cancel)?;
        Ok(neighbors.into_iter().filter(|n| n.position >= 0).collect())
    }

    /// 扫描全部向量，k 超过向量数量时按向量数量计算，不足的部分用 -1 填充
    fn scan(&self, query: &[f32], k: usize, cancel: &CancellationToken) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(Error::validation(format!(
                "查询向量维度不匹配: 期望 {}, 实际 {}",
                self.dimension,
                query.len()
            )));
        }
        let k = k.min(self.count());
        if k == 0 {
            return Ok(vec![]);
        }

        let dim = self.dimension;
        let partial = self
            .data
            .par_chunks(dim * SCAN_CHUNK)
            .enumerate()
            .map(|(chunk_no, chunk)| {
                cancel.check()?;
                let base = (chunk_no * SCAN_CHUNK) as Position;
                let mut topk = TopKNeighbors::new(k.min(SCAN_CHUNK));
                for (i, v) in chunk.chunks_exact(dim).enumerate() {
                    let position = base + i as Position;
                    topk.push(Neighbor { position, score: inner_product(query, v) });
                }
                Ok(topk.into_sorted_vec())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut topk = TopKNeighbors::new(k);
        topk.extend(partial.into_iter().flatten());
        let mut neighbors = topk.into_sorted_vec();
        neighbors.resize(k, Neighbor::default());
        Ok(neighbors)
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_with(&[])
    }

    /// 序列化追加 `extra` 之后的索引，不修改自身
    ///
    /// `extra` 是若干条已经检查过的向量首尾相接
    pub fn serialize_with(&self, extra: &[f32]) -> Vec<u8> {
        debug_assert_eq!(extra.len() % self.dimension, 0);
        let count = (self.data.len() + extra.len()) / self.dimension;
        let mut buf = Vec::with_capacity(HEADER_SIZE + count * self.dimension * 4);
        // 写入 Vec 不会失败
        let _ = self.write_header(&mut buf, count as u64);
        for &v in self.data.iter().chain(extra) {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    fn write_header(&self, w: &mut impl Write, count: u64) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(VERSION)?;
        w.write_u32::<LittleEndian>(self.dimension as u32)?;
        w.write_u64::<LittleEndian>(count)?;
        Ok(())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).map_err(|_| Error::persistence("索引文件过短"))?;
        if &magic != MAGIC {
            return Err(Error::persistence("索引文件格式错误"));
        }
        let version = cur.read_u32::<LittleEndian>().map_err(|_| Error::persistence("索引文件过短"))?;
        if version != VERSION {
            return Err(Error::persistence(format!("不支持的索引版本: {version}")));
        }
        let dimension =
            cur.read_u32::<LittleEndian>().map_err(|_| Error::persistence("索引文件过短"))? as usize;
        let count = cur.read_u64::<LittleEndian>().map_err(|_| Error::persistence("索引文件过短"))?;
        if dimension == 0 {
            return Err(Error::persistence("索引维度为 0"));
        }

        let expected = (count as usize)
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_SIZE));
        if expected != Some(bytes.len()) {
            return Err(Error::persistence(format!(
                "索引文件长度错误: {} 条 {} 维向量, 文件 {} 字节",
                count,
                dimension,
                bytes.len()
            )));
        }

        let mut data = vec![0f32; count as usize * dimension];
        cur.read_f32_into::<LittleEndian>(&mut data)?;
        Ok(Self { dimension, data })
    }
}
